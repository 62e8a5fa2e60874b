use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File cannot be opened or memory-mapped.
    IoOpen,
    /// File cannot be resized.
    IoResize,
    /// On-disk format version does not match the compiled version.
    FormatVersion,
    /// A length does not fit into the 62-bit encoding.
    FormatOverflow,
    /// Internal assertion failed.
    InvariantViolation,
    /// Search cancellation flag was observed.
    Cancelled,
    /// A single bulk-insert item exceeds the stripe size.
    BulkOversizedItem,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::IoOpen,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::InvariantViolation,
            context: format!("serialization error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
