use serde::{Serialize, Deserialize};
use std::hash::Hash;
use crate::core::error::Result;

/// A document the index can store. The application decides what a document
/// is; the index only needs a stable fixed-width identifier, an opaque byte
/// serialization and the list of texts to index.
pub trait Document: Sized + Send + Sync {
    type Id: Copy + Eq + Hash + Send + Sync;

    fn id(&self) -> Self::Id;

    /// Fixed-width byte form of the identifier, used as the store key.
    fn serialize_id(id: Self::Id) -> Vec<u8>;
    fn deserialize_id(bytes: &[u8]) -> Self::Id;

    fn serialize(&self) -> Result<Vec<u8>>;
    fn deserialize(id: Self::Id, bytes: &[u8]) -> Result<Self>;

    /// The texts to tokenize and index, in a stable order.
    fn texts(&self) -> Vec<String>;
}

/// One entry recorded under a token key: which document, and whether the
/// token is the full word form or a prefix of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Posting<Id> {
    pub doc_id: Id,
    pub is_whole: bool,
}

impl<Id> Posting<Id> {
    pub fn whole(doc_id: Id) -> Self {
        Posting { doc_id, is_whole: true }
    }

    pub fn partial(doc_id: Id) -> Self {
        Posting { doc_id, is_whole: false }
    }
}

/// Minimal document: a numeric id and one text. Used by the tests and
/// benches, and as a reference for implementing `Document`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleDoc {
    pub id: u32,
    pub text: String,
}

impl SimpleDoc {
    pub fn new(id: u32, text: impl Into<String>) -> Self {
        SimpleDoc { id, text: text.into() }
    }
}

impl Document for SimpleDoc {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }

    fn serialize_id(id: u32) -> Vec<u8> {
        id.to_le_bytes().to_vec()
    }

    fn deserialize_id(bytes: &[u8]) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(buf)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn deserialize(id: u32, bytes: &[u8]) -> Result<Self> {
        let mut doc: SimpleDoc = bincode::deserialize(bytes)?;
        doc.id = id;
        Ok(doc)
    }

    fn texts(&self) -> Vec<String> {
        vec![self.text.clone()]
    }
}
