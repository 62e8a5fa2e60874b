use std::io::Write;
use crate::core::error::Result;
use crate::core::types::{Document, Posting};

pub type IdOf<D> = <D as Document>::Id;

/// Storage capability the indexer is parameterised over: a document map
/// plus an inverted token map. Implementations may be file-backed or
/// in-memory.
pub trait Store: Send {
    type Doc: Document;

    fn add_doc(&mut self, doc: &Self::Doc, joined: &[String]) -> Result<()>;
    fn remove_doc(&mut self, id: IdOf<Self::Doc>) -> Result<()>;
    fn find_doc(&self, id: IdOf<Self::Doc>) -> Result<Option<(Self::Doc, Vec<String>)>>;
    fn all_documents(&self) -> Result<Vec<Self::Doc>>;

    fn add_token(&mut self, token: &str, posting: Posting<IdOf<Self::Doc>>) -> Result<()>;
    fn remove_token(&mut self, token: &str, posting: Posting<IdOf<Self::Doc>>) -> Result<()>;
    fn find_token(&self, token: &str) -> Result<Vec<Posting<IdOf<Self::Doc>>>>;

    fn size_documents(&self) -> u64;
    /// Number of distinct token keys.
    fn size_tokens(&self) -> u64;

    fn optimize(&mut self) -> Result<()>;
    fn optimize_free_data(&mut self) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

/// Spill-and-merge bulk ingestion. Staging writes framed records to spill
/// streams; the merge phase locks the bucket tables, then has every thread
/// scan all streams and apply only the records whose bucket falls in its
/// range.
pub trait BulkStore: Store + Sync {
    fn bulk_start(&mut self, num_threads: usize) -> Result<()>;
    fn bulk_stop(&mut self) -> Result<()>;

    fn bulk_doc_write(out: &mut dyn Write, doc: &Self::Doc, joined: &[String]) -> Result<()>;
    fn bulk_tokens_write(
        out: &mut dyn Write,
        postings: &[(String, Posting<IdOf<Self::Doc>>)],
    ) -> Result<()>;

    fn bulk_docs_read(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()>;
    fn bulk_tokens_read_add(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()>;
    fn bulk_tokens_read_remove(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()>;

    fn bulk_docs_lock(&mut self, num_items: u64) -> Result<()>;
    fn bulk_docs_unlock(&mut self);
    fn bulk_tokens_lock(&mut self, num_keys: u64) -> Result<()>;
    fn bulk_tokens_unlock(&mut self);
}
