use std::collections::HashMap;
use crate::core::error::Result;
use crate::core::types::{Document, Posting};
use crate::index::store::Store;

/// In-memory store, a drop-in double for `FileStore` in tests. No bulk
/// support; bulk ingestion only makes sense against the file layout.
pub struct MemoryStore<D: Document> {
    docs: HashMap<D::Id, D>,
    doc_tokens: HashMap<D::Id, Vec<String>>,
    index: HashMap<String, Vec<Posting<D::Id>>>,
}

impl<D: Document> MemoryStore<D> {
    pub fn new() -> Self {
        MemoryStore {
            docs: HashMap::new(),
            doc_tokens: HashMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<D: Document> Default for MemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document + Clone> Store for MemoryStore<D> {
    type Doc = D;

    fn add_doc(&mut self, doc: &D, joined: &[String]) -> Result<()> {
        self.docs.insert(doc.id(), doc.clone());
        self.doc_tokens.insert(doc.id(), joined.to_vec());
        Ok(())
    }

    fn remove_doc(&mut self, id: D::Id) -> Result<()> {
        self.docs.remove(&id);
        self.doc_tokens.remove(&id);
        Ok(())
    }

    fn find_doc(&self, id: D::Id) -> Result<Option<(D, Vec<String>)>> {
        match (self.docs.get(&id), self.doc_tokens.get(&id)) {
            (Some(doc), Some(tokens)) => Ok(Some((doc.clone(), tokens.clone()))),
            _ => Ok(None),
        }
    }

    fn all_documents(&self) -> Result<Vec<D>> {
        Ok(self.docs.values().cloned().collect())
    }

    fn add_token(&mut self, token: &str, posting: Posting<D::Id>) -> Result<()> {
        let postings = self.index.entry(token.to_string()).or_default();
        if !postings.contains(&posting) {
            postings.push(posting);
        }
        Ok(())
    }

    fn remove_token(&mut self, token: &str, posting: Posting<D::Id>) -> Result<()> {
        if let Some(postings) = self.index.get_mut(token) {
            postings.retain(|p| *p != posting);
            if postings.is_empty() {
                self.index.remove(token);
            }
        }
        Ok(())
    }

    fn find_token(&self, token: &str) -> Result<Vec<Posting<D::Id>>> {
        Ok(self.index.get(token).cloned().unwrap_or_default())
    }

    fn size_documents(&self) -> u64 {
        self.docs.len() as u64
    }

    fn size_tokens(&self) -> u64 {
        self.index.len() as u64
    }

    fn optimize(&mut self) -> Result<()> {
        Ok(())
    }

    fn optimize_free_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.docs.clear();
        self.doc_tokens.clear();
        self.index.clear();
        Ok(())
    }
}
