use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::core::types::Document;
use crate::index::store::IdOf;

/// Cancellation handle shared between the caller and a running search. A
/// single test-and-set flag: `cancel` clears it, the sort polls it between
/// comparisons and stops once it observes the cleared state.
pub struct SearchManager {
    continue_search: AtomicBool,
}

impl SearchManager {
    pub fn new() -> Self {
        SearchManager {
            continue_search: AtomicBool::new(true),
        }
    }

    pub fn cancel(&self) {
        self.continue_search.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.continue_search.store(true, Ordering::SeqCst);
    }

    /// Test-and-set: returns the previous state and re-arms the flag.
    pub fn should_continue(&self) -> bool {
        self.continue_search.swap(true, Ordering::SeqCst)
    }
}

impl Default for SearchManager {
    fn default() -> Self {
        Self::new()
    }
}

/// One matched document: where it came from, its running index in the
/// result list, and the joined-token strings its relevance is judged by.
pub struct SearchResult<D: Document> {
    pub db_index: usize,
    pub id: IdOf<D>,
    pub index: usize,
    pub doc: D,
    pub tokens: Vec<String>,
}

impl<D: Document> std::fmt::Debug for SearchResult<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResult")
            .field("db_index", &self.db_index)
            .field("index", &self.index)
            .field("tokens", &self.tokens)
            .finish()
    }
}

pub type ResultFilter<D> = dyn Fn(&SearchResult<D>) -> bool + Send + Sync;

pub struct SearchSettings<D: Document> {
    pub query: String,
    /// Filled in by `find_many` from `query`.
    pub tokens: Vec<String>,
    pub tokens_joined: String,
    /// Treat the last query token as a prefix.
    pub autocomplete: bool,
    /// Union instead of intersection across query tokens.
    pub match_any_token: bool,
    pub filter: Option<Box<ResultFilter<D>>>,
    pub manager: Option<Arc<SearchManager>>,
}

impl<D: Document> SearchSettings<D> {
    pub fn new(query: impl Into<String>) -> Self {
        SearchSettings {
            query: query.into(),
            tokens: Vec::new(),
            tokens_joined: String::new(),
            autocomplete: true,
            match_any_token: false,
            filter: None,
            manager: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_flag() {
        let manager = SearchManager::new();
        assert!(manager.should_continue());

        manager.cancel();
        assert!(!manager.should_continue());
        // test-and-set re-armed the flag
        assert!(manager.should_continue());

        manager.cancel();
        manager.reset();
        assert!(manager.should_continue());
    }
}
