use std::collections::HashSet;
use parking_lot::{Mutex, MutexGuard};
use crate::analysis::tokenizer::{char_len, join_tokens, split_tokens, tokenize, tokens_overlap};
use crate::core::error::Result;
use crate::core::types::{Document, Posting};
use crate::index::store::{IdOf, Store};
use crate::search::settings::SearchSettings;

#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    /// Index character-boundary prefixes of every token for autocomplete.
    pub autocomplete: bool,
    /// Longest prefix to index, in bytes; 0 means unbounded.
    pub autocomplete_max_len: u8,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            autocomplete: true,
            autocomplete_max_len: 0,
        }
    }
}

/// The inverted index over a store. On update the previous token set is
/// rebuilt from the stored joined strings and diffed against the new one, so
/// only changed tokens touch the token store.
///
/// One mutex guards every public operation; reads and writes never run
/// concurrently, and nothing derived from the store may outlive the lock.
pub struct Indexer<S: Store> {
    pub settings: IndexSettings,
    pub(crate) store: Mutex<S>,
}

impl<S: Store> Indexer<S> {
    pub fn new(store: S) -> Self {
        Indexer {
            settings: IndexSettings::default(),
            store: Mutex::new(store),
        }
    }

    pub fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock()
    }

    pub fn into_store(self) -> S {
        self.store.into_inner()
    }

    /// Insert or update one document.
    pub fn add(&self, doc: &S::Doc) -> Result<()> {
        let mut store = self.store.lock();
        let id = doc.id();

        let (mut tokens_add, joined) = document_tokens(doc);

        let mut tokens_remove = HashSet::new();
        if let Some((_, old_joined)) = store.find_doc(id)? {
            for text in &old_joined {
                tokens_remove.extend(split_tokens(text)?);
            }
        }
        tokens_difference(&mut tokens_add, &mut tokens_remove);

        let mut add_partial = HashSet::new();
        self.partial_tokens(&tokens_add, &mut add_partial);
        let mut remove_partial = HashSet::new();
        self.partial_tokens(&tokens_remove, &mut remove_partial);
        tokens_difference(&mut add_partial, &mut remove_partial);

        for token in &tokens_remove {
            store.remove_token(token, Posting::whole(id))?;
        }
        for token in &remove_partial {
            store.remove_token(token, Posting::partial(id))?;
        }
        for token in &tokens_add {
            store.add_token(token, Posting::whole(id))?;
        }
        for token in &add_partial {
            store.add_token(token, Posting::partial(id))?;
        }
        store.add_doc(doc, &joined)
    }

    /// Remove a document and every posting naming it.
    pub fn remove(&self, id: IdOf<S::Doc>) -> Result<()> {
        let mut store = self.store.lock();
        let Some((_, joined)) = store.find_doc(id)? else {
            return Ok(());
        };

        let mut tokens_remove = HashSet::new();
        for text in &joined {
            tokens_remove.extend(split_tokens(text)?);
        }
        let mut remove_partial = HashSet::new();
        self.partial_tokens(&tokens_remove, &mut remove_partial);

        for token in &tokens_remove {
            store.remove_token(token, Posting::whole(id))?;
        }
        for token in &remove_partial {
            store.remove_token(token, Posting::partial(id))?;
        }
        store.remove_doc(id)
    }

    pub fn find_doc(&self, id: IdOf<S::Doc>) -> Result<Option<(S::Doc, Vec<String>)>> {
        self.store.lock().find_doc(id)
    }

    pub fn optimize(&self) -> Result<()> {
        self.store.lock().optimize()
    }

    /// Document ids matching the query tokens: intersection by default,
    /// union when `match_any_token` is set. The last token runs as a prefix
    /// lookup when both the query and the index settings ask for
    /// autocomplete.
    pub fn find_match_all(&self, settings: &SearchSettings<S::Doc>) -> Result<HashSet<IdOf<S::Doc>>> {
        let store = self.store.lock();
        let mut all = HashSet::new();
        for (i, raw_token) in settings.tokens.iter().enumerate() {
            let is_partial =
                settings.autocomplete && i + 1 == settings.tokens.len() && self.settings.autocomplete;
            // one-byte prefix lookups are skipped
            if is_partial && raw_token.len() == 1 {
                continue;
            }

            let mut token = raw_token.clone();
            if is_partial {
                let max = self.settings.autocomplete_max_len as usize;
                if max > 0 && token.len() > max {
                    let mut new_len = 0;
                    loop {
                        let len = char_len(token.as_bytes()[new_len])?;
                        if new_len + len > max {
                            break;
                        }
                        new_len += len;
                    }
                    token.truncate(new_len);
                }
            }

            let mut postings = store.find_token(&token)?;
            let mut ids = HashSet::new();
            if is_partial {
                if token.len() != raw_token.len() {
                    // only the truncated form is indexed: keep documents
                    // whose joined strings carry the full query form at a
                    // token boundary
                    let mut kept = Vec::with_capacity(postings.len());
                    for posting in postings {
                        if let Some((_, joined)) = store.find_doc(posting.doc_id)? {
                            let all_joined = join_tokens(&joined);
                            if !all_joined.is_empty() && tokens_overlap(&all_joined, raw_token) {
                                kept.push(posting);
                            }
                        }
                    }
                    postings = kept;
                }
                for posting in postings {
                    ids.insert(posting.doc_id);
                }
            } else {
                for posting in postings {
                    if posting.is_whole {
                        ids.insert(posting.doc_id);
                    }
                }
            }

            if ids.is_empty() && !settings.match_any_token {
                return Ok(HashSet::new());
            }

            if settings.match_any_token {
                all.extend(ids);
            } else if i == 0 {
                all = ids;
            } else {
                all.retain(|id| ids.contains(id));
                if all.is_empty() {
                    return Ok(HashSet::new());
                }
            }
        }
        Ok(all)
    }

    /// Character-boundary-aligned proper prefixes, at least two characters
    /// long, at most `autocomplete_max_len` bytes when that is set.
    pub(crate) fn partial_tokens(&self, tokens: &HashSet<String>, out: &mut HashSet<String>) {
        if !self.settings.autocomplete {
            return;
        }
        let max = self.settings.autocomplete_max_len as usize;
        for token in tokens {
            for (end, _) in token.char_indices().skip(2) {
                if max == 0 || end <= max {
                    out.insert(token[..end].to_string());
                }
            }
        }
    }
}

/// Deduplicated whole tokens and per-text joined strings of a document.
pub(crate) fn document_tokens<D: Document>(doc: &D) -> (HashSet<String>, Vec<String>) {
    let texts = doc.texts();
    let mut all = HashSet::new();
    let mut joined = Vec::with_capacity(texts.len());
    for text in &texts {
        let tokens = tokenize(text);
        joined.push(join_tokens(&tokens));
        all.extend(tokens);
    }
    (all, joined)
}

/// Drop the intersection from both sets, leaving only the actual changes.
pub(crate) fn tokens_difference(add: &mut HashSet<String>, remove: &mut HashSet<String>) {
    let common: Vec<String> = add.intersection(remove).cloned().collect();
    for token in &common {
        add.remove(token);
        remove.remove(token);
    }
}
