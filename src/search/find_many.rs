use std::cell::Cell;
use std::cmp::Ordering;
use crate::analysis::tokenizer::{join_tokens, tokenize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::Document;
use crate::index::indexer::Indexer;
use crate::index::store::Store;
use crate::search::comparators::Comparator;
use crate::search::settings::{SearchResult, SearchSettings};

/// Query tokens past this count are rejected outright.
const MAX_QUERY_TOKENS: usize = 50;

/// Run one query against several indexes and return the matched documents,
/// filtered and ordered. Comparators are applied in order; the sort polls
/// the settings' manager and aborts with `Cancelled` when it was cleared.
pub fn find_many<S: Store>(
    dbs: &[&Indexer<S>],
    settings: &mut SearchSettings<S::Doc>,
    comparators: &mut [&mut dyn Comparator<S::Doc>],
) -> Result<Vec<SearchResult<S::Doc>>> {
    settings.tokens = tokenize(&settings.query);
    settings.tokens_joined = join_tokens(&settings.tokens);
    if settings.tokens.is_empty() {
        return Ok(Vec::new());
    }
    if settings.tokens.len() > MAX_QUERY_TOKENS {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    for (db_index, db) in dbs.iter().enumerate() {
        let ids = db.find_match_all(settings)?;
        for id in ids {
            if let Some((doc, tokens)) = db.find_doc(id)? {
                let index = results.len();
                results.push(SearchResult { db_index, id, index, doc, tokens });
            }
        }
    }

    if let Some(filter) = &settings.filter {
        results.retain(|result| filter(result));
        for (i, result) in results.iter_mut().enumerate() {
            result.index = i;
        }
    }

    sort_results(&mut results, settings, comparators)?;
    Ok(results)
}

/// Sort in comparator order, polling the cancellation flag between
/// comparisons.
pub fn sort_results<D: Document>(
    results: &mut [SearchResult<D>],
    settings: &SearchSettings<D>,
    comparators: &mut [&mut dyn Comparator<D>],
) -> Result<()> {
    if results.len() <= 1 || comparators.is_empty() {
        return Ok(());
    }

    for comparator in comparators.iter_mut() {
        comparator.init(results, settings);
    }

    let cancelled = Cell::new(false);
    results.sort_by(|a, b| {
        if cancelled.get() {
            return Ordering::Equal;
        }
        if let Some(manager) = &settings.manager {
            if !manager.should_continue() {
                cancelled.set(true);
                return Ordering::Equal;
            }
        }
        for comparator in comparators.iter() {
            match comparator.compare(a, b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    });

    for comparator in comparators.iter_mut() {
        comparator.clean();
    }

    if cancelled.get() {
        return Err(Error::new(ErrorKind::Cancelled, "search was cancelled".to_string()));
    }
    Ok(())
}
