use std::cell::RefCell;
use std::cmp::Ordering;
use crate::analysis::tokenizer::{join_tokens, tokens_overlap};
use crate::core::types::Document;
use crate::search::settings::{SearchResult, SearchSettings};

/// Relevance ordering step. Comparators are chained: the first one to break
/// a tie decides. `init` runs once over the gathered results, `compare` must
/// be cheap (cache per result index), `clean` drops the caches.
pub trait Comparator<D: Document> {
    fn init(&mut self, _results: &[SearchResult<D>], _settings: &SearchSettings<D>) {}
    fn compare(&self, a: &SearchResult<D>, b: &SearchResult<D>) -> Ordering;
    fn clean(&mut self) {}
}

/// Documents containing every query token as a whole token rank first.
pub struct WholeMatchFirst {
    tokens: Vec<String>,
    cache: RefCell<Vec<u8>>,
}

impl WholeMatchFirst {
    pub fn new() -> Self {
        WholeMatchFirst {
            tokens: Vec::new(),
            cache: RefCell::new(Vec::new()),
        }
    }

    fn calc<D: Document>(&self, result: &SearchResult<D>) -> bool {
        let joined = join_tokens(&result.tokens);
        self.tokens.iter().all(|token| tokens_overlap(&joined, token))
    }

    fn rank<D: Document>(&self, result: &SearchResult<D>) -> u8 {
        let mut cache = self.cache.borrow_mut();
        if cache[result.index] == 0 {
            cache[result.index] = if self.calc(result) { 2 } else { 1 };
        }
        cache[result.index]
    }
}

impl Default for WholeMatchFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> Comparator<D> for WholeMatchFirst {
    fn init(&mut self, results: &[SearchResult<D>], settings: &SearchSettings<D>) {
        self.tokens = settings.tokens.clone();
        *self.cache.borrow_mut() = vec![0; results.len()];
    }

    fn compare(&self, a: &SearchResult<D>, b: &SearchResult<D>) -> Ordering {
        self.rank(b).cmp(&self.rank(a))
    }

    fn clean(&mut self) {
        self.cache.borrow_mut().clear();
    }
}

/// Documents carrying a longer run of the query tokens in order, adjacent
/// and boundary-aligned, rank first.
pub struct WordsTogetherFirst {
    search_joined: String,
    prefix_lens: Vec<usize>,
    cache: RefCell<Vec<u8>>,
}

impl WordsTogetherFirst {
    pub fn new() -> Self {
        WordsTogetherFirst {
            search_joined: String::new(),
            prefix_lens: Vec::new(),
            cache: RefCell::new(Vec::new()),
        }
    }

    fn calc<D: Document>(&self, result: &SearchResult<D>) -> u8 {
        let joined = join_tokens(&result.tokens);
        for i in (1..=self.prefix_lens.len()).rev() {
            let probe = &self.search_joined[..self.prefix_lens[i - 1]];
            if tokens_overlap(&joined, probe) {
                return i as u8;
            }
        }
        0
    }

    fn rank<D: Document>(&self, result: &SearchResult<D>) -> u8 {
        let mut cache = self.cache.borrow_mut();
        if cache[result.index] == 0 {
            cache[result.index] = self.calc(result) + 1;
        }
        cache[result.index] - 1
    }
}

impl Default for WordsTogetherFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> Comparator<D> for WordsTogetherFirst {
    fn init(&mut self, results: &[SearchResult<D>], settings: &SearchSettings<D>) {
        *self.cache.borrow_mut() = vec![0; results.len()];
        self.search_joined = join_tokens(&settings.tokens);
        self.prefix_lens.clear();

        let mut len = 0;
        for token in &settings.tokens {
            if len != 0 {
                len += 1;
            }
            len += token.len();
            self.prefix_lens.push(len);
            // u8 cache: leave room for the calculated marker
            if self.prefix_lens.len() + 1 == u8::MAX as usize {
                break;
            }
        }
    }

    fn compare(&self, a: &SearchResult<D>, b: &SearchResult<D>) -> Ordering {
        self.rank(b).cmp(&self.rank(a))
    }

    fn clean(&mut self) {
        self.cache.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SimpleDoc;

    fn result(index: usize, id: u32, joined: &str) -> SearchResult<SimpleDoc> {
        SearchResult {
            db_index: 0,
            id,
            index,
            doc: SimpleDoc::new(id, joined),
            tokens: vec![joined.to_string()],
        }
    }

    #[test]
    fn test_whole_match_first() {
        let mut settings: SearchSettings<SimpleDoc> = SearchSettings::new("abc def");
        settings.tokens = vec!["abc".to_string(), "def".to_string()];

        let results = vec![result(0, 1, "abcde defgh"), result(1, 2, "abc def xyz")];
        let mut cmp = WholeMatchFirst::new();
        cmp.init(&results, &settings);

        // document 2 carries both tokens whole, so it sorts first
        assert_eq!(cmp.compare(&results[1], &results[0]), Ordering::Less);
        assert_eq!(cmp.compare(&results[0], &results[1]), Ordering::Greater);
        assert_eq!(cmp.compare(&results[0], &results[0]), Ordering::Equal);
        Comparator::<SimpleDoc>::clean(&mut cmp);
    }

    #[test]
    fn test_words_together_first() {
        let mut settings: SearchSettings<SimpleDoc> = SearchSettings::new("one two three");
        settings.tokens = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let results = vec![
            result(0, 1, "one apart two apart three"),
            result(1, 2, "one two three whole"),
            result(2, 3, "one two apart three"),
        ];
        let mut cmp = WordsTogetherFirst::new();
        cmp.init(&results, &settings);

        assert_eq!(cmp.compare(&results[1], &results[2]), Ordering::Less);
        assert_eq!(cmp.compare(&results[2], &results[0]), Ordering::Less);
        assert_eq!(cmp.compare(&results[0], &results[1]), Ordering::Greater);
        Comparator::<SimpleDoc>::clean(&mut cmp);
    }
}
