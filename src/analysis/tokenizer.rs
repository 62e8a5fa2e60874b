use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;
use crate::core::error::{Error, ErrorKind, Result};

/// Punctuation stripped from the ends of a token.
const EDGE_PUNCTUATION: &[char] = &['.', ',', '!', '?', ':', ';', '&', '"', '\'', '(', ')'];

/// Byte length of the UTF-8 character starting with `first`.
pub fn char_len(first: u8) -> Result<usize> {
    if first < 0x80 {
        Ok(1)
    } else if first & 0xE0 == 0xC0 {
        Ok(2)
    } else if first & 0xF0 == 0xE0 {
        Ok(3)
    } else if first & 0xF8 == 0xF0 {
        Ok(4)
    } else {
        Err(Error::new(ErrorKind::InvariantViolation, format!("invalid utf-8 lead byte {:#x}", first)))
    }
}

/// Split `text` into normalised lowercase tokens: canonical decomposition,
/// combining marks removed, recomposition, lowercase, split on Unicode
/// whitespace, edge punctuation stripped. Deterministic, and idempotent on
/// already normalised input.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .nfc()
        .flat_map(char::to_lowercase)
        .collect();

    normalized
        .split_whitespace()
        .filter_map(|word| {
            let token = word.trim_matches(|c| EDGE_PUNCTUATION.contains(&c));
            if token.is_empty() { None } else { Some(token.to_string()) }
        })
        .collect()
}

/// Tokens joined by single ASCII spaces; empty tokens are skipped.
pub fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for token in tokens {
        let token = token.as_ref();
        if token.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// Inverse of `join_tokens`. A zero-length token inside the joined string
/// means the string was not produced by `join_tokens`.
pub fn split_tokens(joined: &str) -> Result<Vec<String>> {
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    let mut arr = Vec::new();
    for part in joined.split(' ') {
        if part.is_empty() {
            return Err(Error::new(ErrorKind::InvariantViolation, "zero length token in joined string".to_string()));
        }
        arr.push(part.to_string());
    }
    Ok(arr)
}

/// Whether `needle` occurs in `all` aligned to token boundaries: preceded by
/// start-of-string or a space, followed by end-of-string or a space.
pub fn tokens_overlap(all: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let bytes = all.as_bytes();
    let mut pos = 0;
    while pos <= all.len() {
        let found = match all[pos..].find(needle) {
            Some(i) => pos + i,
            None => return false,
        };
        let start_ok = found == 0 || bytes[found - 1] == b' ';
        let end_ok = found + needle.len() == all.len() || bytes[found + needle.len()] == b' ';
        if start_ok && end_ok {
            return true;
        }
        pos = found + 1;
        while pos < all.len() && !all.is_char_boundary(pos) {
            pos += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_split() {
        assert_eq!(tokenize("abc def"), vec!["abc", "def"]);
        assert_eq!(tokenize("  abc\t def \n"), vec!["abc", "def"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[test]
    fn test_lowercase_and_accents() {
        assert_eq!(tokenize("Café"), vec!["cafe"]);
        assert_eq!(tokenize("NAÏVE Señor"), vec!["naive", "senor"]);
        assert_eq!(tokenize("ÜBER"), vec!["uber"]);
    }

    #[test]
    fn test_edge_punctuation() {
        assert_eq!(tokenize("hello, world!"), vec!["hello", "world"]);
        assert_eq!(tokenize("\"quoted\" (parens) end."), vec!["quoted", "parens", "end"]);
        // interior punctuation stays
        assert_eq!(tokenize("it's a.b"), vec!["it's", "a.b"]);
        // a token of nothing but punctuation disappears
        assert_eq!(tokenize("a !? b"), vec!["a", "b"]);
    }

    #[test]
    fn test_idempotent() {
        let first = tokenize("Déjà Vu, Crème BRÛLÉE!");
        let again = tokenize(&join_tokens(&first));
        assert_eq!(first, again);
    }

    #[test]
    fn test_join_split_roundtrip() {
        let tokens = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let joined = join_tokens(&tokens);
        assert_eq!(joined, "one two three");
        assert_eq!(split_tokens(&joined).unwrap(), tokens);
        assert_eq!(split_tokens("").unwrap(), Vec::<String>::new());
        assert!(split_tokens("a  b").is_err());
    }

    #[test]
    fn test_char_len() {
        assert_eq!(char_len(b'a').unwrap(), 1);
        assert_eq!(char_len("é".as_bytes()[0]).unwrap(), 2);
        assert_eq!(char_len("€".as_bytes()[0]).unwrap(), 3);
        assert_eq!(char_len("🎉".as_bytes()[0]).unwrap(), 4);
        assert!(char_len(0x80).is_err());
    }

    #[test]
    fn test_tokens_overlap() {
        assert!(tokens_overlap("abc def ghi", "def"));
        assert!(tokens_overlap("abc def ghi", "abc"));
        assert!(tokens_overlap("abc def ghi", "ghi"));
        assert!(tokens_overlap("abc def ghi", "abc def"));
        assert!(tokens_overlap("abc", "abc"));
        // substring that is not token aligned
        assert!(!tokens_overlap("abcdef", "abc"));
        assert!(!tokens_overlap("abc defghi", "def"));
        assert!(!tokens_overlap("xabc def", "abc"));
        assert!(!tokens_overlap("", "abc"));
        // later occurrence is aligned even when the first is not
        assert!(tokens_overlap("xdef def", "def"));
    }
}
