//! User-supplied and auto-discovered byte-string dictionaries used by the
//! `extras` mutator stages.

/// Auto-discovered tokens are capped and evicted LRU-style so a long session
/// doesn't let the auto dictionary grow without bound.
pub const MAX_AUTO_EXTRAS: usize = 4096;

/// An unordered set of byte strings, sorted by length ascending so the
/// extras stages can iterate shortest-first (matching the reference
/// mutator's iteration order, which keeps the short, most impactful tokens
/// cheap to try first).
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    tokens: Vec<Vec<u8>>,
}

impl TokenSet {
    pub fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.tokens.iter().map(Vec::as_slice)
    }

    pub fn insert(&mut self, token: Vec<u8>) {
        if token.is_empty() || self.tokens.iter().any(|t| t == &token) {
            return;
        }
        let pos = self.tokens.partition_point(|t| t.len() <= token.len());
        self.tokens.insert(pos, token);
    }
}

/// Parses a dictionary file in the common one-token-per-line format: blank
/// lines and `#`-prefixed comments are skipped, a bare token is used
/// literally, and a `"quoted"` token goes through the usual `\xNN` / `\\` /
/// `\"` escapes (the AFL `-x` dictionary format).
pub fn parse_dictionary_file(contents: &str) -> Vec<Vec<u8>> {
    let mut tokens = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Lines may be `name="value"` or bare `"value"`; only the quoted
        // payload matters.
        let Some(start) = line.find('"') else {
            continue;
        };
        let Some(end) = line.rfind('"') else {
            continue;
        };
        if end <= start {
            continue;
        }
        let quoted = &line[start + 1..end];
        tokens.push(unescape(quoted));
    }
    tokens
}

fn unescape(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'x' if i + 3 < bytes.len() => {
                    if let Ok(v) = u8::from_str_radix(
                        std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or(""),
                        16,
                    ) {
                        out.push(v);
                        i += 4;
                        continue;
                    }
                }
                b'\\' => {
                    out.push(b'\\');
                    i += 2;
                    continue;
                }
                b'"' => {
                    out.push(b'"');
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// The two dictionaries consulted by the `extras` mutator stages: user
/// supplied tokens (`-x`) and ones the bitflip stage discovered on its own
/// by noticing boundary differences between consecutive runs.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    pub extras: TokenSet,
    pub auto_extras: TokenSet,
    /// Discovery order of `auto_extras`, oldest first; `TokenSet` itself is
    /// kept length-sorted for iteration, so eviction order has to be
    /// tracked separately.
    auto_order: std::collections::VecDeque<Vec<u8>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file(&mut self, contents: &str) {
        for token in parse_dictionary_file(contents) {
            self.extras.insert(token);
        }
    }

    /// Adds an auto-discovered token, evicting the oldest entry (by
    /// discovery order) once the cap is reached.
    pub fn add_auto(&mut self, token: Vec<u8>) {
        if token.is_empty() || self.auto_extras.iter().any(|t| t == token) {
            return;
        }
        if self.auto_extras.len() >= MAX_AUTO_EXTRAS {
            if let Some(oldest) = self.auto_order.pop_front() {
                self.auto_extras.tokens.retain(|t| t != &oldest);
            }
        }
        self.auto_order.push_back(token.clone());
        self.auto_extras.insert(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dictionary_iterates_nothing() {
        let d = Dictionary::new();
        assert!(d.extras.is_empty());
        assert!(d.auto_extras.is_empty());
        assert_eq!(d.extras.iter().count(), 0);
    }

    #[test]
    fn tokens_sorted_by_length_ascending() {
        let mut set = TokenSet::new();
        set.insert(b"longer".to_vec());
        set.insert(b"a".to_vec());
        set.insert(b"mid".to_vec());
        let lens: Vec<usize> = set.iter().map(|t| t.len()).collect();
        assert_eq!(lens, vec![1, 3, 6]);
    }

    #[test]
    fn duplicate_and_empty_tokens_are_ignored() {
        let mut set = TokenSet::new();
        set.insert(b"x".to_vec());
        set.insert(b"x".to_vec());
        set.insert(Vec::new());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn parses_quoted_and_escaped_tokens() {
        let file = "# comment\nkw1=\"foo\"\n\"bar\\x00baz\"\n\nkw2=\"a\\\"b\"\n";
        let tokens = parse_dictionary_file(file);
        assert_eq!(tokens, vec![b"foo".to_vec(), b"bar\0baz".to_vec(), b"a\"b".to_vec()]);
    }

    #[test]
    fn auto_extras_evict_oldest_past_cap() {
        let mut dict = Dictionary::new();
        for i in 0..MAX_AUTO_EXTRAS {
            dict.add_auto(format!("tok{i}").into_bytes());
        }
        assert_eq!(dict.auto_extras.len(), MAX_AUTO_EXTRAS);
        dict.add_auto(b"overflow".to_vec());
        assert_eq!(dict.auto_extras.len(), MAX_AUTO_EXTRAS);
        assert!(dict
            .auto_extras
            .iter()
            .any(|t| t == b"overflow"));
    }
}
