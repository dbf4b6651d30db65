//! Full-Text Keyword Index
//!
//! Supplementary lookup over Tier 1 content keyed by record_id. Supports
//! exact-token, prefix, and contiguous-phrase queries. Tier 1 never relies on
//! it for correctness; the filtered scan is always available when the index
//! is cold.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::vector::tokenize;

// ============================================================================
// KEYWORD INDEX
// ============================================================================

/// In-memory token → record postings with per-document token sequences
#[derive(Debug, Default)]
pub struct KeywordIndex {
    /// token → record ids containing it (BTreeMap gives us prefix ranges)
    postings: BTreeMap<String, HashSet<String>>,
    /// record id → token sequence, for phrase verification
    docs: HashMap<String, Vec<String>>,
}

impl KeywordIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// No documents indexed
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Index (or re-index) a document
    pub fn insert(&mut self, record_id: &str, text: &str) {
        self.remove(record_id);
        let tokens = tokenize(text);
        for token in &tokens {
            self.postings
                .entry(token.clone())
                .or_default()
                .insert(record_id.to_string());
        }
        self.docs.insert(record_id.to_string(), tokens);
    }

    /// Drop a document from the index
    pub fn remove(&mut self, record_id: &str) {
        let Some(tokens) = self.docs.remove(record_id) else {
            return;
        };
        for token in tokens {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(record_id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    /// Records containing the exact token
    pub fn lookup(&self, token: &str) -> Vec<String> {
        let token = token.to_lowercase();
        self.postings
            .get(&token)
            .map(|ids| {
                let mut out: Vec<String> = ids.iter().cloned().collect();
                out.sort();
                out
            })
            .unwrap_or_default()
    }

    /// Records containing any token starting with `prefix`
    pub fn lookup_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut seen: HashSet<&str> = HashSet::new();
        for (token, ids) in self.postings.range(prefix.clone()..) {
            if !token.starts_with(&prefix) {
                break;
            }
            for id in ids {
                seen.insert(id.as_str());
            }
        }
        let mut out: Vec<String> = seen.into_iter().map(String::from).collect();
        out.sort();
        out
    }

    /// Records containing the tokens of `phrase` contiguously, in order
    pub fn lookup_phrase(&self, phrase: &str) -> Vec<String> {
        let needle = tokenize(phrase);
        if needle.is_empty() {
            return Vec::new();
        }
        if needle.len() == 1 {
            return self.lookup(&needle[0]);
        }

        // Candidates must contain every token; verify adjacency per doc
        let mut candidates: Option<HashSet<&String>> = None;
        for token in &needle {
            let Some(ids) = self.postings.get(token) else {
                return Vec::new();
            };
            candidates = Some(match candidates {
                None => ids.iter().collect(),
                Some(prev) => prev.into_iter().filter(|id| ids.contains(*id)).collect(),
            });
        }

        let mut out: Vec<String> = candidates
            .unwrap_or_default()
            .into_iter()
            .filter(|id| {
                self.docs
                    .get(*id)
                    .is_some_and(|tokens| tokens.windows(needle.len()).any(|w| w == needle))
            })
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.postings.clear();
        self.docs.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> KeywordIndex {
        let mut index = KeywordIndex::new();
        index.insert("r-1", "debugging null pointer in module k");
        index.insert("r-2", "null pointer exception traced to cache");
        index.insert("r-3", "pointer arithmetic in the allocator");
        index
    }

    #[test]
    fn test_token_lookup() {
        let index = seeded();
        assert_eq!(index.lookup("null"), vec!["r-1", "r-2"]);
        assert_eq!(index.lookup("allocator"), vec!["r-3"]);
        assert!(index.lookup("missing").is_empty());
    }

    #[test]
    fn test_prefix_lookup() {
        let index = seeded();
        assert_eq!(index.lookup_prefix("point"), vec!["r-1", "r-2", "r-3"]);
        assert_eq!(index.lookup_prefix("debu"), vec!["r-1"]);
    }

    #[test]
    fn test_phrase_lookup_requires_adjacency() {
        let index = seeded();
        // "null pointer" is contiguous in r-1 and r-2
        assert_eq!(index.lookup_phrase("null pointer"), vec!["r-1", "r-2"]);
        // r-2 contains both tokens but never "pointer cache" contiguously
        assert!(index.lookup_phrase("pointer cache").is_empty());
    }

    #[test]
    fn test_remove_and_reinsert() {
        let mut index = seeded();
        index.remove("r-1");
        assert_eq!(index.lookup("null"), vec!["r-2"]);
        assert_eq!(index.len(), 2);

        index.insert("r-2", "entirely different words now");
        assert!(index.lookup("null").is_empty());
        assert_eq!(index.lookup("entirely"), vec!["r-2"]);
    }
}
