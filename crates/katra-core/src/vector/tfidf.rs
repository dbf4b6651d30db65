//! TF-IDF Embedding Pipeline
//!
//! Fixed-dimension hashed embeddings: tokenize, weight by TF-IDF against the
//! per-CI corpus statistics, scatter each term into a hashed dimension with
//! neighbor smoothing, then L2-normalize. Query embeddings read the IDF table
//! without ever mutating it.

use std::collections::{HashMap, HashSet};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensionality
pub const EMBEDDING_DIMENSIONS: usize = 256;

/// Tokens shorter than this are dropped
pub const MIN_TOKEN_LEN: usize = 2;

/// Tokens longer than this are dropped
pub const MAX_TOKEN_LEN: usize = 32;

/// Per-document token budget
pub const MAX_TOKENS: usize = 512;

// ============================================================================
// TOKENIZER
// ============================================================================

/// Lowercase, split on non-alphanumeric, drop out-of-bounds tokens, cap the
/// total. Shared by the vector pipeline and the Tier 1 keyword index.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN && t.len() <= MAX_TOKEN_LEN)
        .take(MAX_TOKENS)
        .map(String::from)
        .collect()
}

// ============================================================================
// IDF STATISTICS
// ============================================================================

/// Inverse-document-frequency table shared by all of a CI's embeddings
///
/// Mutated only when a document enters the corpus; query embedding reads it
/// through an immutable borrow, which is what keeps queries from polluting
/// the statistics.
#[derive(Debug, Clone, Default)]
pub struct IdfStats {
    doc_freq: HashMap<String, u32>,
    total_docs: u64,
}

impl IdfStats {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u32)>, total_docs: u64) -> Self {
        Self {
            doc_freq: entries.into_iter().collect(),
            total_docs,
        }
    }

    /// Fold one document into the corpus statistics
    pub fn observe_document(&mut self, tokens: &[String]) {
        let unique: HashSet<&String> = tokens.iter().collect();
        for token in unique {
            *self.doc_freq.entry(token.clone()).or_insert(0) += 1;
        }
        self.total_docs += 1;
    }

    /// Laplace-smoothed IDF; unseen tokens get the `ln(N+1)` default weight
    pub fn idf(&self, token: &str) -> f32 {
        let n = self.total_docs as f32;
        match self.doc_freq.get(token) {
            Some(&df) if df > 0 => ((n + 1.0) / df as f32).ln(),
            _ => (n + 1.0).ln(),
        }
    }

    /// Distinct terms observed
    pub fn vocab_size(&self) -> usize {
        self.doc_freq.len()
    }

    /// Documents observed
    pub fn total_docs(&self) -> u64 {
        self.total_docs
    }

    /// Document frequency of one term
    pub fn doc_freq(&self, token: &str) -> u32 {
        self.doc_freq.get(token).copied().unwrap_or(0)
    }

    /// Iterate (term, document frequency) for persistence
    pub fn entries(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.doc_freq.iter()
    }
}

// ============================================================================
// EMBEDDING
// ============================================================================

/// A fixed-dimension embedding vector
///
/// Unit length after a successful embed; magnitude 0 iff the source text held
/// no valid tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector, `EMBEDDING_DIMENSIONS` long
    pub vector: Vec<f32>,
    /// 1.0 for a normalized vector, 0.0 for an empty one
    pub magnitude: f32,
}

impl Embedding {
    /// Wrap a raw vector, normalizing it to unit length
    pub fn from_raw(mut vector: Vec<f32>) -> Self {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
            Self {
                vector,
                magnitude: 1.0,
            }
        } else {
            Self {
                vector,
                magnitude: 0.0,
            }
        }
    }

    /// Zero vector for token-free text
    pub fn empty() -> Self {
        Self {
            vector: vec![0.0; EMBEDDING_DIMENSIONS],
            magnitude: 0.0,
        }
    }

    /// Cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Unit length within tolerance
    pub fn is_normalized(&self) -> bool {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() < 0.001
    }
}

/// Multiplicative string hash with a constant multiplier
fn hash_token(token: &str) -> u64 {
    let mut h: u64 = 0;
    for b in token.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as u64);
    }
    h
}

/// Term weighting scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// Pure hashed term frequency
    Hash,
    /// TF x IDF against the corpus statistics
    TfIdf,
}

/// Embed a token sequence against the given IDF table.
///
/// Each term lands in `hash(term) % D` with half-weight spill into the two
/// neighboring dimensions, then the vector is L2-normalized.
pub fn embed_tokens(tokens: &[String], idf: &IdfStats, weighting: Weighting) -> Embedding {
    if tokens.is_empty() {
        return Embedding::empty();
    }

    let mut counts: HashMap<&String, usize> = HashMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0) += 1;
    }
    let total = tokens.len() as f32;

    let d = EMBEDDING_DIMENSIONS;
    let mut vector = vec![0.0_f32; d];
    for (token, count) in counts {
        let tf = count as f32 / total;
        let weight = match weighting {
            Weighting::Hash => tf,
            Weighting::TfIdf => tf * idf.idf(token),
        };
        let dim = (hash_token(token) % d as u64) as usize;
        vector[dim] += weight;
        vector[(dim + d - 1) % d] += 0.5 * weight;
        vector[(dim + 1) % d] += 0.5 * weight;
    }

    Embedding::from_raw(vector)
}

/// Cosine similarity between two raw vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
