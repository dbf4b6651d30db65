//! Persisted Vector Store
//!
//! Per-CI embeddings plus the per-CI IDF vocabulary, persisted under
//! `tier2/vectors/<ID>/embeddings.dat`. The IDF table sits behind a
//! read/write lock: ingest takes the write side, query embedding only ever
//! the read side, which is how "queries do not pollute the corpus" is encoded
//! in the types.

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use lru::LruCache;

use crate::error::{io_err, KatraError, Result};
use crate::memory::MemoryRecord;

use super::tfidf::{
    embed_tokens, tokenize, Embedding, IdfStats, Weighting, EMBEDDING_DIMENSIONS,
};

/// Default minimum cosine similarity for a search hit
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;

/// Query embeddings memoized per store
const QUERY_CACHE_CAPACITY: usize = 100;

/// Vector file format version, written into the header
const VECTOR_FILE_VERSION: u32 = 1;

// ============================================================================
// EMBEDDING METHOD
// ============================================================================

/// How embeddings are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingMethod {
    /// Hashed term frequency only
    Hash,
    /// Hashed TF-IDF against the per-CI corpus (default)
    #[default]
    TfIdf,
    /// Delegate to a registered external provider, TF-IDF fallback
    External,
}

impl std::str::FromStr for EmbeddingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HASH" => Ok(EmbeddingMethod::Hash),
            "TFIDF" => Ok(EmbeddingMethod::TfIdf),
            "EXTERNAL" => Ok(EmbeddingMethod::External),
            _ => Err(format!("unknown embedding method: {s}")),
        }
    }
}

/// Alternate embedding source invoked by API key
///
/// Provider wrappers live outside the engine; this is the whole contract.
pub trait ExternalEmbeddingProvider: Send {
    /// Provider tag for logs
    fn name(&self) -> &'static str;
    /// Credentials present and believed valid
    fn is_available(&self) -> bool;
    /// Produce a raw vector of `EMBEDDING_DIMENSIONS` floats
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============================================================================
// PER-CI STATE
// ============================================================================

#[derive(Default)]
struct CiVectors {
    /// Corpus statistics; write side for ingest, read side for queries
    idf: RwLock<IdfStats>,
    embeddings: HashMap<String, Embedding>,
    /// Token sequences for the contiguous-phrase shortcut (session-local)
    tokens: HashMap<String, Vec<String>>,
}

/// Per-CI vector statistics
#[derive(Debug, Clone, Default)]
pub struct VectorStats {
    /// Stored embeddings
    pub embeddings: usize,
    /// Distinct vocabulary terms
    pub vocab_size: usize,
    /// Documents folded into the IDF table
    pub total_docs: u64,
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// Multi-CI persisted vector index
pub struct VectorStore {
    dir: PathBuf,
    method: EmbeddingMethod,
    external: Option<Box<dyn ExternalEmbeddingProvider>>,
    similarity_threshold: f32,
    cis: HashMap<String, CiVectors>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl VectorStore {
    /// Open the store rooted at `<memory root>/tier2/vectors`, reloading any
    /// persisted per-CI files
    pub fn open(
        dir: impl Into<PathBuf>,
        method: EmbeddingMethod,
        similarity_threshold: f32,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err("creating vector store root"))?;

        let mut store = Self {
            dir,
            method,
            external: None,
            similarity_threshold: similarity_threshold.clamp(0.0, 1.0),
            cis: HashMap::new(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        };

        let entries: Vec<_> = fs::read_dir(&store.dir)
            .map_err(io_err("listing vector store root"))?
            .collect::<std::io::Result<_>>()
            .map_err(io_err("listing vector store root"))?;
        for entry in entries {
            if !entry.path().is_dir() {
                continue;
            }
            let ci_id = entry.file_name().to_string_lossy().into_owned();
            match store.load_ci(&ci_id) {
                Ok(Some(ci)) => {
                    store.cis.insert(ci_id, ci);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(ci_id, error = %e, "failed to reload vector file; starting cold");
                }
            }
        }
        Ok(store)
    }

    /// Register the external provider used when the method is `External`
    pub fn register_external(&mut self, provider: Box<dyn ExternalEmbeddingProvider>) {
        self.external = Some(provider);
    }

    /// Configured similarity floor
    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    fn ci_file(&self, ci_id: &str) -> PathBuf {
        self.dir.join(ci_id).join("embeddings.dat")
    }

    /// Fold a document into the CI's corpus statistics.
    ///
    /// This is the only operation that mutates the IDF table.
    pub fn update_stats(&mut self, ci_id: &str, text: &str) {
        let ci = self.cis.entry(ci_id.to_string()).or_default();
        let tokens = tokenize(text);
        match ci.idf.write() {
            Ok(mut idf) => idf.observe_document(&tokens),
            Err(_) => tracing::warn!(ci_id, "idf lock poisoned; skipping stats update"),
        }
        // IDF moved; memoized query vectors are stale
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.clear();
        }
    }

    fn weighting(&self) -> Weighting {
        match self.method {
            EmbeddingMethod::Hash => Weighting::Hash,
            _ => Weighting::TfIdf,
        }
    }

    fn external_embed(&self, text: &str) -> Option<Embedding> {
        let provider = self.external.as_ref()?;
        if !provider.is_available() {
            tracing::debug!(
                provider = provider.name(),
                "external provider unavailable; falling back to TF-IDF"
            );
            return None;
        }
        match provider.embed(text) {
            Ok(vector) if vector.len() == EMBEDDING_DIMENSIONS => {
                Some(Embedding::from_raw(vector))
            }
            Ok(vector) => {
                tracing::warn!(
                    provider = provider.name(),
                    got = vector.len(),
                    expected = EMBEDDING_DIMENSIONS,
                    "external embedding has wrong dimension; falling back to TF-IDF"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    provider = provider.name(),
                    error = %e,
                    "external embedding failed; falling back to TF-IDF"
                );
                None
            }
        }
    }

    /// Store a record's embedding: fold it into the corpus, embed with the
    /// then-current statistics, persist.
    pub fn store(&mut self, record: &MemoryRecord) -> Result<()> {
        self.update_stats(&record.ci_id, &record.content);

        let external = if self.method == EmbeddingMethod::External {
            self.external_embed(&record.content)
        } else {
            None
        };

        let tokens = tokenize(&record.content);
        let weighting = self.weighting();
        let ci = self.cis.entry(record.ci_id.clone()).or_default();
        let embedding = match external {
            Some(emb) => emb,
            None => {
                let idf = ci
                    .idf
                    .read()
                    .map_err(|_| KatraError::Logic("idf lock poisoned".into()))?;
                embed_tokens(&tokens, &idf, weighting)
            }
        };

        ci.embeddings.insert(record.record_id.clone(), embedding);
        ci.tokens.insert(record.record_id.clone(), tokens);
        self.save_ci(&record.ci_id)
    }

    /// Embed a query string against the current statistics.
    ///
    /// Never mutates the IDF table; this is the tested purity invariant.
    pub fn embed_query(&self, ci_id: &str, text: &str) -> Result<Embedding> {
        let cache_key = format!("{ci_id}\u{1}{text}");
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(&cache_key) {
                let magnitude = if vector.iter().any(|&x| x != 0.0) {
                    1.0
                } else {
                    0.0
                };
                return Ok(Embedding {
                    vector: vector.clone(),
                    magnitude,
                });
            }
        }

        let tokens = tokenize(text);
        let embedding = match self.cis.get(ci_id) {
            Some(ci) => {
                let idf = ci
                    .idf
                    .read()
                    .map_err(|_| KatraError::Logic("idf lock poisoned".into()))?;
                embed_tokens(&tokens, &idf, self.weighting())
            }
            None => embed_tokens(&tokens, &IdfStats::new(), self.weighting()),
        };

        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(cache_key, embedding.vector.clone());
        }
        Ok(embedding)
    }

    /// Contiguous-phrase shortcut for short queries. Empty when cold.
    fn phrase_hits(&self, ci_id: &str, query_tokens: &[String]) -> Vec<(String, f32)> {
        let Some(ci) = self.cis.get(ci_id) else {
            return Vec::new();
        };
        let mut hits: Vec<(String, f32)> = ci
            .tokens
            .iter()
            .filter(|(_, tokens)| {
                tokens
                    .windows(query_tokens.len())
                    .any(|window| window == query_tokens)
            })
            .map(|(id, _)| (id.clone(), 1.0))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }

    /// Top-K cosine search over the CI's stored embeddings.
    ///
    /// Short queries try the contiguous-phrase path first; otherwise every
    /// stored vector is scored and results above the threshold are returned
    /// best-first.
    pub fn search(
        &self,
        ci_id: &str,
        query_text: &str,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(String, f32)>> {
        let query_tokens = tokenize(query_text);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        if query_tokens.len() <= 2 {
            let mut hits = self.phrase_hits(ci_id, &query_tokens);
            if !hits.is_empty() {
                hits.truncate(limit);
                return Ok(hits);
            }
        }

        let Some(ci) = self.cis.get(ci_id) else {
            return Ok(Vec::new());
        };

        let query = self.embed_query(ci_id, query_text)?;
        if query.magnitude == 0.0 {
            return Ok(Vec::new());
        }

        let threshold = threshold.unwrap_or(self.similarity_threshold);
        let mut scored: Vec<(String, f32)> = ci
            .embeddings
            .iter()
            .map(|(id, emb)| (id.clone(), query.cosine_similarity(emb)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Stored embedding for one record
    pub fn get_embedding(&self, ci_id: &str, record_id: &str) -> Option<Embedding> {
        self.cis
            .get(ci_id)
            .and_then(|ci| ci.embeddings.get(record_id))
            .cloned()
    }

    /// Whether a record has a stored embedding
    pub fn contains(&self, ci_id: &str, record_id: &str) -> bool {
        self.cis
            .get(ci_id)
            .is_some_and(|ci| ci.embeddings.contains_key(record_id))
    }

    /// Remove a record's embedding from memory and disk
    pub fn delete(&mut self, ci_id: &str, record_id: &str) -> Result<bool> {
        let Some(ci) = self.cis.get_mut(ci_id) else {
            return Ok(false);
        };
        let removed = ci.embeddings.remove(record_id).is_some();
        ci.tokens.remove(record_id);
        if removed {
            self.save_ci(ci_id)?;
        }
        Ok(removed)
    }

    /// Per-CI statistics
    pub fn stats(&self, ci_id: &str) -> VectorStats {
        match self.cis.get(ci_id) {
            Some(ci) => {
                let (vocab_size, total_docs) = ci
                    .idf
                    .read()
                    .map(|idf| (idf.vocab_size(), idf.total_docs()))
                    .unwrap_or((0, 0));
                VectorStats {
                    embeddings: ci.embeddings.len(),
                    vocab_size,
                    total_docs,
                }
            }
            None => VectorStats::default(),
        }
    }

    /// (vocab size, total docs) snapshot for purity checks
    pub fn corpus_snapshot(&self, ci_id: &str) -> (usize, u64) {
        let stats = self.stats(ci_id);
        (stats.vocab_size, stats.total_docs)
    }

    // ========================================================================
    // PERSISTENCE (§ vector file layout)
    // ========================================================================

    fn save_ci(&self, ci_id: &str) -> Result<()> {
        let Some(ci) = self.cis.get(ci_id) else {
            return Ok(());
        };
        let idf = ci
            .idf
            .read()
            .map_err(|_| KatraError::Logic("idf lock poisoned".into()))?;

        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&VECTOR_FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&(EMBEDDING_DIMENSIONS as u32).to_le_bytes());
        buf.extend_from_slice(&(idf.vocab_size() as u32).to_le_bytes());
        buf.extend_from_slice(&idf.total_docs().to_le_bytes());

        for (term, df) in idf.entries() {
            buf.extend_from_slice(&(term.len() as u32).to_le_bytes());
            buf.extend_from_slice(term.as_bytes());
            buf.extend_from_slice(&df.to_le_bytes());
        }

        for (record_id, embedding) in &ci.embeddings {
            buf.extend_from_slice(&(record_id.len() as u32).to_le_bytes());
            buf.extend_from_slice(record_id.as_bytes());
            buf.extend_from_slice(&(embedding.vector.len() as u32).to_le_bytes());
            for value in &embedding.vector {
                buf.extend_from_slice(&value.to_le_bytes());
            }
            buf.extend_from_slice(&embedding.magnitude.to_le_bytes());
        }
        drop(idf);

        let path = self.ci_file(ci_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("creating vector ci directory"))?;
        }
        let tmp = path.with_extension("dat.tmp");
        fs::write(&tmp, &buf).map_err(io_err("writing vector file"))?;
        fs::rename(&tmp, &path).map_err(io_err("swapping vector file"))?;
        Ok(())
    }

    fn load_ci(&self, ci_id: &str) -> Result<Option<CiVectors>> {
        let path = self.ci_file(ci_id);
        if !path.exists() {
            return Ok(None);
        }
        let buf = fs::read(&path).map_err(io_err("reading vector file"))?;
        let mut cursor = ByteCursor::new(&buf);

        let corrupt = |detail: &str| KatraError::Corruption {
            location: path.display().to_string(),
            detail: detail.to_string(),
        };

        let version = cursor.u32().ok_or_else(|| corrupt("missing version"))?;
        if version != VECTOR_FILE_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let dimensions = cursor.u32().ok_or_else(|| corrupt("missing dimensions"))?;
        if dimensions as usize != EMBEDDING_DIMENSIONS {
            return Err(corrupt(&format!("dimension mismatch: {dimensions}")));
        }
        let vocab_size = cursor.u32().ok_or_else(|| corrupt("missing vocab size"))?;
        let total_docs = cursor.u64().ok_or_else(|| corrupt("missing doc count"))?;

        let mut entries = Vec::with_capacity(vocab_size as usize);
        for _ in 0..vocab_size {
            let term = cursor.string().ok_or_else(|| corrupt("truncated vocab"))?;
            let df = cursor.u32().ok_or_else(|| corrupt("truncated vocab"))?;
            entries.push((term, df));
        }

        let mut embeddings = HashMap::new();
        loop {
            let Some(record_id) = cursor.string() else {
                if !cursor.at_end() {
                    tracing::warn!(file = %path.display(), "truncated vector record; tail dropped");
                }
                break;
            };
            let Some(dim_count) = cursor.u32() else {
                tracing::warn!(file = %path.display(), "truncated vector record; tail dropped");
                break;
            };
            let mut vector = Vec::with_capacity(dim_count as usize);
            let mut complete = true;
            for _ in 0..dim_count {
                match cursor.f32() {
                    Some(v) => vector.push(v),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            let magnitude = cursor.f32();
            if !complete || magnitude.is_none() {
                tracing::warn!(file = %path.display(), "truncated vector record; tail dropped");
                break;
            }
            embeddings.insert(
                record_id,
                Embedding {
                    vector,
                    magnitude: magnitude.expect("checked above"),
                },
            );
        }

        Ok(Some(CiVectors {
            idf: RwLock::new(IdfStats::from_entries(entries, total_docs)),
            embeddings,
            tokens: HashMap::new(),
        }))
    }
}

/// Bounds-checked little-endian reader
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    fn f32(&mut self) -> Option<f32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(f32::from_le_bytes(bytes))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
