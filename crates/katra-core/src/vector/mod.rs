//! Vector Index - TF-IDF embeddings and cosine recall
//!
//! Hashed fixed-dimension embeddings over a per-CI IDF corpus, persisted to
//! disk and searched by exact cosine scan. Ingest mutates the corpus
//! statistics; queries never do.

mod store;
mod tfidf;

pub use store::{
    EmbeddingMethod, ExternalEmbeddingProvider, VectorStats, VectorStore,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use tfidf::{
    cosine_similarity, embed_tokens, tokenize, Embedding, IdfStats, Weighting,
    EMBEDDING_DIMENSIONS, MAX_TOKENS, MAX_TOKEN_LEN, MIN_TOKEN_LEN,
};
