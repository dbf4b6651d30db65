//! # Katra Core
//!
//! Persistent-memory substrate for Companion Intelligence agents: a
//! per-identity, multi-tier, multi-backend store. Every memory is written to
//! every capable backend simultaneously and recalled through whichever index
//! best fits the question - store everywhere, synthesize on recall.
//!
//! - **Tier 1**: append-only per-day JSONL logs, the source of truth
//! - **Tier 2**: SQLite structured digests built by consolidation
//! - **Tier 3**: pattern summaries compressing redundant memories
//! - **Vector index**: hashed TF-IDF embeddings with cosine recall
//! - **Graph store**: associative edges, traversal, and centrality
//! - **Universal Encoder**: fan-out writes, best-backend reads with fallback
//! - **Consolidation**: ordered preservation rules and crash-safe archival
//! - **Synthesis**: weighted cross-backend ranking
//! - **Access control**: private / team / public / explicit-share filtering
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use katra_core::{BreatheInput, KatraConfig, KatraEngine, QueryCriteria};
//!
//! let engine = KatraEngine::new(None, KatraConfig::default().with_vector_search())?;
//!
//! // Ingest a memory
//! let (record, outcome) = engine.breathe(BreatheInput::new(
//!     "ci-aria",
//!     "I attended Dragon Con in Atlanta",
//!     0.7,
//! ))?;
//! assert!(outcome.succeeded());
//!
//! // Recall semantically
//! let mut criteria = QueryCriteria::for_ci("ci-aria");
//! criteria.query_text = Some("Dragon Atlanta".to_string());
//! let results = engine.recall(&criteria)?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod access;
pub mod audit;
pub mod config;
pub mod consolidation;
pub mod encoder;
mod engine;
pub mod error;
pub mod graph;
pub mod memory;
pub mod synthesis;
pub mod tier1;
pub mod tier2;
pub mod tier3;
pub mod vector;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Memory model
pub use memory::{
    CriteriaShape, Isolation, MemoryRecord, QueryCriteria, RecordType, MAX_CONTENT_BYTES,
};

// Errors
pub use error::{ErrorCategory, KatraError, Result};

// Tier stores
pub use tier1::{CompactOutcome, KeywordIndex, Tier1Stats, Tier1Store};
pub use tier2::{Digest, PeriodKind, Tier2Criteria, Tier2Stats, Tier2Store};
pub use tier3::{PatternRecord, Tier3Stats, Tier3Store};

// Vector index
pub use vector::{
    cosine_similarity, tokenize, Embedding, EmbeddingMethod, ExternalEmbeddingProvider, IdfStats,
    VectorStats, VectorStore, DEFAULT_SIMILARITY_THRESHOLD, EMBEDDING_DIMENSIONS,
};

// Graph store
pub use graph::{
    EdgeType, GraphConfig, GraphStats, MemoryGraph, TraversalHit, MAX_PATHS,
};

// Universal encoder
pub use encoder::{
    Backend, BackendKind, BackendStats, Capabilities, GraphRuntime, QueryHit, StoreOutcome,
    UniversalEncoder, WorkingMemory, DEFAULT_WORKING_CAPACITY,
};

// Consolidation
pub use consolidation::{
    decide, detect_clusters, ArchiveReason, ConsolidationConfig, ConsolidationReport,
    Consolidator, Disposition, PatternRole, PreserveReason,
};

// Synthesis
pub use synthesis::{
    merge_backend_hits, synthesize, MergedHit, SynthesisAlgorithm, SynthesisOptions,
    SynthesisResult,
};

// Access control
pub use access::{AccessPolicy, NoTeams, SqliteTeamDirectory, TeamDirectory};

// Configuration and engine
pub use config::{stable_ci_id, KatraConfig, LogLevel};
pub use engine::{BreatheInput, EngineStats, KatraEngine};

// Audit trail
pub use audit::{AuditEvent, AuditLog};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BreatheInput, Isolation, KatraConfig, KatraEngine, KatraError, MemoryRecord,
        QueryCriteria, RecordType, Result, StoreOutcome, SynthesisOptions,
    };
}
