//! Backend Adapters
//!
//! Concrete backend variants behind the capability interface. Each adapter
//! holds a shared handle to its store and locks it per call, so backend locks
//! stay leaf-level: no adapter ever takes another backend's lock while
//! holding its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::graph::{EdgeType, GraphConfig, MemoryGraph};
use crate::memory::{MemoryRecord, QueryCriteria};
use crate::tier1::Tier1Store;
use crate::tier2::{Tier2Criteria, Tier2Store};
use crate::vector::VectorStore;

use super::working::WorkingMemory;
use super::{lock, Backend, BackendKind, BackendStats, Capabilities, QueryHit};

/// Default association-walk depth for relationship queries
const DEFAULT_TRAVERSAL_DEPTH: usize = 2;

/// Score assigned to lossy digest back-pointers
const DIGEST_HIT_SCORE: f64 = 0.6;

/// Strength of automatically created Sequential edges
const SEQUENTIAL_EDGE_STRENGTH: f64 = 0.8;

// ============================================================================
// TIER 1 (JSONL) BACKEND
// ============================================================================

/// Source-of-truth backend over the Tier 1 day logs
pub struct Tier1Backend {
    pub(crate) store: Arc<Mutex<Tier1Store>>,
}

impl Backend for Tier1Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Jsonl
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_store()
            .with_retrieve()
            .with_query()
            .with_delete()
            .with_stats()
    }

    fn store(&self, record: &MemoryRecord) -> Result<()> {
        lock(&self.store, "tier1")?.store(record)
    }

    fn retrieve(&self, ci_id: &str, record_id: &str) -> Result<Option<MemoryRecord>> {
        let store = lock(&self.store, "tier1")?;
        Ok(store
            .get_any(ci_id, record_id)?
            .filter(MemoryRecord::is_active))
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        let store = lock(&self.store, "tier1")?;
        Ok(store
            .query(criteria)?
            .into_iter()
            .map(|record| QueryHit {
                record_id: record.record_id.clone(),
                score: 1.0,
                record: Some(record),
            })
            .collect())
    }

    fn delete(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        let mut store = lock(&self.store, "tier1")?;
        let Some(record) = store.get_any(ci_id, record_id)? else {
            return Ok(false);
        };
        // Tombstone, then rewrite-on-compact drops the bytes
        store.set_archived(ci_id, record_id, true)?;
        store.compact(ci_id, record.timestamp.date_naive())?;
        Ok(true)
    }

    fn stats(&self, ci_id: &str) -> Result<BackendStats> {
        let store = lock(&self.store, "tier1")?;
        let stats = store.stats(ci_id)?;
        Ok(BackendStats {
            records: stats.active_records,
            bytes: stats.total_bytes,
        })
    }
}

// ============================================================================
// TIER 2 (SQL) BACKEND
// ============================================================================

/// Digest-index backend. Digest-only: raw memory records are never stored
/// here, so the capability set omits `store` and the encoder routes around it.
pub struct SqlBackend {
    pub(crate) store: Arc<Mutex<Tier2Store>>,
}

impl Backend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_query().with_stats()
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        let Some(needle) = criteria
            .query_text
            .as_deref()
            .or(criteria.content_contains.as_deref())
        else {
            return Ok(Vec::new());
        };
        let needle_lower = needle.to_lowercase();

        let store = lock(&self.store, "tier2")?;
        let digests = store.query_digests(&Tier2Criteria {
            ci_id: criteria.ci_id.clone(),
            ..Default::default()
        })?;
        drop(store);

        let mut hits = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::new();
        for digest in digests {
            let matched = digest.theme.to_lowercase().contains(&needle_lower)
                || digest.summary.to_lowercase().contains(&needle_lower)
                || digest
                    .keywords
                    .iter()
                    .any(|k| needle_lower.contains(&k.to_lowercase()));
            if !matched {
                continue;
            }
            for record_id in digest.source_record_ids {
                if seen.insert(record_id.clone(), ()).is_none() {
                    hits.push(QueryHit {
                        record_id,
                        score: DIGEST_HIT_SCORE,
                        record: None,
                    });
                }
            }
        }
        Ok(hits)
    }

    fn stats(&self, ci_id: &str) -> Result<BackendStats> {
        let store = lock(&self.store, "tier2")?;
        let stats = store.stats(ci_id)?;
        Ok(BackendStats {
            records: stats.digests,
            bytes: 0,
        })
    }
}

// ============================================================================
// VECTOR BACKEND
// ============================================================================

/// Semantic backend over the TF-IDF vector store
pub struct VectorBackend {
    pub(crate) store: Arc<Mutex<VectorStore>>,
}

impl Backend for VectorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vector
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_store()
            .with_query()
            .with_delete()
            .with_stats()
    }

    fn store(&self, record: &MemoryRecord) -> Result<()> {
        lock(&self.store, "vector")?.store(record)
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        let Some(query_text) = criteria
            .query_text
            .as_deref()
            .or(criteria.content_contains.as_deref())
        else {
            return Ok(Vec::new());
        };
        let limit = criteria.limit.unwrap_or(super::DEFAULT_QUERY_LIMIT);
        let store = lock(&self.store, "vector")?;
        Ok(store
            .search(&criteria.ci_id, query_text, limit, None)?
            .into_iter()
            .map(|(record_id, score)| QueryHit {
                record_id,
                score: f64::from(score).clamp(0.0, 1.0),
                record: None,
            })
            .collect())
    }

    fn delete(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        lock(&self.store, "vector")?.delete(ci_id, record_id)
    }

    fn stats(&self, ci_id: &str) -> Result<BackendStats> {
        let store = lock(&self.store, "vector")?;
        Ok(BackendStats {
            records: store.stats(ci_id).embeddings as u64,
            bytes: 0,
        })
    }
}

// ============================================================================
// GRAPH BACKEND
// ============================================================================

/// Mutable graph state shared between the backend, the encoder's auto-edge
/// pass, and the consolidation engine
pub struct GraphRuntime {
    /// The associative graph itself
    pub graph: MemoryGraph,
    /// Auto-edge knobs
    pub config: GraphConfig,
    /// ci_id → (record_id, timestamp) of the CI's previous memory
    last_seen: HashMap<String, (String, DateTime<Utc>)>,
}

impl GraphRuntime {
    /// Fresh runtime with the given auto-edge configuration
    pub fn new(config: GraphConfig) -> Self {
        Self {
            graph: MemoryGraph::new(),
            config,
            last_seen: HashMap::new(),
        }
    }
}

/// Relationship backend over the in-memory graph
pub struct GraphBackend {
    pub(crate) runtime: Arc<Mutex<GraphRuntime>>,
}

impl Backend for GraphBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_store()
            .with_query()
            .with_delete()
            .with_stats()
    }

    fn store(&self, record: &MemoryRecord) -> Result<()> {
        let mut runtime = lock(&self.runtime, "graph")?;
        runtime.graph.upsert_node(&record.record_id);

        // Causal chain from the declared predecessor
        if let Some(predecessor) = &record.related_to {
            if let Err(e) =
                runtime
                    .graph
                    .add_edge(predecessor, &record.record_id, EdgeType::Causal, 1.0)
            {
                tracing::debug!(error = %e, "causal edge not created");
            }
        }

        if runtime.config.auto_edges {
            // Sequential edge from the CI's previous memory if close in time
            if let Some((prev_id, prev_ts)) = runtime.last_seen.get(&record.ci_id).cloned() {
                let gap = (record.timestamp - prev_ts).num_seconds().abs();
                if gap <= runtime.config.temporal_window_secs && prev_id != record.record_id {
                    if let Err(e) = runtime.graph.add_edge(
                        &prev_id,
                        &record.record_id,
                        EdgeType::Sequential,
                        SEQUENTIAL_EDGE_STRENGTH,
                    ) {
                        tracing::debug!(error = %e, "sequential edge not created");
                    }
                }
            }
        }

        runtime.last_seen.insert(
            record.ci_id.clone(),
            (record.record_id.clone(), record.timestamp),
        );
        Ok(())
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        let runtime = lock(&self.runtime, "graph")?;
        if let Some(seed) = &criteria.related_to {
            // Association walk; the seed itself is not a result
            return Ok(runtime
                .graph
                .traverse(seed, DEFAULT_TRAVERSAL_DEPTH)
                .into_iter()
                .filter(|hit| hit.depth > 0)
                .map(|hit| QueryHit {
                    record_id: hit.record_id,
                    score: hit.cumulative_strength.clamp(0.0, 1.0),
                    record: None,
                })
                .collect());
        }
        if criteria.query_text.is_some() {
            // Associative salience: surface the hubs
            let limit = criteria.limit.unwrap_or(super::DEFAULT_QUERY_LIMIT);
            return Ok(runtime
                .graph
                .top_by_centrality(limit)
                .into_iter()
                .filter(|(_, centrality)| *centrality > 0.0)
                .map(|(record_id, centrality)| QueryHit {
                    record_id,
                    score: centrality,
                    record: None,
                })
                .collect());
        }
        Ok(Vec::new())
    }

    fn delete(&self, _ci_id: &str, record_id: &str) -> Result<bool> {
        let mut runtime = lock(&self.runtime, "graph")?;
        Ok(runtime.graph.delete_node(record_id))
    }

    fn stats(&self, _ci_id: &str) -> Result<BackendStats> {
        let runtime = lock(&self.runtime, "graph")?;
        Ok(BackendStats {
            records: runtime.graph.stats().node_count as u64,
            bytes: 0,
        })
    }
}

// ============================================================================
// CACHE (WORKING MEMORY) BACKEND
// ============================================================================

/// Hot-set backend over the bounded working memory
pub struct CacheBackend {
    pub(crate) store: Arc<Mutex<WorkingMemory>>,
}

impl Backend for CacheBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cache
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_store()
            .with_retrieve()
            .with_query()
            .with_delete()
            .with_stats()
    }

    fn store(&self, record: &MemoryRecord) -> Result<()> {
        lock(&self.store, "working")?.store(record);
        Ok(())
    }

    fn retrieve(&self, ci_id: &str, record_id: &str) -> Result<Option<MemoryRecord>> {
        Ok(lock(&self.store, "working")?.get(ci_id, record_id).cloned())
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        Ok(lock(&self.store, "working")?
            .query(criteria)
            .into_iter()
            .map(|(record, score)| QueryHit {
                record_id: record.record_id.clone(),
                score,
                record: Some(record),
            })
            .collect())
    }

    fn delete(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        Ok(lock(&self.store, "working")?.delete(ci_id, record_id))
    }

    fn stats(&self, ci_id: &str) -> Result<BackendStats> {
        Ok(BackendStats {
            records: lock(&self.store, "working")?.len(ci_id) as u64,
            bytes: 0,
        })
    }
}
