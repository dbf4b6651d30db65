//! Universal Encoder - store everywhere, synthesize on recall
//!
//! Owns the ordered backend list. Writes fan out to every backend that
//! supports `store` and succeed if at least one accepts; reads pick the
//! backend best suited to the criteria and fall back down the chain, ending
//! at the Tier 1 linear scan, which is always correct.

mod backends;
mod working;

pub use backends::{
    CacheBackend, GraphBackend, GraphRuntime, SqlBackend, Tier1Backend, VectorBackend,
};
pub use working::{WorkingMemory, DEFAULT_WORKING_CAPACITY};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::access::AccessPolicy;
use crate::error::{KatraError, Result};
use crate::graph::EdgeType;
use crate::memory::{CriteriaShape, MemoryRecord, QueryCriteria};
use crate::tier1::Tier1Store;
use crate::tier2::Tier2Store;
use crate::vector::VectorStore;

/// Default result budget when the criteria set no limit
pub const DEFAULT_QUERY_LIMIT: usize = 20;

/// Lock a backend mutex, mapping poisoning onto the internal taxonomy
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| KatraError::Logic(format!("{what} lock poisoned")))
}

// ============================================================================
// BACKEND INTERFACE
// ============================================================================

/// Identity of a registered backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Tier 1 append-only day logs; the source of truth
    Jsonl,
    /// Tier 2 structured digest index
    Sql,
    /// TF-IDF vector index
    Vector,
    /// Associative graph
    Graph,
    /// Bounded working memory
    Cache,
}

impl BackendKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Jsonl => "jsonl",
            BackendKind::Sql => "sql",
            BackendKind::Vector => "vector",
            BackendKind::Graph => "graph",
            BackendKind::Cache => "cache",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operations a backend declares support for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub store: bool,
    pub retrieve: bool,
    pub query: bool,
    pub delete: bool,
    pub update: bool,
    pub stats: bool,
}

impl Capabilities {
    /// No capabilities
    pub const fn none() -> Self {
        Self {
            store: false,
            retrieve: false,
            query: false,
            delete: false,
            update: false,
            stats: false,
        }
    }

    pub const fn with_store(mut self) -> Self {
        self.store = true;
        self
    }

    pub const fn with_retrieve(mut self) -> Self {
        self.retrieve = true;
        self
    }

    pub const fn with_query(mut self) -> Self {
        self.query = true;
        self
    }

    pub const fn with_delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub const fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    pub const fn with_stats(mut self) -> Self {
        self.stats = true;
        self
    }
}

/// One scored match from a backend query. Backends that hold full records
/// attach them; the rest return bare ids for the encoder to materialize from
/// Tier 1.
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// Matched record id
    pub record_id: String,
    /// Backend-local score in [0, 1]
    pub score: f64,
    /// Full record, when the backend had it on hand
    pub record: Option<MemoryRecord>,
}

/// Summary numbers a backend reports for one CI
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Records (or equivalent units) held
    pub records: u64,
    /// Bytes on disk, where meaningful
    pub bytes: u64,
}

/// The capability interface every backend implements.
///
/// Unsupported operations fall through to coded `NotSupported` errors; the
/// encoder consults `capabilities()` first and never calls them in the
/// normal path.
pub trait Backend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Declared operation support
    fn capabilities(&self) -> Capabilities;

    /// Persist one record
    fn store(&self, _record: &MemoryRecord) -> Result<()> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "store",
        })
    }

    /// Fetch one active record, if this backend holds records
    fn retrieve(&self, _ci_id: &str, _record_id: &str) -> Result<Option<MemoryRecord>> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "retrieve",
        })
    }

    /// Scored matches for the criteria
    fn query(&self, _criteria: &QueryCriteria) -> Result<Vec<QueryHit>> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "query",
        })
    }

    /// Remove one record
    fn delete(&self, _ci_id: &str, _record_id: &str) -> Result<bool> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "delete",
        })
    }

    /// Replace one record in place
    fn update(&self, _record: &MemoryRecord) -> Result<()> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "update",
        })
    }

    /// Per-CI summary numbers
    fn stats(&self, _ci_id: &str) -> Result<BackendStats> {
        Err(KatraError::NotSupported {
            backend: self.kind().as_str(),
            operation: "stats",
        })
    }
}

/// Per-backend result of a fan-out store
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// Record that was stored
    pub record_id: String,
    /// Backends that accepted the write
    pub accepted: Vec<BackendKind>,
    /// Backends that failed, with their error text
    pub failed: Vec<(BackendKind, String)>,
}

impl StoreOutcome {
    /// At least one supported backend accepted
    pub fn succeeded(&self) -> bool {
        !self.accepted.is_empty()
    }
}

// ============================================================================
// UNIVERSAL ENCODER
// ============================================================================

/// Fan-out write, fallback read dispatcher over the registered backends
pub struct UniversalEncoder {
    policy: AccessPolicy,
    backends: Vec<Box<dyn Backend>>,
    tier1: Arc<Mutex<Tier1Store>>,
    vector: Option<Arc<Mutex<VectorStore>>>,
    graph: Arc<Mutex<GraphRuntime>>,
}

impl UniversalEncoder {
    /// Wire the encoder over shared store handles.
    ///
    /// Backend order is fixed: Jsonl (source of truth) first, then Sql,
    /// Vector (when enabled), Graph, Cache.
    pub fn new(
        policy: AccessPolicy,
        tier1: Arc<Mutex<Tier1Store>>,
        tier2: Arc<Mutex<Tier2Store>>,
        vector: Option<Arc<Mutex<VectorStore>>>,
        graph: Arc<Mutex<GraphRuntime>>,
        working: Arc<Mutex<WorkingMemory>>,
    ) -> Self {
        let mut backends: Vec<Box<dyn Backend>> = vec![
            Box::new(Tier1Backend {
                store: tier1.clone(),
            }),
            Box::new(SqlBackend { store: tier2 }),
        ];
        if let Some(vector) = &vector {
            backends.push(Box::new(VectorBackend {
                store: vector.clone(),
            }));
        }
        backends.push(Box::new(GraphBackend {
            runtime: graph.clone(),
        }));
        backends.push(Box::new(CacheBackend { store: working }));

        Self {
            policy,
            backends,
            tier1,
            vector,
            graph,
        }
    }

    /// Registered backend kinds, in dispatch order
    pub fn registered(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// The access policy applied to every read path
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn backend(&self, kind: BackendKind) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(|b| b.as_ref())
    }

    /// Write contract: invoke `store` on every backend that supports it.
    ///
    /// Succeeds if at least one accepts; partial failures are reported per
    /// backend and never rolled back. Zero acceptances is the coded
    /// `AllBackendsFailedStore`.
    pub fn store(&self, record: &MemoryRecord) -> Result<StoreOutcome> {
        // Invariant 6: a dangling causal predecessor is tolerated but logged
        if let Some(predecessor) = &record.related_to {
            let known = lock(&self.tier1, "tier1")?
                .get_any(&record.ci_id, predecessor)?
                .is_some();
            if !known {
                tracing::warn!(
                    record_id = %record.record_id,
                    related_to = %predecessor,
                    "related_to references an unknown record"
                );
            }
        }

        let mut outcome = StoreOutcome {
            record_id: record.record_id.clone(),
            accepted: Vec::new(),
            failed: Vec::new(),
        };
        for backend in &self.backends {
            if !backend.capabilities().store {
                continue;
            }
            match backend.store(record) {
                Ok(()) => outcome.accepted.push(backend.kind()),
                Err(e) => {
                    tracing::warn!(
                        backend = backend.kind().as_str(),
                        record_id = %record.record_id,
                        error = %e,
                        "backend store failed"
                    );
                    outcome.failed.push((backend.kind(), e.to_string()));
                }
            }
        }

        if outcome.accepted.is_empty() {
            return Err(KatraError::AllBackendsFailedStore {
                record_id: record.record_id.clone(),
                failures: outcome
                    .failed
                    .iter()
                    .map(|(kind, error)| format!("{kind}: {error}"))
                    .collect(),
            });
        }

        self.create_similar_edges(record);
        Ok(outcome)
    }

    /// Similar-edge pass: ask the vector index for the nearest memories and
    /// link the new record to each close enough one. Locks are taken one at
    /// a time, vector first, then graph.
    fn create_similar_edges(&self, record: &MemoryRecord) {
        let Some(vector) = &self.vector else {
            return;
        };
        let (enabled, threshold, max_edges) = match self.graph.lock() {
            Ok(runtime) => (
                runtime.config.auto_edges,
                runtime.config.similarity_threshold,
                runtime.config.max_similar_edges,
            ),
            Err(_) => return,
        };
        if !enabled || max_edges == 0 {
            return;
        }

        let neighbors = match lock(vector, "vector")
            .and_then(|v| v.search(&record.ci_id, &record.content, max_edges + 1, Some(threshold)))
        {
            Ok(neighbors) => neighbors,
            Err(e) => {
                tracing::debug!(error = %e, "similar-edge search failed");
                return;
            }
        };

        let Ok(mut runtime) = self.graph.lock() else {
            return;
        };
        for (neighbor_id, score) in neighbors
            .into_iter()
            .filter(|(id, _)| id != &record.record_id)
            .take(max_edges)
        {
            if let Err(e) = runtime.graph.add_edge(
                &record.record_id,
                &neighbor_id,
                EdgeType::Similar,
                f64::from(score),
            ) {
                tracing::debug!(error = %e, "similar edge not created");
            }
        }
    }

    /// Read contract: try the backend best suited to the criteria, fall back
    /// on failure or empty result, ending at the Tier 1 linear scan. The
    /// first non-empty materialized result wins.
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<MemoryRecord>> {
        let order: &[BackendKind] = match criteria.shape() {
            CriteriaShape::Semantic => &[BackendKind::Vector, BackendKind::Cache, BackendKind::Jsonl],
            CriteriaShape::Relationship => &[BackendKind::Graph, BackendKind::Jsonl],
            CriteriaShape::Structured => &[BackendKind::Sql, BackendKind::Jsonl],
        };

        let mut attempted = 0_usize;
        let mut failures = Vec::new();
        for kind in order {
            let Some(backend) = self.backend(*kind) else {
                continue;
            };
            if !backend.capabilities().query {
                continue;
            }
            attempted += 1;
            match backend.query(criteria) {
                Ok(hits) => {
                    let records = self.materialize(criteria, hits)?;
                    if !records.is_empty() {
                        return Ok(records);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        backend = kind.as_str(),
                        error = %e,
                        "backend query failed; falling back"
                    );
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        if attempted > 0 && failures.len() == attempted {
            return Err(KatraError::AllBackendsFailedQuery {
                ci_id: criteria.ci_id.clone(),
                failures,
            });
        }
        Ok(Vec::new())
    }

    /// Raw scored hits from one backend, for synthesis
    pub fn query_backend(
        &self,
        kind: BackendKind,
        criteria: &QueryCriteria,
    ) -> Result<Vec<QueryHit>> {
        let backend = self
            .backend(kind)
            .ok_or(KatraError::NotSupported {
                backend: kind.as_str(),
                operation: "query",
            })?;
        backend.query(criteria)
    }

    /// Turn scored hits into full, visible records: best score per id,
    /// resolve bare ids through Tier 1, drop tombstones, apply the
    /// structural filters and the access predicate, honor the limit.
    pub fn materialize(
        &self,
        criteria: &QueryCriteria,
        mut hits: Vec<QueryHit>,
    ) -> Result<Vec<MemoryRecord>> {
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for hit in hits {
            if !seen.insert(hit.record_id.clone()) {
                continue;
            }
            let record = match hit.record {
                Some(record) => record,
                None => {
                    let tier1 = lock(&self.tier1, "tier1")?;
                    match tier1.get_any(&criteria.ci_id, &hit.record_id)? {
                        Some(record) => record,
                        None => continue,
                    }
                }
            };
            if record.archived && !criteria.include_archived {
                continue;
            }
            if !criteria.matches(&record) {
                continue;
            }
            if !self
                .policy
                .permits(&record, criteria.requesting_ci_id.as_deref())
            {
                continue;
            }
            out.push(record);
            if criteria.limit.is_some_and(|n| out.len() >= n) {
                break;
            }
        }
        Ok(out)
    }

    /// Fetch one record through the source of truth, with the access check.
    ///
    /// A visible miss is `Ok(None)`; a present-but-forbidden record is the
    /// distinct `AccessDenied` code.
    pub fn retrieve(
        &self,
        ci_id: &str,
        record_id: &str,
        requester: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        lock(&self.tier1, "tier1")?.get(ci_id, record_id, requester)
    }

    /// Remove a record from every backend that supports delete
    pub fn delete(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        let mut removed_any = false;
        for backend in &self.backends {
            if !backend.capabilities().delete {
                continue;
            }
            match backend.delete(ci_id, record_id) {
                Ok(removed) => removed_any |= removed,
                Err(e) => {
                    tracing::warn!(
                        backend = backend.kind().as_str(),
                        record_id,
                        error = %e,
                        "backend delete failed"
                    );
                }
            }
        }
        Ok(removed_any)
    }

    /// Per-backend statistics for one CI
    pub fn stats(&self, ci_id: &str) -> Vec<(BackendKind, BackendStats)> {
        self.backends
            .iter()
            .filter(|b| b.capabilities().stats)
            .map(|b| {
                let stats = b.stats(ci_id).unwrap_or_else(|e| {
                    tracing::warn!(backend = b.kind().as_str(), error = %e, "stats failed");
                    BackendStats::default()
                });
                (b.kind(), stats)
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphConfig;
    use crate::memory::RecordType;
    use crate::vector::{EmbeddingMethod, DEFAULT_SIMILARITY_THRESHOLD};

    fn encoder_with(dir: &std::path::Path, graph_config: GraphConfig) -> UniversalEncoder {
        let policy = AccessPolicy::without_teams();
        let tier1 = Arc::new(Mutex::new(
            Tier1Store::open(dir.join("tier1"), policy.clone()).unwrap(),
        ));
        let tier2 = Arc::new(Mutex::new(Tier2Store::open(dir.join("tier2")).unwrap()));
        let vector = Arc::new(Mutex::new(
            VectorStore::open(
                dir.join("tier2").join("vectors"),
                EmbeddingMethod::TfIdf,
                DEFAULT_SIMILARITY_THRESHOLD,
            )
            .unwrap(),
        ));
        let graph = Arc::new(Mutex::new(GraphRuntime::new(graph_config)));
        let working = Arc::new(Mutex::new(WorkingMemory::default()));
        UniversalEncoder::new(policy, tier1, tier2, Some(vector), graph, working)
    }

    fn encoder(dir: &std::path::Path) -> UniversalEncoder {
        encoder_with(dir, GraphConfig::default())
    }

    fn record(ci: &str, content: &str) -> MemoryRecord {
        MemoryRecord::new(ci, RecordType::Experience, content, 0.5).unwrap()
    }

    #[test]
    fn test_store_fans_out_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());

        let outcome = enc.store(&record("ci-a", "fan out everywhere")).unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.accepted.contains(&BackendKind::Jsonl));
        assert!(outcome.accepted.contains(&BackendKind::Vector));
        assert!(outcome.accepted.contains(&BackendKind::Graph));
        assert!(outcome.accepted.contains(&BackendKind::Cache));
        // Tier 2 is digest-only: never part of the raw-record fan-out
        assert!(!outcome.accepted.contains(&BackendKind::Sql));
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn test_stored_record_retrievable_via_tier1() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        let r = record("ci-a", "must land in the source of truth");
        enc.store(&r).unwrap();

        let back = enc.retrieve("ci-a", &r.record_id, None).unwrap().unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_semantic_query_routes_to_vector() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        let dragon = record("ci-a", "I attended Dragon Con in Atlanta with George R R Martin");
        enc.store(&dragon).unwrap();
        enc.store(&record("ci-a", "The Roman Empire history is fascinating")).unwrap();
        enc.store(&record("ci-a", "Machine learning algorithms process data")).unwrap();

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.query_text = Some("Dragon Atlanta".to_string());
        let results = enc.query(&criteria).unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].record_id, dragon.record_id);
    }

    #[test]
    fn test_structured_query_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        let r = record("ci-a", "plain structured lookup");
        enc.store(&r).unwrap();

        // No digests exist, so the Sql backend is empty and the encoder must
        // end at the Tier 1 linear scan
        let results = enc.query(&QueryCriteria::for_ci("ci-a")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record_id, r.record_id);
    }

    #[test]
    fn test_relationship_query_walks_graph() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        let first = record("ci-a", "the root of a causal chain");
        enc.store(&first).unwrap();
        let second = record("ci-a", "a direct consequence")
            .with_related_to(first.record_id.clone());
        enc.store(&second).unwrap();

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.related_to = Some(first.record_id.clone());
        let results = enc.query(&criteria).unwrap();

        assert!(results.iter().any(|r| r.record_id == second.record_id));
        assert!(results.iter().all(|r| r.record_id != first.record_id));
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        let r = record("ci-a", "store then delete then query");
        enc.store(&r).unwrap();

        assert!(enc.delete("ci-a", &r.record_id).unwrap());
        assert!(enc.retrieve("ci-a", &r.record_id, None).unwrap().is_none());
        assert!(enc.query(&QueryCriteria::for_ci("ci-a")).unwrap().is_empty());
    }

    #[test]
    fn test_private_records_filtered_for_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        enc.store(&record("ci-a", "my private thought")).unwrap();

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.requesting_ci_id = Some("ci-b".to_string());
        assert!(enc.query(&criteria).unwrap().is_empty());

        // Semantic path filters the same way
        criteria.query_text = Some("private thought".to_string());
        assert!(enc.query(&criteria).unwrap().is_empty());
    }

    #[test]
    fn test_auto_edges_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder_with(dir.path(), GraphConfig::default().with_auto_edges());

        let first = record("ci-a", "watching the dragon con parade in atlanta");
        let second = record("ci-a", "more dragon con parade photos from atlanta");
        enc.store(&first).unwrap();
        enc.store(&second).unwrap();

        // Sequential edge: previous memory -> new memory
        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.related_to = Some(first.record_id.clone());
        let forward = enc.query(&criteria).unwrap();
        assert!(forward.iter().any(|r| r.record_id == second.record_id));

        // Similar edge: new memory -> nearest existing memory
        criteria.related_to = Some(second.record_id.clone());
        let backward = enc.query(&criteria).unwrap();
        assert!(backward.iter().any(|r| r.record_id == first.record_id));
    }

    #[test]
    fn test_registered_order() {
        let dir = tempfile::tempdir().unwrap();
        let enc = encoder(dir.path());
        assert_eq!(
            enc.registered(),
            vec![
                BackendKind::Jsonl,
                BackendKind::Sql,
                BackendKind::Vector,
                BackendKind::Graph,
                BackendKind::Cache,
            ]
        );
    }
}
