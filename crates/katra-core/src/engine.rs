//! Katra Engine
//!
//! The engine context: owns the on-disk layout, the team directory, the
//! access policy, the Universal Encoder with its five backends, the
//! consolidator, and the audit trail. Front-ends call the breathing
//! primitives here; everything below is the machinery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use directories::ProjectDirs;

use crate::access::{AccessPolicy, SqliteTeamDirectory};
use crate::audit::AuditLog;
use crate::config::KatraConfig;
use crate::consolidation::{ConsolidationConfig, ConsolidationReport, Consolidator};
use crate::encoder::{
    lock, GraphRuntime, StoreOutcome, UniversalEncoder, WorkingMemory,
};
use crate::error::{io_err, KatraError, Result};
use crate::graph::GraphStats;
use crate::memory::{Isolation, MemoryRecord, QueryCriteria, RecordType};
use crate::synthesis::{self, SynthesisOptions, SynthesisResult};
use crate::tier1::{CompactOutcome, Tier1Stats, Tier1Store};
use crate::tier2::{Tier2Stats, Tier2Store};
use crate::tier3::{Tier3Stats, Tier3Store};
use crate::vector::{ExternalEmbeddingProvider, VectorStats, VectorStore};

// ============================================================================
// INPUTS
// ============================================================================

/// Input for the breathe primitive
#[derive(Debug, Clone)]
pub struct BreatheInput {
    /// Owning identity
    pub ci_id: String,
    /// Primary text payload
    pub content: String,
    /// Assigned importance in [0, 1]
    pub importance: f64,
    /// Kind of memory
    pub record_type: RecordType,
    /// Auxiliary response text
    pub response: Option<String>,
    /// Auxiliary context text
    pub context: Option<String>,
    /// Session fingerprint
    pub session_id: Option<String>,
    /// Categorization labels
    pub tags: Vec<String>,
    /// Hierarchical organization path
    pub collection: Option<String>,
    /// Access-control class
    pub isolation: Isolation,
    /// Team identifier, required when isolation is Team
    pub team_name: Option<String>,
    /// Emotional salience in [0, 1]
    pub emotion_intensity: Option<f64>,
    /// Short emotion tag
    pub emotion_type: Option<String>,
    /// Voluntary never-archive override
    pub marked_important: bool,
    /// Voluntary archive-now override
    pub marked_forgettable: bool,
    /// Causal predecessor record id
    pub related_to: Option<String>,
}

impl BreatheInput {
    /// Minimal input: everything else defaulted
    pub fn new(ci_id: impl Into<String>, content: impl Into<String>, importance: f64) -> Self {
        Self {
            ci_id: ci_id.into(),
            content: content.into(),
            importance,
            record_type: RecordType::Experience,
            response: None,
            context: None,
            session_id: None,
            tags: Vec::new(),
            collection: None,
            isolation: Isolation::Private,
            team_name: None,
            emotion_intensity: None,
            emotion_type: None,
            marked_important: false,
            marked_forgettable: false,
            related_to: None,
        }
    }
}

/// Per-CI roll-up across every backend
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub tier1: Tier1Stats,
    pub tier2: Tier2Stats,
    pub tier3: Tier3Stats,
    pub vector: Option<VectorStats>,
    pub graph: GraphStats,
    pub working_records: u64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The engine context passed to every caller.
///
/// Thread-safe: internal state is lock-per-subsystem, so `&self` methods may
/// be called from parallel threads.
pub struct KatraEngine {
    config: KatraConfig,
    teams: Arc<SqliteTeamDirectory>,
    encoder: UniversalEncoder,
    tier1: Arc<Mutex<Tier1Store>>,
    tier2: Arc<Mutex<Tier2Store>>,
    tier3: Arc<Mutex<Tier3Store>>,
    vector: Option<Arc<Mutex<VectorStore>>>,
    graph: Arc<Mutex<GraphRuntime>>,
    working: Arc<Mutex<WorkingMemory>>,
    consolidation: ConsolidationConfig,
    audit: AuditLog,
}

impl KatraEngine {
    /// Open (or create) an engine rooted at `root`; `None` uses the platform
    /// data directory.
    ///
    /// Opening also runs the dangling-archive repair pass for every CI with
    /// a Tier 1 store, so a crash mid-consolidation never leaves a record
    /// permanently invisible.
    pub fn new(root: Option<PathBuf>, config: KatraConfig) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => {
                let dirs = ProjectDirs::from("ai", "katra", "core").ok_or_else(|| {
                    KatraError::InvalidState(
                        "could not determine a platform data directory".to_string(),
                    )
                })?;
                dirs.data_dir().to_path_buf()
            }
        };
        let memory_root = root.join("memory");
        std::fs::create_dir_all(&memory_root).map_err(io_err("creating memory root"))?;

        let teams = Arc::new(SqliteTeamDirectory::open(&memory_root.join("teams.db"))?);
        let policy = AccessPolicy::new(teams.clone());

        let tier1 = Arc::new(Mutex::new(Tier1Store::open(
            memory_root.join("tier1"),
            policy.clone(),
        )?));
        let tier2 = Arc::new(Mutex::new(Tier2Store::open(memory_root.join("tier2"))?));
        let tier3 = Arc::new(Mutex::new(Tier3Store::open(
            memory_root.join("tier3").join("patterns"),
        )?));
        let vector = if config.use_vector_search {
            Some(Arc::new(Mutex::new(VectorStore::open(
                memory_root.join("tier2").join("vectors"),
                config.embedding_method,
                config.similarity_threshold,
            )?)))
        } else {
            None
        };
        let graph = Arc::new(Mutex::new(GraphRuntime::new(config.graph.clone())));
        let working = Arc::new(Mutex::new(WorkingMemory::default()));

        let encoder = UniversalEncoder::new(
            policy,
            tier1.clone(),
            tier2.clone(),
            vector.clone(),
            graph.clone(),
            working.clone(),
        );
        let audit = AuditLog::open(memory_root.join("audit"))?;

        let engine = Self {
            config,
            teams,
            encoder,
            tier1,
            tier2,
            tier3,
            vector,
            graph,
            working,
            consolidation: ConsolidationConfig::default(),
            audit,
        };

        for ci_id in engine.list_cis()? {
            match engine.repair(&ci_id) {
                Ok(0) => {}
                Ok(repaired) => {
                    tracing::info!(ci_id = %ci_id, repaired, "restored dangling tombstones on open");
                }
                Err(e) => tracing::warn!(ci_id = %ci_id, error = %e, "open-time repair failed"),
            }
        }
        Ok(engine)
    }

    /// Engine configuration
    pub fn config(&self) -> &KatraConfig {
        &self.config
    }

    /// The team directory behind access control
    pub fn teams(&self) -> &SqliteTeamDirectory {
        &self.teams
    }

    /// The encoder, for callers that dispatch backends directly
    pub fn encoder(&self) -> &UniversalEncoder {
        &self.encoder
    }

    /// The stable ci_id for the configured persona, when one is set
    pub fn persona_ci_id(&self) -> Option<String> {
        self.config.persona_ci_id()
    }

    /// CIs with a Tier 1 store
    pub fn list_cis(&self) -> Result<Vec<String>> {
        lock(&self.tier1, "tier1")?.list_cis()
    }

    /// Register the external embedding provider used when the configured
    /// method is `External`
    pub fn register_embedding_provider(
        &self,
        provider: Box<dyn ExternalEmbeddingProvider>,
    ) -> Result<()> {
        let Some(vector) = &self.vector else {
            return Err(KatraError::InvalidState(
                "vector search is not enabled".to_string(),
            ));
        };
        lock(vector, "vector")?.register_external(provider);
        Ok(())
    }

    // ========================================================================
    // BREATHING PRIMITIVES
    // ========================================================================

    /// Ingest one memory: build the record and fan it out to every backend.
    ///
    /// Succeeds when at least one backend accepts; the outcome reports each
    /// backend's verdict.
    pub fn breathe(&self, input: BreatheInput) -> Result<(MemoryRecord, StoreOutcome)> {
        let mut record = MemoryRecord::new(
            input.ci_id,
            input.record_type,
            input.content,
            input.importance,
        )?;
        record = record.with_isolation(input.isolation, input.team_name)?;
        if let Some(response) = input.response {
            record = record.with_response(response);
        }
        if let Some(context) = input.context {
            record = record.with_context(context);
        }
        if let Some(session_id) = input.session_id {
            record = record.with_session(session_id);
        }
        if !input.tags.is_empty() {
            record = record.with_tags(input.tags);
        }
        if let Some(collection) = input.collection {
            record = record.with_collection(collection);
        }
        if let Some(intensity) = input.emotion_intensity {
            record = record.with_emotion(intensity, input.emotion_type.unwrap_or_default());
        }
        if let Some(related_to) = input.related_to {
            record = record.with_related_to(related_to);
        }
        if input.marked_important {
            record = record.mark_important();
        }
        if input.marked_forgettable {
            record = record.mark_forgettable();
        }

        let outcome = self.encoder.store(&record)?;
        self.audit
            .record("breathe", &record.ci_id, Some(&record.record_id), None);
        Ok((record, outcome))
    }

    /// Recall through the encoder's best-backend-with-fallback path, then
    /// warm the returned records' access counters.
    pub fn recall(&self, criteria: &QueryCriteria) -> Result<Vec<MemoryRecord>> {
        let results = self.encoder.query(criteria)?;
        self.touch(&results);
        self.audit.record(
            "recall",
            &criteria.ci_id,
            None,
            Some(format!("{} results", results.len())),
        );
        Ok(results)
    }

    /// Unified recall across the enabled backends
    pub fn recall_synthesized(
        &self,
        criteria: &QueryCriteria,
        options: &SynthesisOptions,
    ) -> Result<Vec<SynthesisResult>> {
        let results = synthesis::synthesize(&self.encoder, criteria, options)?;
        let records: Vec<MemoryRecord> = results.iter().map(|r| r.record.clone()).collect();
        self.touch(&records);
        self.audit.record(
            "recall",
            &criteria.ci_id,
            None,
            Some(format!("{} synthesized results", results.len())),
        );
        Ok(results)
    }

    /// Fetch one record. A record the requester may not see is the distinct
    /// `AccessDenied` code, never not-found.
    pub fn retrieve(
        &self,
        ci_id: &str,
        record_id: &str,
        requester: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        self.encoder.retrieve(ci_id, record_id, requester)
    }

    /// Destroy one record across every backend
    pub fn forget(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        let removed = self.encoder.delete(ci_id, record_id)?;
        if removed {
            self.audit.record("forget", ci_id, Some(record_id), None);
        }
        Ok(removed)
    }

    /// Access-based warming: bump counters on the returned records
    fn touch(&self, records: &[MemoryRecord]) {
        if records.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut warmed = Vec::with_capacity(records.len());
        {
            let Ok(mut tier1) = self.tier1.lock() else {
                return;
            };
            for record in records {
                let mut touched = record.clone();
                touched.record_access(now);
                match tier1.supersede(&touched) {
                    Ok(()) => warmed.push(touched),
                    Err(e) => {
                        tracing::debug!(
                            record_id = %record.record_id,
                            error = %e,
                            "access warm skipped"
                        );
                    }
                }
            }
        }
        if let Ok(mut working) = self.working.lock() {
            for record in &warmed {
                working.store(record);
            }
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Run consolidation for one CI. `age_cutoff_days` overrides the default
    /// cutoff for this run only.
    pub fn consolidate(
        &self,
        ci_id: &str,
        age_cutoff_days: Option<i64>,
    ) -> Result<ConsolidationReport> {
        let mut config = self.consolidation.clone();
        if let Some(cutoff) = age_cutoff_days {
            config.age_cutoff_days = cutoff;
        }
        let consolidator = Consolidator::new(config);
        let report = consolidator.run(
            ci_id,
            Utc::now(),
            &self.tier1,
            &self.tier2,
            &self.tier3,
            self.vector.as_deref(),
            &self.graph,
        )?;
        self.audit.record(
            "consolidate",
            ci_id,
            None,
            Some(format!(
                "archived {} of {}",
                report.archived_count, report.examined
            )),
        );
        Ok(report)
    }

    /// Restore tombstones whose successor write never landed
    pub fn repair(&self, ci_id: &str) -> Result<usize> {
        let consolidator = Consolidator::new(self.consolidation.clone());
        let repaired =
            consolidator.repair_dangling_archives(ci_id, &self.tier1, &self.tier2, &self.tier3)?;
        if repaired > 0 {
            self.audit.record(
                "repair",
                ci_id,
                None,
                Some(format!("{repaired} tombstones restored")),
            );
        }
        Ok(repaired)
    }

    /// Rewrite one Tier 1 day file, dropping tombstoned rows
    pub fn compact(&self, ci_id: &str, date: NaiveDate) -> Result<CompactOutcome> {
        lock(&self.tier1, "tier1")?.compact(ci_id, date)
    }

    /// Repopulate the Tier 1 keyword index from disk
    pub fn rebuild_index(&self, ci_id: &str) -> Result<usize> {
        lock(&self.tier1, "tier1")?.rebuild_index(ci_id)
    }

    /// Per-CI statistics across every backend
    pub fn stats(&self, ci_id: &str) -> Result<EngineStats> {
        let tier1 = lock(&self.tier1, "tier1")?.stats(ci_id)?;
        let tier2 = lock(&self.tier2, "tier2")?.stats(ci_id)?;
        let tier3 = lock(&self.tier3, "tier3")?.stats(ci_id)?;
        let vector = match &self.vector {
            Some(vector) => Some(lock(vector, "vector")?.stats(ci_id)),
            None => None,
        };
        let graph = lock(&self.graph, "graph")?.graph.stats();
        let working_records = lock(&self.working, "working")?.len(ci_id) as u64;
        Ok(EngineStats {
            tier1,
            tier2,
            tier3,
            vector,
            graph,
            working_records,
        })
    }
}
