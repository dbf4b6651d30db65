//! Synthesis - Unified Recall
//!
//! Store everywhere, synthesize here: each enabled backend scores the query
//! independently, matches merge by record id, and one ranked list comes back.
//! Weighted mode sums weight x score across the backends that matched a
//! record; Union mode takes the best single score.

use std::collections::HashMap;

use crate::encoder::{BackendKind, QueryHit, UniversalEncoder};
use crate::error::Result;
use crate::memory::{MemoryRecord, QueryCriteria};

// ============================================================================
// OPTIONS
// ============================================================================

/// How per-backend scores combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynthesisAlgorithm {
    /// Sum of weight x score across matching backends
    #[default]
    Weighted,
    /// Best single backend score
    Union,
}

/// Recall options: which backends run, how much each is worth, and how the
/// scores merge
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Backends to consult, in order
    pub backends: Vec<BackendKind>,
    /// Per-backend weights; absent backends default to 1.0
    pub weights: HashMap<BackendKind, f64>,
    /// Vector hits below this cosine are ignored
    pub similarity_threshold: f32,
    /// Final list truncation
    pub max_results: usize,
    /// Merge algorithm
    pub algorithm: SynthesisAlgorithm,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self::comprehensive()
    }
}

impl SynthesisOptions {
    /// All backends on, equal weights
    pub fn comprehensive() -> Self {
        let backends = vec![
            BackendKind::Jsonl,
            BackendKind::Sql,
            BackendKind::Vector,
            BackendKind::Graph,
            BackendKind::Cache,
        ];
        let weights = backends.iter().map(|&k| (k, 1.0)).collect();
        Self {
            backends,
            weights,
            similarity_threshold: 0.3,
            max_results: 10,
            algorithm: SynthesisAlgorithm::Weighted,
        }
    }

    /// Vector plus working memory, vector heavily weighted
    pub fn semantic() -> Self {
        Self {
            backends: vec![BackendKind::Vector, BackendKind::Cache],
            weights: HashMap::from([(BackendKind::Vector, 0.8), (BackendKind::Cache, 0.2)]),
            similarity_threshold: 0.3,
            max_results: 10,
            algorithm: SynthesisAlgorithm::Weighted,
        }
    }

    /// SQL plus working memory; skips vector and graph entirely
    pub fn fast() -> Self {
        Self {
            backends: vec![BackendKind::Sql, BackendKind::Cache],
            weights: HashMap::from([(BackendKind::Sql, 0.5), (BackendKind::Cache, 0.5)]),
            similarity_threshold: 0.3,
            max_results: 10,
            algorithm: SynthesisAlgorithm::Union,
        }
    }

    /// Weight for one backend (1.0 when unset)
    pub fn weight_of(&self, kind: BackendKind) -> f64 {
        self.weights.get(&kind).copied().unwrap_or(1.0)
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// A record's merged standing across backends
#[derive(Debug, Clone)]
pub struct MergedHit {
    /// Combined score
    pub score: f64,
    /// Backends that matched this record
    pub sources: Vec<BackendKind>,
    /// Full record, when any backend attached one
    pub record: Option<MemoryRecord>,
}

/// Merge per-backend hits by record id
pub fn merge_backend_hits(
    per_backend: Vec<(BackendKind, f64, Vec<QueryHit>)>,
    algorithm: SynthesisAlgorithm,
) -> HashMap<String, MergedHit> {
    let mut merged: HashMap<String, MergedHit> = HashMap::new();
    for (kind, weight, hits) in per_backend {
        for hit in hits {
            let score = hit.score.clamp(0.0, 1.0);
            let entry = merged.entry(hit.record_id).or_insert(MergedHit {
                score: 0.0,
                sources: Vec::new(),
                record: None,
            });
            match algorithm {
                SynthesisAlgorithm::Weighted => entry.score += weight * score,
                SynthesisAlgorithm::Union => entry.score = entry.score.max(score),
            }
            if !entry.sources.contains(&kind) {
                entry.sources.push(kind);
            }
            if entry.record.is_none() {
                entry.record = hit.record;
            }
        }
    }
    merged
}

// ============================================================================
// SYNTHESIS
// ============================================================================

/// One ranked recall result
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    /// The recalled record
    pub record: MemoryRecord,
    /// Combined score
    pub score: f64,
    /// Backends that contributed
    pub sources: Vec<BackendKind>,
}

/// Run every enabled backend, merge by record id, rank, materialize.
///
/// Backend failures degrade the result set rather than failing recall; the
/// access predicate and structural filters apply on the way out.
pub fn synthesize(
    encoder: &UniversalEncoder,
    criteria: &QueryCriteria,
    options: &SynthesisOptions,
) -> Result<Vec<SynthesisResult>> {
    let registered = encoder.registered();
    let mut per_backend = Vec::new();
    for &kind in &options.backends {
        if !registered.contains(&kind) {
            continue;
        }
        match encoder.query_backend(kind, criteria) {
            Ok(mut hits) => {
                if kind == BackendKind::Vector {
                    hits.retain(|h| h.score >= f64::from(options.similarity_threshold));
                }
                per_backend.push((kind, options.weight_of(kind), hits));
            }
            Err(e) => {
                tracing::warn!(backend = kind.as_str(), error = %e, "synthesis backend failed");
            }
        }
    }

    let merged = merge_backend_hits(per_backend, options.algorithm);

    // Rank, then let the encoder resolve ids and apply visibility
    let hits: Vec<QueryHit> = merged
        .iter()
        .map(|(record_id, hit)| QueryHit {
            record_id: record_id.clone(),
            score: hit.score,
            record: hit.record.clone(),
        })
        .collect();
    let mut bounded = criteria.clone();
    bounded.limit = Some(options.max_results);
    let records = encoder.materialize(&bounded, hits)?;

    Ok(records
        .into_iter()
        .filter_map(|record| {
            merged.get(&record.record_id).map(|hit| SynthesisResult {
                score: hit.score,
                sources: hit.sources.clone(),
                record,
            })
        })
        .collect())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64) -> QueryHit {
        QueryHit {
            record_id: id.to_string(),
            score,
            record: None,
        }
    }

    #[test]
    fn test_weighted_merge_sums_across_backends() {
        let merged = merge_backend_hits(
            vec![
                (BackendKind::Vector, 0.8, vec![hit("r-1", 0.5), hit("r-2", 1.0)]),
                (BackendKind::Cache, 0.2, vec![hit("r-1", 1.0)]),
            ],
            SynthesisAlgorithm::Weighted,
        );

        let r1 = &merged["r-1"];
        assert!((r1.score - (0.8 * 0.5 + 0.2 * 1.0)).abs() < 1e-9);
        assert_eq!(r1.sources, vec![BackendKind::Vector, BackendKind::Cache]);

        let r2 = &merged["r-2"];
        assert!((r2.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_union_merge_takes_max() {
        let merged = merge_backend_hits(
            vec![
                (BackendKind::Sql, 0.5, vec![hit("r-1", 0.6)]),
                (BackendKind::Cache, 0.5, vec![hit("r-1", 0.9)]),
            ],
            SynthesisAlgorithm::Union,
        );
        assert!((merged["r-1"].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_scores_clamped_before_merging() {
        let merged = merge_backend_hits(
            vec![(BackendKind::Jsonl, 1.0, vec![hit("r-1", 7.5)])],
            SynthesisAlgorithm::Weighted,
        );
        assert!((merged["r-1"].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_presets() {
        let comprehensive = SynthesisOptions::comprehensive();
        assert_eq!(comprehensive.backends.len(), 5);
        assert!((comprehensive.weight_of(BackendKind::Graph) - 1.0).abs() < 1e-9);

        let semantic = SynthesisOptions::semantic();
        assert!(!semantic.backends.contains(&BackendKind::Sql));
        assert!(semantic.weight_of(BackendKind::Vector) > semantic.weight_of(BackendKind::Cache));

        let fast = SynthesisOptions::fast();
        assert!(!fast.backends.contains(&BackendKind::Vector));
        assert!(!fast.backends.contains(&BackendKind::Graph));
    }
}
