//! Consolidation / Archival Engine
//!
//! The maintenance pass over a CI's Tier 1 working set: preservation rules
//! run in a fixed order and the first rule to fire wins. Redundant records
//! compress into Tier 3 patterns, aged leftovers into Tier 2 digests; the
//! Tier 1 row is tombstoned only after its successor is durable enough to
//! find again, and a dedicated repair pass restores any tombstone whose
//! successor write never landed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::encoder::{lock, GraphRuntime};
use crate::memory::{MemoryRecord, QueryCriteria};
use crate::error::Result;
use crate::tier1::Tier1Store;
use crate::tier2::{weekly_period_id, Digest, PeriodKind, Tier2Store};
use crate::tier3::{PatternRecord, Tier3Store};
use crate::vector::{cosine_similarity, tokenize, Embedding, VectorStore};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Consolidation knobs
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Records younger than this many days are always preserved
    pub age_cutoff_days: i64,
    /// Accesses within this many days keep a record warm
    pub decay_window_days: i64,
    /// Emotional salience at or above this preserves
    pub salience_threshold: f64,
    /// Graph centrality at or above this preserves
    pub hub_threshold: f64,
    /// Minimum embedding cosine for two records to cluster
    pub pattern_min_similarity: f32,
    /// Minimum cluster size to count as a pattern
    pub pattern_min_cluster: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            age_cutoff_days: 30,
            decay_window_days: 7,
            salience_threshold: 0.7,
            hub_threshold: 0.5,
            pattern_min_similarity: 0.4,
            pattern_min_cluster: 3,
        }
    }
}

// ============================================================================
// DISPOSITIONS
// ============================================================================

/// Why a record was preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreserveReason {
    /// Voluntary override
    MarkedImportant,
    /// Younger than the cutoff
    RecentAge,
    /// Accessed within the decay window
    RecentAccess,
    /// Emotional salience at or above threshold
    EmotionalSalience,
    /// Graph hub
    GraphHub,
    /// First, last, or most-important member of a pattern
    PatternOutlier,
    /// Unique memory in a corpus that has redundancy to compress instead
    Distinctive,
}

/// Why a record was archived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveReason {
    /// Voluntary override
    MarkedForgettable,
    /// Compressed into a pattern summary
    PatternMember,
    /// Aged out with nothing else holding it
    Aged,
}

/// Outcome of the rule chain for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Preserve(PreserveReason),
    Archive(ArchiveReason),
}

/// The record's role in a detected pattern, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternRole {
    /// First, last, or max-importance member
    Outlier,
    /// Interior member, eligible for compression
    Member,
}

/// Evaluate the preservation rules in order; the first to fire wins.
///
/// `has_patterns` reports whether any redundancy pattern exists for this CI
/// (detected this run or already in Tier 3). While redundancy exists, aging
/// alone does not archive a unique record; with none, age is the final rule.
pub fn decide(
    record: &MemoryRecord,
    now: DateTime<Utc>,
    config: &ConsolidationConfig,
    pattern_role: Option<PatternRole>,
    has_patterns: bool,
) -> Disposition {
    if record.marked_important {
        return Disposition::Preserve(PreserveReason::MarkedImportant);
    }
    if record.marked_forgettable {
        return Disposition::Archive(ArchiveReason::MarkedForgettable);
    }
    if record.age_days(now) <= config.age_cutoff_days {
        return Disposition::Preserve(PreserveReason::RecentAge);
    }
    if let Some(last) = record.last_accessed {
        if (now - last).num_days() <= config.decay_window_days {
            return Disposition::Preserve(PreserveReason::RecentAccess);
        }
    }
    if record.emotion_intensity >= config.salience_threshold {
        return Disposition::Preserve(PreserveReason::EmotionalSalience);
    }
    if record.graph_centrality >= config.hub_threshold {
        return Disposition::Preserve(PreserveReason::GraphHub);
    }
    match pattern_role {
        Some(PatternRole::Outlier) => Disposition::Preserve(PreserveReason::PatternOutlier),
        Some(PatternRole::Member) => Disposition::Archive(ArchiveReason::PatternMember),
        None if has_patterns => Disposition::Preserve(PreserveReason::Distinctive),
        None => Disposition::Archive(ArchiveReason::Aged),
    }
}

// ============================================================================
// PATTERN DETECTION
// ============================================================================

/// Greedy single-seed clustering by embedding cosine.
///
/// Records are visited in timestamp order; each unassigned record seeds a
/// cluster of every other unassigned record within the similarity floor.
/// Clusters below the size floor dissolve back into the pool.
pub fn detect_clusters(
    embeddings: &[Option<Embedding>],
    min_similarity: f32,
    min_cluster: usize,
) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; embeddings.len()];
    let mut clusters = Vec::new();

    for seed in 0..embeddings.len() {
        if assigned[seed] {
            continue;
        }
        let Some(seed_emb) = &embeddings[seed] else {
            continue;
        };
        if seed_emb.magnitude == 0.0 {
            continue;
        }

        let mut cluster = vec![seed];
        for other in seed + 1..embeddings.len() {
            if assigned[other] {
                continue;
            }
            let Some(other_emb) = &embeddings[other] else {
                continue;
            };
            if cosine_similarity(&seed_emb.vector, &other_emb.vector) >= min_similarity {
                cluster.push(other);
            }
        }

        if cluster.len() >= min_cluster {
            for &idx in &cluster {
                assigned[idx] = true;
            }
            clusters.push(cluster);
        }
    }
    clusters
}

/// Outlier indices of one cluster: first, last, and max-importance member
fn cluster_outliers(cluster: &[usize], records: &[MemoryRecord]) -> HashSet<usize> {
    let mut outliers = HashSet::new();
    if cluster.is_empty() {
        return outliers;
    }
    let first = *cluster
        .iter()
        .min_by_key(|&&i| records[i].timestamp)
        .expect("non-empty cluster");
    let last = *cluster
        .iter()
        .max_by_key(|&&i| records[i].timestamp)
        .expect("non-empty cluster");
    let most_important = *cluster
        .iter()
        .max_by(|&&a, &&b| {
            records[a]
                .importance
                .partial_cmp(&records[b].importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("non-empty cluster");
    outliers.insert(first);
    outliers.insert(last);
    outliers.insert(most_important);
    outliers
}

/// The member whose embedding is most similar to the rest of the cluster
fn cluster_centroid(cluster: &[usize], embeddings: &[Option<Embedding>]) -> usize {
    let mut best = cluster[0];
    let mut best_score = f32::MIN;
    for &candidate in cluster {
        let Some(candidate_emb) = &embeddings[candidate] else {
            continue;
        };
        let mut total = 0.0_f32;
        for &other in cluster {
            if other == candidate {
                continue;
            }
            if let Some(other_emb) = &embeddings[other] {
                total += cosine_similarity(&candidate_emb.vector, &other_emb.vector);
            }
        }
        if total > best_score {
            best_score = total;
            best = candidate;
        }
    }
    best
}

// ============================================================================
// REPORT
// ============================================================================

/// Result of one consolidation run
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    /// Active records examined
    pub examined: usize,
    /// Records left active
    pub preserved: usize,
    /// Records tombstoned this run
    pub archived_count: usize,
    /// Ids tombstoned this run
    pub archived_ids: Vec<String>,
    /// Tier 3 patterns written
    pub patterns_created: usize,
    /// Tier 2 digests written
    pub digests_created: usize,
    /// Wall time
    pub duration_ms: i64,
}

// ============================================================================
// CONSOLIDATOR
// ============================================================================

/// Runs the preservation algorithm over one CI's working set
pub struct Consolidator {
    config: ConsolidationConfig,
}

impl Default for Consolidator {
    fn default() -> Self {
        Self::new(ConsolidationConfig::default())
    }
}

impl Consolidator {
    /// Consolidator with the given configuration
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    /// Current configuration
    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Run consolidation for one CI.
    ///
    /// Backend locks are leaf-level, so each phase takes exactly one lock at
    /// a time: read the working set, refresh centrality, fetch embeddings,
    /// decide, then apply tombstones and successors.
    pub fn run(
        &self,
        ci_id: &str,
        now: DateTime<Utc>,
        tier1: &Mutex<Tier1Store>,
        tier2: &Mutex<Tier2Store>,
        tier3: &Mutex<Tier3Store>,
        vector: Option<&Mutex<VectorStore>>,
        graph: &Mutex<GraphRuntime>,
    ) -> Result<ConsolidationReport> {
        let start = Instant::now();

        // Phase 1: working set, oldest first
        let mut records = {
            let store = lock(tier1, "tier1")?;
            store.query(&QueryCriteria::for_ci(ci_id))?
        };
        records.sort_by_key(|r| r.timestamp);

        // Phase 2: refresh graph scores; a stored score is never lowered by
        // a colder graph
        {
            let ids: Vec<String> = records.iter().map(|r| r.record_id.clone()).collect();
            let mut runtime = lock(graph, "graph")?;
            let scores: HashMap<String, (f64, usize)> = runtime
                .graph
                .recompute_centrality(&ids)
                .into_iter()
                .map(|(id, centrality, degree)| (id, (centrality, degree)))
                .collect();
            drop(runtime);
            for record in &mut records {
                if let Some(&(centrality, degree)) = scores.get(&record.record_id) {
                    let effective = record.graph_centrality.max(centrality);
                    let connections = record.connection_count.max(degree);
                    record.set_graph_scores(effective, connections);
                }
            }
        }

        // Phase 3: embeddings for pattern detection (query path; the corpus
        // statistics stay untouched)
        let embeddings: Vec<Option<Embedding>> = match vector {
            Some(vector) => {
                let store = lock(vector, "vector")?;
                records
                    .iter()
                    .map(|r| {
                        store
                            .get_embedding(ci_id, &r.record_id)
                            .or_else(|| store.embed_query(ci_id, &r.content).ok())
                    })
                    .collect()
            }
            None => vec![None; records.len()],
        };

        // Phase 4: pattern detection
        let clusters = detect_clusters(
            &embeddings,
            self.config.pattern_min_similarity,
            self.config.pattern_min_cluster,
        );
        let mut role_of: HashMap<usize, PatternRole> = HashMap::new();
        let mut cluster_of: HashMap<usize, usize> = HashMap::new();
        for (cluster_idx, cluster) in clusters.iter().enumerate() {
            let outliers = cluster_outliers(cluster, &records);
            for &record_idx in cluster {
                cluster_of.insert(record_idx, cluster_idx);
                role_of.insert(
                    record_idx,
                    if outliers.contains(&record_idx) {
                        PatternRole::Outlier
                    } else {
                        PatternRole::Member
                    },
                );
            }
        }
        let has_patterns = !clusters.is_empty() || {
            let store = lock(tier3, "tier3")?;
            store.stats(ci_id)?.patterns > 0
        };

        // Phase 5: the rule chain
        let mut report = ConsolidationReport {
            examined: records.len(),
            ..Default::default()
        };
        let mut archived_to_digest: Vec<usize> = Vec::new();
        let mut archived_by_cluster: HashMap<usize, Vec<usize>> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            match decide(
                record,
                now,
                &self.config,
                role_of.get(&idx).copied(),
                has_patterns,
            ) {
                Disposition::Preserve(reason) => {
                    tracing::debug!(record_id = %record.record_id, ?reason, "preserved");
                    report.preserved += 1;
                }
                Disposition::Archive(ArchiveReason::PatternMember) => {
                    archived_by_cluster
                        .entry(cluster_of[&idx])
                        .or_default()
                        .push(idx);
                }
                Disposition::Archive(reason) => {
                    tracing::debug!(record_id = %record.record_id, ?reason, "archiving");
                    archived_to_digest.push(idx);
                }
            }
        }

        // Phase 6: compress pattern members into Tier 3. A pattern row is
        // written only when it actually archives something.
        for (cluster_idx, member_indices) in &archived_by_cluster {
            let cluster = &clusters[*cluster_idx];
            let centroid_idx = cluster_centroid(cluster, &embeddings);
            let mut pattern = PatternRecord::new(
                ci_id,
                records[centroid_idx].content.clone(),
                cluster.iter().map(|&i| records[i].record_id.clone()).collect(),
                self.config.pattern_min_similarity,
            );
            pattern.set_adoption(cluster.len() as f64 / records.len().max(1) as f64);
            pattern.set_effectiveness(
                cluster.iter().map(|&i| records[i].importance).sum::<f64>()
                    / cluster.len() as f64,
            );

            self.archive_rows(ci_id, &records, member_indices, 3, tier1)?;
            lock(tier3, "tier3")?.store_pattern(&pattern)?;
            report.patterns_created += 1;
            for &idx in member_indices {
                report.archived_ids.push(records[idx].record_id.clone());
            }
        }

        // Phase 7: digest the rest of the archived set, grouped by ISO week
        let mut by_period: HashMap<String, Vec<usize>> = HashMap::new();
        for &idx in &archived_to_digest {
            by_period
                .entry(weekly_period_id(records[idx].timestamp.date_naive()))
                .or_default()
                .push(idx);
        }
        for (period_id, group) in by_period {
            let digest = build_digest(ci_id, &period_id, &records, &group);
            self.archive_rows(ci_id, &records, &group, 2, tier1)?;
            lock(tier2, "tier2")?.store_digest(&digest)?;
            report.digests_created += 1;
            for &idx in &group {
                report.archived_ids.push(records[idx].record_id.clone());
            }
        }

        report.archived_count = report.archived_ids.len();
        report.duration_ms = start.elapsed().as_millis() as i64;
        tracing::info!(
            ci_id,
            examined = report.examined,
            preserved = report.preserved,
            archived = report.archived_count,
            patterns = report.patterns_created,
            digests = report.digests_created,
            "consolidation run complete"
        );
        Ok(report)
    }

    /// Tombstone a set of rows, bumping them to the successor tier
    fn archive_rows(
        &self,
        _ci_id: &str,
        records: &[MemoryRecord],
        indices: &[usize],
        successor_tier: u8,
        tier1: &Mutex<Tier1Store>,
    ) -> Result<()> {
        let mut store = lock(tier1, "tier1")?;
        for &idx in indices {
            let mut tombstone = records[idx].clone();
            tombstone.archived = true;
            tombstone.tier = successor_tier;
            store.supersede(&tombstone)?;
        }
        Ok(())
    }

    /// Restore tombstoned rows whose successor write never landed.
    ///
    /// A row with `archived=true` but no referencing digest or pattern would
    /// otherwise be permanently invisible; the flag is cleared so the record
    /// is reprocessed by a later run.
    pub fn repair_dangling_archives(
        &self,
        ci_id: &str,
        tier1: &Mutex<Tier1Store>,
        tier2: &Mutex<Tier2Store>,
        tier3: &Mutex<Tier3Store>,
    ) -> Result<usize> {
        let tombstones: Vec<MemoryRecord> = {
            let store = lock(tier1, "tier1")?;
            let mut criteria = QueryCriteria::for_ci(ci_id);
            criteria.include_archived = true;
            store
                .query(&criteria)?
                .into_iter()
                .filter(|r| r.archived)
                .collect()
        };

        let mut repaired = 0;
        for record in tombstones {
            let in_tier2 = lock(tier2, "tier2")?.references_record(ci_id, &record.record_id)?;
            let in_tier3 = lock(tier3, "tier3")?.references_record(ci_id, &record.record_id)?;
            if in_tier2 || in_tier3 {
                continue;
            }
            tracing::info!(
                ci_id,
                record_id = %record.record_id,
                "restoring tombstone with no successor"
            );
            lock(tier1, "tier1")?.set_archived(ci_id, &record.record_id, false)?;
            repaired += 1;
        }
        Ok(repaired)
    }
}

/// Build the lossy weekly digest for a group of archived records
fn build_digest(
    ci_id: &str,
    period_id: &str,
    records: &[MemoryRecord],
    group: &[usize],
) -> Digest {
    let mut token_counts: HashMap<String, usize> = HashMap::new();
    for &idx in group {
        for token in tokenize(&records[idx].content) {
            *token_counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = token_counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let keywords: Vec<String> = ranked.iter().take(5).map(|(t, _)| t.clone()).collect();
    let theme = keywords.first().cloned().unwrap_or_else(|| "misc".to_string());

    let mut summary = String::new();
    for &idx in group {
        if !summary.is_empty() {
            summary.push_str("; ");
        }
        let content = &records[idx].content;
        let cut = content
            .char_indices()
            .nth(100)
            .map(|(i, _)| i)
            .unwrap_or(content.len());
        summary.push_str(&content[..cut]);
        if summary.len() > 1000 {
            break;
        }
    }

    Digest::new(
        ci_id,
        period_id,
        PeriodKind::Weekly,
        theme,
        keywords,
        summary,
        group.iter().map(|&i| records[i].record_id.clone()).collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordType;
    use crate::vector::{embed_tokens, IdfStats, Weighting};
    use chrono::Duration;

    fn aged(ci: &str, content: &str, days_old: i64, importance: f64) -> MemoryRecord {
        let mut record = MemoryRecord::new(ci, RecordType::Experience, content, importance).unwrap();
        record.timestamp -= Duration::days(days_old);
        record
    }

    #[test]
    fn test_rule_order_first_match_wins() {
        let now = Utc::now();
        let config = ConsolidationConfig {
            age_cutoff_days: 5,
            ..Default::default()
        };

        // marked_important beats everything, even marked_forgettable combined
        let mut r = aged("ci-a", "x", 30, 0.9);
        r.marked_important = true;
        r.marked_forgettable = true;
        assert_eq!(
            decide(&r, now, &config, Some(PatternRole::Member), false),
            Disposition::Preserve(PreserveReason::MarkedImportant)
        );

        // marked_forgettable beats youth
        let mut r = aged("ci-a", "x", 1, 0.9);
        r.marked_forgettable = true;
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Archive(ArchiveReason::MarkedForgettable)
        );

        // Youth preserves
        let r = aged("ci-a", "x", 3, 0.1);
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Preserve(PreserveReason::RecentAge)
        );

        // Access warming preserves an old record
        let mut r = aged("ci-a", "x", 30, 0.1);
        r.record_access(now - Duration::days(2));
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Preserve(PreserveReason::RecentAccess)
        );

        // Emotional salience
        let mut r = aged("ci-a", "x", 30, 0.1);
        r.set_emotion_intensity(0.8);
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Preserve(PreserveReason::EmotionalSalience)
        );

        // Hub centrality
        let mut r = aged("ci-a", "x", 30, 0.1);
        r.set_graph_scores(0.8, 4);
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Preserve(PreserveReason::GraphHub)
        );

        // Pattern roles
        let r = aged("ci-a", "x", 30, 0.1);
        assert_eq!(
            decide(&r, now, &config, Some(PatternRole::Outlier), true),
            Disposition::Preserve(PreserveReason::PatternOutlier)
        );
        assert_eq!(
            decide(&r, now, &config, Some(PatternRole::Member), true),
            Disposition::Archive(ArchiveReason::PatternMember)
        );

        // No pattern anywhere: age is the final word
        assert_eq!(
            decide(&r, now, &config, None, false),
            Disposition::Archive(ArchiveReason::Aged)
        );
        // Redundancy exists elsewhere: unique old records stay
        assert_eq!(
            decide(&r, now, &config, None, true),
            Disposition::Preserve(PreserveReason::Distinctive)
        );
    }

    #[test]
    fn test_detect_clusters_threshold_and_size() {
        let mut idf = IdfStats::new();
        let texts = [
            "debugging null pointer in module k",
            "debugging null pointer in module k again",
            "null pointer debugging in module k continues",
            "planning a trip to atlanta",
        ];
        for t in &texts {
            idf.observe_document(&tokenize(t));
        }
        let embeddings: Vec<Option<Embedding>> = texts
            .iter()
            .map(|t| Some(embed_tokens(&tokenize(t), &idf, Weighting::TfIdf)))
            .collect();

        let clusters = detect_clusters(&embeddings, 0.4, 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
        assert!(!clusters[0].contains(&3));

        // Raising the size floor dissolves it
        assert!(detect_clusters(&embeddings, 0.4, 4).is_empty());
    }

    #[test]
    fn test_cluster_outliers_first_last_max_importance() {
        let records = vec![
            aged("ci-a", "a", 10, 0.2),
            aged("ci-a", "b", 8, 0.9),
            aged("ci-a", "c", 6, 0.3),
            aged("ci-a", "d", 4, 0.1),
        ];
        let cluster = vec![0, 1, 2, 3];
        let outliers = cluster_outliers(&cluster, &records);
        // first (0), last (3), max importance (1)
        assert_eq!(outliers, HashSet::from([0, 1, 3]));
    }
}
