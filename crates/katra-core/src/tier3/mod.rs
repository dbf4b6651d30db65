//! Tier 3 - Pattern Summaries
//!
//! Long-horizon abstractions: a pattern record owns a centroid (the
//! representative content), the member record ids it compresses, the
//! similarity threshold it was detected at, and adoption/effectiveness
//! scores. Membership is additive; a record may contribute to many patterns.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{io_err, KatraError, Result};

// ============================================================================
// PATTERN RECORD
// ============================================================================

/// A cluster of Tier 1 records collapsed into one summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    /// Unique pattern identifier
    pub pattern_id: String,
    /// Owning identity
    pub ci_id: String,
    /// Representative content, taken from the most central member
    pub centroid_content: String,
    /// Records that contributed to this pattern
    pub member_record_ids: Vec<String>,
    /// Cosine threshold the cluster was detected at
    pub similarity_threshold: f32,
    /// How often the pattern keeps recurring
    pub adoption_score: f64,
    /// How well following the pattern has worked out
    pub effectiveness_score: f64,
    /// When the pattern was extracted
    pub created_at: DateTime<Utc>,
}

impl PatternRecord {
    /// Build a pattern record. Scores are clamped to [0, 1].
    pub fn new(
        ci_id: impl Into<String>,
        centroid_content: impl Into<String>,
        member_record_ids: Vec<String>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            pattern_id: Uuid::new_v4().to_string(),
            ci_id: ci_id.into(),
            centroid_content: centroid_content.into(),
            member_record_ids,
            similarity_threshold,
            adoption_score: 0.0,
            effectiveness_score: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Clamped adoption setter
    pub fn set_adoption(&mut self, score: f64) {
        self.adoption_score = score.clamp(0.0, 1.0);
    }

    /// Clamped effectiveness setter
    pub fn set_effectiveness(&mut self, score: f64) {
        self.effectiveness_score = score.clamp(0.0, 1.0);
    }
}

/// Per-CI Tier 3 statistics
#[derive(Debug, Clone, Default)]
pub struct Tier3Stats {
    /// Pattern records for the CI
    pub patterns: u64,
    /// Distinct member records across all patterns
    pub compressed_records: u64,
}

// ============================================================================
// TIER 3 STORE
// ============================================================================

/// JSONL pattern store rooted at `<memory root>/tier3/patterns`
pub struct Tier3Store {
    root: PathBuf,
}

impl Tier3Store {
    /// Open the store
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err("creating tier3 root"))?;
        Ok(Self { root })
    }

    fn ci_file(&self, ci_id: &str) -> PathBuf {
        self.root.join(ci_id).join("patterns.jsonl")
    }

    /// Append one pattern record
    pub fn store_pattern(&mut self, pattern: &PatternRecord) -> Result<()> {
        let path = self.ci_file(&pattern.ci_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("creating tier3 ci directory"))?;
        }
        let line = serde_json::to_string(pattern).map_err(|e| KatraError::Format {
            what: "pattern row".to_string(),
            detail: e.to_string(),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err("opening pattern log"))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(io_err("appending pattern log"))?;
        Ok(())
    }

    /// All patterns for a CI, tolerant of a truncated trailing line
    pub fn load_patterns(&self, ci_id: &str) -> Result<Vec<PatternRecord>> {
        let path = self.ci_file(ci_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).map_err(io_err("reading pattern log"))?;
        let lines: Vec<&str> = text.lines().collect();
        let mut out = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PatternRecord>(line) {
                Ok(pattern) => out.push(pattern),
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = i + 1,
                        error = %e,
                        "skipping unreadable pattern row"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Patterns whose centroid mentions the keyword
    pub fn query(&self, ci_id: &str, keyword: &str) -> Result<Vec<PatternRecord>> {
        let needle = keyword.to_lowercase();
        Ok(self
            .load_patterns(ci_id)?
            .into_iter()
            .filter(|p| p.centroid_content.to_lowercase().contains(&needle))
            .collect())
    }

    /// Does any pattern list this record as a member? Drives archive repair.
    pub fn references_record(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        Ok(self
            .load_patterns(ci_id)?
            .iter()
            .any(|p| p.member_record_ids.iter().any(|id| id == record_id)))
    }

    /// Per-CI statistics
    pub fn stats(&self, ci_id: &str) -> Result<Tier3Stats> {
        let patterns = self.load_patterns(ci_id)?;
        let mut members: Vec<&String> = patterns
            .iter()
            .flat_map(|p| p.member_record_ids.iter())
            .collect();
        members.sort();
        members.dedup();
        Ok(Tier3Stats {
            patterns: patterns.len() as u64,
            compressed_records: members.len() as u64,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(ci: &str, centroid: &str, members: &[&str]) -> PatternRecord {
        PatternRecord::new(
            ci,
            centroid,
            members.iter().map(|s| s.to_string()).collect(),
            0.4,
        )
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Tier3Store::open(dir.path().join("patterns")).unwrap();

        let p = pattern("ci-a", "debugging null pointers", &["r-1", "r-2", "r-3"]);
        store.store_pattern(&p).unwrap();

        let loaded = store.load_patterns("ci-a").unwrap();
        assert_eq!(loaded, vec![p]);
    }

    #[test]
    fn test_additive_membership() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Tier3Store::open(dir.path().join("patterns")).unwrap();

        store.store_pattern(&pattern("ci-a", "first", &["r-1", "r-2"])).unwrap();
        store.store_pattern(&pattern("ci-a", "second", &["r-2", "r-3"])).unwrap();

        // r-2 contributes to both patterns
        assert!(store.references_record("ci-a", "r-2").unwrap());
        let stats = store.stats("ci-a").unwrap();
        assert_eq!(stats.patterns, 2);
        assert_eq!(stats.compressed_records, 3);
    }

    #[test]
    fn test_query_by_centroid_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Tier3Store::open(dir.path().join("patterns")).unwrap();
        store.store_pattern(&pattern("ci-a", "debugging null pointers", &["r-1"])).unwrap();
        store.store_pattern(&pattern("ci-a", "planning travel", &["r-2"])).unwrap();

        let hits = store.query("ci-a", "NULL").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].centroid_content, "debugging null pointers");
    }

    #[test]
    fn test_scores_clamped() {
        let mut p = pattern("ci-a", "x", &[]);
        p.set_adoption(2.0);
        p.set_effectiveness(-1.0);
        assert_eq!(p.adoption_score, 1.0);
        assert_eq!(p.effectiveness_score, 0.0);
    }
}
