//! Tier 2 - Structured Digests
//!
//! Periodic summaries of Tier 1 material, indexed in SQLite for structured
//! queries by theme, keyword, and period. Content fidelity is lossy by
//! design; every digest keeps back-pointers to its source Tier 1 records.
//! Digests are built by the consolidation engine, never by write traffic.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{io_err, KatraError, Result};

// ============================================================================
// PERIODS
// ============================================================================

/// Digest granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Weekly,
    Monthly,
}

impl PeriodKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Weekly => "weekly",
            PeriodKind::Monthly => "monthly",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "weekly" => Some(PeriodKind::Weekly),
            "monthly" => Some(PeriodKind::Monthly),
            _ => None,
        }
    }
}

/// ISO-week period id, e.g. `2026-W31`
pub fn weekly_period_id(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Calendar-month period id, e.g. `2026-07`
pub fn monthly_period_id(date: NaiveDate) -> String {
    format!("{}-{:02}", date.year(), date.month())
}

// ============================================================================
// DIGEST
// ============================================================================

/// A lossy summary of a set of Tier 1 records for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    /// Unique digest identifier
    pub digest_id: String,
    /// Owning identity
    pub ci_id: String,
    /// Period label, e.g. `2026-W31`
    pub period_id: String,
    /// Weekly or monthly
    pub period_kind: PeriodKind,
    /// Dominant theme of the summarized records
    pub theme: String,
    /// Index keywords
    pub keywords: Vec<String>,
    /// Summary text
    pub summary: String,
    /// Back-pointers to the Tier 1 records this digest compresses
    pub source_record_ids: Vec<String>,
    /// When the digest was built
    pub created_at: DateTime<Utc>,
}

impl Digest {
    /// Build a digest record
    pub fn new(
        ci_id: impl Into<String>,
        period_id: impl Into<String>,
        period_kind: PeriodKind,
        theme: impl Into<String>,
        keywords: Vec<String>,
        summary: impl Into<String>,
        source_record_ids: Vec<String>,
    ) -> Self {
        Self {
            digest_id: Uuid::new_v4().to_string(),
            ci_id: ci_id.into(),
            period_id: period_id.into(),
            period_kind,
            theme: theme.into(),
            keywords,
            summary: summary.into(),
            source_record_ids,
            created_at: Utc::now(),
        }
    }
}

/// Filter set for digest queries
#[derive(Debug, Clone, Default)]
pub struct Tier2Criteria {
    /// Owning identity (required)
    pub ci_id: String,
    /// Case-insensitive substring over the theme
    pub theme_contains: Option<String>,
    /// Exact keyword membership
    pub keyword: Option<String>,
    /// Exact period label
    pub period_id: Option<String>,
    /// Restrict to one granularity
    pub period_kind: Option<PeriodKind>,
    /// Truncate the result list
    pub limit: Option<usize>,
}

/// Per-CI Tier 2 statistics
#[derive(Debug, Clone, Default)]
pub struct Tier2Stats {
    /// Digest rows for the CI
    pub digests: u64,
    /// Distinct themes
    pub themes: u64,
}

// ============================================================================
// TIER 2 STORE
// ============================================================================

/// SQLite-backed digest store rooted at `<memory root>/tier2`
pub struct Tier2Store {
    conn: Connection,
    root: PathBuf,
}

impl Tier2Store {
    /// Open the store, creating `index/digests.db` and the schema if absent
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let index_dir = root.join("index");
        fs::create_dir_all(&index_dir).map_err(io_err("creating tier2 index directory"))?;

        let conn = Connection::open(index_dir.join("digests.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS digests (
                 digest_id   TEXT PRIMARY KEY,
                 ci_id       TEXT NOT NULL,
                 period_id   TEXT NOT NULL,
                 period_kind TEXT NOT NULL,
                 theme       TEXT NOT NULL,
                 keywords    TEXT NOT NULL,
                 summary     TEXT NOT NULL,
                 source_ids  TEXT NOT NULL,
                 created_at  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_digests_ci_period
                 ON digests (ci_id, period_id);
             CREATE INDEX IF NOT EXISTS idx_digests_theme
                 ON digests (ci_id, theme);",
        )?;

        Ok(Self { conn, root })
    }

    /// Persist a digest: one row in the index plus a JSONL mirror line under
    /// the period directory
    pub fn store_digest(&mut self, digest: &Digest) -> Result<()> {
        let keywords = serde_json::to_string(&digest.keywords).map_err(|e| KatraError::Format {
            what: "digest keywords".to_string(),
            detail: e.to_string(),
        })?;
        let source_ids =
            serde_json::to_string(&digest.source_record_ids).map_err(|e| KatraError::Format {
                what: "digest source ids".to_string(),
                detail: e.to_string(),
            })?;

        self.conn.execute(
            "INSERT OR REPLACE INTO digests (
                digest_id, ci_id, period_id, period_kind, theme,
                keywords, summary, source_ids, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                digest.digest_id,
                digest.ci_id,
                digest.period_id,
                digest.period_kind.as_str(),
                digest.theme,
                keywords,
                digest.summary,
                source_ids,
                digest.created_at.to_rfc3339(),
            ],
        )?;

        // Mirror line; advisory, so failures only log
        if let Err(e) = self.append_mirror(digest) {
            tracing::warn!(digest_id = %digest.digest_id, error = %e, "digest mirror write failed");
        }
        Ok(())
    }

    fn append_mirror(&self, digest: &Digest) -> Result<()> {
        let dir = self
            .root
            .join(digest.period_kind.as_str())
            .join(&digest.period_id);
        fs::create_dir_all(&dir).map_err(io_err("creating digest period directory"))?;
        let line = serde_json::to_string(digest).map_err(|e| KatraError::Format {
            what: "digest mirror row".to_string(),
            detail: e.to_string(),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("digest.jsonl"))
            .map_err(io_err("opening digest mirror"))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(io_err("appending digest mirror"))?;
        Ok(())
    }

    fn row_to_digest(row: &rusqlite::Row<'_>) -> rusqlite::Result<Digest> {
        let period_kind: String = row.get(3)?;
        let keywords: String = row.get(5)?;
        let source_ids: String = row.get(7)?;
        let created_at: String = row.get(8)?;
        Ok(Digest {
            digest_id: row.get(0)?,
            ci_id: row.get(1)?,
            period_id: row.get(2)?,
            period_kind: PeriodKind::parse_name(&period_kind).unwrap_or(PeriodKind::Weekly),
            theme: row.get(4)?,
            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            summary: row.get(6)?,
            source_record_ids: serde_json::from_str(&source_ids).unwrap_or_default(),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    /// Structured digest query
    pub fn query_digests(&self, criteria: &Tier2Criteria) -> Result<Vec<Digest>> {
        if criteria.ci_id.trim().is_empty() {
            return Err(KatraError::NullInput("ci_id"));
        }
        let mut stmt = self.conn.prepare(
            "SELECT digest_id, ci_id, period_id, period_kind, theme,
                    keywords, summary, source_ids, created_at
             FROM digests WHERE ci_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows: Vec<Digest> = stmt
            .query_map(params![criteria.ci_id], Self::row_to_digest)?
            .filter_map(|r| r.ok())
            .collect();

        let mut out: Vec<Digest> = rows
            .into_iter()
            .filter(|d| {
                if let Some(theme) = &criteria.theme_contains {
                    if !d.theme.to_lowercase().contains(&theme.to_lowercase()) {
                        return false;
                    }
                }
                if let Some(keyword) = &criteria.keyword {
                    if !d.keywords.iter().any(|k| k == keyword) {
                        return false;
                    }
                }
                if let Some(period_id) = &criteria.period_id {
                    if &d.period_id != period_id {
                        return false;
                    }
                }
                if let Some(kind) = criteria.period_kind {
                    if d.period_kind != kind {
                        return false;
                    }
                }
                true
            })
            .collect();
        if let Some(limit) = criteria.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Fetch one digest by id
    pub fn retrieve_by_id(&self, digest_id: &str) -> Result<Option<Digest>> {
        let digest = self
            .conn
            .query_row(
                "SELECT digest_id, ci_id, period_id, period_kind, theme,
                        keywords, summary, source_ids, created_at
                 FROM digests WHERE digest_id = ?1",
                params![digest_id],
                Self::row_to_digest,
            )
            .optional()?;
        Ok(digest)
    }

    /// Does any digest back-point at this record? Drives archive repair.
    pub fn references_record(&self, ci_id: &str, record_id: &str) -> Result<bool> {
        let pattern = format!("%\"{record_id}\"%");
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM digests WHERE ci_id = ?1 AND source_ids LIKE ?2",
            params![ci_id, pattern],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Per-CI statistics
    pub fn stats(&self, ci_id: &str) -> Result<Tier2Stats> {
        let digests: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM digests WHERE ci_id = ?1",
            params![ci_id],
            |row| row.get(0),
        )?;
        let themes: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT theme) FROM digests WHERE ci_id = ?1",
            params![ci_id],
            |row| row.get(0),
        )?;
        Ok(Tier2Stats {
            digests: digests as u64,
            themes: themes as u64,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Tier2Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Tier2Store::open(dir.path().join("tier2")).unwrap();
        (dir, store)
    }

    fn digest(ci: &str, theme: &str, keywords: &[&str]) -> Digest {
        Digest::new(
            ci,
            "2026-W31",
            PeriodKind::Weekly,
            theme,
            keywords.iter().map(|s| s.to_string()).collect(),
            format!("summary of {theme}"),
            vec!["r-1".to_string(), "r-2".to_string()],
        )
    }

    #[test]
    fn test_period_ids() {
        let date = NaiveDate::from_ymd_opt(2026, 7, 29).unwrap();
        assert_eq!(weekly_period_id(date), "2026-W31");
        assert_eq!(monthly_period_id(date), "2026-07");
    }

    #[test]
    fn test_store_and_retrieve() {
        let (_dir, mut store) = store();
        let d = digest("ci-a", "debugging", &["null", "pointer"]);
        store.store_digest(&d).unwrap();

        let back = store.retrieve_by_id(&d.digest_id).unwrap().unwrap();
        assert_eq!(back.theme, "debugging");
        assert_eq!(back.keywords, vec!["null", "pointer"]);
        assert_eq!(back.source_record_ids, vec!["r-1", "r-2"]);
    }

    #[test]
    fn test_query_by_theme_keyword_period() {
        let (_dir, mut store) = store();
        store.store_digest(&digest("ci-a", "debugging sessions", &["null"])).unwrap();
        store.store_digest(&digest("ci-a", "travel notes", &["atlanta"])).unwrap();
        store.store_digest(&digest("ci-b", "debugging elsewhere", &["null"])).unwrap();

        let by_theme = store
            .query_digests(&Tier2Criteria {
                ci_id: "ci-a".to_string(),
                theme_contains: Some("DEBUG".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_theme.len(), 1);

        let by_keyword = store
            .query_digests(&Tier2Criteria {
                ci_id: "ci-a".to_string(),
                keyword: Some("atlanta".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_keyword.len(), 1);
        assert_eq!(by_keyword[0].theme, "travel notes");

        let by_period = store
            .query_digests(&Tier2Criteria {
                ci_id: "ci-a".to_string(),
                period_id: Some("2026-W31".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_period.len(), 2);
    }

    #[test]
    fn test_references_record_for_repair() {
        let (_dir, mut store) = store();
        store.store_digest(&digest("ci-a", "anything", &[])).unwrap();
        assert!(store.references_record("ci-a", "r-1").unwrap());
        assert!(!store.references_record("ci-a", "r-99").unwrap());
    }

    #[test]
    fn test_mirror_line_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Tier2Store::open(dir.path().join("tier2")).unwrap();
        let d = digest("ci-a", "mirrored", &[]);
        store.store_digest(&d).unwrap();

        let mirror = dir
            .path()
            .join("tier2")
            .join("weekly")
            .join("2026-W31")
            .join("digest.jsonl");
        let text = std::fs::read_to_string(mirror).unwrap();
        assert!(text.contains(&d.digest_id));
    }

    #[test]
    fn test_stats() {
        let (_dir, mut store) = store();
        store.store_digest(&digest("ci-a", "one", &[])).unwrap();
        store.store_digest(&digest("ci-a", "two", &[])).unwrap();
        let stats = store.stats("ci-a").unwrap();
        assert_eq!(stats.digests, 2);
        assert_eq!(stats.themes, 2);
    }
}
