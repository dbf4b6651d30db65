//! Tier 1 - Append-Only Raw Log
//!
//! Per-CI, per-day JSONL files. Once a row is written its bytes never move:
//! updates append a superseding row for the same record_id (last row wins),
//! and tombstoned rows are physically dropped only by `compact`, which swaps
//! the day file atomically. The keyword index is supplementary; the filtered
//! scan never depends on it.

mod index;

pub use index::KeywordIndex;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::access::AccessPolicy;
use crate::error::{io_err, KatraError, Result};
use crate::memory::{MemoryRecord, QueryCriteria};

// ============================================================================
// STATS / OUTCOMES
// ============================================================================

/// Per-CI Tier 1 statistics
#[derive(Debug, Clone, Default)]
pub struct Tier1Stats {
    /// Records whose latest row is not tombstoned
    pub active_records: u64,
    /// Records whose latest row is tombstoned
    pub archived_records: u64,
    /// Total bytes across the CI's day files
    pub total_bytes: u64,
    /// Number of day files
    pub day_files: usize,
}

/// Result of compacting one day file
#[derive(Debug, Clone)]
pub struct CompactOutcome {
    /// Rows in the file before the rewrite
    pub rows_before: usize,
    /// Rows kept after dropping superseded and tombstoned rows
    pub rows_after: usize,
}

// ============================================================================
// TIER 1 STORE
// ============================================================================

/// Append-only day-log store
pub struct Tier1Store {
    root: PathBuf,
    policy: AccessPolicy,
    index: HashMap<String, KeywordIndex>,
    quota_bytes: Option<u64>,
}

fn validate_ci_id(ci_id: &str) -> Result<()> {
    if ci_id.trim().is_empty() {
        return Err(KatraError::NullInput("ci_id"));
    }
    if ci_id.contains(['/', '\\']) || ci_id.contains("..") {
        return Err(KatraError::InvalidParams(format!(
            "ci_id is not a valid path segment: {ci_id}"
        )));
    }
    Ok(())
}

impl Tier1Store {
    /// Open the store rooted at `<memory root>/tier1`
    pub fn open(root: impl Into<PathBuf>, policy: AccessPolicy) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err("creating tier1 root"))?;
        Ok(Self {
            root,
            policy,
            index: HashMap::new(),
            quota_bytes: None,
        })
    }

    /// Cap the per-CI byte budget; writes past it fail with `QuotaExceeded`
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn ci_dir(&self, ci_id: &str) -> PathBuf {
        self.root.join(ci_id)
    }

    fn day_path(&self, ci_id: &str, date: NaiveDate) -> PathBuf {
        self.ci_dir(ci_id)
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one framed row to the record's day file
    pub fn store(&mut self, record: &MemoryRecord) -> Result<()> {
        validate_ci_id(&record.ci_id)?;

        let line = serde_json::to_string(record).map_err(|e| KatraError::Format {
            what: "tier1 row".to_string(),
            detail: e.to_string(),
        })?;

        if let Some(quota) = self.quota_bytes {
            let stats = self.stats(&record.ci_id)?;
            if stats.total_bytes + line.len() as u64 > quota {
                return Err(KatraError::QuotaExceeded {
                    ci_id: record.ci_id.clone(),
                    used_bytes: stats.total_bytes,
                });
            }
        }

        self.append_line(&record.ci_id, record.timestamp.date_naive(), &line)?;

        self.index
            .entry(record.ci_id.clone())
            .or_default()
            .insert(&record.record_id, &record.content);
        Ok(())
    }

    fn append_line(&self, ci_id: &str, date: NaiveDate, line: &str) -> Result<()> {
        let dir = self.ci_dir(ci_id);
        fs::create_dir_all(&dir).map_err(io_err("creating ci directory"))?;
        let path = self.day_path(ci_id, date);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(format!("opening day log {}", path.display())))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.flush())
            .map_err(io_err(format!("appending to {}", path.display())))?;
        Ok(())
    }

    /// Day files for a CI, sorted chronologically (filename order)
    pub fn list_days(&self, ci_id: &str) -> Result<Vec<NaiveDate>> {
        validate_ci_id(ci_id)?;
        let dir = self.ci_dir(ci_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut days = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err("listing day files"))? {
            let entry = entry.map_err(io_err("listing day files"))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                    days.push(date);
                }
            }
        }
        days.sort();
        Ok(days)
    }

    /// All CIs with a Tier 1 directory
    pub fn list_cis(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err("listing tier1 root"))? {
            let entry = entry.map_err(io_err("listing tier1 root"))?;
            if entry.path().is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read one day file tolerantly.
    ///
    /// A malformed trailing line is a recoverable partial write: skipped here,
    /// physically dropped on the next compact. A malformed interior line is
    /// corruption: logged and skipped.
    fn load_day(&self, path: &Path) -> Result<Vec<MemoryRecord>> {
        let text = fs::read_to_string(path)
            .map_err(io_err(format!("reading day log {}", path.display())))?;
        let lines: Vec<&str> = text.lines().collect();
        let mut rows = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryRecord>(line) {
                Ok(record) => rows.push(record),
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %e,
                        "skipping truncated trailing row"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = i + 1,
                        error = %e,
                        "skipping corrupt row"
                    );
                }
            }
        }
        Ok(rows)
    }

    /// Latest row per record across the day range, in first-seen order
    fn latest_rows(
        &self,
        ci_id: &str,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<Vec<MemoryRecord>> {
        let mut ordered: Vec<MemoryRecord> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for day in self.list_days(ci_id)? {
            if since.is_some_and(|d| day < d) || until.is_some_and(|d| day > d) {
                continue;
            }
            for record in self.load_day(&self.day_path(ci_id, day))? {
                match by_id.get(&record.record_id) {
                    Some(&idx) => ordered[idx] = record,
                    None => {
                        by_id.insert(record.record_id.clone(), ordered.len());
                        ordered.push(record);
                    }
                }
            }
        }
        Ok(ordered)
    }

    /// Linear filtered scan over day files in the requested time range.
    ///
    /// Skips tombstoned rows unless the criteria ask for them, applies the
    /// structural filters, then the access predicate, then the limit.
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<MemoryRecord>> {
        validate_ci_id(&criteria.ci_id)?;
        let since = criteria.since.map(|t| t.date_naive());
        let until = criteria.until.map(|t| t.date_naive());

        let mut out = Vec::new();
        for record in self.latest_rows(&criteria.ci_id, since, until)? {
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

    /// Latest row for one record, tombstoned or not. No access check.
    pub(crate) fn get_any(&self, ci_id: &str, record_id: &str) -> Result<Option<MemoryRecord>> {
        validate_ci_id(ci_id)?;
        let mut found = None;
        for record in self.latest_rows(ci_id, None, None)? {
            if record.record_id == record_id {
                found = Some(record);
            }
        }
        Ok(found)
    }

    /// Fetch one active record.
    ///
    /// Denied access is reported as `AccessDenied`, never as not-found.
    pub fn get(
        &self,
        ci_id: &str,
        record_id: &str,
        requester: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let Some(record) = self.get_any(ci_id, record_id)? else {
            return Ok(None);
        };
        if record.archived {
            return Ok(None);
        }
        if !self.policy.permits(&record, requester) {
            return Err(KatraError::AccessDenied {
                requester: requester.unwrap_or("<anonymous>").to_string(),
                record_id: record_id.to_string(),
            });
        }
        Ok(Some(record))
    }

    /// Flip the tombstone flag by appending a superseding row
    pub fn set_archived(&mut self, ci_id: &str, record_id: &str, archived: bool) -> Result<()> {
        let mut record = self
            .get_any(ci_id, record_id)?
            .ok_or_else(|| KatraError::RecordNotFound(record_id.to_string()))?;
        if record.archived == archived {
            return Ok(());
        }
        record.archived = archived;
        let line = serde_json::to_string(&record).map_err(|e| KatraError::Format {
            what: "tier1 row".to_string(),
            detail: e.to_string(),
        })?;
        self.append_line(ci_id, record.timestamp.date_naive(), &line)?;
        if archived {
            if let Some(index) = self.index.get_mut(ci_id) {
                index.remove(record_id);
            }
        }
        Ok(())
    }

    /// Apply a consolidation-time mutation by appending the superseding row.
    ///
    /// Content is immutable after creation; only lifecycle fields may change.
    pub fn supersede(&mut self, record: &MemoryRecord) -> Result<()> {
        let existing = self
            .get_any(&record.ci_id, &record.record_id)?
            .ok_or_else(|| KatraError::RecordNotFound(record.record_id.clone()))?;
        crate::error::check_invariant(
            existing.content == record.content,
            "tier1 supersede must not rewrite content",
        )?;
        let line = serde_json::to_string(record).map_err(|e| KatraError::Format {
            what: "tier1 row".to_string(),
            detail: e.to_string(),
        })?;
        self.append_line(&record.ci_id, record.timestamp.date_naive(), &line)
    }

    /// Per-CI statistics
    pub fn stats(&self, ci_id: &str) -> Result<Tier1Stats> {
        validate_ci_id(ci_id)?;
        let mut stats = Tier1Stats::default();
        let days = self.list_days(ci_id)?;
        stats.day_files = days.len();
        for day in &days {
            let path = self.day_path(ci_id, *day);
            stats.total_bytes += fs::metadata(&path)
                .map_err(io_err("reading day file metadata"))?
                .len();
        }
        for record in self.latest_rows(ci_id, None, None)? {
            if record.archived {
                stats.archived_records += 1;
            } else {
                stats.active_records += 1;
            }
        }
        Ok(stats)
    }

    /// Rewrite one day file keeping only each record's final non-tombstoned
    /// row. Atomic: written to a temp file, then swapped in.
    pub fn compact(&mut self, ci_id: &str, date: NaiveDate) -> Result<CompactOutcome> {
        validate_ci_id(ci_id)?;
        let path = self.day_path(ci_id, date);
        if !path.exists() {
            return Ok(CompactOutcome {
                rows_before: 0,
                rows_after: 0,
            });
        }

        let rows = self.load_day(&path)?;
        let rows_before = rows.len();

        let mut ordered: Vec<MemoryRecord> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for record in rows {
            match by_id.get(&record.record_id) {
                Some(&idx) => ordered[idx] = record,
                None => {
                    by_id.insert(record.record_id.clone(), ordered.len());
                    ordered.push(record);
                }
            }
        }
        let kept: Vec<&MemoryRecord> = ordered.iter().filter(|r| !r.archived).collect();

        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(io_err("creating compact temp file"))?;
            for record in &kept {
                let line = serde_json::to_string(record).map_err(|e| KatraError::Format {
                    what: "tier1 row".to_string(),
                    detail: e.to_string(),
                })?;
                tmp.write_all(line.as_bytes())
                    .and_then(|_| tmp.write_all(b"\n"))
                    .map_err(io_err("writing compact temp file"))?;
            }
            tmp.flush().map_err(io_err("flushing compact temp file"))?;
        }
        fs::rename(&tmp_path, &path).map_err(io_err("swapping compacted day file"))?;

        tracing::debug!(
            ci_id,
            day = %date,
            rows_before,
            rows_after = kept.len(),
            "compacted day file"
        );
        Ok(CompactOutcome {
            rows_before,
            rows_after: kept.len(),
        })
    }

    /// Repopulate the CI's keyword index from all day files
    pub fn rebuild_index(&mut self, ci_id: &str) -> Result<usize> {
        validate_ci_id(ci_id)?;
        let rows = self.latest_rows(ci_id, None, None)?;
        let index = self.index.entry(ci_id.to_string()).or_default();
        index.clear();
        let mut indexed = 0;
        for record in rows {
            if record.archived {
                continue;
            }
            index.insert(&record.record_id, &record.content);
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Keyword lookup against the supplementary index.
    ///
    /// Returns record ids; empty when the index is cold. Callers fall back to
    /// the linear scan for correctness.
    pub fn keyword_lookup(&self, ci_id: &str, query: &str) -> Vec<String> {
        let Some(index) = self.index.get(ci_id) else {
            return Vec::new();
        };
        if query.split_whitespace().nth(1).is_some() {
            index.lookup_phrase(query)
        } else {
            index.lookup_prefix(query)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordType;

    fn store() -> (tempfile::TempDir, Tier1Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Tier1Store::open(dir.path().join("tier1"), AccessPolicy::without_teams())
            .unwrap();
        (dir, store)
    }

    fn record(ci: &str, content: &str) -> MemoryRecord {
        MemoryRecord::new(ci, RecordType::Experience, content, 0.5).unwrap()
    }

    #[test]
    fn test_store_then_query_roundtrip() {
        let (_dir, mut store) = store();
        let r = record("ci-a", "first memory");
        store.store(&r).unwrap();

        let out = store.query(&QueryCriteria::for_ci("ci-a")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], r);
    }

    #[test]
    fn test_archived_rows_skipped_and_restorable() {
        let (_dir, mut store) = store();
        let r = record("ci-a", "to be archived");
        store.store(&r).unwrap();
        store.set_archived("ci-a", &r.record_id, true).unwrap();

        assert!(store.query(&QueryCriteria::for_ci("ci-a")).unwrap().is_empty());

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.include_archived = true;
        assert_eq!(store.query(&criteria).unwrap().len(), 1);

        store.set_archived("ci-a", &r.record_id, false).unwrap();
        assert_eq!(store.query(&QueryCriteria::for_ci("ci-a")).unwrap().len(), 1);
    }

    #[test]
    fn test_get_distinguishes_denied_from_missing() {
        let (_dir, mut store) = store();
        let r = record("ci-a", "private thing");
        store.store(&r).unwrap();

        assert!(store.get("ci-a", "no-such-id", None).unwrap().is_none());
        let err = store.get("ci-a", &r.record_id, Some("ci-b")).unwrap_err();
        assert_eq!(err.name(), "E_ACCESS_DENIED");
    }

    #[test]
    fn test_truncated_trailing_row_is_skipped() {
        let (_dir, mut store) = store();
        let r = record("ci-a", "survives the crash");
        store.store(&r).unwrap();

        // Simulate a crash mid-append
        let day = r.timestamp.date_naive();
        let path = store.day_path("ci-a", day);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record_id\":\"half-writ").unwrap();

        let out = store.query(&QueryCriteria::for_ci("ci-a")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record_id, r.record_id);
    }

    #[test]
    fn test_compact_drops_tombstones_and_supersessions() {
        let (_dir, mut store) = store();
        let keep = record("ci-a", "keep me");
        let drop = record("ci-a", "drop me");
        store.store(&keep).unwrap();
        store.store(&drop).unwrap();
        store.set_archived("ci-a", &drop.record_id, true).unwrap();

        let day = keep.timestamp.date_naive();
        let outcome = store.compact("ci-a", day).unwrap();
        assert_eq!(outcome.rows_before, 3);
        assert_eq!(outcome.rows_after, 1);

        let out = store.query(&QueryCriteria::for_ci("ci-a")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record_id, keep.record_id);
    }

    #[test]
    fn test_stats_counts_active_and_bytes() {
        let (_dir, mut store) = store();
        store.store(&record("ci-a", "one")).unwrap();
        store.store(&record("ci-a", "two")).unwrap();

        let stats = store.stats("ci-a").unwrap();
        assert_eq!(stats.active_records, 2);
        assert_eq!(stats.archived_records, 0);
        assert!(stats.total_bytes > 0);
        assert_eq!(stats.day_files, 1);
    }

    #[test]
    fn test_quota_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Tier1Store::open(dir.path().join("tier1"), AccessPolicy::without_teams())
            .unwrap()
            .with_quota(64);
        store
            .store(&record("ci-a", "short"))
            .expect_err("quota of 64 bytes cannot hold a full row");
    }

    #[test]
    fn test_rebuild_index_and_lookup() {
        let (_dir, mut store) = store();
        let r = record("ci-a", "dragon con in atlanta");
        store.store(&r).unwrap();

        store.rebuild_index("ci-a").unwrap();
        let hits = store.keyword_lookup("ci-a", "dragon con");
        assert_eq!(hits, vec![r.record_id.clone()]);
        assert_eq!(store.keyword_lookup("ci-a", "atla"), vec![r.record_id]);
    }

    #[test]
    fn test_ci_id_path_safety() {
        let (_dir, store) = store();
        assert!(store.query(&QueryCriteria::for_ci("../escape")).is_err());
    }
}
