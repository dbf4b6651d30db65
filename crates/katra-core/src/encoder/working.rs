//! Working Memory - The bounded in-process cache backend
//!
//! Recent records kept hot per CI under a hard budget. When the budget is
//! exceeded the least valuable record is evicted: lowest importance first,
//! oldest creation time as the tie-break. Eviction here is the one
//! hard-limit destroy path a record can take outside an explicit delete.

use std::collections::HashMap;

use crate::memory::{MemoryRecord, QueryCriteria};
use crate::vector::tokenize;

/// Default per-CI record budget
pub const DEFAULT_WORKING_CAPACITY: usize = 128;

// ============================================================================
// WORKING MEMORY
// ============================================================================

/// Bounded per-CI record cache
pub struct WorkingMemory {
    capacity: usize,
    by_ci: HashMap<String, Vec<MemoryRecord>>,
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(DEFAULT_WORKING_CAPACITY)
    }
}

impl WorkingMemory {
    /// Cache with the given per-CI budget (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_ci: HashMap::new(),
        }
    }

    /// Records currently held for a CI
    pub fn len(&self, ci_id: &str) -> usize {
        self.by_ci.get(ci_id).map_or(0, Vec::len)
    }

    /// Nothing held for a CI
    pub fn is_empty(&self, ci_id: &str) -> bool {
        self.len(ci_id) == 0
    }

    /// Insert or refresh a record, evicting past the budget
    pub fn store(&mut self, record: &MemoryRecord) {
        let records = self.by_ci.entry(record.ci_id.clone()).or_default();
        match records.iter_mut().find(|r| r.record_id == record.record_id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        while records.len() > self.capacity {
            let weakest = records
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.importance
                        .partial_cmp(&b.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.timestamp.cmp(&b.timestamp))
                })
                .map(|(i, _)| i);
            match weakest {
                Some(i) => {
                    let evicted = records.remove(i);
                    tracing::debug!(
                        ci_id = %evicted.ci_id,
                        record_id = %evicted.record_id,
                        "working memory budget reached; evicted weakest record"
                    );
                }
                None => break,
            }
        }
    }

    /// Fetch one cached record
    pub fn get(&self, ci_id: &str, record_id: &str) -> Option<&MemoryRecord> {
        self.by_ci
            .get(ci_id)?
            .iter()
            .find(|r| r.record_id == record_id)
    }

    /// Drop a record; returns whether it was held
    pub fn delete(&mut self, ci_id: &str, record_id: &str) -> bool {
        let Some(records) = self.by_ci.get_mut(ci_id) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| r.record_id != record_id);
        records.len() < before
    }

    /// Score cached records against the criteria.
    ///
    /// With query text: exact substring scores 1.0, otherwise the fraction of
    /// query tokens present. Without: recency order.
    pub fn query(&self, criteria: &QueryCriteria) -> Vec<(MemoryRecord, f64)> {
        let Some(records) = self.by_ci.get(&criteria.ci_id) else {
            return Vec::new();
        };
        let needle = criteria
            .query_text
            .as_deref()
            .or(criteria.content_contains.as_deref());

        let mut scored: Vec<(MemoryRecord, f64)> = records
            .iter()
            .filter(|r| criteria.matches(r))
            .filter_map(|r| {
                let score = match needle {
                    Some(needle) => score_against(r, needle)?,
                    None => 1.0,
                };
                Some((r.clone(), score))
            })
            .collect();

        match needle {
            Some(_) => scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            }),
            None => scored.sort_by(|a, b| b.0.timestamp.cmp(&a.0.timestamp)),
        }
        if let Some(limit) = criteria.limit {
            scored.truncate(limit);
        }
        scored
    }
}

fn score_against(record: &MemoryRecord, needle: &str) -> Option<f64> {
    if record
        .content
        .to_lowercase()
        .contains(&needle.to_lowercase())
    {
        return Some(1.0);
    }
    let query_tokens = tokenize(needle);
    if query_tokens.is_empty() {
        return None;
    }
    let content_tokens = tokenize(&record.content);
    let matched = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(t))
        .count();
    if matched == 0 {
        None
    } else {
        Some(matched as f64 / query_tokens.len() as f64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordType;

    fn record(ci: &str, content: &str, importance: f64) -> MemoryRecord {
        MemoryRecord::new(ci, RecordType::Experience, content, importance).unwrap()
    }

    #[test]
    fn test_budget_evicts_weakest() {
        let mut wm = WorkingMemory::new(2);
        let weak = record("ci-a", "weak", 0.1);
        let mid = record("ci-a", "mid", 0.5);
        let strong = record("ci-a", "strong", 0.9);

        wm.store(&weak);
        wm.store(&mid);
        wm.store(&strong);

        assert_eq!(wm.len("ci-a"), 2);
        assert!(wm.get("ci-a", &weak.record_id).is_none());
        assert!(wm.get("ci-a", &strong.record_id).is_some());
    }

    #[test]
    fn test_store_refreshes_in_place() {
        let mut wm = WorkingMemory::new(4);
        let mut r = record("ci-a", "original", 0.5);
        wm.store(&r);
        r.set_importance(0.9);
        wm.store(&r);

        assert_eq!(wm.len("ci-a"), 1);
        assert_eq!(wm.get("ci-a", &r.record_id).unwrap().importance, 0.9);
    }

    #[test]
    fn test_query_scores_substring_then_overlap() {
        let mut wm = WorkingMemory::new(8);
        let exact = record("ci-a", "dragon con in atlanta", 0.5);
        let partial = record("ci-a", "a dragon appeared", 0.5);
        let unrelated = record("ci-a", "roman empire history", 0.5);
        for r in [&exact, &partial, &unrelated] {
            wm.store(r);
        }

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.query_text = Some("dragon con".to_string());
        let hits = wm.query(&criteria);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.record_id, exact.record_id);
        assert_eq!(hits[0].1, 1.0);
        assert!(hits[1].1 < 1.0);
    }

    #[test]
    fn test_delete() {
        let mut wm = WorkingMemory::default();
        let r = record("ci-a", "gone soon", 0.5);
        wm.store(&r);
        assert!(wm.delete("ci-a", &r.record_id));
        assert!(!wm.delete("ci-a", &r.record_id));
        assert!(wm.is_empty("ci-a"));
    }
}
