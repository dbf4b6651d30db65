//! Memory module - Core types and data structures
//!
//! The record model shared by every backend, plus the query criteria that
//! drive backend selection in the encoder.

mod record;

pub use record::{Isolation, MemoryRecord, RecordType, MAX_CONTENT_BYTES};

use chrono::{DateTime, Utc};

// ============================================================================
// QUERY CRITERIA
// ============================================================================

/// Shape of a query, used by the encoder to pick the best backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaShape {
    /// Free-text meaning lookup; served by the vector index
    Semantic,
    /// Association walk from a seed record; served by the graph store
    Relationship,
    /// Field filters over the raw stores
    Structured,
}

/// Filter set for memory queries
///
/// `ci_id` scopes the search to one identity's store. `requesting_ci_id`
/// drives access filtering: `None` means owner context (no filtering).
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    /// Identity whose store is being searched (required)
    pub ci_id: String,
    /// Identity asking; `None` = owner context
    pub requesting_ci_id: Option<String>,
    /// Inclusive lower bound on creation time
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on creation time
    pub until: Option<DateTime<Utc>>,
    /// Restrict to these record kinds
    pub types: Option<Vec<RecordType>>,
    /// Minimum importance
    pub min_importance: Option<f64>,
    /// Case-insensitive substring over content/response/context
    pub content_contains: Option<String>,
    /// Restrict to one session fingerprint
    pub session_id: Option<String>,
    /// Restrict to a collection path prefix
    pub collection: Option<String>,
    /// Restrict to records carrying this tag
    pub tag: Option<String>,
    /// Seed record for association walks
    pub related_to: Option<String>,
    /// Free-text query for semantic recall
    pub query_text: Option<String>,
    /// Include tombstoned rows (consolidation internals only)
    pub include_archived: bool,
    /// Truncate the result list
    pub limit: Option<usize>,
}

impl QueryCriteria {
    /// Criteria matching everything a CI owns
    pub fn for_ci(ci_id: impl Into<String>) -> Self {
        Self {
            ci_id: ci_id.into(),
            ..Default::default()
        }
    }

    /// Classify the query for backend selection
    pub fn shape(&self) -> CriteriaShape {
        if self.related_to.is_some() {
            CriteriaShape::Relationship
        } else if self.query_text.is_some() {
            CriteriaShape::Semantic
        } else {
            CriteriaShape::Structured
        }
    }

    /// Structural filter check. Access control is applied separately.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if record.ci_id != self.ci_id {
            return false;
        }
        if record.archived && !self.include_archived {
            return false;
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&record.record_type) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        if let Some(needle) = &self.content_contains {
            let needle = needle.to_lowercase();
            let in_content = record.content.to_lowercase().contains(&needle);
            let in_response = record
                .response
                .as_ref()
                .is_some_and(|r| r.to_lowercase().contains(&needle));
            let in_context = record
                .context
                .as_ref()
                .is_some_and(|c| c.to_lowercase().contains(&needle));
            if !(in_content || in_response || in_context) {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if record.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.collection {
            match &record.collection {
                Some(path) if path.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryRecord {
        MemoryRecord::new("ci-a", RecordType::Knowledge, "Rust ownership notes", 0.6)
            .unwrap()
            .with_session("sess-1")
            .with_collection("study/rust")
            .with_tags(vec!["rust".to_string()])
    }

    #[test]
    fn test_shape_classification() {
        let mut criteria = QueryCriteria::for_ci("ci-a");
        assert_eq!(criteria.shape(), CriteriaShape::Structured);

        criteria.query_text = Some("ownership".to_string());
        assert_eq!(criteria.shape(), CriteriaShape::Semantic);

        // Relationship wins over semantic when both are set
        criteria.related_to = Some("r-1".to_string());
        assert_eq!(criteria.shape(), CriteriaShape::Relationship);
    }

    #[test]
    fn test_matches_filters() {
        let record = sample();

        let mut criteria = QueryCriteria::for_ci("ci-a");
        assert!(criteria.matches(&record));

        criteria.ci_id = "ci-b".to_string();
        assert!(!criteria.matches(&record));

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.min_importance = Some(0.9);
        assert!(!criteria.matches(&record));

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.content_contains = Some("OWNERSHIP".to_string());
        assert!(criteria.matches(&record));

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.types = Some(vec![RecordType::Decision]);
        assert!(!criteria.matches(&record));

        let mut criteria = QueryCriteria::for_ci("ci-a");
        criteria.collection = Some("study".to_string());
        assert!(criteria.matches(&record));
        criteria.collection = Some("work".to_string());
        assert!(!criteria.matches(&record));
    }

    #[test]
    fn test_archived_rows_skipped_by_default() {
        let mut record = sample();
        record.archived = true;

        let mut criteria = QueryCriteria::for_ci("ci-a");
        assert!(!criteria.matches(&record));

        criteria.include_archived = true;
        assert!(criteria.matches(&record));
    }
}
