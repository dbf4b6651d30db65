//! Memory Record - The single currency of the engine
//!
//! Every backend stores, indexes, or links the same record type. Records are
//! created through the factory, mutated only by consolidation, and keep their
//! score fields clamped to [0, 1] at every touch point.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KatraError, Result};

/// Upper bound on record content, in bytes
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Kinds of memory a CI can hold
///
/// The kind controls the default consolidation weight: decisions and goals
/// resist archival longer than raw interactions.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Something that happened to or around the CI
    #[default]
    Experience,
    /// The CI thinking about its own state or past
    Reflection,
    /// A durable fact or learned piece of information
    Knowledge,
    /// A choice that was made, with stakes
    Decision,
    /// An intention the CI is carrying forward
    Goal,
    /// A conversational exchange
    Interaction,
}

impl RecordType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Experience => "experience",
            RecordType::Reflection => "reflection",
            RecordType::Knowledge => "knowledge",
            RecordType::Decision => "decision",
            RecordType::Goal => "goal",
            RecordType::Interaction => "interaction",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "experience" => RecordType::Experience,
            "reflection" => RecordType::Reflection,
            "knowledge" => RecordType::Knowledge,
            "decision" => RecordType::Decision,
            "goal" => RecordType::Goal,
            "interaction" => RecordType::Interaction,
            _ => RecordType::Experience,
        }
    }

    /// Default consolidation weight for this kind
    pub fn consolidation_weight(&self) -> f64 {
        match self {
            RecordType::Experience => 0.5,
            RecordType::Reflection => 0.7,
            RecordType::Knowledge => 0.8,
            RecordType::Decision => 0.9,
            RecordType::Goal => 0.9,
            RecordType::Interaction => 0.4,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ISOLATION
// ============================================================================

/// Access-control class of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Owner only (plus explicit shares)
    #[default]
    Private,
    /// Members of the record's team
    Team,
    /// Anyone
    Public,
}

impl Isolation {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Private => "private",
            Isolation::Team => "team",
            Isolation::Public => "public",
        }
    }

    pub(crate) fn is_private(&self) -> bool {
        matches!(self, Isolation::Private)
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn default_tier() -> u8 {
    1
}

/// A memory record
///
/// Serialized as one JSON object per Tier 1 log line. Optional fields are
/// written only when non-default; readers tolerate unknown fields, so rows
/// written by newer engines still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Opaque unique identifier, stable across tiers
    pub record_id: String,
    /// Owning identity; primary partition key
    pub ci_id: String,
    /// Creation time, second precision
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Kind of memory
    #[serde(rename = "type", default)]
    pub record_type: RecordType,
    /// Assigned importance in [0, 1]
    pub importance: f64,
    /// Primary text payload
    pub content: String,
    /// Auxiliary response text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Auxiliary context text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Session fingerprint for per-session recall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Current storage tier
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Tombstone: the record has been promoted and has a successor
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
    /// Access-control class
    #[serde(default, skip_serializing_if = "Isolation::is_private")]
    pub isolation: Isolation,
    /// Team identifier; non-empty whenever isolation is Team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    /// Explicit grants that bypass isolation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<String>,
    /// Emotional salience in [0, 1]; consolidation input
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub emotion_intensity: f64,
    /// Short emotion tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_type: Option<String>,
    /// Voluntary override: never archived
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_important: bool,
    /// Voluntary override: eligible for immediate archival
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_forgettable: bool,
    /// Times this record was returned to a caller
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub access_count: u64,
    /// Last time this record was returned
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Normalized hub score in [0, 1]; populated by the graph store
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub graph_centrality: f64,
    /// Edge count; populated by the graph store
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub connection_count: usize,
    /// "Why did I remember this": the question that was open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_question: Option<String>,
    /// "Why did I remember this": how it resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_resolution: Option<String>,
    /// "Why did I remember this": what stayed uncertain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_uncertainty: Option<String>,
    /// Causal predecessor record id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
    /// Hierarchical organization path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Short categorization labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl MemoryRecord {
    /// Record factory
    ///
    /// Defaults: tier 1, not archived, private. `importance` is clamped to
    /// [0, 1]; content is bounded by [`MAX_CONTENT_BYTES`].
    pub fn new(
        ci_id: impl Into<String>,
        record_type: RecordType,
        content: impl Into<String>,
        importance: f64,
    ) -> Result<Self> {
        let ci_id = ci_id.into();
        let content = content.into();

        if ci_id.trim().is_empty() {
            return Err(KatraError::NullInput("ci_id"));
        }
        if content.is_empty() {
            return Err(KatraError::NullInput("content"));
        }
        if content.len() > MAX_CONTENT_BYTES {
            return Err(KatraError::TooLarge {
                what: "content",
                size: content.len(),
                limit: MAX_CONTENT_BYTES,
            });
        }

        let now = Utc::now();
        // Second precision, so JSONL timestamps round-trip exactly
        let timestamp = Utc
            .timestamp_opt(now.timestamp(), 0)
            .single()
            .unwrap_or(now);

        Ok(Self {
            record_id: Uuid::new_v4().to_string(),
            ci_id,
            timestamp,
            record_type,
            importance: importance.clamp(0.0, 1.0),
            content,
            response: None,
            context: None,
            session_id: None,
            tier: 1,
            archived: false,
            isolation: Isolation::Private,
            team_name: None,
            shared_with: Vec::new(),
            emotion_intensity: 0.0,
            emotion_type: None,
            marked_important: false,
            marked_forgettable: false,
            access_count: 0,
            last_accessed: None,
            graph_centrality: 0.0,
            connection_count: 0,
            context_question: None,
            context_resolution: None,
            context_uncertainty: None,
            related_to: None,
            collection: None,
            tags: Vec::new(),
        })
    }

    /// Attach a response payload
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Attach surrounding context text
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Bind to a session fingerprint
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Tag the record
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Place under a hierarchical collection path
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Set emotional salience. Intensity is clamped to [0, 1].
    pub fn with_emotion(mut self, intensity: f64, emotion_type: impl Into<String>) -> Self {
        self.emotion_intensity = intensity.clamp(0.0, 1.0);
        self.emotion_type = Some(emotion_type.into());
        self
    }

    /// Link to a causal predecessor
    pub fn with_related_to(mut self, record_id: impl Into<String>) -> Self {
        self.related_to = Some(record_id.into());
        self
    }

    /// Set the "why did I remember this" triple
    pub fn with_context_triple(
        mut self,
        question: Option<String>,
        resolution: Option<String>,
        uncertainty: Option<String>,
    ) -> Self {
        self.context_question = question;
        self.context_resolution = resolution;
        self.context_uncertainty = uncertainty;
        self
    }

    /// Set the access-control class. Team isolation requires a team name.
    pub fn with_isolation(mut self, isolation: Isolation, team_name: Option<String>) -> Result<Self> {
        if isolation == Isolation::Team {
            match team_name.as_deref() {
                Some(name) if !name.trim().is_empty() => {}
                _ => return Err(KatraError::NullInput("team_name")),
            }
        }
        self.isolation = isolation;
        self.team_name = team_name;
        Ok(self)
    }

    /// Grant an explicit share to another CI
    pub fn share_with(mut self, ci_id: impl Into<String>) -> Self {
        let ci_id = ci_id.into();
        if !self.shared_with.contains(&ci_id) {
            self.shared_with.push(ci_id);
        }
        self
    }

    /// Voluntary override: never archive
    pub fn mark_important(mut self) -> Self {
        self.marked_important = true;
        self
    }

    /// Voluntary override: archive at the next opportunity
    pub fn mark_forgettable(mut self) -> Self {
        self.marked_forgettable = true;
        self
    }

    /// Clamped importance setter
    pub fn set_importance(&mut self, importance: f64) {
        self.importance = importance.clamp(0.0, 1.0);
    }

    /// Clamped emotional-salience setter
    pub fn set_emotion_intensity(&mut self, intensity: f64) {
        self.emotion_intensity = intensity.clamp(0.0, 1.0);
    }

    /// Update graph caches; centrality is clamped to [0, 1]
    pub fn set_graph_scores(&mut self, centrality: f64, connection_count: usize) {
        self.graph_centrality = centrality.clamp(0.0, 1.0);
        self.connection_count = connection_count;
    }

    /// Record a read for access-based decay
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = Some(now);
    }

    /// Whole days since creation
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_days()
    }

    /// Not archived
    pub fn is_active(&self) -> bool {
        !self.archived
    }
}

// ============================================================================
// TESTS
// ============================================================================
