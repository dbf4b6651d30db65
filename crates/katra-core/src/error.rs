//! Error Taxonomy
//!
//! Every failure in the engine carries a stable coded kind: the high byte is
//! the category, the low byte the kind number within it. Codes are part of
//! the wire contract with front-ends; the in-process error carries a
//! source-chained cause on top of the code.

use std::fmt;

// ============================================================================
// CATEGORIES
// ============================================================================

/// Error categories, encoded in the high byte of a code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// OS-level failures: IO, permissions, memory
    System = 1,
    /// Tier store failures: corruption, capacity, missing records
    MemoryTier = 2,
    /// Caller mistakes: bad ranges, bad formats, bad state
    Input = 3,
    /// Authorization and consent failures
    Access = 4,
    /// Invariants that should never fail
    Internal = 5,
    /// Checkpoint persistence failures
    Checkpoint = 6,
}

impl ErrorCategory {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::System => "system",
            ErrorCategory::MemoryTier => "memory_tier",
            ErrorCategory::Input => "input",
            ErrorCategory::Access => "access",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Engine error type
///
/// Variants map one-to-one onto the coded taxonomy. `code()` yields the
/// category:number code, `name()` the stable symbolic name, and
/// `suggestion()` a short remediation hint for clients.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum KatraError {
    // ========== System ==========
    /// IO failure with the operation that was in flight
    #[error("io failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// Database error from the SQLite layer
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Allocation budget exhausted
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// Filesystem permission failure
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Truncated read mid-structure
    #[error("unexpected end of data while {0}")]
    UnexpectedEof(String),
    /// Per-CI storage quota exceeded
    #[error("storage quota exceeded for {ci_id}: {used_bytes} bytes used")]
    QuotaExceeded { ci_id: String, used_bytes: u64 },

    // ========== Memory tier ==========
    /// Tier refused new writes
    #[error("tier {tier} is full")]
    TierFull { tier: u8 },
    /// On-disk state failed validation
    #[error("corruption detected in {location}: {detail}")]
    Corruption { location: String, detail: String },
    /// Record lookup miss
    #[error("record not found: {0}")]
    RecordNotFound(String),
    /// Consolidation pass could not complete
    #[error("consolidation failed: {0}")]
    ConsolidationFailed(String),
    /// A preservation rule was about to be violated
    #[error("retention violated for record {0}")]
    RetentionViolated(String),
    /// No write backend accepted the record
    #[error("no backend accepted store for record {record_id}: {failures:?}")]
    AllBackendsFailedStore {
        record_id: String,
        failures: Vec<String>,
    },
    /// Every query backend failed (not merely returned empty)
    #[error("all backends failed the query for {ci_id}: {failures:?}")]
    AllBackendsFailedQuery {
        ci_id: String,
        failures: Vec<String>,
    },

    // ========== Input ==========
    /// A required value was absent
    #[error("required value missing: {0}")]
    NullInput(&'static str),
    /// Numeric input outside its domain
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    /// Malformed serialized data
    #[error("malformed {what}: {detail}")]
    Format { what: String, detail: String },
    /// Payload over the configured bound
    #[error("{what} too large: {size} bytes (limit {limit})")]
    TooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },
    /// Parameter combination does not make sense
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// Operation not legal in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Identifier collision
    #[error("duplicate {what}: {id}")]
    Duplicate { what: &'static str, id: String },
    /// A bounded resource hit its limit
    #[error("resource limit reached: {0}")]
    ResourceLimit(String),
    /// Double initialization
    #[error("already initialized: {0}")]
    AlreadyInitialized(&'static str),
    /// Backend does not implement the requested operation
    #[error("{backend} backend does not support {operation}")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    // ========== Access ==========
    /// Requester may not read the record. Never conflated with not-found.
    #[error("access denied: {requester} may not read record {record_id}")]
    AccessDenied {
        requester: String,
        record_id: String,
    },
    /// Consent flow did not answer in time
    #[error("consent timed out for {0}")]
    ConsentTimeout(String),
    /// Operation needs an explicit consent grant
    #[error("consent required for {0}")]
    ConsentRequired(String),
    /// Referenced consent directive does not exist
    #[error("directive not found: {0}")]
    DirectiveNotFound(String),

    // ========== Internal ==========
    /// A believed-impossible condition fired; logged, never aborts
    #[error("assertion failed: {0}")]
    Assertion(String),
    /// Reached code that contradicts the design
    #[error("logic error: {0}")]
    Logic(String),
    /// In-memory structures disagree with each other
    #[error("internal corruption: {0}")]
    InternalCorruption(String),
    /// Declared but unimplemented path
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    // ========== Checkpoint ==========
    /// Checkpoint write failed
    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),
    /// Named checkpoint does not exist
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    /// Checkpoint payload failed validation
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
    /// Checkpoint larger than the configured bound
    #[error("checkpoint too large: {size} bytes (limit {limit})")]
    CheckpointTooLarge { size: usize, limit: usize },
    /// Restore from checkpoint failed partway
    #[error("checkpoint recovery failed: {0}")]
    CheckpointRecoveryFailed(String),
    /// Checkpoint written by an incompatible engine version
    #[error("checkpoint version mismatch: found {found}, expected {expected}")]
    CheckpointVersionMismatch { found: u32, expected: u32 },
}

/// Engine result type
pub type Result<T, E = KatraError> = std::result::Result<T, E>;

// ============================================================================
// CODES
// ============================================================================

impl KatraError {
    /// The category this error belongs to
    pub fn category(&self) -> ErrorCategory {
        use KatraError::*;
        match self {
            Io { .. } | Database(_) | OutOfMemory(_) | PermissionDenied(_) | UnexpectedEof(_)
            | QuotaExceeded { .. } => ErrorCategory::System,
            TierFull { .. }
            | Corruption { .. }
            | RecordNotFound(_)
            | ConsolidationFailed(_)
            | RetentionViolated(_)
            | AllBackendsFailedStore { .. }
            | AllBackendsFailedQuery { .. } => ErrorCategory::MemoryTier,
            NullInput(_) | OutOfRange { .. } | Format { .. } | TooLarge { .. }
            | InvalidParams(_) | InvalidState(_) | Duplicate { .. } | ResourceLimit(_)
            | AlreadyInitialized(_) | NotSupported { .. } => ErrorCategory::Input,
            AccessDenied { .. } | ConsentTimeout(_) | ConsentRequired(_)
            | DirectiveNotFound(_) => ErrorCategory::Access,
            Assertion(_) | Logic(_) | InternalCorruption(_) | NotImplemented(_) => {
                ErrorCategory::Internal
            }
            CheckpointFailed(_)
            | CheckpointNotFound(_)
            | CheckpointCorrupt(_)
            | CheckpointTooLarge { .. }
            | CheckpointRecoveryFailed(_)
            | CheckpointVersionMismatch { .. } => ErrorCategory::Checkpoint,
        }
    }

    /// Kind number within the category (low byte of the code)
    fn number(&self) -> u8 {
        use KatraError::*;
        match self {
            Io { .. } => 1,
            Database(_) => 2,
            OutOfMemory(_) => 3,
            PermissionDenied(_) => 4,
            UnexpectedEof(_) => 5,
            QuotaExceeded { .. } => 6,

            TierFull { .. } => 1,
            Corruption { .. } => 2,
            RecordNotFound(_) => 3,
            ConsolidationFailed(_) => 4,
            RetentionViolated(_) => 5,
            AllBackendsFailedStore { .. } => 6,
            AllBackendsFailedQuery { .. } => 7,

            NullInput(_) => 1,
            OutOfRange { .. } => 2,
            Format { .. } => 3,
            TooLarge { .. } => 4,
            InvalidParams(_) => 5,
            InvalidState(_) => 6,
            Duplicate { .. } => 7,
            ResourceLimit(_) => 8,
            AlreadyInitialized(_) => 9,
            NotSupported { .. } => 10,

            AccessDenied { .. } => 1,
            ConsentTimeout(_) => 2,
            ConsentRequired(_) => 3,
            DirectiveNotFound(_) => 4,

            Assertion(_) => 1,
            Logic(_) => 2,
            InternalCorruption(_) => 3,
            NotImplemented(_) => 4,

            CheckpointFailed(_) => 1,
            CheckpointNotFound(_) => 2,
            CheckpointCorrupt(_) => 3,
            CheckpointTooLarge { .. } => 4,
            CheckpointRecoveryFailed(_) => 5,
            CheckpointVersionMismatch { .. } => 6,
        }
    }

    /// Combined code: category in the high byte, kind number in the low byte
    pub fn code(&self) -> u16 {
        ((self.category() as u16) << 8) | self.number() as u16
    }

    /// Stable symbolic name for the wire
    pub fn name(&self) -> &'static str {
        use KatraError::*;
        match self {
            Io { .. } => "E_IO",
            Database(_) => "E_DATABASE",
            OutOfMemory(_) => "E_OOM",
            PermissionDenied(_) => "E_PERMISSION",
            UnexpectedEof(_) => "E_EOF",
            QuotaExceeded { .. } => "E_QUOTA_EXCEEDED",

            TierFull { .. } => "E_TIER_FULL",
            Corruption { .. } => "E_CORRUPTION",
            RecordNotFound(_) => "E_RECORD_NOT_FOUND",
            ConsolidationFailed(_) => "E_CONSOLIDATION_FAILED",
            RetentionViolated(_) => "E_RETENTION_VIOLATED",
            AllBackendsFailedStore { .. } => "E_ALL_BACKENDS_FAILED_STORE",
            AllBackendsFailedQuery { .. } => "E_ALL_BACKENDS_FAILED_QUERY",

            NullInput(_) => "E_NULL_INPUT",
            OutOfRange { .. } => "E_OUT_OF_RANGE",
            Format { .. } => "E_FORMAT",
            TooLarge { .. } => "E_TOO_LARGE",
            InvalidParams(_) => "E_INVALID_PARAMS",
            InvalidState(_) => "E_INVALID_STATE",
            Duplicate { .. } => "E_DUPLICATE",
            ResourceLimit(_) => "E_RESOURCE_LIMIT",
            AlreadyInitialized(_) => "E_ALREADY_INITIALIZED",
            NotSupported { .. } => "E_NOT_SUPPORTED",

            AccessDenied { .. } => "E_ACCESS_DENIED",
            ConsentTimeout(_) => "E_CONSENT_TIMEOUT",
            ConsentRequired(_) => "E_CONSENT_REQUIRED",
            DirectiveNotFound(_) => "E_DIRECTIVE_NOT_FOUND",

            Assertion(_) => "E_ASSERTION",
            Logic(_) => "E_LOGIC",
            InternalCorruption(_) => "E_INTERNAL_CORRUPTION",
            NotImplemented(_) => "E_NOT_IMPLEMENTED",

            CheckpointFailed(_) => "E_CHECKPOINT_FAILED",
            CheckpointNotFound(_) => "E_CHECKPOINT_NOT_FOUND",
            CheckpointCorrupt(_) => "E_CHECKPOINT_CORRUPT",
            CheckpointTooLarge { .. } => "E_CHECKPOINT_TOO_LARGE",
            CheckpointRecoveryFailed(_) => "E_CHECKPOINT_RECOVERY_FAILED",
            CheckpointVersionMismatch { .. } => "E_CHECKPOINT_VERSION_MISMATCH",
        }
    }

    /// Short remediation hint for clients
    pub fn suggestion(&self) -> &'static str {
        use KatraError::*;
        match self {
            Io { .. } | Database(_) => "check disk space and file permissions, then retry",
            OutOfMemory(_) => "reduce the working set or raise the memory budget",
            PermissionDenied(_) => "fix filesystem permissions on the memory root",
            UnexpectedEof(_) => "run compact to drop the truncated tail",
            QuotaExceeded { .. } => "run consolidation or raise the storage quota",
            TierFull { .. } => "run consolidation to promote old records",
            Corruption { .. } => "rebuild the index from the tier 1 log",
            RecordNotFound(_) => "verify the record id and owning CI",
            ConsolidationFailed(_) => "retry; partial archives are repaired on next open",
            RetentionViolated(_) => "clear marked_important before archiving",
            AllBackendsFailedStore { .. } => "check backend health; tier 1 must be writable",
            AllBackendsFailedQuery { .. } => "check backend health; tier 1 must be readable",
            NullInput(_) | InvalidParams(_) => "supply the missing or corrected parameter",
            OutOfRange { .. } => "clamp the value to its documented range",
            Format { .. } => "re-serialize the payload",
            TooLarge { .. } => "shorten the content or split the record",
            InvalidState(_) => "re-open the store before retrying",
            Duplicate { .. } => "use update instead of store",
            ResourceLimit(_) => "evict or raise the working-memory budget",
            AlreadyInitialized(_) => "reuse the existing instance",
            NotSupported { .. } => "route the operation to a capable backend",
            AccessDenied { .. } => "request a share grant from the record owner",
            ConsentTimeout(_) | ConsentRequired(_) => "re-run with consent granted",
            DirectiveNotFound(_) => "register the consent directive first",
            Assertion(_) | Logic(_) | InternalCorruption(_) => "report this as an engine bug",
            NotImplemented(_) => "this operation is declared but not yet available",
            CheckpointFailed(_) | CheckpointRecoveryFailed(_) => "retry the checkpoint operation",
            CheckpointNotFound(_) => "list checkpoints to find a valid name",
            CheckpointCorrupt(_) | CheckpointVersionMismatch { .. } => {
                "restore from an older checkpoint"
            }
            CheckpointTooLarge { .. } => "consolidate before checkpointing",
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wrap an IO error with the operation that was in flight
pub fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> KatraError {
    let context = context.into();
    move |source| KatraError::Io { context, source }
}

/// Check an invariant believed never to fail.
///
/// On violation, logs at error level and returns a `Logic` code instead of
/// aborting the process.
pub fn check_invariant(condition: bool, detail: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        tracing::error!(detail, "invariant violated");
        Err(KatraError::Logic(detail.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_partitioning() {
        let err = KatraError::RecordNotFound("r-1".to_string());
        assert_eq!(err.category(), ErrorCategory::MemoryTier);
        assert_eq!(err.code() >> 8, ErrorCategory::MemoryTier as u16);
        assert_eq!(err.code() & 0xff, 3);
    }

    #[test]
    fn test_access_denied_distinct_from_not_found() {
        let denied = KatraError::AccessDenied {
            requester: "ci-b".to_string(),
            record_id: "r-1".to_string(),
        };
        let missing = KatraError::RecordNotFound("r-1".to_string());
        assert_ne!(denied.code(), missing.code());
        assert_eq!(denied.name(), "E_ACCESS_DENIED");
        assert_eq!(missing.name(), "E_RECORD_NOT_FOUND");
    }

    #[test]
    fn test_every_variant_has_suggestion() {
        let samples = vec![
            KatraError::TierFull { tier: 1 },
            KatraError::NullInput("ci_id"),
            KatraError::Assertion("x".to_string()),
            KatraError::CheckpointVersionMismatch {
                found: 2,
                expected: 1,
            },
        ];
        for err in samples {
            assert!(!err.suggestion().is_empty());
            assert!(err.name().starts_with("E_"));
        }
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = io_err("appending day log")(io);
        assert_eq!(err.name(), "E_IO");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_check_invariant() {
        assert!(check_invariant(true, "fine").is_ok());
        let err = check_invariant(false, "broken").unwrap_err();
        assert_eq!(err.name(), "E_LOGIC");
    }
}
