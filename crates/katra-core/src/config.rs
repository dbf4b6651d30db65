//! Environment Configuration
//!
//! The recognized options, exactly as the host environment passes them:
//! PERSONA, ROLE, LOG_LEVEL, USE_VECTOR_SEARCH, EMBEDDING_METHOD,
//! SIMILARITY_THRESHOLD. Unrecognized values fall back to defaults with a
//! warning; configuration never aborts engine start.

use crate::graph::GraphConfig;
use crate::vector::{EmbeddingMethod, DEFAULT_SIMILARITY_THRESHOLD};

// ============================================================================
// LOG LEVEL
// ============================================================================

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ERROR" => Some(LogLevel::Error),
            "WARN" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// The matching tracing level
    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone)]
pub struct KatraConfig {
    /// Persistent identity name, mapped to a stable ci_id
    pub persona: Option<String>,
    /// Human-readable role tag stored with the persona
    pub role: Option<String>,
    /// Log verbosity
    pub log_level: LogLevel,
    /// Opt-in semantic recall for the breathing primitives
    pub use_vector_search: bool,
    /// How embeddings are produced
    pub embedding_method: EmbeddingMethod,
    /// Cosine floor for vector search hits
    pub similarity_threshold: f32,
    /// Write-time auto-edge creation knobs
    pub graph: GraphConfig,
}

impl Default for KatraConfig {
    fn default() -> Self {
        Self {
            persona: None,
            role: None,
            log_level: LogLevel::default(),
            use_vector_search: false,
            embedding_method: EmbeddingMethod::default(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            graph: GraphConfig::default(),
        }
    }
}

fn env_truthy(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enabled"
    )
}

impl KatraConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(persona) = std::env::var("PERSONA") {
            if !persona.trim().is_empty() {
                config.persona = Some(persona);
            }
        }
        if let Ok(role) = std::env::var("ROLE") {
            if !role.trim().is_empty() {
                config.role = Some(role);
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            match LogLevel::parse_name(&level) {
                Some(level) => config.log_level = level,
                None => tracing::warn!(value = %level, "unrecognized LOG_LEVEL; keeping default"),
            }
        }
        if let Ok(flag) = std::env::var("USE_VECTOR_SEARCH") {
            config.use_vector_search = env_truthy(&flag);
        }
        if let Ok(method) = std::env::var("EMBEDDING_METHOD") {
            match method.parse::<EmbeddingMethod>() {
                Ok(method) => config.embedding_method = method,
                Err(e) => tracing::warn!(error = %e, "keeping default embedding method"),
            }
        }
        if let Ok(threshold) = std::env::var("SIMILARITY_THRESHOLD") {
            match threshold.parse::<f32>() {
                Ok(value) if (0.0..=1.0).contains(&value) => {
                    config.similarity_threshold = value;
                }
                _ => tracing::warn!(
                    value = %threshold,
                    "SIMILARITY_THRESHOLD must be a float in [0, 1]; keeping default"
                ),
            }
        }

        config
    }

    /// Enable semantic recall
    pub fn with_vector_search(mut self) -> Self {
        self.use_vector_search = true;
        self
    }

    /// The stable ci_id for the configured persona, when one is set
    pub fn persona_ci_id(&self) -> Option<String> {
        self.persona.as_deref().map(stable_ci_id)
    }
}

/// Deterministic persona → ci_id mapping: the same persona name always
/// resolves to the same identity
pub fn stable_ci_id(persona: &str) -> String {
    let mut h: u64 = 1469598103934665603;
    for b in persona.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(1099511628211);
    }
    format!("ci-{h:016x}")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KatraConfig::default();
        assert_eq!(config.log_level, LogLevel::Warn);
        assert!(!config.use_vector_search);
        assert_eq!(config.embedding_method, EmbeddingMethod::TfIdf);
        assert!((config.similarity_threshold - DEFAULT_SIMILARITY_THRESHOLD).abs() < 1e-6);
    }

    #[test]
    fn test_log_level_roundtrip() {
        for level in [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug] {
            assert_eq!(LogLevel::parse_name(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::parse_name("chatty"), None);
    }

    #[test]
    fn test_stable_ci_id_is_deterministic() {
        let a = stable_ci_id("Aria");
        let b = stable_ci_id("Aria");
        let c = stable_ci_id("Echo");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("ci-"));
    }

    #[test]
    fn test_env_truthy() {
        for v in ["1", "true", "YES", "On", "enabled"] {
            assert!(env_truthy(v));
        }
        for v in ["0", "false", "off", ""] {
            assert!(!env_truthy(v));
        }
    }
}
