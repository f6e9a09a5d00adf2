mod engine;
mod llm;
mod observability;
mod server;

pub use engine::*;
pub use llm::*;
pub use observability::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub todo: TodoConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError::warning(
                "server.cors.allowed_origins",
                "wildcard \"*\" allows all origins (not recommended for production)",
            ));
        }

        if self.llm.base_url.is_empty() {
            errors.push(ConfigError::error("llm.base_url", "base_url must not be empty"));
        }
        if self.llm.default_model.is_empty() {
            errors.push(ConfigError::error(
                "llm.default_model",
                "default_model must not be empty",
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push(ConfigError::warning(
                "llm.temperature",
                format!("{} is outside the usual 0.0..=2.0 range", self.llm.temperature),
            ));
        }

        if self.engine.flush_interval_ms == 0 {
            errors.push(ConfigError::error(
                "engine.flush_interval_ms",
                "flush interval must be greater than 0",
            ));
        }
        if self.engine.flush_threshold_chars == 0 {
            errors.push(ConfigError::warning(
                "engine.flush_threshold_chars",
                "a zero threshold flushes every fragment",
            ));
        }

        if !(0.0..=1.0).contains(&self.duplicates.text_similarity) {
            errors.push(ConfigError::error(
                "duplicates.text_similarity",
                "similarity threshold must be within 0.0..=1.0",
            ));
        }

        if self.actions.max_records_per_conversation == 0 {
            errors.push(ConfigError::error(
                "actions.max_records_per_conversation",
                "retention cap must be greater than 0",
            ));
        }

        if self.todo.default_watch_timeout_secs > self.todo.max_watch_timeout_secs {
            errors.push(ConfigError::error(
                "todo.default_watch_timeout_secs",
                "default watch timeout exceeds max_watch_timeout_secs",
            ));
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "sample rate must be within 0.0..=1.0",
            ));
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let issues = Config::default().validate();
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "server.port" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn out_of_range_similarity_is_an_error() {
        let mut cfg = Config::default();
        cfg.duplicates.text_similarity = 1.5;
        let issues = cfg.validate();
        assert!(issues.iter().any(|e| e.field == "duplicates.text_similarity"));
    }

    #[test]
    fn wildcard_cors_is_only_a_warning() {
        let mut cfg = Config::default();
        cfg.server.cors.allowed_origins = vec!["*".into()];
        let issues = cfg.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    }

    #[test]
    fn display_tags_severity() {
        let e = ConfigError::error("server.port", "bad");
        assert_eq!(e.to_string(), "[ERROR] server.port: bad");
    }
}
