//! Runtime configuration
//!
//! The engine is embedded in client processes and receives its settings
//! as a plain value; there is no config file or CLI surface.

use serde::{Deserialize, Serialize};

/// Configuration for a `WeftRuntime`.
///
/// # Example
///
/// ```
/// use weft_runtime::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_precise_conflicts(true)
///     .with_transaction_logging(true);
/// assert!(config.precise_conflicts);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Mirror every committing transaction onto the reserved transaction
    /// stream.
    #[serde(default)]
    pub transaction_logging: bool,

    /// Resolve sequencer conflict rejections precisely by scanning the
    /// log, instead of aborting on the (possibly false) fingerprint
    /// match.
    #[serde(default)]
    pub precise_conflicts: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            transaction_logging: false,
            precise_conflicts: false,
        }
    }
}

impl RuntimeConfig {
    /// Enable or disable the transaction-stream mirror.
    pub fn with_transaction_logging(mut self, enabled: bool) -> Self {
        self.transaction_logging = enabled;
        self
    }

    /// Enable or disable precise conflict resolution by default.
    pub fn with_precise_conflicts(mut self, enabled: bool) -> Self {
        self.precise_conflicts = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_off() {
        let c = RuntimeConfig::default();
        assert!(!c.transaction_logging);
        assert!(!c.precise_conflicts);
    }

    #[test]
    fn test_config_deserializes_with_missing_fields() {
        let c: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(!c.precise_conflicts);
        let c: RuntimeConfig =
            serde_json::from_str(r#"{"precise_conflicts": true}"#).unwrap();
        assert!(c.precise_conflicts);
    }
}
