// Engine configuration
// Layered: built-in defaults, optional config files, then environment variables

//! # Engine Configuration
//!
//! All tunables of the orchestrator, the communication protocol and the
//! performance analyzer live in [`EngineConfig`]. Every field has a default, so
//! an empty configuration source yields a fully working engine.
//!
//! Sources are merged in this order (later wins):
//! 1. `config/agent-chain.{toml,json,yaml}` (optional)
//! 2. an explicit file passed to [`EngineConfig::load_from`] (optional)
//! 3. environment variables prefixed `AGENT_CHAIN__`, e.g.
//!    `AGENT_CHAIN__ORCHESTRATOR__DEFAULT_STEP_RETRIES=3`

use serde::{Deserialize, Serialize};

use crate::Result;

/// Root configuration object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub protocol: ProtocolConfig,
    pub analyzer: AnalyzerConfig,
    pub logging: LoggingConfig,
}

/// Step scheduling and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retries granted to steps that do not declare their own retry count
    pub default_step_retries: u32,
    /// Linear backoff unit between attempts of the same step
    pub retry_backoff_ms: u64,
    /// Abort agent calls that exceed the step timeout. Off by default: step and
    /// chain timeouts are advisory and only logged.
    pub enforce_step_timeouts: bool,
    /// Timeout applied to steps that do not declare their own
    pub default_step_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_retries: 1,
            retry_backoff_ms: 250,
            enforce_step_timeouts: false,
            default_step_timeout_secs: 300,
        }
    }
}

/// Handoff sizing and validation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Payloads above this size are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Payloads above this size are moved out of band and passed by reference
    pub reference_threshold_bytes: usize,
    /// Payloads above this size degrade the quality score and raise a warning
    pub max_payload_bytes: usize,
    /// Agent pairs scoring below this compatibility get a transform warning
    pub compatibility_warning_threshold: f64,
    /// Quality score deducted for an oversized payload
    pub size_penalty: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 1024 * 1024,
            reference_threshold_bytes: 8 * 1024 * 1024,
            max_payload_bytes: 10 * 1024 * 1024,
            compatibility_warning_threshold: 0.5,
            size_penalty: 0.2,
        }
    }
}

/// Bottleneck thresholds and trend classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub max_step_time_ms: u64,
    pub max_step_cost: f64,
    pub min_quality_score: f64,
    /// Chains slower than this get a parallelization recommendation
    pub slow_chain_ms: u64,
    /// Relative slopes inside this band are classified as stable
    pub trend_stability_band: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_step_time_ms: 60_000,
            max_step_cost: 1.0,
            min_quality_score: 0.7,
            slow_chain_ms: 5 * 60 * 1000,
            trend_stability_band: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the defaults
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::with_name("config/agent-chain").required(false));

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix("AGENT_CHAIN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = EngineConfig::default();
        assert_eq!(config.protocol.compression_threshold_bytes, 1_048_576);
        assert!(config.protocol.reference_threshold_bytes > config.protocol.compression_threshold_bytes);
        assert!(!config.orchestrator.enforce_step_timeouts);
        assert_eq!(config.analyzer.slow_chain_ms, 300_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"orchestrator": {"default_step_retries": 4}}))
                .unwrap();
        assert_eq!(config.orchestrator.default_step_retries, 4);
        assert_eq!(config.orchestrator.retry_backoff_ms, 250);
        assert_eq!(config.analyzer.max_step_cost, 1.0);
    }
}
