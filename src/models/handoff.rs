// Handoff data exchanged between chain steps

//! # Handoff Models
//!
//! A handoff is created exactly once per step transition and is immutable
//! after creation. Its payload is stored in one of three encodings:
//! inline JSON, gzip+base64 compressed JSON, or a reference to an out-of-band
//! blob. Receivers always get the decoded JSON back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::agent::AgentKind;

/// How much of the sender's state travels with the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    DataOnly,
    DataWithContext,
    FullState,
    Reference,
}

/// Stored payload encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum HandoffPayload {
    Inline {
        data: serde_json::Value,
    },
    /// gzip-compressed JSON, base64 encoded
    Compressed {
        data: String,
        original_size: usize,
        compressed_size: usize,
    },
    /// Payload stored out of band under `blob_key`
    Reference {
        blob_key: String,
        size_bytes: usize,
    },
}

/// Context carried alongside the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffContext {
    pub execution_id: Option<Uuid>,
    pub campaign_id: Option<String>,
    pub chain_id: Option<String>,
    /// State the sender wants downstream steps to keep
    pub preserved_state: serde_json::Map<String, serde_json::Value>,
    /// e.g. expected latency or quality of the sender
    pub performance_hints: HashMap<String, serde_json::Value>,
}

/// One optimization applied to a handoff payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    /// `compression`, `field_filter`, `transform:<name>` or `reference`
    pub kind: String,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub bytes_saved: i64,
    pub time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffMetadata {
    pub created_at: DateTime<Utc>,
    /// Size of the accepted JSON payload before encoding
    pub payload_bytes: usize,
    /// SHA-256 of the accepted JSON payload, hex encoded
    pub checksum: String,
    pub quality_score: f64,
    pub optimizations: Vec<OptimizationRecord>,
    pub warnings: Vec<String>,
}

/// The message transferred between two steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffData {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Assigned by storage, monotonically increasing within the execution
    pub handoff_number: u64,
    pub from_step: u32,
    pub to_step: u32,
    pub from_agent: AgentKind,
    pub to_agent: AgentKind,
    pub kind: HandoffKind,
    pub payload: HandoffPayload,
    pub context: HandoffContext,
    pub metadata: HandoffMetadata,
}

/// Outcome of validating a candidate payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffValidation {
    /// No error-class violation occurred
    pub valid: bool,
    /// 0.0 - 1.0
    pub quality_score: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

/// What `create_handoff` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffResult {
    pub success: bool,
    pub handoff: Option<HandoffData>,
    pub validation: HandoffValidation,
    pub next_step: u32,
    pub next_agent: AgentKind,
}

/// Transport chosen for an agent pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProtocol {
    Direct,
    Compressed,
    Reference,
}

/// Negotiated channel descriptor for one agent pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationChannel {
    pub from_agent: AgentKind,
    pub to_agent: AgentKind,
    pub protocol: ChannelProtocol,
    pub compression: bool,
    /// Estimated probability that a transfer succeeds
    pub reliability: f64,
    pub average_latency_ms: f64,
    pub established_at: DateTime<Utc>,
}

/// Rolling transfer statistics for one agent pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub transfers: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_bytes: u64,
    /// Exponential moving average
    pub average_transfer_ms: f64,
    pub average_size_bytes: f64,
}

impl ChannelMetrics {
    const SMOOTHING: f64 = 0.2;

    pub fn record(&mut self, success: bool, size_bytes: usize, transfer_ms: f64) {
        self.transfers += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_bytes += size_bytes as u64;

        if self.transfers == 1 {
            self.average_transfer_ms = transfer_ms;
            self.average_size_bytes = size_bytes as f64;
        } else {
            self.average_transfer_ms += Self::SMOOTHING * (transfer_ms - self.average_transfer_ms);
            self.average_size_bytes += Self::SMOOTHING * (size_bytes as f64 - self.average_size_bytes);
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.transfers == 0 {
            1.0
        } else {
            self.successes as f64 / self.transfers as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_metrics_rolling_average() {
        let mut metrics = ChannelMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record(true, 100, 10.0);
        assert_eq!(metrics.average_transfer_ms, 10.0);

        metrics.record(false, 300, 20.0);
        assert_eq!(metrics.transfers, 2);
        assert_eq!(metrics.total_bytes, 400);
        assert!((metrics.average_transfer_ms - 12.0).abs() < 1e-9);
        assert!((metrics.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_payload_encoding_tag() {
        let payload = HandoffPayload::Reference {
            blob_key: "blob-1".to_string(),
            size_bytes: 42,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["encoding"], "reference");
    }
}
