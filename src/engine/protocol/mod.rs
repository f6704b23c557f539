// Agent communication protocol
// Creates, validates, optimizes and delivers handoffs between chain steps

//! # Agent Communication Protocol
//!
//! A handoff is created once per step transition, after the sending step
//! succeeds:
//!
//! 1. the next step is resolved from the step sequence registered for the
//!    execution (the first step numbered above the sender)
//! 2. the raw output is validated ([`validation`]); an invalid handoff is
//!    returned unsuccessful and nothing is stored
//! 3. the payload is transformed and field-filtered ([`optimization`]),
//!    checksummed, then stored inline, compressed, or as an out-of-band blob
//! 4. the pair's channel metrics are updated ([`channel`])
//!
//! [`AgentCommunicationProtocol::receive_handoff`] reverses the encoding and
//! verifies the checksum, so the receiver always sees exactly the optimized
//! payload that was accepted.

pub mod channel;
pub mod optimization;
pub mod validation;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use self::channel::ChannelTable;
use self::optimization::{checksum, compress, decompress, optimize_payload};
use self::validation::validate_payload;
use super::registry::CapabilityRegistry;
use super::storage::ChainStorage;
use crate::config::ProtocolConfig;
use crate::models::{
    AgentKind, AgentOutput, ChannelMetrics, CommunicationChannel, HandoffContext, HandoffData,
    HandoffKind, HandoffMetadata, HandoffPayload, HandoffResult, OptimizationRecord,
};
use crate::{ChainError, Result};

/// Payload fields that mark a payload as carrying sender state
const STATE_FIELDS: [&str; 5] = ["context", "state", "metadata", "_meta", "preserved_state"];

/// What a receiving step gets back
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedHandoff {
    pub handoff_id: Uuid,
    pub from_step: u32,
    pub from_agent: AgentKind,
    pub kind: HandoffKind,
    pub data: serde_json::Value,
    pub context: HandoffContext,
    pub hints: HashMap<String, serde_json::Value>,
    pub quality_score: f64,
}

/// Handoff creation and delivery
pub struct AgentCommunicationProtocol {
    config: ProtocolConfig,
    registry: Arc<CapabilityRegistry>,
    storage: Arc<dyn ChainStorage>,
    sequences: DashMap<Uuid, Vec<(u32, AgentKind)>>,
    channels: ChannelTable,
}

impl AgentCommunicationProtocol {
    pub fn new(config: ProtocolConfig, registry: Arc<CapabilityRegistry>, storage: Arc<dyn ChainStorage>) -> Self {
        Self {
            config,
            registry,
            storage,
            sequences: DashMap::new(),
            channels: ChannelTable::new(),
        }
    }

    /// Register the step sequence of an execution before any handoff is created
    pub fn register_sequence(&self, execution_id: Uuid, steps: impl IntoIterator<Item = (u32, AgentKind)>) {
        let mut sequence: Vec<(u32, AgentKind)> = steps.into_iter().collect();
        sequence.sort_by_key(|(n, _)| *n);
        self.sequences.insert(execution_id, sequence);
    }

    /// Drop the step sequence once an execution is finalized
    pub fn release(&self, execution_id: &Uuid) {
        self.sequences.remove(execution_id);
    }

    /// First step numbered above `from_step`
    pub fn next_step(&self, execution_id: &Uuid, from_step: u32) -> Option<(u32, AgentKind)> {
        self.sequences
            .get(execution_id)?
            .iter()
            .find(|(n, _)| *n > from_step)
            .copied()
    }

    pub fn channel(&self, from: AgentKind, to: AgentKind) -> CommunicationChannel {
        self.channels.channel(&self.config, &self.registry, from, to)
    }

    pub fn metrics(&self, from: AgentKind, to: AgentKind) -> ChannelMetrics {
        self.channels.metrics(from, to)
    }

    /// Pick the handoff kind for a payload of `size_bytes`
    pub fn select_kind(&self, from: AgentKind, to: AgentKind, payload: &serde_json::Value, size_bytes: usize) -> HandoffKind {
        if size_bytes > self.config.reference_threshold_bytes {
            HandoffKind::Reference
        } else if payload
            .as_object()
            .map_or(false, |map| STATE_FIELDS.iter().any(|f| map.contains_key(*f)))
        {
            HandoffKind::FullState
        } else if self.registry.requires_shared_context(from, to) {
            HandoffKind::DataWithContext
        } else {
            HandoffKind::DataOnly
        }
    }

    /// Create and store the handoff from a successful step to the next one
    ///
    /// ## Errors
    /// - `NotFound` when no sequence is registered or no step follows `from_step`
    /// - storage and encoding failures
    ///
    /// A payload that fails validation is not an error: the result comes back
    /// with `success == false` and the validation details.
    pub async fn create_handoff(
        &self,
        execution_id: Uuid,
        from_step: u32,
        from_agent: AgentKind,
        output: &AgentOutput,
        context: HandoffContext,
    ) -> Result<HandoffResult> {
        let started = Instant::now();
        let (next_step, next_agent) = self.next_step(&execution_id, from_step).ok_or_else(|| {
            ChainError::NotFound(format!(
                "no step follows step {} in execution {}",
                from_step, execution_id
            ))
        })?;

        let raw_bytes = serde_json::to_vec(&output.output)?.len();
        let validation = validate_payload(
            &self.config,
            &self.registry,
            execution_id,
            from_agent,
            next_agent,
            &output.output,
            raw_bytes,
        );

        for warning in &validation.warnings {
            warn!(%execution_id, from_step, to_step = next_step, "handoff warning: {}", warning);
        }

        if !validation.valid {
            warn!(%execution_id, from_step, to_step = next_step, errors = ?validation.errors, "handoff rejected");
            self.record_transfer(from_agent, next_agent, false, raw_bytes, started);
            return Ok(HandoffResult {
                success: false,
                handoff: None,
                validation,
                next_step,
                next_agent,
            });
        }

        let kind = self.select_kind(from_agent, next_agent, &output.output, raw_bytes);
        let (optimized, mut optimizations) = optimize_payload(from_agent, next_agent, output.output.clone());
        let bytes = serde_json::to_vec(&optimized)?;
        let handoff_id = Uuid::new_v4();

        let payload = self
            .encode(execution_id, handoff_id, kind, optimized, &bytes, &mut optimizations)
            .await?;

        let handoff = HandoffData {
            id: handoff_id,
            execution_id,
            handoff_number: 0,
            from_step,
            to_step: next_step,
            from_agent,
            to_agent: next_agent,
            kind,
            payload,
            context: self.carried_context(kind, execution_id, from_agent, next_agent, output, context),
            metadata: HandoffMetadata {
                created_at: chrono::Utc::now(),
                payload_bytes: bytes.len(),
                checksum: checksum(&bytes),
                quality_score: validation.quality_score,
                optimizations,
                warnings: validation.warnings.clone(),
            },
        };

        let stored = self.storage.store_handoff(handoff).await?;
        self.record_transfer(from_agent, next_agent, true, bytes.len(), started);
        debug!(
            %execution_id,
            handoff_id = %stored.id,
            handoff_number = stored.handoff_number,
            kind = ?stored.kind,
            bytes = stored.metadata.payload_bytes,
            "handoff created"
        );

        Ok(HandoffResult {
            success: true,
            handoff: Some(stored),
            validation,
            next_step,
            next_agent,
        })
    }

    async fn encode(
        &self,
        execution_id: Uuid,
        handoff_id: Uuid,
        kind: HandoffKind,
        optimized: serde_json::Value,
        bytes: &[u8],
        optimizations: &mut Vec<OptimizationRecord>,
    ) -> Result<HandoffPayload> {
        if kind == HandoffKind::Reference {
            let started = Instant::now();
            let blob_key = format!("handoff/{}/{}", execution_id, handoff_id);
            self.storage.store_blob(&blob_key, bytes.to_vec()).await?;
            optimizations.push(OptimizationRecord {
                kind: "reference".to_string(),
                bytes_before: bytes.len(),
                bytes_after: blob_key.len(),
                bytes_saved: bytes.len() as i64 - blob_key.len() as i64,
                time_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
            return Ok(HandoffPayload::Reference {
                blob_key,
                size_bytes: bytes.len(),
            });
        }

        if bytes.len() > self.config.compression_threshold_bytes {
            let (data, record) = compress(bytes)?;
            let compressed_size = data.len();
            optimizations.push(record);
            return Ok(HandoffPayload::Compressed {
                data,
                original_size: bytes.len(),
                compressed_size,
            });
        }

        Ok(HandoffPayload::Inline { data: optimized })
    }

    fn carried_context(
        &self,
        kind: HandoffKind,
        execution_id: Uuid,
        from: AgentKind,
        to: AgentKind,
        output: &AgentOutput,
        mut context: HandoffContext,
    ) -> HandoffContext {
        context.execution_id = Some(execution_id);
        if kind == HandoffKind::DataOnly {
            context.preserved_state.clear();
            context.performance_hints.clear();
        }

        let hints = &mut context.performance_hints;
        if let Some(quality) = output.quality_score {
            hints.insert("source_quality".to_string(), serde_json::json!(quality));
        }
        if let Some(confidence) = output.confidence {
            hints.insert("source_confidence".to_string(), serde_json::json!(confidence));
        }
        hints.insert("source_cost".to_string(), serde_json::json!(output.cost));
        hints.insert(
            "target_expected_latency_ms".to_string(),
            serde_json::json!(self.registry.expected_latency_ms(to)),
        );
        hints.insert(
            "pair_compatibility".to_string(),
            serde_json::json!(self.registry.pair_compatibility(from, to)),
        );
        context
    }

    fn record_transfer(&self, from: AgentKind, to: AgentKind, success: bool, size: usize, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.channels
            .record_transfer(&self.config, &self.registry, from, to, success, size, elapsed_ms);
    }

    /// Deliver the latest handoff addressed to `to_step`
    ///
    /// Returns `Ok(None)` when no handoff targets the step.
    ///
    /// ## Errors
    /// - `InvalidInput` when the handoff was addressed to another agent kind
    /// - `HandoffValidation` when the payload fails its checksum
    pub async fn receive_handoff(
        &self,
        execution_id: Uuid,
        to_step: u32,
        to_agent: AgentKind,
    ) -> Result<Option<ReceivedHandoff>> {
        let handoff = match self
            .storage
            .list_handoffs(&execution_id)
            .await?
            .into_iter()
            .rev()
            .find(|h| h.to_step == to_step)
        {
            Some(handoff) => handoff,
            None => return Ok(None),
        };

        if handoff.to_agent != to_agent {
            return Err(ChainError::InvalidInput(format!(
                "handoff {} targets {} but step {} runs {}",
                handoff.id, handoff.to_agent, to_step, to_agent
            )));
        }

        let data = self.decode(&handoff).await?;
        debug!(%execution_id, handoff_id = %handoff.id, to_step, "handoff received");

        Ok(Some(ReceivedHandoff {
            handoff_id: handoff.id,
            from_step: handoff.from_step,
            from_agent: handoff.from_agent,
            kind: handoff.kind,
            hints: handoff.context.performance_hints.clone(),
            context: handoff.context,
            data,
            quality_score: handoff.metadata.quality_score,
        }))
    }

    async fn decode(&self, handoff: &HandoffData) -> Result<serde_json::Value> {
        let bytes = match &handoff.payload {
            HandoffPayload::Inline { data } => serde_json::to_vec(data)?,
            HandoffPayload::Compressed { data, .. } => decompress(data)?,
            HandoffPayload::Reference { blob_key, .. } => self
                .storage
                .load_blob(blob_key)
                .await?
                .ok_or_else(|| ChainError::NotFound(format!("handoff blob {}", blob_key)))?,
        };

        if checksum(&bytes) != handoff.metadata.checksum {
            return Err(ChainError::HandoffValidation {
                errors: vec![format!("checksum mismatch for handoff {}", handoff.id)],
            });
        }

        match &handoff.payload {
            HandoffPayload::Inline { data } => Ok(data.clone()),
            _ => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}
