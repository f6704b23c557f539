// Per agent-pair communication channels

use chrono::Utc;
use dashmap::DashMap;

use crate::config::ProtocolConfig;
use crate::engine::registry::CapabilityRegistry;
use crate::models::{AgentKind, ChannelMetrics, ChannelProtocol, CommunicationChannel};

/// Channel descriptors and rolling transfer metrics, keyed by agent pair
///
/// Descriptors are negotiated lazily and renegotiated after every transfer,
/// so protocol choice and reliability follow the observed traffic.
#[derive(Default)]
pub struct ChannelTable {
    channels: DashMap<(AgentKind, AgentKind), CommunicationChannel>,
    metrics: DashMap<(AgentKind, AgentKind), ChannelMetrics>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached descriptor, negotiating one on first use
    pub fn channel(
        &self,
        config: &ProtocolConfig,
        registry: &CapabilityRegistry,
        from: AgentKind,
        to: AgentKind,
    ) -> CommunicationChannel {
        if let Some(existing) = self.channels.get(&(from, to)) {
            return existing.clone();
        }
        let channel = negotiate(config, registry, from, to, &self.metrics(from, to));
        self.channels.insert((from, to), channel.clone());
        channel
    }

    pub fn metrics(&self, from: AgentKind, to: AgentKind) -> ChannelMetrics {
        self.metrics
            .get(&(from, to))
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Fold one transfer into the pair's metrics and refresh its descriptor
    pub fn record_transfer(
        &self,
        config: &ProtocolConfig,
        registry: &CapabilityRegistry,
        from: AgentKind,
        to: AgentKind,
        success: bool,
        size_bytes: usize,
        transfer_ms: f64,
    ) {
        let snapshot = {
            let mut entry = self.metrics.entry((from, to)).or_default();
            entry.record(success, size_bytes, transfer_ms);
            entry.clone()
        };
        let mut channel = negotiate(config, registry, from, to, &snapshot);
        if let Some(previous) = self.channels.get(&(from, to)) {
            channel.established_at = previous.established_at;
        }
        self.channels.insert((from, to), channel);
    }
}

/// Derive a channel descriptor from capabilities and observed traffic
fn negotiate(
    config: &ProtocolConfig,
    registry: &CapabilityRegistry,
    from: AgentKind,
    to: AgentKind,
    metrics: &ChannelMetrics,
) -> CommunicationChannel {
    let protocol = if metrics.average_size_bytes > config.reference_threshold_bytes as f64 {
        ChannelProtocol::Reference
    } else if metrics.average_size_bytes > config.compression_threshold_bytes as f64 {
        ChannelProtocol::Compressed
    } else {
        ChannelProtocol::Direct
    };

    let reliability_of = |kind| registry.capability(kind).map(|c| c.reliability).unwrap_or(0.5);
    let estimated = reliability_of(from) * reliability_of(to) * registry.pair_compatibility(from, to).max(0.5);
    let reliability = if metrics.transfers == 0 {
        estimated
    } else {
        0.5 * estimated + 0.5 * metrics.success_rate()
    };

    CommunicationChannel {
        from_agent: from,
        to_agent: to,
        protocol,
        compression: protocol != ChannelProtocol::Direct,
        reliability: reliability.clamp(0.0, 1.0),
        average_latency_ms: metrics.average_transfer_ms,
        established_at: Utc::now(),
    }
}
