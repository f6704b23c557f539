// Agent capability registry and agent dispatch

//! # Capability Registry
//!
//! [`CapabilityRegistry`] is the leaf of the engine: a static table of agent
//! kinds with their strengths, expected cost and latency, plus the lookup
//! tables the planner needs (goal keywords, inter-kind dependencies and
//! agent-pair compatibility). It is built once with
//! [`CapabilityRegistry::with_defaults`], then shared read-only through an
//! `Arc`. Every engine instance receives its own registry, so tests can run
//! independent engines side by side.
//!
//! The invocation side mirrors it: one [`ChainAgent`] per kind, selected
//! through the [`AgentDispatcher`] lookup table, which implements the
//! [`AgentInvoker`] boundary the orchestrator calls.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects
//! `Arc<dyn ChainAgent>` lets the dispatcher hold agents of different concrete
//! types in one map. `Send + Sync` on the trait makes those objects shareable
//! across tokio tasks.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::graph;
use crate::models::{AgentCapability, AgentError, AgentKind, AgentOutput};
use crate::Result;

/// Compatibility assumed for agent pairs without an explicit entry
const DEFAULT_COMPATIBILITY: f64 = 0.7;

/// Compatibility of a pair where the receiver consumes the sender's output
const DEPENDENT_COMPATIBILITY: f64 = 0.9;

/// Read-only planning tables for agent kinds
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<AgentKind, AgentCapability>,
    dependencies: BTreeMap<AgentKind, Vec<AgentKind>>,
    keywords: Vec<(String, AgentKind)>,
    compatibility: HashMap<(AgentKind, AgentKind), f64>,
    shared_context: HashSet<(AgentKind, AgentKind)>,
}

fn capability(
    kind: AgentKind,
    name: &str,
    strengths: &[&str],
    weaknesses: &[&str],
    expected_cost: f64,
    expected_latency_ms: u64,
    reliability: f64,
) -> AgentCapability {
    AgentCapability {
        kind,
        name: name.to_string(),
        strengths: strengths.iter().map(|s| s.to_string()).collect(),
        weaknesses: weaknesses.iter().map(|s| s.to_string()).collect(),
        expected_cost,
        expected_latency_ms,
        reliability,
    }
}

impl CapabilityRegistry {
    /// An empty registry; use the `with_*` builders or [`Self::with_defaults`]
    pub fn empty() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            keywords: Vec::new(),
            compatibility: HashMap::new(),
            shared_context: HashSet::new(),
        }
    }

    /// The built-in table covering every [`AgentKind`]
    pub fn with_defaults() -> Self {
        use AgentKind::*;

        let capabilities = [
            capability(
                TrendAnalysis,
                "Trend Analysis Agent",
                &["real-time trend detection", "audience signals", "viral pattern recognition"],
                &["long-term forecasting"],
                0.15,
                4_000,
                0.92,
            ),
            capability(
                Seo,
                "SEO Agent",
                &["keyword research", "search intent", "on-page optimization"],
                &["social tone"],
                0.10,
                3_000,
                0.95,
            ),
            capability(
                Content,
                "Content Agent",
                &["long-form copy", "brand voice", "multi-format writing"],
                &["visual assets"],
                0.40,
                12_000,
                0.90,
            ),
            capability(
                Design,
                "Design Agent",
                &["visual assets", "brand consistency"],
                &["copywriting", "latency"],
                0.60,
                20_000,
                0.85,
            ),
            capability(
                SocialMedia,
                "Social Media Agent",
                &["platform formatting", "engagement optimization", "scheduling"],
                &["long-form content"],
                0.20,
                5_000,
                0.91,
            ),
            capability(
                Advertising,
                "Advertising Agent",
                &["audience targeting", "budget allocation", "ad copy variants"],
                &["organic reach"],
                0.50,
                8_000,
                0.88,
            ),
            capability(
                Email,
                "Email Agent",
                &["segmentation", "subject line testing", "nurture sequences"],
                &["visual-heavy formats"],
                0.15,
                4_000,
                0.94,
            ),
            capability(
                Outreach,
                "Outreach Agent",
                &["influencer discovery", "personalized pitches"],
                &["response latency"],
                0.30,
                9_000,
                0.82,
            ),
            capability(
                Analytics,
                "Analytics Agent",
                &["attribution", "performance reporting", "insight extraction"],
                &["creative work"],
                0.10,
                3_500,
                0.96,
            ),
        ];

        let dependencies: &[(AgentKind, &[AgentKind])] = &[
            (TrendAnalysis, &[]),
            (Seo, &[]),
            (Content, &[TrendAnalysis, Seo]),
            (Design, &[Content]),
            (SocialMedia, &[Content, Design]),
            (Advertising, &[Content, Design]),
            (Email, &[Content]),
            (Outreach, &[Content]),
            (Analytics, &[SocialMedia, Advertising, Email]),
        ];

        let keywords: &[(&str, AgentKind)] = &[
            ("content", Content),
            ("blog", Content),
            ("article", Content),
            ("copy", Content),
            ("seo", Seo),
            ("search", Seo),
            ("ranking", Seo),
            ("keyword", Seo),
            ("trend", TrendAnalysis),
            ("trending", TrendAnalysis),
            ("viral", TrendAnalysis),
            ("social", SocialMedia),
            ("engagement", SocialMedia),
            ("instagram", SocialMedia),
            ("twitter", SocialMedia),
            ("tiktok", SocialMedia),
            ("ad", Advertising),
            ("ads", Advertising),
            ("advertising", Advertising),
            ("campaign", Advertising),
            ("email", Email),
            ("newsletter", Email),
            ("design", Design),
            ("visual", Design),
            ("image", Design),
            ("outreach", Outreach),
            ("influencer", Outreach),
            ("pr", Outreach),
            ("analytics", Analytics),
            ("insight", Analytics),
            ("insights", Analytics),
            ("performance", Analytics),
            ("report", Analytics),
        ];

        // Pairs whose payload shapes barely overlap
        let low_compatibility: &[((AgentKind, AgentKind), f64)] = &[
            ((Seo, Design), 0.35),
            ((Design, Seo), 0.3),
            ((Design, Email), 0.45),
            ((Outreach, Design), 0.4),
            ((Analytics, Design), 0.3),
            ((Analytics, Outreach), 0.45),
            ((Email, Design), 0.4),
        ];

        let shared_context: &[(AgentKind, AgentKind)] = &[
            (Content, SocialMedia),
            (Content, Advertising),
            (Content, Email),
            (Design, SocialMedia),
            (Design, Advertising),
            (SocialMedia, Analytics),
            (Advertising, Analytics),
        ];

        let mut registry = Self::empty();
        for cap in capabilities {
            registry = registry.with_capability(cap);
        }
        for (kind, deps) in dependencies {
            registry.dependencies.insert(*kind, deps.to_vec());
        }
        registry.keywords = keywords.iter().map(|(k, kind)| (k.to_string(), *kind)).collect();
        registry.compatibility = low_compatibility.iter().copied().collect();
        registry.shared_context = shared_context.iter().copied().collect();
        registry
    }

    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.insert(capability.kind, capability);
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>, kind: AgentKind) -> Self {
        self.keywords.push((keyword.into().to_lowercase(), kind));
        self
    }

    pub fn with_compatibility(mut self, from: AgentKind, to: AgentKind, score: f64) -> Self {
        self.compatibility.insert((from, to), score.clamp(0.0, 1.0));
        self
    }

    pub fn capability(&self, kind: AgentKind) -> Option<&AgentCapability> {
        self.capabilities.get(&kind)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &AgentCapability> {
        self.capabilities.values()
    }

    /// Kinds whose output `kind` consumes
    pub fn dependencies_of(&self, kind: AgentKind) -> &[AgentKind] {
        self.dependencies.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn expected_latency_ms(&self, kind: AgentKind) -> u64 {
        self.capability(kind).map(|c| c.expected_latency_ms).unwrap_or(0)
    }

    pub fn expected_cost(&self, kind: AgentKind) -> f64 {
        self.capability(kind).map(|c| c.expected_cost).unwrap_or(0.0)
    }

    /// Agent kinds mentioned by a goal, in declaration order
    ///
    /// Matching is on whole lowercase words, so "pr" matches "PR push" but not
    /// "product".
    pub fn kinds_for_text(&self, text: &str) -> Vec<AgentKind> {
        let words = tokenize(text);
        let mut matched: Vec<AgentKind> = self
            .keywords
            .iter()
            .filter(|(keyword, _)| words.iter().any(|w| w == keyword))
            .map(|(_, kind)| *kind)
            .collect();
        matched.sort();
        matched.dedup();
        matched
    }

    /// Order agent kinds so every kind follows the kinds it depends on
    ///
    /// Dependencies on kinds outside `kinds` are ignored.
    pub fn order_kinds(&self, kinds: &[AgentKind]) -> Result<Vec<AgentKind>> {
        graph::topological_sort(kinds, &self.dependencies)
    }

    /// 0.0 - 1.0 estimate of how well `to` can consume `from`'s output
    pub fn pair_compatibility(&self, from: AgentKind, to: AgentKind) -> f64 {
        if let Some(score) = self.compatibility.get(&(from, to)) {
            return *score;
        }
        if from == to {
            1.0
        } else if self.dependencies_of(to).contains(&from) {
            DEPENDENT_COMPATIBILITY
        } else {
            DEFAULT_COMPATIBILITY
        }
    }

    /// Whether `to` needs the sender's context alongside the data
    pub fn requires_shared_context(&self, from: AgentKind, to: AgentKind) -> bool {
        self.shared_context.contains(&(from, to))
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// One agent implementation
#[async_trait]
pub trait ChainAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn execute(
        &self,
        input: &serde_json::Value,
        config: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<AgentOutput, AgentError>;
}

/// The agent invocation boundary consumed by the orchestrator
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn execute(
        &self,
        kind: AgentKind,
        input: &serde_json::Value,
        config: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<AgentOutput, AgentError>;
}

/// Lookup table from agent kind to implementation
#[derive(Default, Clone)]
pub struct AgentDispatcher {
    agents: HashMap<AgentKind, Arc<dyn ChainAgent>>,
}

impl AgentDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with a [`SimulatedAgent`] for every kind in the registry
    pub fn simulated(registry: &CapabilityRegistry) -> Self {
        registry.capabilities().fold(Self::new(), |dispatcher, cap| {
            dispatcher.with_agent(Arc::new(SimulatedAgent::new(cap.clone())))
        })
    }

    /// Register an agent, replacing any agent of the same kind
    pub fn with_agent(mut self, agent: Arc<dyn ChainAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn register(&mut self, agent: Arc<dyn ChainAgent>) {
        self.agents.insert(agent.kind(), agent);
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn ChainAgent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<AgentKind> = self.agents.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl AgentInvoker for AgentDispatcher {
    async fn execute(
        &self,
        kind: AgentKind,
        input: &serde_json::Value,
        config: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<AgentOutput, AgentError> {
        match self.agents.get(&kind) {
            Some(agent) => agent.execute(input, config).await,
            None => Err(AgentError::permanent(format!("no agent registered for kind '{}'", kind))),
        }
    }
}

/// Deterministic stand-in for a real agent
///
/// Produces a kind-shaped object payload with the registry's expected cost and
/// a quality score equal to the capability's reliability. Two config keys are
/// honoured:
/// - `simulated_latency_ms`: sleep before answering
/// - `simulate_failure`: `"transient"` or `"permanent"` to fail instead
pub struct SimulatedAgent {
    capability: AgentCapability,
    latency: Duration,
}

impl SimulatedAgent {
    pub fn new(capability: AgentCapability) -> Self {
        Self {
            capability,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Step config `topic` wins over the run context
    fn topic(input: &serde_json::Value, config: &HashMap<String, serde_json::Value>) -> String {
        if let Some(topic) = config.get("topic").and_then(|v| v.as_str()) {
            return topic.to_string();
        }
        ["topic", "goal", "product"]
            .iter()
            .find_map(|key| {
                input
                    .get("context")
                    .and_then(|c| c.get(*key))
                    .or_else(|| input.get(*key))
                    .and_then(|v| v.as_str())
            })
            .unwrap_or("the campaign")
            .to_string()
    }

    fn payload(&self, topic: &str) -> serde_json::Value {
        use serde_json::json;
        let body = match self.capability.kind {
            AgentKind::TrendAnalysis => json!({
                "trends": [format!("{} short-form video", topic), format!("{} user stories", topic), "behind the scenes"],
                "keywords": [topic, "trending", "community"],
                "audience": "18-34 mobile-first",
                "momentum": 0.82,
            }),
            AgentKind::Seo => json!({
                "keywords": [topic, format!("best {}", topic), format!("{} guide", topic)],
                "search_volume": 12_400,
                "difficulty": 0.42,
                "meta_description": format!("Everything you need to know about {}", topic),
            }),
            AgentKind::Content => json!({
                "title": format!("Why {} matters now", topic),
                "body": format!("A practical look at {} and what it means for your audience.", topic),
                "keywords": [topic],
                "tone": "conversational",
                "call_to_action": "Learn more",
            }),
            AgentKind::Design => json!({
                "assets": [{"type": "image", "format": "1080x1080", "alt": format!("{} hero", topic)}],
                "palette": ["#0F172A", "#F97316"],
                "format": "square",
            }),
            AgentKind::SocialMedia => json!({
                "posts": [{"platform": "instagram", "text": format!("Ready for {}?", topic)}],
                "platforms": ["instagram", "twitter"],
                "scheduled": 2,
                "engagement_estimate": 0.047,
            }),
            AgentKind::Advertising => json!({
                "ad_sets": [{"name": format!("{} prospecting", topic), "daily_budget": 50}],
                "targeting": {"age": "18-34", "interests": [topic]},
                "budget": 350,
            }),
            AgentKind::Email => json!({
                "subject": format!("{}: what's new", topic),
                "preview_text": "Five minutes that pay off",
                "segments": ["subscribers", "recent_buyers"],
            }),
            AgentKind::Outreach => json!({
                "targets": [{"name": "industry newsletter", "fit": 0.8}],
                "pitch": format!("A fresh angle on {}", topic),
            }),
            AgentKind::Analytics => json!({
                "metrics": {"reach": 18_000, "engagement_rate": 0.051, "conversions": 42},
                "insights": ["video outperforms static images"],
                "report": format!("Performance summary for {}", topic),
            }),
        };
        let mut payload = body;
        if let Some(object) = payload.as_object_mut() {
            object.insert("agent".to_string(), json!(self.capability.kind));
        }
        payload
    }
}

#[async_trait]
impl ChainAgent for SimulatedAgent {
    fn kind(&self) -> AgentKind {
        self.capability.kind
    }

    async fn execute(
        &self,
        input: &serde_json::Value,
        config: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<AgentOutput, AgentError> {
        let latency = config
            .get("simulated_latency_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match config.get("simulate_failure").and_then(|v| v.as_str()) {
            Some("transient") => return Err(AgentError::transient(format!("{} timed out", self.capability.name))),
            Some(_) => return Err(AgentError::permanent(format!("{} rejected the input", self.capability.name))),
            None => {}
        }

        let topic = Self::topic(input, config);
        debug!(agent = %self.capability.kind, topic = %topic, "simulated agent invoked");

        Ok(AgentOutput::new(self.payload(&topic))
            .with_cost(self.capability.expected_cost)
            .with_quality(self.capability.reliability)
            .with_confidence(self.capability.reliability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_kind() {
        let registry = CapabilityRegistry::with_defaults();
        for kind in AgentKind::all() {
            let cap = registry.capability(*kind).unwrap();
            assert!(cap.expected_cost > 0.0);
            assert!(cap.reliability > 0.0 && cap.reliability <= 1.0);
        }
    }

    #[test]
    fn test_keywords_match_whole_words() {
        let registry = CapabilityRegistry::with_defaults();
        assert_eq!(
            registry.kinds_for_text("increase social engagement"),
            vec![AgentKind::SocialMedia]
        );
        assert_eq!(
            registry.kinds_for_text("SEO blog post and a newsletter"),
            vec![AgentKind::Seo, AgentKind::Content, AgentKind::Email]
        );
        // "product" must not match "pr"
        assert!(registry.kinds_for_text("launch a product").is_empty());
    }

    #[test]
    fn test_order_kinds_follows_dependency_table() {
        let registry = CapabilityRegistry::with_defaults();
        let ordered = registry
            .order_kinds(&[AgentKind::SocialMedia, AgentKind::Content, AgentKind::TrendAnalysis])
            .unwrap();
        assert_eq!(
            ordered,
            vec![AgentKind::TrendAnalysis, AgentKind::Content, AgentKind::SocialMedia]
        );
    }

    #[test]
    fn test_pair_compatibility() {
        let registry = CapabilityRegistry::with_defaults();
        assert_eq!(registry.pair_compatibility(AgentKind::Content, AgentKind::Design), 0.9);
        assert!(registry.pair_compatibility(AgentKind::Design, AgentKind::Seo) < 0.5);
        assert_eq!(registry.pair_compatibility(AgentKind::Email, AgentKind::Outreach), 0.7);
        assert!(registry.requires_shared_context(AgentKind::Content, AgentKind::SocialMedia));
        assert!(!registry.requires_shared_context(AgentKind::TrendAnalysis, AgentKind::Seo));
    }

    #[tokio::test]
    async fn test_simulated_dispatch() {
        let registry = CapabilityRegistry::with_defaults();
        let dispatcher = AgentDispatcher::simulated(&registry);
        assert_eq!(dispatcher.kinds().len(), AgentKind::all().len());

        let input = serde_json::json!({"context": {"topic": "cold brew"}});
        let output = dispatcher
            .execute(AgentKind::Content, &input, &HashMap::new())
            .await
            .unwrap();
        assert!(output.output["title"].as_str().unwrap().contains("cold brew"));
        assert_eq!(output.cost, 0.40);

        let mut config = HashMap::new();
        config.insert("simulate_failure".to_string(), serde_json::json!("transient"));
        let err = dispatcher.execute(AgentKind::Seo, &input, &config).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_missing_agent_is_permanent_error() {
        let dispatcher = AgentDispatcher::new();
        let err = dispatcher
            .execute(AgentKind::Email, &serde_json::json!({}), &HashMap::new())
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
