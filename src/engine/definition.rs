// Chain definition engine
// Turns a high-level goal into a runnable chain definition

//! # Chain Definition Engine
//!
//! [`ChainDefinitionEngine::recommend_chain`] answers "which chain should run
//! for this goal?" in two stages:
//!
//! 1. **Template match.** Every stored template is scored against the goal:
//!    keyword match 40%, preferred-agent overlap 30%, constraint satisfaction
//!    20%, historical success rate 10%. The best template wins if it scores
//!    above 0.6; at 0.8 or more the recommendation is flagged high confidence.
//! 2. **Synthesis.** Otherwise the goal text is mapped to agent kinds through
//!    the registry's keyword table, required/forbidden kinds are applied, and
//!    the kinds are ordered by the inter-kind dependency table.
//!
//! A goal that maps to no agent kind yields the documented two-step fallback
//! chain (content then social media), never an empty chain.
//!
//! ## Rust Learning Notes:
//!
//! ### Shared Ownership of Collaborators
//! The engine holds `Arc<CapabilityRegistry>` and `Arc<dyn ChainStorage>`.
//! Cloning an `Arc` only bumps a reference count, so the same registry and
//! storage can be handed to the orchestrator and the analyzer as well.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::registry::{tokenize, CapabilityRegistry};
use super::storage::ChainStorage;
use crate::models::{
    AgentKind, ChainDefinition, ChainKind, ChainRecommendation, ChainStepDefinition, ChainTemplate,
    ExecutionMode, RecommendationSource, SuccessCriteria, TemplateStats,
};
use crate::{ChainError, Result};

const GOAL_MATCH_WEIGHT: f64 = 0.4;
const AGENT_OVERLAP_WEIGHT: f64 = 0.3;
const CONSTRAINT_WEIGHT: f64 = 0.2;
const SUCCESS_RATE_WEIGHT: f64 = 0.1;

/// Minimum template score for a template to be recommended
pub const TEMPLATE_ACCEPT_SCORE: f64 = 0.6;
/// Template score at which a recommendation is accepted without review
pub const HIGH_CONFIDENCE_SCORE: f64 = 0.8;
/// Keyword matches needed for a full goal-match score
const FULL_MATCH_KEYWORDS: f64 = 2.0;

/// Kinds used when the goal names no agent kind at all
pub const FALLBACK_KINDS: [AgentKind; 2] = [AgentKind::Content, AgentKind::SocialMedia];

/// Hard limits a recommended chain must respect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConstraints {
    pub max_cost: Option<f64>,
    pub max_time_ms: Option<u64>,
    pub required_agents: Vec<AgentKind>,
    pub forbidden_agents: Vec<AgentKind>,
}

impl ChainConstraints {
    fn is_empty(&self) -> bool {
        self.max_cost.is_none()
            && self.max_time_ms.is_none()
            && self.required_agents.is_empty()
            && self.forbidden_agents.is_empty()
    }

    /// Fraction of the declared checks a chain with these figures satisfies
    fn satisfaction(&self, kinds: &[AgentKind], cost: f64, duration_ms: u64) -> f64 {
        if self.is_empty() {
            return 1.0;
        }
        let mut checks = 0u32;
        let mut passed = 0u32;
        if let Some(max_cost) = self.max_cost {
            checks += 1;
            passed += u32::from(cost <= max_cost);
        }
        if let Some(max_time) = self.max_time_ms {
            checks += 1;
            passed += u32::from(duration_ms <= max_time);
        }
        if !self.required_agents.is_empty() {
            checks += 1;
            passed += u32::from(self.required_agents.iter().all(|k| kinds.contains(k)));
        }
        if !self.forbidden_agents.is_empty() {
            checks += 1;
            passed += u32::from(!self.forbidden_agents.iter().any(|k| kinds.contains(k)));
        }
        f64::from(passed) / f64::from(checks)
    }

    /// Required/forbidden violations rule a template out regardless of score
    fn admits(&self, kinds: &[AgentKind]) -> bool {
        self.required_agents.iter().all(|k| kinds.contains(k))
            && !self.forbidden_agents.iter().any(|k| kinds.contains(k))
    }
}

/// What the caller wants to achieve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainGoal {
    pub primary_objective: String,
    pub secondary_objectives: Vec<String>,
    /// e.g. `engagement_rate -> 0.05`
    pub target_metrics: HashMap<String, f64>,
    pub constraints: ChainConstraints,
}

impl ChainGoal {
    pub fn new(primary_objective: impl Into<String>) -> Self {
        Self {
            primary_objective: primary_objective.into(),
            ..Default::default()
        }
    }

    pub fn with_secondary(mut self, objective: impl Into<String>) -> Self {
        self.secondary_objectives.push(objective.into());
        self
    }

    pub fn with_target_metric(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.target_metrics.insert(metric.into(), value);
        self
    }

    pub fn with_constraints(mut self, constraints: ChainConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    fn text(&self) -> String {
        let mut text = self.primary_objective.clone();
        for objective in &self.secondary_objectives {
            text.push(' ');
            text.push_str(objective);
        }
        for metric in self.target_metrics.keys() {
            text.push(' ');
            text.push_str(&metric.replace('_', " "));
        }
        text
    }
}

/// Optional steering for the recommendation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainPreferences {
    /// Agent kinds the caller would like to see; defaults to the goal's kinds
    pub preferred_agents: Vec<AgentKind>,
    pub execution_mode: Option<ExecutionMode>,
    pub max_retries: Option<u32>,
    pub success_criteria: Option<SuccessCriteria>,
}

/// Scored template, kept for the alternatives list
struct ScoredTemplate {
    template: ChainTemplate,
    score: f64,
    admitted: bool,
    reasoning: Vec<String>,
}

/// Goal to chain definition planner
pub struct ChainDefinitionEngine {
    registry: Arc<CapabilityRegistry>,
    storage: Arc<dyn ChainStorage>,
}

impl ChainDefinitionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, storage: Arc<dyn ChainStorage>) -> Self {
        Self { registry, storage }
    }

    /// Store the built-in templates that are not stored yet
    ///
    /// Returns how many templates were added.
    pub async fn install_predefined_templates(&self) -> Result<usize> {
        let mut installed = 0;
        for template in predefined_templates() {
            if self.storage.get_template(&template.id).await?.is_none() {
                debug!(template_id = %template.id, "installing predefined template");
                self.storage.store_template(template).await?;
                installed += 1;
            }
        }
        Ok(installed)
    }

    pub async fn list_templates(&self) -> Result<Vec<ChainTemplate>> {
        self.storage.list_templates().await
    }

    /// Recommend a chain for `goal`
    ///
    /// `context` may carry a numeric `budget`, used as the cost ceiling when the
    /// goal has none, and a `topic` copied into every synthesized step's config.
    pub async fn recommend_chain(
        &self,
        goal: &ChainGoal,
        context: Option<&HashMap<String, serde_json::Value>>,
        preferences: Option<&ChainPreferences>,
    ) -> Result<ChainRecommendation> {
        if goal.primary_objective.trim().is_empty() {
            return Err(ChainError::InvalidInput("goal must have a primary objective".to_string()));
        }

        let default_preferences = ChainPreferences::default();
        let preferences = preferences.unwrap_or(&default_preferences);
        let mut constraints = goal.constraints.clone();
        if constraints.max_cost.is_none() {
            constraints.max_cost = context.and_then(|c| c.get("budget")).and_then(|b| b.as_f64());
        }

        let goal_text = goal.text();
        let goal_kinds = self.registry.kinds_for_text(&goal_text);
        let preferred = if preferences.preferred_agents.is_empty() {
            goal_kinds.clone()
        } else {
            preferences.preferred_agents.clone()
        };

        let mut scored = self
            .score_templates(&goal_text, &preferred, &constraints)
            .await?;
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.template.id.cmp(&b.template.id)));
        let alternatives: Vec<(String, f64)> = scored
            .iter()
            .map(|s| (s.template.id.clone(), s.score))
            .collect();

        if let Some(best) = scored.iter().find(|s| s.admitted && s.score > TEMPLATE_ACCEPT_SCORE) {
            info!(template_id = %best.template.id, score = best.score, "template matched goal");
            return Ok(self.recommend_template(best, preferences, &constraints, alternatives));
        }

        let recommendation =
            self.synthesize(goal, &goal_kinds, &constraints, preferences, context, alternatives)?;
        info!(
            source = ?recommendation.source,
            steps = recommendation.definition.steps.len(),
            "synthesized chain for goal"
        );
        Ok(recommendation)
    }

    async fn score_templates(
        &self,
        goal_text: &str,
        preferred: &[AgentKind],
        constraints: &ChainConstraints,
    ) -> Result<Vec<ScoredTemplate>> {
        let words = tokenize(goal_text);
        let templates = self.storage.list_templates().await?;

        Ok(templates
            .into_iter()
            .map(|template| {
                let kinds = template.agent_kinds();
                let matched: Vec<&String> = template
                    .keywords
                    .iter()
                    .filter(|k| words.iter().any(|w| keyword_matches(w, k)))
                    .collect();
                let goal_match = (matched.len() as f64 / FULL_MATCH_KEYWORDS).min(1.0);
                let overlap = if preferred.is_empty() {
                    0.0
                } else {
                    preferred.iter().filter(|k| kinds.contains(k)).count() as f64 / preferred.len() as f64
                };
                let (cost, duration) = self.template_estimates(&template);
                let satisfaction = constraints.satisfaction(&kinds, cost, duration);
                let success_rate = template.stats.success_rate;

                let score = GOAL_MATCH_WEIGHT * goal_match
                    + AGENT_OVERLAP_WEIGHT * overlap
                    + CONSTRAINT_WEIGHT * satisfaction
                    + SUCCESS_RATE_WEIGHT * success_rate;

                let reasoning = vec![
                    format!("matched keywords: {:?}", matched),
                    format!("preferred agent overlap {:.2}", overlap),
                    format!("constraint satisfaction {:.2}", satisfaction),
                    format!("historical success rate {:.2}", success_rate),
                ];
                debug!(template_id = %template.id, score, "scored template");

                ScoredTemplate {
                    admitted: constraints.admits(&kinds),
                    template,
                    score,
                    reasoning,
                }
            })
            .collect())
    }

    /// Cost and duration of a template: history when available, else the registry estimate
    fn template_estimates(&self, template: &ChainTemplate) -> (f64, u64) {
        if template.stats.usage_count > 0 {
            (
                template.stats.average_cost,
                template.stats.average_execution_time_ms.round() as u64,
            )
        } else {
            self.estimate(&template.definition)
        }
    }

    /// Registry estimate: summed cost, duration over the critical path of waves
    pub fn estimate(&self, definition: &ChainDefinition) -> (f64, u64) {
        let cost: f64 = definition
            .steps
            .iter()
            .map(|s| self.registry.expected_cost(s.agent_kind))
            .sum();
        let latency = |n: &u32| {
            definition
                .step(*n)
                .map(|s| self.registry.expected_latency_ms(s.agent_kind))
                .unwrap_or(0)
        };
        let duration: u64 = match (definition.execution_mode, definition.dependency_waves()) {
            (ExecutionMode::Parallel, Ok(waves)) => waves
                .iter()
                .map(|wave| wave.iter().map(latency).max().unwrap_or(0))
                .sum(),
            _ => definition.steps.iter().map(|s| latency(&s.step_number)).sum(),
        };
        (cost, duration)
    }

    fn recommend_template(
        &self,
        best: &ScoredTemplate,
        preferences: &ChainPreferences,
        constraints: &ChainConstraints,
        alternatives: Vec<(String, f64)>,
    ) -> ChainRecommendation {
        let mut definition = best.template.instantiate();
        apply_preferences(&mut definition, preferences);
        if definition.max_budget.is_none() {
            definition.max_budget = constraints.max_cost;
        }
        let (estimated_cost, estimated_duration_ms) = self.template_estimates(&best.template);
        let mut reasoning = vec![format!(
            "template '{}' scored {:.2}",
            best.template.name, best.score
        )];
        reasoning.extend(best.reasoning.iter().cloned());

        ChainRecommendation {
            source: RecommendationSource::Template {
                template_id: best.template.id.clone(),
                score: best.score,
            },
            agent_kinds: definition.agent_kinds(),
            definition,
            confidence: best.score.min(1.0),
            high_confidence: best.score >= HIGH_CONFIDENCE_SCORE,
            estimated_cost,
            estimated_duration_ms,
            reasoning,
            alternatives: alternatives
                .into_iter()
                .filter(|(id, _)| *id != best.template.id)
                .collect(),
        }
    }

    fn synthesize(
        &self,
        goal: &ChainGoal,
        goal_kinds: &[AgentKind],
        constraints: &ChainConstraints,
        preferences: &ChainPreferences,
        context: Option<&HashMap<String, serde_json::Value>>,
        alternatives: Vec<(String, f64)>,
    ) -> Result<ChainRecommendation> {
        let mut reasoning = Vec::new();
        let mut kinds: Vec<AgentKind> = goal_kinds.to_vec();
        for kind in &constraints.required_agents {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds.retain(|k| !constraints.forbidden_agents.contains(k));

        let source = if kinds.is_empty() {
            reasoning.push(format!(
                "goal '{}' maps to no agent kind, using the default content/social chain",
                goal.primary_objective
            ));
            kinds = FALLBACK_KINDS
                .iter()
                .copied()
                .filter(|k| !constraints.forbidden_agents.contains(k))
                .collect();
            if kinds.is_empty() {
                return Err(ChainError::Definition(
                    "no viable agent kinds remain after applying constraints".to_string(),
                ));
            }
            RecommendationSource::Fallback
        } else {
            reasoning.push(format!("goal keywords map to {:?}", kinds));
            RecommendationSource::Synthesized
        };

        let ordered = self.registry.order_kinds(&kinds)?;
        let definition = self.build_definition(goal, &ordered, preferences, constraints, context)?;
        let (estimated_cost, estimated_duration_ms) = self.estimate(&definition);

        let confidence = match source {
            RecommendationSource::Fallback => 0.3,
            _ => (0.45 + 0.1 * goal_kinds.len().min(3) as f64).min(0.75),
        };
        reasoning.push(format!("execution order: {:?}", ordered));

        Ok(ChainRecommendation {
            source,
            agent_kinds: ordered,
            definition,
            confidence,
            high_confidence: false,
            estimated_cost,
            estimated_duration_ms,
            reasoning,
            alternatives,
        })
    }

    fn build_definition(
        &self,
        goal: &ChainGoal,
        ordered: &[AgentKind],
        preferences: &ChainPreferences,
        constraints: &ChainConstraints,
        context: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<ChainDefinition> {
        let id = format!(
            "synth-{}",
            ordered.iter().map(AgentKind::as_str).collect::<Vec<_>>().join("-")
        );
        let topic = context.and_then(|c| c.get("topic")).cloned();

        let mut definition = ChainDefinition::new(id, format!("Chain for: {}", goal.primary_objective), ExecutionMode::Sequential)
            .with_description(goal.primary_objective.clone());

        for (index, kind) in ordered.iter().enumerate() {
            let step_number = index as u32 + 1;
            let depends_on: Vec<u32> = ordered[..index]
                .iter()
                .enumerate()
                .filter(|(_, earlier)| self.registry.dependencies_of(*kind).contains(*earlier))
                .map(|(i, _)| i as u32 + 1)
                .collect();
            let mut step = ChainStepDefinition::new(step_number, kind.as_str(), *kind).depends_on(depends_on);
            if let Some(topic) = &topic {
                step = step.with_config("topic", topic.clone());
            }
            definition = definition.with_step(step);
        }

        let linear = definition.dependency_waves()?.iter().all(|wave| wave.len() == 1);
        definition.execution_mode = if linear {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel
        };
        definition.chain_kind = if linear {
            ChainKind::Sequential
        } else {
            ChainKind::Parallel
        };
        definition.max_budget = constraints.max_cost;
        apply_preferences(&mut definition, preferences);
        definition.validate()?;
        Ok(definition)
    }

    /// Persist `definition` as a reusable template with zeroed statistics
    ///
    /// The template id is derived from the name.
    ///
    /// ## Errors
    /// - the definition is invalid
    /// - a template with the same id already exists
    pub async fn create_custom_template(
        &self,
        name: &str,
        category: &str,
        keywords: &[&str],
        definition: ChainDefinition,
    ) -> Result<ChainTemplate> {
        definition.validate()?;
        let id = slug(name);
        if id.is_empty() {
            return Err(ChainError::InvalidInput("template name must contain letters or digits".to_string()));
        }
        if self.storage.get_template(&id).await?.is_some() {
            return Err(ChainError::InvalidInput(format!("template '{}' already exists", id)));
        }

        let mut template = ChainTemplate::new(id, name, category, definition).with_keywords(keywords);
        template.stats = TemplateStats::default();
        info!(template_id = %template.id, "created custom template");
        self.storage.store_template(template).await
    }

    /// Fold one run of a template into its statistics
    pub async fn record_template_usage(
        &self,
        template_id: &str,
        success: bool,
        cost: f64,
        execution_time_ms: u64,
    ) -> Result<TemplateStats> {
        record_template_usage(self.storage.as_ref(), template_id, success, cost, execution_time_ms).await
    }
}

/// Shared with the orchestrator's finalization
pub(crate) async fn record_template_usage(
    storage: &dyn ChainStorage,
    template_id: &str,
    success: bool,
    cost: f64,
    execution_time_ms: u64,
) -> Result<TemplateStats> {
    let mut template = storage
        .get_template(template_id)
        .await?
        .ok_or_else(|| ChainError::NotFound(format!("template {}", template_id)))?;
    template.stats.record(success, cost, execution_time_ms as f64);
    template.updated_at = chrono::Utc::now();
    let stats = template.stats.clone();
    storage.update_template(template).await?;
    Ok(stats)
}

fn apply_preferences(definition: &mut ChainDefinition, preferences: &ChainPreferences) {
    if let Some(mode) = preferences.execution_mode {
        definition.execution_mode = mode;
    }
    if let Some(retries) = preferences.max_retries {
        definition.max_retries = Some(retries);
    }
    if let Some(criteria) = &preferences.success_criteria {
        definition.success_criteria = criteria.clone();
    }
}

/// Whole-word match that tolerates a plural `s` on either side
fn keyword_matches(word: &str, keyword: &str) -> bool {
    word == keyword
        || word.strip_suffix('s') == Some(keyword)
        || keyword.strip_suffix('s') == Some(word)
}

fn slug(name: &str) -> String {
    tokenize(name).join("-")
}

/// Built-in templates with seeded statistics
pub fn predefined_templates() -> Vec<ChainTemplate> {
    use AgentKind::*;

    let step = |n: u32, name: &str, kind: AgentKind| ChainStepDefinition::new(n, name, kind);

    let viral = ChainDefinition::new("viral-content", "Viral Content", ExecutionMode::Sequential)
        .with_description("Spot a trend, write to it, design for it and push it to social channels")
        .with_step(step(1, "trend_research", TrendAnalysis))
        .with_step(step(2, "content_creation", Content).depends_on([1]))
        .with_step(step(3, "visual_design", Design).depends_on([2]))
        .with_step(step(4, "social_distribution", SocialMedia).depends_on([2, 3]));

    let seo = ChainDefinition::new("seo-content-pipeline", "SEO Content Pipeline", ExecutionMode::Parallel)
        .with_description("Keyword and trend research feeding search-optimized articles")
        .with_step(step(1, "keyword_research", Seo))
        .with_step(step(2, "trend_research", TrendAnalysis))
        .with_step(step(3, "article_writing", Content).depends_on([1, 2]))
        .with_step(step(4, "featured_images", Design).depends_on([3]));

    let launch = ChainDefinition::new("product-launch", "Product Launch", ExecutionMode::Parallel)
        .with_description("Coordinated launch across social, paid and email with a closing report")
        .with_step(step(1, "market_trends", TrendAnalysis))
        .with_step(step(2, "launch_copy", Content).depends_on([1]))
        .with_step(step(3, "launch_visuals", Design).depends_on([2]))
        .with_step(step(4, "social_launch", SocialMedia).depends_on([2, 3]))
        .with_step(step(5, "paid_launch", Advertising).depends_on([2, 3]))
        .with_step(step(6, "launch_email", Email).depends_on([2]))
        .with_step(step(7, "launch_report", Analytics).depends_on([4, 5, 6]))
        .with_success_criteria(SuccessCriteria {
            min_steps_completed: Some(5),
            required_steps: vec![2, 4],
            ..Default::default()
        });

    let leads = ChainDefinition::new("lead-generation", "Lead Generation", ExecutionMode::Parallel)
        .with_description("Search-led content turned into email nurture and direct outreach")
        .with_step(step(1, "keyword_research", Seo))
        .with_step(step(2, "lead_magnet", Content).depends_on([1]))
        .with_step(step(3, "nurture_email", Email).depends_on([2]))
        .with_step(step(4, "partner_outreach", Outreach).depends_on([2]))
        .with_step(step(5, "funnel_report", Analytics).depends_on([3, 4]));

    let mut templates = vec![
        ChainTemplate::new("viral-content", "Viral Content", "social", viral)
            .with_keywords(&["viral", "social", "engagement", "trending", "shares", "reach"]),
        ChainTemplate::new("seo-content-pipeline", "SEO Content Pipeline", "content", seo)
            .with_keywords(&["seo", "search", "ranking", "blog", "article", "organic"]),
        ChainTemplate::new("product-launch", "Product Launch", "launch", launch)
            .with_keywords(&["launch", "product", "announcement", "release", "campaign"]),
        ChainTemplate::new("lead-generation", "Lead Generation", "acquisition", leads)
            .with_keywords(&["lead", "generation", "outreach", "nurture", "conversion", "signup"]),
    ];
    let seeds = [
        TemplateStats::seeded(120, 0.87, 1.35, 41_000.0),
        TemplateStats::seeded(85, 0.91, 1.25, 30_000.0),
        TemplateStats::seeded(40, 0.82, 2.40, 65_000.0),
        TemplateStats::seeded(60, 0.85, 1.05, 38_000.0),
    ];
    for (template, stats) in templates.iter_mut().zip(seeds) {
        template.stats = stats;
        template.is_predefined = true;
    }
    templates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryChainStorage;

    async fn engine() -> ChainDefinitionEngine {
        let engine = ChainDefinitionEngine::new(
            Arc::new(CapabilityRegistry::with_defaults()),
            Arc::new(InMemoryChainStorage::new()),
        );
        assert_eq!(engine.install_predefined_templates().await.unwrap(), 4);
        engine
    }

    #[test]
    fn test_predefined_templates_are_valid() {
        for template in predefined_templates() {
            template.definition.validate().unwrap();
            assert_eq!(template.definition.id, template.id);
            assert!(template.stats.success_rate > 0.8);
        }
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let engine = engine().await;
        assert_eq!(engine.install_predefined_templates().await.unwrap(), 0);
        assert_eq!(engine.list_templates().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_social_engagement_matches_viral_template() {
        let engine = engine().await;
        let rec = engine
            .recommend_chain(&ChainGoal::new("increase social engagement"), None, None)
            .await
            .unwrap();

        assert!(rec.agent_kinds.contains(&AgentKind::SocialMedia));
        match &rec.source {
            RecommendationSource::Template { template_id, .. } => assert_eq!(template_id, "viral-content"),
            other => panic!("expected template match, got {:?}", other),
        }
        assert!(rec.confidence >= 0.6);
        assert!(rec.high_confidence);
        assert_eq!(rec.definition.template_id.as_deref(), Some("viral-content"));
    }

    #[tokio::test]
    async fn test_preferred_agents_steer_template_confidence() {
        let engine = engine().await;
        let goal = ChainGoal::new("product launch");

        // Both launch keywords match but the launch template has no outreach step
        let elsewhere = ChainPreferences {
            preferred_agents: vec![AgentKind::Outreach],
            ..Default::default()
        };
        let rec = engine.recommend_chain(&goal, None, Some(&elsewhere)).await.unwrap();
        let score = match &rec.source {
            RecommendationSource::Template { template_id, score } => {
                assert_eq!(template_id, "product-launch");
                *score
            }
            other => panic!("expected template match, got {:?}", other),
        };
        assert!(score > TEMPLATE_ACCEPT_SCORE && score < HIGH_CONFIDENCE_SCORE);
        assert!((score - 0.682).abs() < 1e-9);
        assert!(!rec.high_confidence);

        let aligned = ChainPreferences {
            preferred_agents: vec![AgentKind::Advertising, AgentKind::Email],
            ..Default::default()
        };
        let rec = engine.recommend_chain(&goal, None, Some(&aligned)).await.unwrap();
        match &rec.source {
            RecommendationSource::Template { template_id, score } => {
                assert_eq!(template_id, "product-launch");
                assert!((score - 0.982).abs() < 1e-9);
            }
            other => panic!("expected template match, got {:?}", other),
        }
        assert!(rec.high_confidence);
    }

    #[tokio::test]
    async fn test_synthesizes_ordered_chain() {
        let engine = engine().await;
        let goal = ChainGoal::new("write a newsletter with fresh design");
        let rec = engine.recommend_chain(&goal, None, None).await.unwrap();

        assert_eq!(rec.source, RecommendationSource::Synthesized);
        assert_eq!(rec.agent_kinds, vec![AgentKind::Design, AgentKind::Email]);
        assert!(rec.definition.validate().is_ok());
        assert!(!rec.high_confidence);
    }

    #[tokio::test]
    async fn test_dependencies_become_step_edges() {
        let engine = engine().await;
        let goal = ChainGoal::new("trend driven content").with_constraints(ChainConstraints {
            required_agents: vec![AgentKind::Seo],
            ..Default::default()
        });
        let rec = engine.recommend_chain(&goal, None, None).await.unwrap();
        assert_eq!(rec.source, RecommendationSource::Synthesized);
        assert_eq!(
            rec.agent_kinds,
            vec![AgentKind::TrendAnalysis, AgentKind::Seo, AgentKind::Content]
        );
        let content = rec.definition.step(3).unwrap();
        assert_eq!(content.depends_on, vec![1, 2]);
        assert_eq!(rec.definition.execution_mode, ExecutionMode::Parallel);
    }

    #[tokio::test]
    async fn test_unknown_goal_falls_back() {
        let engine = engine().await;
        let rec = engine
            .recommend_chain(&ChainGoal::new("make things better"), None, None)
            .await
            .unwrap();
        assert_eq!(rec.source, RecommendationSource::Fallback);
        assert_eq!(rec.agent_kinds, FALLBACK_KINDS.to_vec());
        assert_eq!(rec.definition.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_forbidden_agent_excludes_template() {
        let engine = engine().await;
        let goal = ChainGoal::new("viral social engagement").with_constraints(ChainConstraints {
            forbidden_agents: vec![AgentKind::Design],
            ..Default::default()
        });
        let rec = engine.recommend_chain(&goal, None, None).await.unwrap();
        assert!(!rec.agent_kinds.contains(&AgentKind::Design));
        assert!(matches!(rec.source, RecommendationSource::Synthesized));
    }

    #[tokio::test]
    async fn test_custom_template_lifecycle() {
        let engine = engine().await;
        let definition = ChainDefinition::new("my-chain", "Mine", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "write", AgentKind::Content))
            .with_step(ChainStepDefinition::new(2, "mail", AgentKind::Email).depends_on([1]));

        let template = engine
            .create_custom_template("Weekly Digest", "email", &["digest", "weekly"], definition.clone())
            .await
            .unwrap();
        assert_eq!(template.id, "weekly-digest");
        assert_eq!(template.stats.usage_count, 0);
        assert!(!template.is_predefined);

        let duplicate = engine
            .create_custom_template("weekly digest", "email", &[], definition)
            .await;
        let err = tokio_test::assert_err!(duplicate);
        assert!(matches!(err, ChainError::InvalidInput(_)));

        let stats = engine.record_template_usage("weekly-digest", true, 0.5, 1200).await.unwrap();
        assert_eq!(stats.usage_count, 1);
        assert_eq!(stats.success_rate, 1.0);

        let missing = engine.record_template_usage("nope", true, 0.0, 0).await;
        let err = tokio_test::assert_err!(missing);
        assert!(matches!(err, ChainError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_empty_goal() {
        let engine = engine().await;
        let result = engine.recommend_chain(&ChainGoal::new("  "), None, None).await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, ChainError::InvalidInput(_)));
    }
}
