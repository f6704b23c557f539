// Reusable chain templates and chain recommendations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentKind;
use super::chain::ChainDefinition;

/// Aggregate historical statistics of a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateStats {
    pub usage_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub average_cost: f64,
    pub average_execution_time_ms: f64,
}

impl TemplateStats {
    /// Seeded statistics, weighted as `usage_count` prior runs
    pub fn seeded(usage_count: u64, success_rate: f64, average_cost: f64, average_execution_time_ms: f64) -> Self {
        Self {
            usage_count,
            success_count: (usage_count as f64 * success_rate).round() as u64,
            success_rate,
            average_cost,
            average_execution_time_ms,
        }
    }

    /// Fold one more run into the running averages
    pub fn record(&mut self, success: bool, cost: f64, execution_time_ms: f64) {
        let previous = self.usage_count as f64;
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        let n = self.usage_count as f64;
        self.success_rate = self.success_count as f64 / n;
        self.average_cost = (self.average_cost * previous + cost) / n;
        self.average_execution_time_ms = (self.average_execution_time_ms * previous + execution_time_ms) / n;
    }
}

/// A named, reusable chain definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Goal keywords this template is good for
    pub keywords: Vec<String>,
    pub definition: ChainDefinition,
    pub stats: TemplateStats,
    pub is_predefined: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        definition: ChainDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: definition.description.clone(),
            category: category.into(),
            keywords: Vec::new(),
            definition,
            stats: TemplateStats::default(),
            is_predefined: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn agent_kinds(&self) -> Vec<AgentKind> {
        self.definition.agent_kinds()
    }

    /// A fresh definition for one run, tagged with this template's id
    pub fn instantiate(&self) -> ChainDefinition {
        let mut definition = self.definition.clone();
        definition.template_id = Some(self.id.clone());
        definition.created_at = Utc::now();
        definition
    }
}

/// Where a recommended chain came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecommendationSource {
    Template { template_id: String, score: f64 },
    Synthesized,
    /// The goal mapped to no agent kind; the minimal default chain was used
    Fallback,
}

/// What `recommend_chain` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecommendation {
    pub source: RecommendationSource,
    pub definition: ChainDefinition,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub high_confidence: bool,
    pub agent_kinds: Vec<AgentKind>,
    pub estimated_cost: f64,
    pub estimated_duration_ms: u64,
    pub reasoning: Vec<String>,
    /// Other templates that were scored, best first: (template id, score)
    pub alternatives: Vec<(String, f64)>,
}
