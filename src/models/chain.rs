// Chain definitions - declarative multi-step workflows

//! # Chain Definitions
//!
//! A [`ChainDefinition`] is an ordered list of [`ChainStepDefinition`]s, each
//! bound to exactly one agent kind and annotated with the step numbers it
//! depends on. The dependency graph over step numbers must be acyclic and may
//! only reference steps of the same definition; [`ChainDefinition::validate`]
//! enforces both.
//!
//! Definitions are immutable once an execution starts: the orchestrator only
//! ever borrows them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::agent::AgentKind;
use super::execution::{StepExecutionResult, StepStatus};
use super::rule::Rule;
use crate::engine::graph;
use crate::{ChainError, Result};

/// Overall shape of the chain, informational for planning and analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

/// Scheduling mode used by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time by ascending step number
    Sequential,
    /// Dependency waves, steps inside a wave run concurrently
    Parallel,
    /// One step at a time in a dependency and latency aware order
    Adaptive,
}

/// What a step does when it runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke the step's agent
    #[default]
    AgentExecution,
    /// Evaluate the step conditions and publish the outcome; never skipped
    Conditional,
    /// Pause for a fixed duration
    Wait { duration_ms: u64 },
}

/// One unit of work in a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepDefinition {
    /// Unique within the chain
    pub step_number: u32,
    pub step_name: String,
    #[serde(default)]
    pub step_kind: StepKind,
    pub agent_kind: AgentKind,
    #[serde(default)]
    pub agent_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    /// All conditions must pass against the outputs produced so far
    #[serde(default)]
    pub conditions: Vec<Rule>,
    /// Retries after the first attempt; falls back to the chain/engine default
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// target field -> dotted path into the flat output map
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// output field -> renamed field
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    /// Keep a sequential chain running when this step fails
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl ChainStepDefinition {
    pub fn new(step_number: u32, step_name: impl Into<String>, agent_kind: AgentKind) -> Self {
        Self {
            step_number,
            step_name: step_name.into(),
            step_kind: StepKind::AgentExecution,
            agent_kind,
            agent_config: HashMap::new(),
            depends_on: Vec::new(),
            conditions: Vec::new(),
            retry_count: None,
            timeout_secs: None,
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            continue_on_failure: false,
        }
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on.extend(steps);
        self
    }

    pub fn with_kind(mut self, step_kind: StepKind) -> Self {
        self.step_kind = step_kind;
        self
    }

    pub fn with_condition(mut self, rule: Rule) -> Self {
        self.conditions.push(rule);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.agent_config.insert(key.into(), value);
        self
    }

    pub fn with_input_mapping(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping.insert(target.into(), source.into());
        self
    }

    pub fn with_output_mapping(mut self, field: impl Into<String>, renamed: impl Into<String>) -> Self {
        self.output_mapping.insert(field.into(), renamed.into());
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Conditions a finished run must meet to be reported COMPLETED
///
/// An empty set of criteria means "every step completed or was skipped".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessCriteria {
    pub min_steps_completed: Option<usize>,
    pub required_steps: Vec<u32>,
    pub min_quality_score: Option<f64>,
    pub max_error_rate: Option<f64>,
    /// Evaluated against the run summary (see [`SuccessCriteria::summary`])
    pub custom_conditions: Vec<Rule>,
}

/// Outcome of evaluating [`SuccessCriteria`]
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaEvaluation {
    pub passed: bool,
    pub failures: Vec<String>,
}

impl SuccessCriteria {
    pub fn is_empty(&self) -> bool {
        self.min_steps_completed.is_none()
            && self.required_steps.is_empty()
            && self.min_quality_score.is_none()
            && self.max_error_rate.is_none()
            && self.custom_conditions.is_empty()
    }

    /// JSON summary of a run, the document custom conditions are evaluated against
    pub fn summary(results: &[StepExecutionResult]) -> serde_json::Value {
        let completed = results.iter().filter(|r| r.status == StepStatus::Completed).count();
        let skipped = results.iter().filter(|r| r.status == StepStatus::Skipped).count();
        let failed = results.iter().filter(|r| r.status == StepStatus::Failed).count();
        let qualities: Vec<f64> = results.iter().filter_map(|r| r.quality_score).collect();
        let mean_quality = if qualities.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::json!(qualities.iter().sum::<f64>() / qualities.len() as f64)
        };

        serde_json::json!({
            "total_steps": results.len(),
            "steps_completed": completed + skipped,
            "steps_executed": completed,
            "steps_skipped": skipped,
            "steps_failed": failed,
            "error_rate": if results.is_empty() { 0.0 } else { failed as f64 / results.len() as f64 },
            "mean_quality": mean_quality,
            "total_cost": results.iter().map(|r| r.cost).sum::<f64>(),
        })
    }

    /// Evaluate the criteria once all steps have concluded
    ///
    /// Skipped steps count as successful.
    pub fn evaluate(&self, results: &[StepExecutionResult]) -> CriteriaEvaluation {
        let mut failures = Vec::new();
        let succeeded: HashSet<u32> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.step_number)
            .collect();
        let failed = results.iter().filter(|r| r.status == StepStatus::Failed).count();

        if self.is_empty() {
            if failed > 0 {
                failures.push(format!("{} step(s) failed", failed));
            }
            return CriteriaEvaluation {
                passed: failures.is_empty(),
                failures,
            };
        }

        if let Some(min) = self.min_steps_completed {
            if succeeded.len() < min {
                failures.push(format!(
                    "only {} step(s) completed, at least {} required",
                    succeeded.len(),
                    min
                ));
            }
        }

        for step in &self.required_steps {
            if !succeeded.contains(step) {
                failures.push(format!("required step {} did not complete", step));
            }
        }

        if let Some(min_quality) = self.min_quality_score {
            let qualities: Vec<f64> = results.iter().filter_map(|r| r.quality_score).collect();
            if !qualities.is_empty() {
                let mean = qualities.iter().sum::<f64>() / qualities.len() as f64;
                if mean < min_quality {
                    failures.push(format!("mean quality {:.3} below {:.3}", mean, min_quality));
                }
            }
        }

        if let Some(max_error_rate) = self.max_error_rate {
            if !results.is_empty() {
                let rate = failed as f64 / results.len() as f64;
                if rate > max_error_rate {
                    failures.push(format!("error rate {:.3} above {:.3}", rate, max_error_rate));
                }
            }
        }

        if !self.custom_conditions.is_empty() {
            let summary = Self::summary(results);
            for rule in &self.custom_conditions {
                let evaluation = rule.evaluate_detailed(&summary);
                if !evaluation.passed {
                    failures.push(format!("custom condition '{}' failed: {}", rule.id, evaluation.explanation));
                }
            }
        }

        CriteriaEvaluation {
            passed: failures.is_empty(),
            failures,
        }
    }
}

/// A complete chain definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// Stable identifier used to group executions of the same chain
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chain_kind: ChainKind,
    pub execution_mode: ExecutionMode,
    pub steps: Vec<ChainStepDefinition>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    /// Retry ceiling for steps that do not declare their own
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Advisory: the host enforces it, the orchestrator only logs an overrun
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub max_budget: Option<f64>,
    /// Set when the definition was instantiated from a template
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChainDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, execution_mode: ExecutionMode) -> Self {
        let chain_kind = match execution_mode {
            ExecutionMode::Parallel => ChainKind::Parallel,
            _ => ChainKind::Sequential,
        };
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            chain_kind,
            execution_mode,
            steps: Vec::new(),
            success_criteria: SuccessCriteria::default(),
            max_retries: None,
            timeout_minutes: None,
            max_budget: None,
            template_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: ChainStepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_success_criteria(mut self, criteria: SuccessCriteria) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn step(&self, step_number: u32) -> Option<&ChainStepDefinition> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Steps sorted by ascending step number
    pub fn steps_in_order(&self) -> Vec<&ChainStepDefinition> {
        let mut steps: Vec<&ChainStepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.step_number);
        steps
    }

    /// Distinct agent kinds in step order
    pub fn agent_kinds(&self) -> Vec<AgentKind> {
        let mut kinds = Vec::new();
        for step in self.steps_in_order() {
            if !kinds.contains(&step.agent_kind) {
                kinds.push(step.agent_kind);
            }
        }
        kinds
    }

    fn dependency_map(&self) -> BTreeMap<u32, Vec<u32>> {
        self.steps
            .iter()
            .map(|s| (s.step_number, s.depends_on.clone()))
            .collect()
    }

    fn step_numbers(&self) -> Vec<u32> {
        self.steps_in_order().iter().map(|s| s.step_number).collect()
    }

    /// Check that the definition is runnable
    ///
    /// ## Errors
    /// - no steps, or an empty name
    /// - duplicate step numbers
    /// - a dependency on an unknown step or on the step itself
    /// - a dependency cycle
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ChainError::Definition("chain name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(ChainError::Definition(format!("chain '{}' has no steps", self.name)));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_number) {
                return Err(ChainError::DuplicateStep(step.step_number));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if *dep == step.step_number || !seen.contains(dep) {
                    return Err(ChainError::UnknownDependency {
                        step: step.step_number,
                        depends_on: *dep,
                    });
                }
            }
        }

        graph::topological_sort(&self.step_numbers(), &self.dependency_map())?;
        Ok(())
    }

    /// A valid topological order, ties broken by step number
    pub fn execution_order(&self) -> Result<Vec<u32>> {
        graph::topological_sort(&self.step_numbers(), &self.dependency_map())
    }

    /// Dependency waves: wave 0 has no dependencies, wave n depends only on waves < n
    pub fn dependency_waves(&self) -> Result<Vec<Vec<u32>>> {
        graph::dependency_waves(&self.step_numbers(), &self.dependency_map())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::StepExecutionResult;

    fn diamond() -> ChainDefinition {
        ChainDefinition::new("diamond", "Diamond", ExecutionMode::Parallel)
            .with_step(ChainStepDefinition::new(1, "trends", AgentKind::TrendAnalysis))
            .with_step(ChainStepDefinition::new(2, "seo", AgentKind::Seo))
            .with_step(ChainStepDefinition::new(3, "content", AgentKind::Content).depends_on([1, 2]))
            .with_step(ChainStepDefinition::new(4, "social", AgentKind::SocialMedia).depends_on([3]))
    }

    #[test]
    fn test_valid_definition() {
        let chain = diamond();
        assert!(chain.validate().is_ok());
        assert_eq!(chain.execution_order().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(chain.dependency_waves().unwrap(), vec![vec![1, 2], vec![3], vec![4]]);
        assert_eq!(
            chain.agent_kinds(),
            vec![AgentKind::TrendAnalysis, AgentKind::Seo, AgentKind::Content, AgentKind::SocialMedia]
        );
    }

    #[test]
    fn test_rejects_unknown_and_self_dependencies() {
        let chain = diamond().with_step(ChainStepDefinition::new(5, "email", AgentKind::Email).depends_on([9]));
        assert!(matches!(
            chain.validate(),
            Err(ChainError::UnknownDependency { step: 5, depends_on: 9 })
        ));

        let chain = ChainDefinition::new("self", "Self", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "loop", AgentKind::Content).depends_on([1]));
        assert!(matches!(chain.validate(), Err(ChainError::UnknownDependency { .. })));
    }

    #[test]
    fn test_rejects_duplicates_and_cycles() {
        let chain = diamond().with_step(ChainStepDefinition::new(2, "again", AgentKind::Email));
        assert!(matches!(chain.validate(), Err(ChainError::DuplicateStep(2))));

        let cyclic = ChainDefinition::new("cycle", "Cycle", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "a", AgentKind::Content).depends_on([3]))
            .with_step(ChainStepDefinition::new(2, "b", AgentKind::Design).depends_on([1]))
            .with_step(ChainStepDefinition::new(3, "c", AgentKind::SocialMedia).depends_on([2]));
        assert!(matches!(cyclic.validate(), Err(ChainError::CyclicDependency { .. })));
    }

    #[test]
    fn test_rejects_empty_chain() {
        let chain = ChainDefinition::new("empty", "Empty", ExecutionMode::Sequential);
        assert!(matches!(chain.validate(), Err(ChainError::Definition(_))));
    }

    fn results(statuses: &[(u32, StepStatus, Option<f64>)]) -> Vec<StepExecutionResult> {
        statuses
            .iter()
            .map(|(n, status, quality)| {
                let mut r = match status {
                    StepStatus::Completed => StepExecutionResult::completed(
                        *n,
                        format!("step {}", n),
                        AgentKind::Content,
                        serde_json::json!({"ok": true}),
                    ),
                    StepStatus::Skipped => {
                        StepExecutionResult::skipped(*n, format!("step {}", n), AgentKind::Content, "condition false")
                    }
                    _ => StepExecutionResult::failed(*n, format!("step {}", n), AgentKind::Content, "boom"),
                };
                r.quality_score = *quality;
                r
            })
            .collect()
    }

    #[test]
    fn test_empty_criteria_require_all_steps() {
        let criteria = SuccessCriteria::default();
        let ok = results(&[(1, StepStatus::Completed, None), (2, StepStatus::Skipped, None)]);
        assert!(criteria.evaluate(&ok).passed);
        let bad = results(&[(1, StepStatus::Completed, None), (2, StepStatus::Failed, None)]);
        assert!(!criteria.evaluate(&bad).passed);
    }

    #[test]
    fn test_min_steps_completed_tolerates_failure() {
        let criteria = SuccessCriteria {
            min_steps_completed: Some(2),
            ..Default::default()
        };
        let r = results(&[
            (1, StepStatus::Completed, None),
            (2, StepStatus::Failed, None),
            (3, StepStatus::Completed, None),
        ]);
        assert!(criteria.evaluate(&r).passed);
    }

    #[test]
    fn test_required_quality_and_error_rate() {
        let criteria = SuccessCriteria {
            required_steps: vec![2],
            min_quality_score: Some(0.8),
            max_error_rate: Some(0.2),
            ..Default::default()
        };
        let r = results(&[
            (1, StepStatus::Completed, Some(0.6)),
            (2, StepStatus::Failed, None),
            (3, StepStatus::Completed, Some(0.7)),
        ]);
        let evaluation = criteria.evaluate(&r);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.failures.len(), 3);
    }

    #[test]
    fn test_custom_conditions_use_summary() {
        let criteria = SuccessCriteria {
            custom_conditions: vec![Rule::field_less_than("cheap", "total_cost", 1.0)],
            ..Default::default()
        };
        let r = results(&[(1, StepStatus::Completed, None)]);
        assert!(criteria.evaluate(&r).passed);
    }
}
