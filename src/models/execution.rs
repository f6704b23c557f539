// Execution state, step results and persisted execution records

//! # Execution Models
//!
//! - [`ChainExecutionState`]: in-memory state of one run, owned by the orchestrator
//! - [`StepExecutionResult`]: one entry of the authoritative execution trace
//! - [`ExecutionError`]: a captured error with timestamp, location and recoverability
//! - [`ChainExecutionResult`]: what `execute_chain` returns
//! - [`ChainExecutionRecord`] / [`ChainStepRecord`]: what goes through the persistence boundary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::agent::AgentKind;
use super::chain::ExecutionMode;
use crate::ChainError;

/// Status of a chain execution: `Pending -> Running -> (Completed | Failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// Status of a single step. `Skipped` is terminal and counts as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// Error taxonomy used in captured execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Definition,
    Dependency,
    StepExecution,
    HandoffValidation,
    System,
}

/// An error captured during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub step_number: Option<u32>,
    pub agent_kind: Option<AgentKind>,
    pub message: String,
    pub recoverable: bool,
}

impl ExecutionError {
    pub fn new(category: ErrorCategory, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            step_number: None,
            agent_kind: None,
            message: message.into(),
            recoverable,
        }
    }

    pub fn at_step(mut self, step_number: u32, agent_kind: AgentKind) -> Self {
        self.step_number = Some(step_number);
        self.agent_kind = Some(agent_kind);
        self
    }

    pub fn from_chain_error(error: &ChainError) -> Self {
        let mut captured = Self::new(error.category(), error.to_string(), error.is_recoverable());
        match error {
            ChainError::StepExecution {
                step_number,
                agent_kind,
                ..
            } => {
                captured.step_number = Some(*step_number);
                captured.agent_kind = Some(*agent_kind);
            }
            ChainError::DependencyUnsatisfied { step, .. } => captured.step_number = Some(*step),
            _ => {}
        }
        captured
    }
}

/// Result of one concluded step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_number: u32,
    pub step_name: String,
    pub agent_kind: AgentKind,
    pub status: StepStatus,
    /// True for completed and skipped steps
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub cost: f64,
    pub confidence: Option<f64>,
    pub quality_score: Option<f64>,
    /// Agent invocations made, including retries
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepExecutionResult {
    fn base(step_number: u32, step_name: String, agent_kind: AgentKind, status: StepStatus) -> Self {
        let now = Utc::now();
        Self {
            step_number,
            step_name,
            agent_kind,
            status,
            success: status.is_success(),
            output: None,
            error: None,
            execution_time_ms: 0,
            cost: 0.0,
            confidence: None,
            quality_score: None,
            attempts: 0,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn completed(
        step_number: u32,
        step_name: impl Into<String>,
        agent_kind: AgentKind,
        output: serde_json::Value,
    ) -> Self {
        let mut result = Self::base(step_number, step_name.into(), agent_kind, StepStatus::Completed);
        result.output = Some(output);
        result.attempts = 1;
        result
    }

    pub fn failed(
        step_number: u32,
        step_name: impl Into<String>,
        agent_kind: AgentKind,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(step_number, step_name.into(), agent_kind, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn skipped(
        step_number: u32,
        step_name: impl Into<String>,
        agent_kind: AgentKind,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(step_number, step_name.into(), agent_kind, StepStatus::Skipped);
        result.output = Some(serde_json::json!({ "skipped": true, "reason": reason.into() }));
        result
    }

    /// Set timing from a start instant to now
    pub fn timed(mut self, started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        self.started_at = started_at;
        self.completed_at = now;
        self.execution_time_ms = (now - started_at).num_milliseconds().max(0) as u64;
        self
    }
}

/// In-memory state of one run
///
/// Created when a run starts and discarded when it ends; never shared between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecutionState {
    pub execution_id: Uuid,
    pub execution_number: u64,
    pub chain_id: String,
    pub chain_name: String,
    pub status: ExecutionStatus,
    pub trigger: HashMap<String, serde_json::Value>,
    pub total_steps: usize,
    pub step_states: BTreeMap<u32, StepStatus>,
    pub started_at: DateTime<Utc>,
}

impl ChainExecutionState {
    pub fn steps_in(&self, status: StepStatus) -> usize {
        self.step_states.values().filter(|s| **s == status).count()
    }
}

/// What `execute_chain` returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecutionResult {
    pub execution_id: Uuid,
    pub execution_number: u64,
    pub chain_id: String,
    pub status: ExecutionStatus,
    /// Whether the success criteria held
    pub success: bool,
    pub step_results: Vec<StepExecutionResult>,
    /// Flat output map keyed by `step_<n>` and by step name
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub errors: Vec<ExecutionError>,
    pub criteria_failures: Vec<String>,
    pub handoff_ids: Vec<Uuid>,
    pub total_cost: f64,
    pub total_time_ms: u64,
    pub success_rate: f64,
    pub mean_quality: Option<f64>,
    pub agents_used: Vec<AgentKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ChainExecutionResult {
    pub fn step(&self, step_number: u32) -> Option<&StepExecutionResult> {
        self.step_results.iter().find(|r| r.step_number == step_number)
    }

    pub fn failed_steps(&self) -> Vec<&StepExecutionResult> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .collect()
    }
}

/// Persisted execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecutionRecord {
    pub id: Uuid,
    /// Assigned by storage, monotonically increasing
    pub execution_number: u64,
    pub chain_id: String,
    pub chain_name: String,
    pub execution_mode: ExecutionMode,
    pub template_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger: HashMap<String, serde_json::Value>,
    pub total_steps: usize,
    pub total_cost: f64,
    pub total_time_ms: u64,
    pub success_rate: f64,
    pub mean_quality: Option<f64>,
    pub agents_used: Vec<AgentKind>,
    pub errors: Vec<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChainExecutionRecord {
    pub fn new(
        id: Uuid,
        chain_id: impl Into<String>,
        chain_name: impl Into<String>,
        execution_mode: ExecutionMode,
        total_steps: usize,
    ) -> Self {
        Self {
            id,
            execution_number: 0,
            chain_id: chain_id.into(),
            chain_name: chain_name.into(),
            execution_mode,
            template_id: None,
            status: ExecutionStatus::Pending,
            trigger: HashMap::new(),
            total_steps,
            total_cost: 0.0,
            total_time_ms: 0,
            success_rate: 0.0,
            mean_quality: None,
            agents_used: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Persisted step record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Assigned by storage, monotonically increasing within the execution
    pub record_number: u64,
    pub result: StepExecutionResult,
    pub recorded_at: DateTime<Utc>,
}

impl ChainStepRecord {
    pub fn new(execution_id: Uuid, result: StepExecutionResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            record_number: 0,
            result,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_constructors() {
        let done = StepExecutionResult::completed(1, "trends", AgentKind::TrendAnalysis, serde_json::json!({"a": 1}));
        assert!(done.success);
        assert_eq!(done.attempts, 1);

        let skipped = StepExecutionResult::skipped(2, "seo", AgentKind::Seo, "condition false");
        assert!(skipped.success);
        assert_eq!(skipped.status, StepStatus::Skipped);

        let failed = StepExecutionResult::failed(3, "content", AgentKind::Content, "timeout");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_error_capture_keeps_location() {
        let error = ChainError::StepExecution {
            step_number: 2,
            agent_kind: AgentKind::Design,
            message: "render failed".to_string(),
            recoverable: false,
        };
        let captured = ExecutionError::from_chain_error(&error);
        assert_eq!(captured.category, ErrorCategory::StepExecution);
        assert_eq!(captured.step_number, Some(2));
        assert_eq!(captured.agent_kind, Some(AgentKind::Design));
        assert!(!captured.recoverable);
    }
}
