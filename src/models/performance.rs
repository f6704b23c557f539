// Performance analysis artifacts
// Derived and read-only: always recomputable from the execution trace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::agent::AgentKind;
use super::execution::{ExecutionStatus, StepStatus};
use crate::config::AnalyzerConfig;

/// Per-step view of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetric {
    pub step_number: u32,
    pub step_name: String,
    pub agent_kind: AgentKind,
    pub status: StepStatus,
    pub time_ms: u64,
    pub cost: f64,
    pub quality_score: Option<f64>,
    /// Fraction of the summed step time
    pub time_share: f64,
    /// Fraction of the total cost
    pub cost_share: f64,
}

/// Aggregates per agent kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBreakdown {
    pub invocations: u32,
    pub total_time_ms: u64,
    pub total_cost: f64,
    pub mean_quality: Option<f64>,
}

/// Metrics of one execution, computed once and cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub execution_id: Uuid,
    pub chain_id: String,
    pub status: ExecutionStatus,
    pub total_time_ms: u64,
    pub total_cost: f64,
    pub mean_quality: Option<f64>,
    pub success_rate: f64,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub step_metrics: Vec<StepMetric>,
    pub agent_breakdown: BTreeMap<AgentKind, AgentBreakdown>,
    pub handoff_count: usize,
    pub handoff_bytes_saved: i64,
    /// Combined 0.0 - 1.0 score of reliability, quality and cost per step
    pub efficiency_score: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckType {
    ExecutionTime,
    Cost,
    Quality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Classify how far a value exceeds its threshold
    ///
    /// `ratio` is value / threshold (or threshold / value for lower bounds):
    /// below 1.5 low, below 2 medium, below 3 high, otherwise critical.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 1.5 {
            Severity::Low
        } else if ratio < 2.0 {
            Severity::Medium
        } else if ratio < 3.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

/// Where a bottleneck was found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckLocation {
    pub step_number: u32,
    pub step_name: String,
    pub agent_kind: AgentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub bottleneck_type: BottleneckType,
    pub location: BottleneckLocation,
    pub severity: Severity,
    /// 0.0 - 1.0 share of the run affected
    pub impact: f64,
    pub value: f64,
    pub threshold: f64,
    pub description: String,
    pub suggested_actions: Vec<String>,
}

/// Thresholds for bottleneck detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckThresholds {
    pub max_step_time_ms: u64,
    pub max_step_cost: f64,
    pub min_quality_score: f64,
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self::from(&AnalyzerConfig::default())
    }
}

impl From<&AnalyzerConfig> for BottleneckThresholds {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            max_step_time_ms: config.max_step_time_ms,
            max_step_cost: config.max_step_cost,
            min_quality_score: config.min_quality_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    Parallelization,
    Performance,
    CostOptimization,
    QualityImprovement,
    Reliability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: RecommendationCategory,
    pub priority: Severity,
    pub title: String,
    pub description: String,
    /// Expected relative improvement, 0.0 - 1.0
    pub expected_improvement: f64,
    pub related_step: Option<u32>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

/// Linear trend of one metric over successive executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub metric: String,
    pub direction: TrendDirection,
    /// Change per execution in the metric's unit
    pub slope: f64,
    /// Slope divided by the series mean
    pub relative_slope: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Best/median/worst figures across a chain's executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpread {
    pub best_time_ms: u64,
    pub median_time_ms: u64,
    pub worst_time_ms: u64,
    pub lowest_cost: f64,
    pub highest_cost: f64,
    pub best_execution_id: Option<Uuid>,
}

/// What `analyze_chain_performance` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPerformanceSummary {
    pub chain_id: String,
    pub time_range: Option<TimeRange>,
    pub execution_count: usize,
    pub success_rate: f64,
    pub average_time_ms: f64,
    pub average_cost: f64,
    pub average_quality: Option<f64>,
    pub trends: Vec<Trend>,
    pub benchmarks: ExecutionSpread,
}

/// Signed comparison along one dimension; positive improvement is better
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkDimension {
    pub name: String,
    pub baseline: f64,
    pub current: f64,
    pub improvement: f64,
    pub regression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub chain_id: String,
    pub baseline_execution_id: Uuid,
    pub current_execution_id: Uuid,
    pub dimensions: Vec<BenchmarkDimension>,
    /// Mean of the dimension improvements
    pub overall_improvement: f64,
    pub generated_at: DateTime<Utc>,
}

impl Benchmark {
    pub fn dimension(&self, name: &str) -> Option<&BenchmarkDimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::from_ratio(1.4), Severity::Low);
        assert_eq!(Severity::from_ratio(1.5), Severity::Medium);
        assert_eq!(Severity::from_ratio(1.99), Severity::Medium);
        assert_eq!(Severity::from_ratio(2.5), Severity::High);
        assert_eq!(Severity::from_ratio(3.0), Severity::Critical);
        assert_eq!(Severity::from_ratio(3.5), Severity::Critical);
        assert!(Severity::Critical > Severity::Low);
    }
}
