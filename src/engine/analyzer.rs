// Chain performance analyzer
// Post-hoc and cross-run analysis of execution records

//! # Chain Performance Analyzer
//!
//! Reads execution, step and handoff records through [`ChainStorage`] and
//! derives:
//!
//! - [`PerformanceMetrics`] for one execution (cached per execution id)
//! - [`Bottleneck`]s: steps over the time or cost threshold, or under the
//!   quality threshold
//! - [`Recommendation`]s: generic ones for the whole run plus one per bottleneck
//! - [`Trend`]s: least-squares slope of time, cost and quality across runs
//! - [`Benchmark`]s: a baseline execution against the best completed one
//!
//! Everything here is derived data. Dropping the cache with
//! [`ChainPerformanceAnalyzer::invalidate`] is always safe.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::storage::ChainStorage;
use crate::config::AnalyzerConfig;
use crate::models::{
    AgentBreakdown, Benchmark, BenchmarkDimension, Bottleneck, BottleneckLocation, BottleneckThresholds,
    BottleneckType, ChainExecutionRecord, ChainPerformanceSummary, ExecutionSpread, ExecutionStatus,
    PerformanceMetrics, Recommendation, RecommendationCategory, Severity, StepExecutionResult, StepMetric,
    StepStatus, TimeRange, Trend, TrendDirection,
};
use crate::{ChainError, Result};

/// Share of a bottleneck's impact a fix is expected to recover
const TIME_IMPROVEMENT_FACTOR: f64 = 0.5;
const COST_IMPROVEMENT_FACTOR: f64 = 0.3;
const QUALITY_IMPROVEMENT_FACTOR: f64 = 0.4;

pub struct ChainPerformanceAnalyzer {
    config: AnalyzerConfig,
    storage: Arc<dyn ChainStorage>,
    cache: DashMap<Uuid, PerformanceMetrics>,
}

impl ChainPerformanceAnalyzer {
    pub fn new(config: AnalyzerConfig, storage: Arc<dyn ChainStorage>) -> Self {
        Self {
            config,
            storage,
            cache: DashMap::new(),
        }
    }

    /// Drop the cached metrics of one execution
    pub fn invalidate(&self, execution_id: &Uuid) -> bool {
        self.cache.remove(execution_id).is_some()
    }

    pub fn cached_executions(&self) -> usize {
        self.cache.len()
    }

    /// Metrics of one execution, `None` if the execution is unknown
    ///
    /// Metrics of finished executions are computed once and then served from
    /// the cache; running executions are recomputed on every call.
    pub async fn analyze_chain_execution(&self, execution_id: &Uuid) -> Result<Option<PerformanceMetrics>> {
        if let Some(cached) = self.cache.get(execution_id) {
            return Ok(Some(cached.clone()));
        }

        let record = match self.storage.get_execution(execution_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let results = self.step_results(execution_id).await?;
        let handoffs = self.storage.list_handoffs(execution_id).await?;

        let metrics = compute_metrics(&record, &results, &handoffs);
        debug!(
            %execution_id,
            steps = metrics.steps_total,
            efficiency = metrics.efficiency_score,
            "computed execution metrics"
        );
        if record.status.is_terminal() {
            self.cache.insert(*execution_id, metrics.clone());
        }
        Ok(Some(metrics))
    }

    /// Latest recorded result per step, in step order
    async fn step_results(&self, execution_id: &Uuid) -> Result<Vec<StepExecutionResult>> {
        let mut latest: BTreeMap<u32, (u64, StepExecutionResult)> = BTreeMap::new();
        for record in self.storage.list_steps(execution_id).await? {
            let step_number = record.result.step_number;
            match latest.get(&step_number) {
                Some((seen, _)) if *seen > record.record_number => {}
                _ => {
                    latest.insert(step_number, (record.record_number, record.result));
                }
            }
        }
        Ok(latest.into_values().map(|(_, result)| result).collect())
    }

    async fn require_metrics(&self, execution_id: &Uuid) -> Result<PerformanceMetrics> {
        self.analyze_chain_execution(execution_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("execution {}", execution_id)))
    }

    /// Threshold checks over every step that ran
    ///
    /// Without explicit thresholds the configured ones apply.
    pub async fn detect_bottlenecks(
        &self,
        execution_id: &Uuid,
        thresholds: Option<&BottleneckThresholds>,
    ) -> Result<Vec<Bottleneck>> {
        let metrics = self.require_metrics(execution_id).await?;
        let defaults = BottleneckThresholds::from(&self.config);
        let thresholds = thresholds.unwrap_or(&defaults);

        let mut bottlenecks: Vec<Bottleneck> = metrics
            .step_metrics
            .iter()
            .filter(|step| step.status != StepStatus::Skipped)
            .flat_map(|step| step_bottlenecks(step, thresholds))
            .collect();
        bottlenecks.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.location.step_number.cmp(&b.location.step_number))
        });

        if !bottlenecks.is_empty() {
            info!(%execution_id, count = bottlenecks.len(), "bottlenecks detected");
        }
        Ok(bottlenecks)
    }

    /// Run-level recommendations followed by one per bottleneck
    pub async fn generate_recommendations(
        &self,
        execution_id: &Uuid,
        bottlenecks: &[Bottleneck],
    ) -> Result<Vec<Recommendation>> {
        let metrics = self.require_metrics(execution_id).await?;
        let mut recommendations = Vec::new();

        if metrics.total_time_ms > self.config.slow_chain_ms {
            let ratio = metrics.total_time_ms as f64 / self.config.slow_chain_ms as f64;
            recommendations.push(Recommendation {
                category: RecommendationCategory::Parallelization,
                priority: Severity::from_ratio(ratio),
                title: "Run independent steps in parallel".to_string(),
                description: format!(
                    "The chain took {:.1} minutes. Steps without mutual dependencies can run in the same wave.",
                    metrics.total_time_ms as f64 / 60_000.0
                ),
                expected_improvement: (1.0 - 1.0 / ratio).clamp(0.0, 0.5),
                related_step: None,
                actions: vec![
                    "Switch the chain to parallel execution mode".to_string(),
                    "Remove dependencies that only exist for ordering".to_string(),
                ],
            });
        }

        if metrics.steps_failed > 0 {
            let failure_rate = metrics.steps_failed as f64 / metrics.steps_total.max(1) as f64;
            recommendations.push(Recommendation {
                category: RecommendationCategory::Reliability,
                priority: if failure_rate > 0.25 { Severity::High } else { Severity::Medium },
                title: "Reduce step failures".to_string(),
                description: format!(
                    "{} of {} steps failed in this execution.",
                    metrics.steps_failed, metrics.steps_total
                ),
                expected_improvement: failure_rate,
                related_step: None,
                actions: vec![
                    "Raise the retry count of steps with transient failures".to_string(),
                    "Mark optional steps continue_on_failure".to_string(),
                ],
            });
        }

        recommendations.extend(bottlenecks.iter().map(bottleneck_recommendation));
        Ok(recommendations)
    }

    /// Summary, trends and spread over the finished executions of one chain
    pub async fn analyze_chain_performance(
        &self,
        chain_id: &str,
        time_range: Option<TimeRange>,
    ) -> Result<ChainPerformanceSummary> {
        let executions = self.finished_executions(chain_id, time_range).await?;
        let count = executions.len();

        let mut summary = ChainPerformanceSummary {
            chain_id: chain_id.to_string(),
            time_range,
            execution_count: count,
            success_rate: 0.0,
            average_time_ms: 0.0,
            average_cost: 0.0,
            average_quality: None,
            trends: Vec::new(),
            benchmarks: ExecutionSpread::default(),
        };
        if count == 0 {
            return Ok(summary);
        }

        let completed = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count();
        summary.success_rate = completed as f64 / count as f64;
        summary.average_time_ms = executions.iter().map(|e| e.total_time_ms as f64).sum::<f64>() / count as f64;
        summary.average_cost = executions.iter().map(|e| e.total_cost).sum::<f64>() / count as f64;
        summary.average_quality = mean(executions.iter().filter_map(|e| e.mean_quality));

        let times: Vec<f64> = executions.iter().map(|e| e.total_time_ms as f64).collect();
        let costs: Vec<f64> = executions.iter().map(|e| e.total_cost).collect();
        let qualities: Vec<f64> = executions.iter().filter_map(|e| e.mean_quality).collect();
        summary.trends = [
            self.trend("execution_time", &times, false),
            self.trend("cost", &costs, false),
            self.trend("quality", &qualities, true),
        ]
        .into_iter()
        .flatten()
        .collect();

        summary.benchmarks = spread(&executions);
        Ok(summary)
    }

    /// Compare a baseline run against the best completed run of the chain
    ///
    /// The baseline defaults to the earliest finished execution.
    pub async fn benchmark_chain(&self, chain_id: &str, baseline_execution_id: Option<Uuid>) -> Result<Benchmark> {
        let executions = self.finished_executions(chain_id, None).await?;
        if executions.is_empty() {
            return Err(ChainError::NotFound(format!("no finished executions of chain {}", chain_id)));
        }

        let baseline = match baseline_execution_id {
            Some(id) => executions
                .iter()
                .find(|e| e.id == id)
                .ok_or_else(|| ChainError::NotFound(format!("execution {} of chain {}", id, chain_id)))?,
            None => &executions[0],
        };
        let current = best_execution(&executions).unwrap_or(&executions[executions.len() - 1]);

        let dimensions = vec![
            dimension("time", baseline.total_time_ms as f64, current.total_time_ms as f64, false),
            dimension("cost", baseline.total_cost, current.total_cost, false),
            dimension(
                "quality",
                baseline.mean_quality.unwrap_or(0.0),
                current.mean_quality.unwrap_or(0.0),
                true,
            ),
            dimension("reliability", baseline.success_rate, current.success_rate, true),
        ];
        let overall_improvement = dimensions.iter().map(|d| d.improvement).sum::<f64>() / dimensions.len() as f64;

        Ok(Benchmark {
            chain_id: chain_id.to_string(),
            baseline_execution_id: baseline.id,
            current_execution_id: current.id,
            dimensions,
            overall_improvement,
            generated_at: Utc::now(),
        })
    }

    /// Terminal executions of a chain, oldest first
    async fn finished_executions(
        &self,
        chain_id: &str,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<ChainExecutionRecord>> {
        Ok(self
            .storage
            .list_executions(Some(chain_id))
            .await?
            .into_iter()
            .filter(|e| e.status.is_terminal())
            .filter(|e| time_range.map_or(true, |range| range.contains(e.started_at)))
            .collect())
    }

    fn trend(&self, metric: &str, series: &[f64], higher_is_better: bool) -> Option<Trend> {
        let slope = linear_slope(series)?;
        let series_mean = series.iter().sum::<f64>() / series.len() as f64;
        let relative_slope = if series_mean.abs() > f64::EPSILON {
            slope / series_mean
        } else {
            0.0
        };

        let direction = if relative_slope.abs() < self.config.trend_stability_band {
            TrendDirection::Stable
        } else if (relative_slope > 0.0) == higher_is_better {
            TrendDirection::Improving
        } else {
            TrendDirection::Declining
        };

        Some(Trend {
            metric: metric.to_string(),
            direction,
            slope,
            relative_slope,
            samples: series.len(),
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn share(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        part / total
    } else {
        0.0
    }
}

fn compute_metrics(
    record: &ChainExecutionRecord,
    results: &[StepExecutionResult],
    handoffs: &[crate::models::HandoffData],
) -> PerformanceMetrics {
    let step_time: f64 = results.iter().map(|r| r.execution_time_ms as f64).sum();
    let step_cost: f64 = results.iter().map(|r| r.cost).sum();

    let step_metrics: Vec<StepMetric> = results
        .iter()
        .map(|r| StepMetric {
            step_number: r.step_number,
            step_name: r.step_name.clone(),
            agent_kind: r.agent_kind,
            status: r.status,
            time_ms: r.execution_time_ms,
            cost: r.cost,
            quality_score: r.quality_score,
            time_share: share(r.execution_time_ms as f64, step_time),
            cost_share: share(r.cost, step_cost),
        })
        .collect();

    let mut agent_breakdown: BTreeMap<_, AgentBreakdown> = BTreeMap::new();
    let mut agent_qualities: BTreeMap<_, Vec<f64>> = BTreeMap::new();
    for r in results.iter().filter(|r| r.status != StepStatus::Skipped) {
        let entry = agent_breakdown.entry(r.agent_kind).or_default();
        entry.invocations += 1;
        entry.total_time_ms += r.execution_time_ms;
        entry.total_cost += r.cost;
        if let Some(quality) = r.quality_score {
            agent_qualities.entry(r.agent_kind).or_default().push(quality);
        }
    }
    for (kind, qualities) in agent_qualities {
        if let Some(entry) = agent_breakdown.get_mut(&kind) {
            entry.mean_quality = mean(qualities.into_iter());
        }
    }

    let count = |status: StepStatus| results.iter().filter(|r| r.status == status).count();
    let steps_total = results.len();
    let success_rate = share(results.iter().filter(|r| r.success).count() as f64, steps_total as f64);
    let mean_quality = mean(results.iter().filter_map(|r| r.quality_score));

    // reliability and quality weigh 0.4 each, cost per step 0.2
    let cost_factor = 1.0 / (1.0 + step_cost / steps_total.max(1) as f64);
    let efficiency_score =
        (0.4 * success_rate + 0.4 * mean_quality.unwrap_or(success_rate) + 0.2 * cost_factor).clamp(0.0, 1.0);

    PerformanceMetrics {
        execution_id: record.id,
        chain_id: record.chain_id.clone(),
        status: record.status,
        total_time_ms: record.total_time_ms,
        total_cost: if record.total_cost > 0.0 { record.total_cost } else { step_cost },
        mean_quality,
        success_rate,
        steps_total,
        steps_completed: count(StepStatus::Completed),
        steps_failed: count(StepStatus::Failed),
        steps_skipped: count(StepStatus::Skipped),
        step_metrics,
        agent_breakdown,
        handoff_count: handoffs.len(),
        handoff_bytes_saved: handoffs
            .iter()
            .flat_map(|h| h.metadata.optimizations.iter())
            .map(|o| o.bytes_saved)
            .sum(),
        efficiency_score,
        computed_at: Utc::now(),
    }
}

fn step_bottlenecks(step: &StepMetric, thresholds: &BottleneckThresholds) -> Vec<Bottleneck> {
    let location = BottleneckLocation {
        step_number: step.step_number,
        step_name: step.step_name.clone(),
        agent_kind: step.agent_kind,
    };
    let mut found = Vec::new();

    let max_time = thresholds.max_step_time_ms as f64;
    if max_time > 0.0 && step.time_ms as f64 > max_time {
        found.push(Bottleneck {
            bottleneck_type: BottleneckType::ExecutionTime,
            location: location.clone(),
            severity: Severity::from_ratio(step.time_ms as f64 / max_time),
            impact: step.time_share,
            value: step.time_ms as f64,
            threshold: max_time,
            description: format!(
                "Step {} ({}) took {}ms, limit {}ms",
                step.step_number, step.agent_kind, step.time_ms, thresholds.max_step_time_ms
            ),
            suggested_actions: vec![
                format!("Cache {} results for repeated inputs", step.agent_kind),
                "Reduce the input handed to this step".to_string(),
                "Move the step into a parallel wave".to_string(),
            ],
        });
    }

    if thresholds.max_step_cost > 0.0 && step.cost > thresholds.max_step_cost {
        found.push(Bottleneck {
            bottleneck_type: BottleneckType::Cost,
            location: location.clone(),
            severity: Severity::from_ratio(step.cost / thresholds.max_step_cost),
            impact: step.cost_share,
            value: step.cost,
            threshold: thresholds.max_step_cost,
            description: format!(
                "Step {} ({}) cost {:.2}, limit {:.2}",
                step.step_number, step.agent_kind, step.cost, thresholds.max_step_cost
            ),
            suggested_actions: vec![
                "Use a cheaper agent configuration".to_string(),
                "Trim the handoff payload to the fields the agent reads".to_string(),
            ],
        });
    }

    if let Some(quality) = step.quality_score {
        if quality < thresholds.min_quality_score {
            let ratio = if quality > 0.0 {
                thresholds.min_quality_score / quality
            } else {
                f64::INFINITY
            };
            found.push(Bottleneck {
                bottleneck_type: BottleneckType::Quality,
                location,
                severity: Severity::from_ratio(ratio),
                impact: (thresholds.min_quality_score - quality).clamp(0.0, 1.0),
                value: quality,
                threshold: thresholds.min_quality_score,
                description: format!(
                    "Step {} ({}) scored {:.2}, minimum {:.2}",
                    step.step_number, step.agent_kind, quality, thresholds.min_quality_score
                ),
                suggested_actions: vec![
                    "Enrich the handoff context passed to this agent".to_string(),
                    "Add a review step after this one".to_string(),
                ],
            });
        }
    }

    found
}

fn bottleneck_recommendation(bottleneck: &Bottleneck) -> Recommendation {
    let (category, factor, title) = match bottleneck.bottleneck_type {
        BottleneckType::ExecutionTime => (
            RecommendationCategory::Performance,
            TIME_IMPROVEMENT_FACTOR,
            format!("Speed up step {}", bottleneck.location.step_number),
        ),
        BottleneckType::Cost => (
            RecommendationCategory::CostOptimization,
            COST_IMPROVEMENT_FACTOR,
            format!("Lower the cost of step {}", bottleneck.location.step_number),
        ),
        BottleneckType::Quality => (
            RecommendationCategory::QualityImprovement,
            QUALITY_IMPROVEMENT_FACTOR,
            format!("Raise the output quality of step {}", bottleneck.location.step_number),
        ),
    };

    Recommendation {
        category,
        priority: bottleneck.severity,
        title,
        description: bottleneck.description.clone(),
        expected_improvement: bottleneck.impact * factor,
        related_step: Some(bottleneck.location.step_number),
        actions: bottleneck.suggested_actions.clone(),
    }
}

/// Least-squares slope against the sample index; `None` below two samples
fn linear_slope(series: &[f64]) -> Option<f64> {
    if series.len() < 2 {
        return None;
    }
    let n = series.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = series.iter().sum::<f64>() / n;

    let (covariance, variance) = series
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(cov, var), (i, y)| {
            let dx = i as f64 - x_mean;
            (cov + dx * (y - y_mean), var + dx * dx)
        });
    Some(covariance / variance)
}

/// Fastest completed execution
fn best_execution(executions: &[ChainExecutionRecord]) -> Option<&ChainExecutionRecord> {
    executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .min_by_key(|e| e.total_time_ms)
}

fn spread(executions: &[ChainExecutionRecord]) -> ExecutionSpread {
    let mut times: Vec<u64> = executions.iter().map(|e| e.total_time_ms).collect();
    times.sort_unstable();
    let lowest_cost = executions.iter().map(|e| e.total_cost).fold(f64::INFINITY, f64::min);

    ExecutionSpread {
        best_time_ms: times.first().copied().unwrap_or(0),
        median_time_ms: times.get(times.len() / 2).copied().unwrap_or(0),
        worst_time_ms: times.last().copied().unwrap_or(0),
        lowest_cost: if lowest_cost.is_finite() { lowest_cost } else { 0.0 },
        highest_cost: executions.iter().map(|e| e.total_cost).fold(0.0, f64::max),
        best_execution_id: best_execution(executions).map(|e| e.id),
    }
}

/// Relative change from baseline; positive means better
fn dimension(name: &str, baseline: f64, current: f64, higher_is_better: bool) -> BenchmarkDimension {
    let delta = if higher_is_better { current - baseline } else { baseline - current };
    let improvement = if baseline.abs() > f64::EPSILON {
        delta / baseline.abs()
    } else {
        delta
    };
    BenchmarkDimension {
        name: name.to_string(),
        baseline,
        current,
        improvement,
        regression: improvement < 0.0,
    }
}
