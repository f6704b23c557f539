// Chain orchestrator - the execution engine
// Drives step execution, handoffs, success criteria and finalization

//! # Chain Orchestrator
//!
//! [`ChainOrchestrator::execute_chain`] runs one chain definition end to end.
//!
//! ## Execution State Machine
//!
//! ```text
//! execution: PENDING -> RUNNING -> (COMPLETED | FAILED)
//! step:      PENDING -> RUNNING -> (COMPLETED | FAILED)
//!            PENDING -> SKIPPED   (counts as success)
//! ```
//!
//! ## Scheduling Modes
//!
//! - **Sequential**: one step at a time by ascending step number
//! - **Parallel**: dependency waves; steps inside a wave run concurrently and a
//!   failure never cancels its siblings
//! - **Adaptive**: one step at a time in a topological order that prefers the
//!   fastest ready agent
//!
//! Before a step runs its dependencies must have completed (or been skipped on
//! a false condition) and its conditions must hold against the outputs
//! produced so far; otherwise it is skipped. A step skipped for unmet
//! dependencies leaves its own dependents unmet too.
//! After a step succeeds, the communication protocol hands its output to the
//! next step, then the output is merged into the flat output map under
//! `step_<n>` and under the step name.
//!
//! In sequential and adaptive mode a failed step halts the chain unless it
//! still had retry budget left (a permanent agent error cuts retries short)
//! or is marked `continue_on_failure`. A halted chain always ends FAILED;
//! otherwise the success criteria decide.
//!
//! Chain `timeout_minutes` is advisory: an overrun is logged, nothing is
//! aborted. Per-step timeouts are only enforced when
//! `orchestrator.enforce_step_timeouts` is set.
//!
//! ## Rust Learning Notes:
//!
//! ### Concurrency Without Shared Mutation
//! Steps of a wave run through `futures::future::join_all`. Each step future
//! only borrows the orchestrator and a snapshot of the outputs and returns a
//! [`StepExecutionResult`]; all mutation happens afterwards, on one task, in
//! step-number order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definition::record_template_usage;
use super::events::{ChainEvent, EventBus};
use super::graph;
use super::protocol::AgentCommunicationProtocol;
use super::registry::{AgentInvoker, CapabilityRegistry};
use super::storage::ChainStorage;
use crate::config::{EngineConfig, OrchestratorConfig};
use crate::models::{
    lookup_path, AgentError, AgentKind, AgentOutput, ChainDefinition, ChainExecutionRecord,
    ChainExecutionResult, ChainExecutionState, ChainStepDefinition, ChainStepRecord, ErrorCategory,
    ExecutionError, ExecutionMode, ExecutionStatus, HandoffContext, StepExecutionResult, StepKind,
    StepStatus,
};
use crate::{ChainError, Result};

/// Caller-supplied context of one run
#[derive(Debug, Clone, Default)]
pub struct ChainRunContext {
    /// Trigger metadata, passed to every step under `context`
    pub trigger: HashMap<String, Value>,
    pub campaign_id: Option<String>,
    /// Use this id instead of a fresh one
    pub execution_id: Option<Uuid>,
}

impl ChainRunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger(mut self, key: impl Into<String>, value: Value) -> Self {
        self.trigger.insert(key.into(), value);
        self
    }

    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

/// Mutable bookkeeping of one run, owned by the driving task
struct RunState {
    execution_id: Uuid,
    context: Value,
    results: Vec<StepExecutionResult>,
    outputs: Map<String, Value>,
    errors: Vec<ExecutionError>,
    handoff_ids: Vec<Uuid>,
    /// destination step -> reason its inbound handoff was rejected
    handoff_failures: HashMap<u32, String>,
    /// Steps skipped because one of their own dependencies was unsatisfied
    unsatisfied: HashSet<u32>,
    halted: bool,
}

impl RunState {
    fn result(&self, step_number: u32) -> Option<&StepExecutionResult> {
        self.results.iter().find(|r| r.step_number == step_number)
    }

    /// Completed, or skipped on a false condition
    fn satisfies(&self, step_number: u32) -> bool {
        match self.result(step_number).map(|r| r.status) {
            Some(StepStatus::Completed) => true,
            Some(StepStatus::Skipped) => !self.unsatisfied.contains(&step_number),
            _ => false,
        }
    }
}

/// How a step is concluded before or instead of running
enum Prepared {
    Skip { reason: String, error: Option<ExecutionError> },
    Fail { error: ExecutionError },
    Ready { input: Value },
}

/// A concluded step waiting to be folded into the run state
struct Concluded {
    result: StepExecutionResult,
    /// Output as seen by downstream steps, for completed steps
    output: Option<AgentOutput>,
    /// Failure classification for failed steps
    failure: Option<ExecutionError>,
}

/// The execution engine
pub struct ChainOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<dyn AgentInvoker>,
    storage: Arc<dyn ChainStorage>,
    protocol: Arc<AgentCommunicationProtocol>,
    events: EventBus,
    active: DashMap<Uuid, ChainExecutionState>,
}

impl ChainOrchestrator {
    pub fn new(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        invoker: Arc<dyn AgentInvoker>,
        storage: Arc<dyn ChainStorage>,
    ) -> Self {
        let protocol = Arc::new(AgentCommunicationProtocol::new(
            config.protocol.clone(),
            registry.clone(),
            storage.clone(),
        ));
        Self {
            config: config.orchestrator,
            registry,
            invoker,
            storage,
            protocol,
            events: EventBus::new(),
            active: DashMap::new(),
        }
    }

    /// Publish on an externally owned bus instead of a private one
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn protocol(&self) -> &Arc<AgentCommunicationProtocol> {
        &self.protocol
    }

    /// Snapshot of an in-flight execution; `None` once it has finished
    pub fn active_execution(&self, execution_id: &Uuid) -> Option<ChainExecutionState> {
        self.active.get(execution_id).map(|state| state.clone())
    }

    pub fn active_executions(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Run `definition` to completion
    ///
    /// ## Errors
    /// - definition errors (validation) before anything is stored
    /// - storage failures, after the execution has been marked FAILED
    ///
    /// Step failures are not errors: they are reported in the returned
    /// result's `step_results` and `errors`.
    pub async fn execute_chain(
        &self,
        definition: &ChainDefinition,
        context: ChainRunContext,
    ) -> Result<ChainExecutionResult> {
        definition.validate()?;

        let execution_id = context.execution_id.unwrap_or_else(Uuid::new_v4);
        let started_at = Utc::now();

        let mut record = ChainExecutionRecord::new(
            execution_id,
            definition.id.clone(),
            definition.name.clone(),
            definition.execution_mode,
            definition.steps.len(),
        );
        record.template_id = definition.template_id.clone();
        record.trigger = context.trigger.clone();
        record.started_at = started_at;
        let mut record = self.storage.create_execution(record).await?;
        record.status = ExecutionStatus::Running;
        let record = self.storage.update_execution(record).await?;

        self.active.insert(
            execution_id,
            ChainExecutionState {
                execution_id,
                execution_number: record.execution_number,
                chain_id: definition.id.clone(),
                chain_name: definition.name.clone(),
                status: ExecutionStatus::Running,
                trigger: context.trigger.clone(),
                total_steps: definition.steps.len(),
                step_states: definition
                    .steps
                    .iter()
                    .map(|s| (s.step_number, StepStatus::Pending))
                    .collect(),
                started_at,
            },
        );
        self.protocol.register_sequence(
            execution_id,
            definition.steps.iter().map(|s| (s.step_number, s.agent_kind)),
        );

        info!(
            %execution_id,
            chain_id = %definition.id,
            mode = ?definition.execution_mode,
            steps = definition.steps.len(),
            "chain execution started"
        );
        self.events.publish(ChainEvent::ExecutionStarted {
            execution_id,
            chain_id: definition.id.clone(),
            total_steps: definition.steps.len(),
            at: started_at,
        });

        let mut trigger: Map<String, Value> = context.trigger.clone().into_iter().collect();
        if let Some(campaign_id) = &context.campaign_id {
            trigger.insert("campaign_id".to_string(), json!(campaign_id));
        }
        let mut run = RunState {
            execution_id,
            context: Value::Object(trigger),
            results: Vec::new(),
            outputs: Map::new(),
            errors: Vec::new(),
            handoff_ids: Vec::new(),
            handoff_failures: HashMap::new(),
            unsatisfied: HashSet::new(),
            halted: false,
        };

        let driven = match definition.execution_mode {
            ExecutionMode::Sequential => {
                let order: Vec<u32> = definition.steps_in_order().iter().map(|s| s.step_number).collect();
                self.run_serial(definition, &context, &mut run, &order).await
            }
            ExecutionMode::Adaptive => match self.adaptive_order(definition) {
                Ok(order) => self.run_serial(definition, &context, &mut run, &order).await,
                Err(e) => Err(e),
            },
            ExecutionMode::Parallel => self.run_waves(definition, &context, &mut run).await,
        };

        match driven {
            Ok(()) => self.finalize(definition, record, run, started_at).await,
            Err(e) => {
                self.abort(record, run, started_at, &e).await;
                Err(e)
            }
        }
    }

    /// Topological order preferring the lowest expected latency among ready steps
    pub fn adaptive_order(&self, definition: &ChainDefinition) -> Result<Vec<u32>> {
        let numbers: Vec<u32> = definition.steps_in_order().iter().map(|s| s.step_number).collect();
        let deps: BTreeMap<u32, Vec<u32>> = definition
            .steps
            .iter()
            .map(|s| (s.step_number, s.depends_on.clone()))
            .collect();
        let latency: HashMap<u32, u64> = definition
            .steps
            .iter()
            .map(|s| (s.step_number, self.registry.expected_latency_ms(s.agent_kind)))
            .collect();
        graph::topological_sort_by(&numbers, &deps, |n| (latency.get(n).copied().unwrap_or(0), *n))
    }

    async fn run_serial(
        &self,
        definition: &ChainDefinition,
        context: &ChainRunContext,
        run: &mut RunState,
        order: &[u32],
    ) -> Result<()> {
        for step_number in order {
            if run.halted {
                debug!(execution_id = %run.execution_id, step = step_number, "chain halted, step not run");
                break;
            }
            let step = match definition.step(*step_number) {
                Some(step) => step,
                None => continue,
            };

            let prepared = self.prepare(step, run).await;
            let snapshot = Value::Object(run.outputs.clone());
            let concluded = self.conclude(run.execution_id, step, prepared, &snapshot, definition).await;
            let failed = concluded.result.status == StepStatus::Failed;
            let recoverable = concluded.failure.as_ref().map_or(false, |f| f.recoverable);

            self.absorb(definition, context, run, concluded, false).await?;

            if failed && !recoverable && !step.continue_on_failure {
                warn!(execution_id = %run.execution_id, step = step_number, "unrecoverable step failure, halting chain");
                run.halted = true;
            }
        }
        Ok(())
    }

    async fn run_waves(&self, definition: &ChainDefinition, context: &ChainRunContext, run: &mut RunState) -> Result<()> {
        let waves = definition.dependency_waves()?;
        for (index, wave) in waves.iter().enumerate() {
            debug!(execution_id = %run.execution_id, wave = index, steps = ?wave, "starting wave");
            let snapshot = Value::Object(run.outputs.clone());

            let mut prepared = Vec::with_capacity(wave.len());
            for step_number in wave {
                if let Some(step) = definition.step(*step_number) {
                    prepared.push((step, self.prepare(step, run).await));
                }
            }

            let execution_id = run.execution_id;
            let mut concluded = join_all(
                prepared
                    .into_iter()
                    .map(|(step, prepared)| self.conclude(execution_id, step, prepared, &snapshot, definition)),
            )
            .await;
            concluded.sort_by_key(|c| c.result.step_number);
            for step in concluded {
                self.absorb(definition, context, run, step, true).await?;
            }
        }
        Ok(())
    }

    /// Decide whether a step runs, and build its input
    async fn prepare(&self, step: &ChainStepDefinition, run: &RunState) -> Prepared {
        if let Some(reason) = run.handoff_failures.get(&step.step_number) {
            return Prepared::Fail {
                error: ExecutionError::new(
                    ErrorCategory::HandoffValidation,
                    format!("inbound handoff rejected: {}", reason),
                    false,
                )
                .at_step(step.step_number, step.agent_kind),
            };
        }

        let missing: Vec<u32> = step
            .depends_on
            .iter()
            .copied()
            .filter(|dep| !run.satisfies(*dep))
            .collect();
        if !missing.is_empty() {
            let error = ChainError::DependencyUnsatisfied {
                step: step.step_number,
                missing: missing.clone(),
            };
            return Prepared::Skip {
                reason: format!("unsatisfied dependencies {:?}", missing),
                error: Some(ExecutionError::from_chain_error(&error).at_step(step.step_number, step.agent_kind)),
            };
        }

        if step.step_kind != StepKind::Conditional {
            let outputs = Value::Object(run.outputs.clone());
            if let Some(rule) = step.conditions.iter().find(|rule| !rule.evaluate(&outputs)) {
                return Prepared::Skip {
                    reason: format!("condition '{}' not met", rule.id),
                    error: None,
                };
            }
        }

        match self.build_input(step, run).await {
            Ok(input) => Prepared::Ready { input },
            Err(e) => Prepared::Fail {
                error: ExecutionError::from_chain_error(&e).at_step(step.step_number, step.agent_kind),
            },
        }
    }

    /// `{context, handoff, dependencies, <mapped fields>}`
    async fn build_input(&self, step: &ChainStepDefinition, run: &RunState) -> Result<Value> {
        let received = self
            .protocol
            .receive_handoff(run.execution_id, step.step_number, step.agent_kind)
            .await?;

        let dependencies: Map<String, Value> = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                let key = format!("step_{}", dep);
                run.outputs.get(&key).map(|output| (key, output.clone()))
            })
            .collect();

        let mut input = Map::new();
        input.insert("context".to_string(), run.context.clone());
        input.insert(
            "handoff".to_string(),
            received.as_ref().map(|h| h.data.clone()).unwrap_or(Value::Null),
        );
        if let Some(handoff) = &received {
            input.insert("handoff_hints".to_string(), json!(handoff.hints));
        }
        input.insert("dependencies".to_string(), Value::Object(dependencies));

        let outputs = Value::Object(run.outputs.clone());
        for (target, source) in &step.input_mapping {
            match lookup_path(&outputs, source) {
                Some(value) => {
                    input.insert(target.clone(), value.clone());
                }
                None => warn!(
                    execution_id = %run.execution_id,
                    step = step.step_number,
                    source = %source,
                    "input mapping source not found"
                ),
            }
        }
        Ok(Value::Object(input))
    }

    /// Turn a prepared step into a concluded one, running it if ready
    async fn conclude(
        &self,
        execution_id: Uuid,
        step: &ChainStepDefinition,
        prepared: Prepared,
        outputs: &Value,
        definition: &ChainDefinition,
    ) -> Concluded {
        match prepared {
            Prepared::Skip { reason, error } => {
                debug!(%execution_id, step = step.step_number, reason = %reason, "step skipped");
                Concluded {
                    result: StepExecutionResult::skipped(step.step_number, &step.step_name, step.agent_kind, reason),
                    output: None,
                    failure: error,
                }
            }
            Prepared::Fail { error } => Concluded {
                result: StepExecutionResult::failed(
                    step.step_number,
                    &step.step_name,
                    step.agent_kind,
                    error.message.clone(),
                ),
                output: None,
                failure: Some(error),
            },
            Prepared::Ready { input } => self.run_step(execution_id, step, input, outputs, definition).await,
        }
    }

    async fn run_step(
        &self,
        execution_id: Uuid,
        step: &ChainStepDefinition,
        input: Value,
        outputs: &Value,
        definition: &ChainDefinition,
    ) -> Concluded {
        let started_at = Utc::now();
        self.mark(&execution_id, step.step_number, StepStatus::Running);

        match &step.step_kind {
            StepKind::AgentExecution => self.run_agent(execution_id, step, &input, definition, started_at).await,
            StepKind::Conditional => {
                let evaluations: Vec<Value> = step
                    .conditions
                    .iter()
                    .map(|rule| {
                        let result = rule.evaluate_detailed(outputs);
                        json!({"rule_id": result.rule_id, "passed": result.passed, "explanation": result.explanation})
                    })
                    .collect();
                let met = evaluations.iter().all(|e| e["passed"] == json!(true));
                let output = json!({"conditions_met": met, "evaluations": evaluations});
                Concluded {
                    result: StepExecutionResult::completed(step.step_number, &step.step_name, step.agent_kind, output.clone())
                        .timed(started_at),
                    output: Some(AgentOutput::new(output)),
                    failure: None,
                }
            }
            StepKind::Wait { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                let output = json!({"waited_ms": duration_ms});
                Concluded {
                    result: StepExecutionResult::completed(step.step_number, &step.step_name, step.agent_kind, output.clone())
                        .timed(started_at),
                    output: Some(AgentOutput::new(output)),
                    failure: None,
                }
            }
        }
    }

    fn retries_for(&self, step: &ChainStepDefinition, definition: &ChainDefinition) -> u32 {
        step.retry_count
            .or(definition.max_retries)
            .unwrap_or(self.config.default_step_retries)
    }

    fn step_timeout(&self, step: &ChainStepDefinition) -> Duration {
        Duration::from_secs(step.timeout_secs.unwrap_or(self.config.default_step_timeout_secs))
    }

    async fn invoke(&self, step: &ChainStepDefinition, input: &Value) -> std::result::Result<AgentOutput, AgentError> {
        let call = self.invoker.execute(step.agent_kind, input, &step.agent_config);
        if !self.config.enforce_step_timeouts {
            return call.await;
        }
        let timeout = self.step_timeout(step);
        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::transient(format!(
                "step timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn run_agent(
        &self,
        execution_id: Uuid,
        step: &ChainStepDefinition,
        input: &Value,
        definition: &ChainDefinition,
        started_at: DateTime<Utc>,
    ) -> Concluded {
        let max_attempts = self.retries_for(step, definition) + 1;
        let mut attempts = 0;

        let last_error = loop {
            attempts += 1;
            self.events.publish(ChainEvent::StepStarted {
                execution_id,
                step_number: step.step_number,
                agent_kind: step.agent_kind,
                attempt: attempts,
            });
            debug!(%execution_id, step = step.step_number, agent = %step.agent_kind, attempt = attempts, "invoking agent");

            match self.invoke(step, input).await {
                Ok(mut output) => {
                    output.output = apply_output_mapping(output.output, &step.output_mapping);
                    let mut result = StepExecutionResult::completed(
                        step.step_number,
                        &step.step_name,
                        step.agent_kind,
                        output.output.clone(),
                    )
                    .timed(started_at);
                    result.cost = output.cost;
                    result.confidence = output.confidence;
                    result.quality_score = output.quality_score;
                    result.attempts = attempts;

                    let limit = self.step_timeout(step);
                    if !self.config.enforce_step_timeouts && result.execution_time_ms > limit.as_millis() as u64 {
                        warn!(%execution_id, step = step.step_number, elapsed_ms = result.execution_time_ms, "step exceeded its timeout");
                    }
                    return Concluded {
                        result,
                        output: Some(output),
                        failure: None,
                    };
                }
                Err(e) if e.retryable && attempts < max_attempts => {
                    let delay = self.backoff(attempts);
                    warn!(
                        %execution_id,
                        step = step.step_number,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient agent failure, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break e,
            }
        };

        // Budget left only when a permanent error cut the retries short
        let recoverable = attempts < max_attempts;
        let error = ChainError::StepExecution {
            step_number: step.step_number,
            agent_kind: step.agent_kind,
            message: last_error.message.clone(),
            recoverable,
        };
        let mut result = StepExecutionResult::failed(step.step_number, &step.step_name, step.agent_kind, last_error.message)
            .timed(started_at);
        result.attempts = attempts;

        Concluded {
            result,
            output: None,
            failure: Some(ExecutionError::from_chain_error(&error)),
        }
    }

    /// Fold a concluded step into the run: events, storage, handoff, outputs
    async fn absorb(
        &self,
        definition: &ChainDefinition,
        context: &ChainRunContext,
        run: &mut RunState,
        concluded: Concluded,
        parallel: bool,
    ) -> Result<()> {
        let Concluded { result, output, failure } = concluded;
        let execution_id = run.execution_id;
        let step_number = result.step_number;
        self.mark(&execution_id, step_number, result.status);

        match result.status {
            StepStatus::Skipped => {
                self.events.publish(ChainEvent::StepSkipped {
                    execution_id,
                    step_number,
                    reason: result
                        .output
                        .as_ref()
                        .and_then(|o| o["reason"].as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
                if let Some(error) = failure {
                    if error.category == ErrorCategory::Dependency {
                        run.unsatisfied.insert(step_number);
                    }
                    run.errors.push(error);
                }
            }
            StepStatus::Failed => {
                let mut error = failure.unwrap_or_else(|| {
                    ExecutionError::new(
                        ErrorCategory::StepExecution,
                        result.error.clone().unwrap_or_default(),
                        false,
                    )
                    .at_step(step_number, result.agent_kind)
                });
                if parallel {
                    error.recoverable = false;
                    error.message = format!("parallel execution: {}", error.message);
                }
                warn!(%execution_id, step = step_number, agent = %result.agent_kind, error = %error.message, "step failed");
                self.events.publish(ChainEvent::StepFailed {
                    execution_id,
                    step_number,
                    agent_kind: result.agent_kind,
                    error: error.message.clone(),
                    recoverable: error.recoverable,
                });
                run.errors.push(error);
            }
            _ => {
                info!(
                    %execution_id,
                    step = step_number,
                    agent = %result.agent_kind,
                    elapsed_ms = result.execution_time_ms,
                    cost = result.cost,
                    "step completed"
                );
                self.events.publish(ChainEvent::StepCompleted {
                    execution_id,
                    step_number,
                    agent_kind: result.agent_kind,
                    execution_time_ms: result.execution_time_ms,
                    cost: result.cost,
                });
                if let Some(output) = output {
                    self.hand_off(definition, context, run, &result, &output).await?;
                    run.outputs.insert(format!("step_{}", step_number), output.output.clone());
                    run.outputs.insert(result.step_name.clone(), output.output);
                }
            }
        }

        self.storage
            .record_step(ChainStepRecord::new(execution_id, result.clone()))
            .await?;
        run.results.push(result);
        Ok(())
    }

    async fn hand_off(
        &self,
        definition: &ChainDefinition,
        context: &ChainRunContext,
        run: &mut RunState,
        result: &StepExecutionResult,
        output: &AgentOutput,
    ) -> Result<()> {
        let execution_id = run.execution_id;
        if self.protocol.next_step(&execution_id, result.step_number).is_none() {
            return Ok(());
        }

        let handoff_context = HandoffContext {
            execution_id: Some(execution_id),
            campaign_id: context.campaign_id.clone(),
            chain_id: Some(definition.id.clone()),
            preserved_state: run.context.as_object().cloned().unwrap_or_default(),
            performance_hints: HashMap::new(),
        };
        let handoff = self
            .protocol
            .create_handoff(execution_id, result.step_number, result.agent_kind, output, handoff_context)
            .await?;

        match handoff.handoff {
            Some(created) if handoff.success => {
                self.events.publish(ChainEvent::HandoffCreated {
                    execution_id,
                    handoff_id: created.id,
                    from_step: created.from_step,
                    to_step: created.to_step,
                    payload_bytes: created.metadata.payload_bytes,
                });
                run.handoff_ids.push(created.id);
            }
            _ => {
                let reason = handoff.validation.errors.join("; ");
                let error = ChainError::HandoffValidation {
                    errors: handoff.validation.errors.clone(),
                };
                let mut captured = ExecutionError::from_chain_error(&error);
                captured.step_number = Some(handoff.next_step);
                captured.agent_kind = Some(handoff.next_agent);
                run.errors.push(captured);

                if run.result(handoff.next_step).is_none() {
                    run.handoff_failures.insert(handoff.next_step, reason);
                } else {
                    warn!(%execution_id, to_step = handoff.next_step, "handoff rejected after destination step already ran");
                }
            }
        }
        Ok(())
    }

    fn mark(&self, execution_id: &Uuid, step_number: u32, status: StepStatus) {
        if let Some(mut state) = self.active.get_mut(execution_id) {
            state.step_states.insert(step_number, status);
        }
    }

    async fn finalize(
        &self,
        definition: &ChainDefinition,
        mut record: ChainExecutionRecord,
        run: RunState,
        started_at: DateTime<Utc>,
    ) -> Result<ChainExecutionResult> {
        let execution_id = run.execution_id;
        let completed_at = Utc::now();
        let total_time_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

        let evaluation = definition.success_criteria.evaluate(&run.results);
        let status = if run.halted || !evaluation.passed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        let success = status == ExecutionStatus::Completed;

        let total_cost: f64 = run.results.iter().map(|r| r.cost).sum();
        let succeeded = run.results.iter().filter(|r| r.success).count();
        let success_rate = if run.results.is_empty() {
            0.0
        } else {
            succeeded as f64 / run.results.len() as f64
        };
        let qualities: Vec<f64> = run.results.iter().filter_map(|r| r.quality_score).collect();
        let mean_quality = if qualities.is_empty() {
            None
        } else {
            Some(qualities.iter().sum::<f64>() / qualities.len() as f64)
        };
        let mut agents_used: Vec<AgentKind> = Vec::new();
        for result in run.results.iter().filter(|r| r.status == StepStatus::Completed) {
            if !agents_used.contains(&result.agent_kind) {
                agents_used.push(result.agent_kind);
            }
        }

        if let Some(minutes) = definition.timeout_minutes {
            if total_time_ms > u64::from(minutes) * 60_000 {
                warn!(%execution_id, total_time_ms, timeout_minutes = minutes, "chain exceeded its advisory timeout");
            }
        }
        if let Some(budget) = definition.max_budget {
            if total_cost > budget {
                warn!(%execution_id, total_cost, budget, "chain exceeded its budget");
            }
        }

        record.status = status;
        record.total_cost = total_cost;
        record.total_time_ms = total_time_ms;
        record.success_rate = success_rate;
        record.mean_quality = mean_quality;
        record.agents_used = agents_used.clone();
        record.errors = run.errors.clone();
        record.completed_at = Some(completed_at);
        let record = self.storage.update_execution(record).await?;

        if let Some(template_id) = &definition.template_id {
            if let Err(e) =
                record_template_usage(self.storage.as_ref(), template_id, success, total_cost, total_time_ms).await
            {
                warn!(%execution_id, template_id = %template_id, "could not update template statistics: {}", e);
            }
        }

        self.release(&execution_id);
        self.events.publish(ChainEvent::ExecutionFinished {
            execution_id,
            status,
            success,
            total_time_ms,
            at: completed_at,
        });
        info!(
            %execution_id,
            status = ?status,
            steps = run.results.len(),
            failed = run.results.iter().filter(|r| r.status == StepStatus::Failed).count(),
            total_cost,
            total_time_ms,
            "chain execution finished"
        );

        Ok(ChainExecutionResult {
            execution_id,
            execution_number: record.execution_number,
            chain_id: definition.id.clone(),
            status,
            success,
            step_results: run.results,
            outputs: run.outputs,
            errors: run.errors,
            criteria_failures: evaluation.failures,
            handoff_ids: run.handoff_ids,
            total_cost,
            total_time_ms,
            success_rate,
            mean_quality,
            agents_used,
            started_at,
            completed_at,
        })
    }

    /// Mark an execution FAILED after a system error
    async fn abort(&self, mut record: ChainExecutionRecord, run: RunState, started_at: DateTime<Utc>, cause: &ChainError) {
        let execution_id = run.execution_id;
        let completed_at = Utc::now();
        let total_time_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        error!(%execution_id, "chain execution aborted: {}", cause);

        record.status = ExecutionStatus::Failed;
        record.total_cost = run.results.iter().map(|r| r.cost).sum();
        record.total_time_ms = total_time_ms;
        record.errors = run.errors;
        record.errors.push(ExecutionError::from_chain_error(cause));
        record.completed_at = Some(completed_at);
        if let Err(e) = self.storage.update_execution(record).await {
            error!(%execution_id, "could not persist failed execution: {}", e);
        }

        self.release(&execution_id);
        self.events.publish(ChainEvent::ExecutionFinished {
            execution_id,
            status: ExecutionStatus::Failed,
            success: false,
            total_time_ms,
            at: completed_at,
        });
    }

    fn release(&self, execution_id: &Uuid) {
        self.protocol.release(execution_id);
        self.active.remove(execution_id);
    }
}

/// Rename top-level output fields; non-object outputs pass through
fn apply_output_mapping(output: Value, mapping: &HashMap<String, String>) -> Value {
    if mapping.is_empty() {
        return output;
    }
    match output {
        Value::Object(mut map) => {
            for (field, renamed) in mapping {
                if let Some(value) = map.remove(field) {
                    map.insert(renamed.clone(), value);
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{AgentDispatcher, ChainAgent};
    use crate::engine::storage::InMemoryChainStorage;
    use crate::models::{Rule, SuccessCriteria};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds
    struct FlakyAgent {
        kind: AgentKind,
        failures: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl ChainAgent for FlakyAgent {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        async fn execute(
            &self,
            _input: &Value,
            _config: &HashMap<String, Value>,
        ) -> std::result::Result<AgentOutput, AgentError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AgentError {
                    message: "flaky".to_string(),
                    retryable: self.retryable,
                });
            }
            Ok(AgentOutput::new(json!({"title": "ok", "body": "done"})).with_cost(0.1).with_quality(0.9))
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.orchestrator.retry_backoff_ms = 0;
        config
    }

    fn orchestrator_with(dispatcher: AgentDispatcher) -> (ChainOrchestrator, Arc<InMemoryChainStorage>) {
        let registry = Arc::new(CapabilityRegistry::with_defaults());
        let storage = Arc::new(InMemoryChainStorage::new());
        let orchestrator = ChainOrchestrator::new(fast_config(), registry, Arc::new(dispatcher), storage.clone());
        (orchestrator, storage)
    }

    fn simulated() -> (ChainOrchestrator, Arc<InMemoryChainStorage>) {
        orchestrator_with(AgentDispatcher::simulated(&CapabilityRegistry::with_defaults()))
    }

    fn failing(kind: AgentKind, failures: u32, retryable: bool) -> AgentDispatcher {
        AgentDispatcher::simulated(&CapabilityRegistry::with_defaults()).with_agent(Arc::new(FlakyAgent {
            kind,
            failures: AtomicU32::new(failures),
            retryable,
        }))
    }

    fn three_steps(mode: ExecutionMode) -> ChainDefinition {
        ChainDefinition::new("three", "Three steps", mode)
            .with_step(ChainStepDefinition::new(1, "trends", AgentKind::TrendAnalysis))
            .with_step(ChainStepDefinition::new(2, "content", AgentKind::Content).depends_on([1]))
            .with_step(ChainStepDefinition::new(3, "social", AgentKind::SocialMedia))
    }

    #[tokio::test]
    async fn test_sequential_success_merges_outputs_and_hands_off() {
        let (orchestrator, storage) = simulated();
        let definition = three_steps(ExecutionMode::Sequential);
        let result = orchestrator
            .execute_chain(&definition, ChainRunContext::new().with_trigger("topic", json!("oat milk")))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.success);
        assert_eq!(result.step_results.len(), 3);
        assert!(result.outputs.contains_key("step_2"));
        assert!(result.outputs.contains_key("content"));
        assert_eq!(result.handoff_ids.len(), 2);
        assert!(result.outputs["step_2"]["title"].as_str().unwrap().contains("oat milk"));
        assert!(orchestrator.active_execution(&result.execution_id).is_none());

        let record = storage.get_execution(&result.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.agents_used.len(), 3);
        assert_eq!(storage.list_steps(&result.execution_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_without_retries_halts_chain() {
        let (orchestrator, _) = orchestrator_with(failing(AgentKind::Content, 1, true));
        let mut definition = three_steps(ExecutionMode::Sequential);
        definition.steps[1] = ChainStepDefinition::new(2, "content", AgentKind::Content).with_retries(0);

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_steps().len(), 1);
        assert!(result.step(3).map_or(true, |s| s.status == StepStatus::Skipped));
        assert!(!result.errors.is_empty());
        assert!(!result.errors[0].recoverable);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (orchestrator, _) = orchestrator_with(failing(AgentKind::Content, 2, true));
        let mut definition = three_steps(ExecutionMode::Sequential);
        definition.steps[1] = ChainStepDefinition::new(2, "content", AgentKind::Content).with_retries(2);

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.step(2).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_with_budget_left_continues() {
        let (orchestrator, _) = orchestrator_with(failing(AgentKind::Content, 1, false));
        let mut definition = three_steps(ExecutionMode::Sequential);
        definition.steps[1] = ChainStepDefinition::new(2, "content", AgentKind::Content).with_retries(3);

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(2).unwrap().attempts, 1);
        assert!(result.errors[0].recoverable);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Completed);
        // empty criteria: any failed step fails the run
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_min_steps_completed_tolerates_one_failure() {
        let (orchestrator, _) = orchestrator_with(failing(AgentKind::Content, 5, true));
        let definition = ChainDefinition::new("tolerant", "Tolerant", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "trends", AgentKind::TrendAnalysis))
            .with_step(
                ChainStepDefinition::new(2, "content", AgentKind::Content)
                    .with_retries(0)
                    .continue_on_failure(),
            )
            .with_step(ChainStepDefinition::new(3, "seo", AgentKind::Seo))
            .with_success_criteria(SuccessCriteria {
                min_steps_completed: Some(2),
                ..Default::default()
            });

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.failed_steps().len(), 1);
        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_false_condition_skips_step() {
        let (orchestrator, _) = simulated();
        let definition = ChainDefinition::new("cond", "Conditional", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "seo", AgentKind::Seo))
            .with_step(
                ChainStepDefinition::new(2, "ads", AgentKind::Advertising)
                    .with_condition(Rule::field_greater_than("volume", "step_1.search_volume", 1_000_000.0)),
            )
            .with_step(
                ChainStepDefinition::new(3, "content", AgentKind::Content)
                    .with_condition(Rule::field_exists("has_keywords", "seo.keywords")),
            );

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(2).unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Completed);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(!result.outputs.contains_key("step_2"));
    }

    #[tokio::test]
    async fn test_parallel_failure_does_not_cancel_siblings() {
        let (orchestrator, _) = orchestrator_with(failing(AgentKind::Seo, 9, true));
        let definition = ChainDefinition::new("par", "Parallel", ExecutionMode::Parallel)
            .with_max_retries(0)
            .with_step(ChainStepDefinition::new(1, "trends", AgentKind::TrendAnalysis))
            .with_step(ChainStepDefinition::new(2, "seo", AgentKind::Seo))
            .with_step(ChainStepDefinition::new(3, "content", AgentKind::Content).depends_on([1, 2]))
            .with_step(ChainStepDefinition::new(4, "email", AgentKind::Email).depends_on([1]));

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(result.step(2).unwrap().status, StepStatus::Failed);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step(4).unwrap().status, StepStatus::Completed);
        assert_eq!(result.status, ExecutionStatus::Failed);

        let parallel_error = result
            .errors
            .iter()
            .find(|e| e.category == ErrorCategory::StepExecution)
            .unwrap();
        assert!(!parallel_error.recoverable);
        assert!(result.errors.iter().any(|e| e.category == ErrorCategory::Dependency));
    }

    #[tokio::test]
    async fn test_dependency_skips_propagate_downstream() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let (orchestrator, _) = simulated();
            let definition = ChainDefinition::new("cascade", "Cascade", mode)
                .with_step(
                    ChainStepDefinition::new(1, "seo", AgentKind::Seo)
                        .with_retries(0)
                        .with_config("simulate_failure", json!("permanent"))
                        .continue_on_failure(),
                )
                .with_step(ChainStepDefinition::new(2, "content", AgentKind::Content).depends_on([1]))
                .with_step(ChainStepDefinition::new(3, "social", AgentKind::SocialMedia).depends_on([2]))
                .with_success_criteria(SuccessCriteria {
                    min_steps_completed: Some(1),
                    ..Default::default()
                });

            let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
            assert_eq!(result.step(1).unwrap().status, StepStatus::Failed, "{:?}", mode);
            assert_eq!(result.step(2).unwrap().status, StepStatus::Skipped, "{:?}", mode);
            assert_eq!(result.step(3).unwrap().status, StepStatus::Skipped, "{:?}", mode);
            assert!(!result.outputs.contains_key("step_3"));
            let dependency_errors: Vec<Option<u32>> = result
                .errors
                .iter()
                .filter(|e| e.category == ErrorCategory::Dependency)
                .map(|e| e.step_number)
                .collect();
            assert_eq!(dependency_errors, vec![Some(2), Some(3)], "{:?}", mode);
        }
    }

    #[tokio::test]
    async fn test_condition_skip_still_satisfies_dependents() {
        let (orchestrator, _) = simulated();
        let definition = ChainDefinition::new("cond-dep", "Condition dependency", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "seo", AgentKind::Seo))
            .with_step(
                ChainStepDefinition::new(2, "ads", AgentKind::Advertising)
                    .depends_on([1])
                    .with_condition(Rule::field_greater_than("volume", "step_1.search_volume", 1_000_000.0)),
            )
            .with_step(ChainStepDefinition::new(3, "email", AgentKind::Email).depends_on([2]));

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(2).unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step(3).unwrap().status, StepStatus::Completed);
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_adaptive_prefers_fast_ready_steps() {
        let (orchestrator, _) = simulated();
        let definition = ChainDefinition::new("adaptive", "Adaptive", ExecutionMode::Adaptive)
            .with_step(ChainStepDefinition::new(1, "design", AgentKind::Design))
            .with_step(ChainStepDefinition::new(2, "seo", AgentKind::Seo))
            .with_step(ChainStepDefinition::new(3, "social", AgentKind::SocialMedia).depends_on([1]));

        assert_eq!(orchestrator.adaptive_order(&definition).unwrap(), vec![2, 1, 3]);
        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        let order: Vec<u32> = result.step_results.iter().map(|r| r.step_number).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_handoff_fails_destination_step() {
        struct ListAgent;

        #[async_trait]
        impl ChainAgent for ListAgent {
            fn kind(&self) -> AgentKind {
                AgentKind::TrendAnalysis
            }

            async fn execute(
                &self,
                _input: &Value,
                _config: &HashMap<String, Value>,
            ) -> std::result::Result<AgentOutput, AgentError> {
                Ok(AgentOutput::new(json!(["a", "b"])))
            }
        }

        let dispatcher = AgentDispatcher::simulated(&CapabilityRegistry::with_defaults()).with_agent(Arc::new(ListAgent));
        let (orchestrator, _) = orchestrator_with(dispatcher);
        let definition = three_steps(ExecutionMode::Sequential);

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(result.step(2).unwrap().status, StepStatus::Failed);
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::HandoffValidation && e.step_number == Some(2)));
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_timeout_is_enforced_when_enabled() {
        let registry = Arc::new(CapabilityRegistry::with_defaults());
        let mut config = fast_config();
        config.orchestrator.enforce_step_timeouts = true;
        let orchestrator = ChainOrchestrator::new(
            config,
            registry.clone(),
            Arc::new(AgentDispatcher::simulated(&registry)),
            Arc::new(InMemoryChainStorage::new()),
        );
        let definition = ChainDefinition::new("slow", "Slow", ExecutionMode::Sequential).with_step(
            ChainStepDefinition::new(1, "slow", AgentKind::Content)
                .with_config("simulated_latency_ms", json!(3_000))
                .with_timeout_secs(1)
                .with_retries(0),
        );

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert_eq!(result.step(1).unwrap().status, StepStatus::Failed);
        assert!(result.step(1).unwrap().error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_mappings_and_events() {
        let (orchestrator, _) = simulated();
        let mut events = orchestrator.events().subscribe();
        let definition = ChainDefinition::new("map", "Mapping", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "seo", AgentKind::Seo).with_output_mapping("keywords", "seo_keywords"))
            .with_step(
                ChainStepDefinition::new(2, "content", AgentKind::Content)
                    .depends_on([1])
                    .with_input_mapping("keywords", "step_1.seo_keywords"),
            );

        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await.unwrap();
        assert!(result.outputs["step_1"].get("seo_keywords").is_some());
        assert!(result.outputs["step_1"].get("keywords").is_none());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.first(), Some(&"execution_started"));
        assert_eq!(names.last(), Some(&"execution_finished"));
        assert!(names.contains(&"handoff_created"));
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected_before_running() {
        let (orchestrator, storage) = simulated();
        let definition = ChainDefinition::new("bad", "Bad", ExecutionMode::Sequential)
            .with_step(ChainStepDefinition::new(1, "a", AgentKind::Content).depends_on([7]));
        let result = orchestrator.execute_chain(&definition, ChainRunContext::default()).await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, ChainError::UnknownDependency { .. }));
        assert!(storage.list_executions(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_output_mapping_renames_fields() {
        let mut mapping = HashMap::new();
        mapping.insert("a".to_string(), "b".to_string());
        assert_eq!(apply_output_mapping(json!({"a": 1, "c": 2}), &mapping), json!({"b": 1, "c": 2}));
        assert_eq!(apply_output_mapping(json!([1]), &mapping), json!([1]));
    }
}
