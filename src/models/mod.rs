// Core domain models for Agent Chain
// Pure data structures: no I/O, no async

//! # Domain Models Module
//!
//! This module contains the data model of the chain engine. Everything here is
//! plain data plus validation and small pure helpers; the behaviour lives in
//! `engine/`.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization
//! This `mod.rs` file serves as the **module root** for the `models` directory.
//! Each `pub mod` declaration includes one file as a submodule, and the
//! `pub use` statements at the bottom flatten the API so users can write
//! `agent_chain::models::ChainDefinition`.

// Agent kinds, capabilities and the invocation boundary types
pub mod agent;

// Rules used for step conditions and custom success criteria
pub mod rule;

// Chain and step definitions, success criteria, validation
pub mod chain;

// Run state, step results, captured errors, persisted records
pub mod execution;

// Handoff messages, channels and transfer metrics
pub mod handoff;

// Templates and recommendations
pub mod template;

// Derived performance artifacts
pub mod performance;

pub use agent::{AgentCapability, AgentError, AgentKind, AgentOutput};

pub use rule::{lookup_path, Rule, RuleCondition, RuleEvaluationResult};

pub use chain::{
    ChainDefinition, ChainKind, ChainStepDefinition, CriteriaEvaluation, ExecutionMode, StepKind,
    SuccessCriteria,
};

pub use execution::{
    ChainExecutionRecord, ChainExecutionResult, ChainExecutionState, ChainStepRecord, ErrorCategory,
    ExecutionError, ExecutionStatus, StepExecutionResult, StepStatus,
};

pub use handoff::{
    ChannelMetrics, ChannelProtocol, CommunicationChannel, HandoffContext, HandoffData, HandoffKind,
    HandoffMetadata, HandoffPayload, HandoffResult, HandoffValidation, OptimizationRecord,
};

pub use template::{ChainRecommendation, ChainTemplate, RecommendationSource, TemplateStats};

pub use performance::{
    AgentBreakdown, Benchmark, BenchmarkDimension, Bottleneck, BottleneckLocation, BottleneckThresholds,
    BottleneckType, ChainPerformanceSummary, ExecutionSpread, PerformanceMetrics, Recommendation,
    RecommendationCategory, Severity, StepMetric, TimeRange, Trend, TrendDirection,
};
