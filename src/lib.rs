// Agent Chain - Rust Edition
// A multi-agent chain orchestration engine with typed handoffs

//! # Agent Chain Library
//!
//! This is the library crate for Agent Chain, an engine that runs declarative
//! multi-step workflows ("chains") across several autonomous agents. This file
//! is the **library root** and defines the public API that host processes use.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`ChainDefinition`] / [`ChainStepDefinition`]: what a chain is made of
//! - [`StepExecutionResult`] / [`ChainExecutionResult`]: the execution trace
//! - [`HandoffData`]: the validated message passed between two steps
//! - [`ChainTemplate`]: a reusable definition with historical statistics
//!
//! ### Engines (`engine`)
//! - [`CapabilityRegistry`]: static table of agent kinds (leaf)
//! - [`ChainDefinitionEngine`]: goal → template match or synthesized chain
//! - [`AgentCommunicationProtocol`]: handoff creation, validation, optimization
//! - [`ChainOrchestrator`]: sequential / parallel / adaptive execution
//! - [`ChainPerformanceAnalyzer`]: bottlenecks, recommendations, trends, benchmarks
//!
//! Control flow: definition engine → orchestrator → (protocol between each
//! pair of steps) → analyzer.
//!
//! **Usage Example:**
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_chain::{
//!     AgentDispatcher, CapabilityRegistry, ChainDefinitionEngine, ChainGoal,
//!     ChainOrchestrator, ChainRunContext, EngineConfig, InMemoryChainStorage,
//! };
//!
//! # async fn demo() -> agent_chain::Result<()> {
//! let config = EngineConfig::default();
//! let registry = Arc::new(CapabilityRegistry::with_defaults());
//! let storage = Arc::new(InMemoryChainStorage::default());
//! let definitions = ChainDefinitionEngine::new(registry.clone(), storage.clone());
//! definitions.install_predefined_templates().await?;
//!
//! let recommendation = definitions
//!     .recommend_chain(&ChainGoal::new("increase social engagement"), None, None)
//!     .await?;
//!
//! let dispatcher = Arc::new(AgentDispatcher::simulated(&registry));
//! let orchestrator = ChainOrchestrator::new(config, registry, dispatcher, storage);
//! let result = orchestrator
//!     .execute_chain(&recommendation.definition, ChainRunContext::default())
//!     .await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use agent_chain::engine::orchestrator::ChainOrchestrator`,
//! users can write `use agent_chain::ChainOrchestrator`.

// Layered engine configuration (defaults, files, environment)
pub mod config;

// Core domain models (pure data, no I/O)
pub mod models;

// Engine implementations: registry, storage, definition, protocol, orchestrator, analyzer
pub mod engine;

pub use config::{AnalyzerConfig, EngineConfig, LoggingConfig, OrchestratorConfig, ProtocolConfig};

pub use models::{
    AgentCapability, AgentError, AgentKind, AgentOutput, Benchmark, BenchmarkDimension,
    Bottleneck, BottleneckThresholds, BottleneckType, ChainDefinition, ChainExecutionRecord,
    ChainExecutionResult, ChainExecutionState, ChainKind, ChainPerformanceSummary,
    ChainRecommendation, ChainStepDefinition, ChainStepRecord, ChainTemplate,
    ChannelMetrics, CommunicationChannel, ErrorCategory, ExecutionError, ExecutionMode,
    ExecutionStatus, HandoffContext, HandoffData, HandoffKind, HandoffMetadata,
    HandoffPayload, HandoffResult, HandoffValidation, OptimizationRecord,
    PerformanceMetrics, Recommendation, RecommendationSource, Rule, RuleCondition,
    Severity, StepExecutionResult, StepKind, StepStatus, SuccessCriteria, TemplateStats,
    TimeRange, Trend, TrendDirection,
};

pub use engine::{
    analyzer::ChainPerformanceAnalyzer,
    definition::{ChainConstraints, ChainDefinitionEngine, ChainGoal, ChainPreferences},
    events::{ChainEvent, EventBus},
    orchestrator::{ChainOrchestrator, ChainRunContext},
    protocol::{AgentCommunicationProtocol, ReceivedHandoff},
    registry::{AgentDispatcher, AgentInvoker, CapabilityRegistry, ChainAgent, SimulatedAgent},
    storage::{ChainStorage, InMemoryChainStorage},
};

use thiserror::Error;

/// Error taxonomy for chain definition, execution and analysis
///
/// Each variant belongs to one [`ErrorCategory`] so callers can tell "retry the
/// whole chain" apart from "investigate configuration".
#[derive(Error, Debug)]
pub enum ChainError {
    /// A goal or definition cannot produce a runnable chain
    #[error("Invalid chain definition: {0}")]
    Definition(String),

    /// The dependency graph contains a cycle through the listed nodes
    #[error("Cyclic dependency detected between: {steps:?}")]
    CyclicDependency { steps: Vec<String> },

    /// A step depends on a step number that does not exist in the definition
    #[error("Step {step} depends on unknown step {depends_on}")]
    UnknownDependency { step: u32, depends_on: u32 },

    /// Two steps share the same step number
    #[error("Duplicate step number: {0}")]
    DuplicateStep(u32),

    /// A step's dependencies could not be satisfied
    #[error("Step {step} has unsatisfied dependencies: {missing:?}")]
    DependencyUnsatisfied { step: u32, missing: Vec<u32> },

    /// An agent invocation failed after all permitted attempts
    #[error("Step {step_number} ({agent_kind}) failed: {message}")]
    StepExecution {
        step_number: u32,
        agent_kind: AgentKind,
        message: String,
        recoverable: bool,
    },

    /// A handoff payload was rejected by validation
    #[error("Handoff validation failed: {}", .errors.join("; "))]
    HandoffValidation { errors: Vec<String> },

    /// A record could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error when invalid input is provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Internal(err.to_string())
    }
}

impl ChainError {
    /// Which part of the error taxonomy this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChainError::Definition(_)
            | ChainError::CyclicDependency { .. }
            | ChainError::UnknownDependency { .. }
            | ChainError::DuplicateStep(_)
            | ChainError::InvalidInput(_) => ErrorCategory::Definition,
            ChainError::DependencyUnsatisfied { .. } => ErrorCategory::Dependency,
            ChainError::StepExecution { .. } => ErrorCategory::StepExecution,
            ChainError::HandoffValidation { .. } => ErrorCategory::HandoffValidation,
            ChainError::NotFound(_)
            | ChainError::Storage(_)
            | ChainError::Serialization(_)
            | ChainError::Config(_)
            | ChainError::Internal(_) => ErrorCategory::System,
        }
    }

    /// Whether re-running the chain without changing its configuration may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ChainError::StepExecution { recoverable, .. } => *recoverable,
            ChainError::DependencyUnsatisfied { .. } => true,
            ChainError::Storage(_) => true,
            _ => false,
        }
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, ChainError>;
