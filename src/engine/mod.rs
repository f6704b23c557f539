// Agent Chain Engine
// Execution engines that sit between the domain models and the host process

//! # Agent Chain Engine Module
//!
//! This module contains the engines that turn chain definitions into running
//! executions and execution records into analysis. The engine is the layer
//! between the domain models and whatever host embeds the library.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: pure data and validation (in `models/`)
//! - **Engine Layer**: scheduling, handoffs, persistence, analysis (this module)
//! - **Host**: the `chainctl` binary or any application using the library
//!
//! Construction order: the capability registry first (read-only afterwards),
//! then storage, then the engines that share both through `Arc`.
//!
//! ## Engine Components
//!
//! ### Capability Registry (`registry` module)
//! - Static table of agent kinds: cost, latency, reliability, keywords
//! - Pair compatibility and agent dependency ordering
//! - The agent invocation boundary and its dispatcher
//!
//! ### Definition Engine (`definition` module)
//! - Matches goals against templates, or synthesizes a chain from keywords
//! - Maintains template usage statistics
//!
//! ### Communication Protocol (`protocol` module)
//! - Validates, optimizes, encodes and stores handoffs between steps
//! - Negotiates per-pair channels and tracks transfer metrics
//!
//! ### Orchestrator (`orchestrator` module)
//! - Runs chains in sequential, parallel or adaptive mode
//! - Retries, conditions, dependency skips, success criteria
//!
//! ### Performance Analyzer (`analyzer` module)
//! - Per-execution metrics, bottlenecks, recommendations, trends, benchmarks
//!
//! ### Supporting modules
//! - `graph`: topological sort and dependency waves
//! - `storage`: persistence boundary plus the in-memory backend
//! - `events`: broadcast bus for execution lifecycle events
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for a clean API

/// Dependency graph algorithms
pub mod graph;

/// Agent capability registry and agent dispatch
///
/// Contains:
/// - CapabilityRegistry with the default agent table
/// - ChainAgent / AgentInvoker traits
/// - AgentDispatcher and the SimulatedAgent used by the CLI and tests
pub mod registry;

/// Storage abstraction layer
///
/// Contains:
/// - ChainStorage trait definition
/// - In-memory storage implementation
pub mod storage;

/// Event bus for execution lifecycle events
pub mod events;

/// Goal-driven chain recommendation and template management
pub mod definition;

/// Agent communication protocol
///
/// Contains:
/// - Handoff creation and reception
/// - Payload validation and optimization
/// - Channel negotiation and transfer metrics
pub mod protocol;

/// Chain execution engine
pub mod orchestrator;

/// Performance analysis over execution records
pub mod analyzer;

pub use analyzer::ChainPerformanceAnalyzer;
pub use definition::{ChainConstraints, ChainDefinitionEngine, ChainGoal, ChainPreferences};
pub use events::{ChainEvent, EventBus};
pub use orchestrator::{ChainOrchestrator, ChainRunContext};
pub use protocol::{AgentCommunicationProtocol, ReceivedHandoff};
pub use registry::{AgentDispatcher, AgentInvoker, CapabilityRegistry, ChainAgent, SimulatedAgent};
pub use storage::{ChainStorage, InMemoryChainStorage};
