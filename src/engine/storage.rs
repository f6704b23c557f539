// Storage abstraction for the chain engine
// Persistence boundary for executions, steps, handoffs, templates and handoff blobs

//! # Storage Abstraction Layer
//!
//! The orchestrator, the communication protocol, the definition engine and the
//! analyzer all read and write through [`ChainStorage`]. The storage layer owns
//! sequence numbers: `execution_number` is global and increasing,
//! `record_number` and `handoff_number` increase within one execution.
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **ChainStorage trait**: the interface every backend implements
//! - **InMemoryChainStorage**: default backend for development, tests and the CLI
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! Rust doesn't natively support `dyn`-compatible async functions in traits.
//! The `async-trait` crate rewrites each method to return a boxed future so the
//! trait can be used as `Arc<dyn ChainStorage>`.
//!
//! ### `Result<Option<T>>`
//! - `Ok(Some(record))`: found
//! - `Ok(None)`: nothing with that key (not an error)
//! - `Err(error)`: the backend failed

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ChainExecutionRecord, ChainStepRecord, ChainTemplate, HandoffData};
use crate::{ChainError, Result};

/// Persistence boundary
#[async_trait::async_trait]
pub trait ChainStorage: Send + Sync {
    /// Store a new execution record, assigning its `execution_number`
    async fn create_execution(&self, record: ChainExecutionRecord) -> Result<ChainExecutionRecord>;

    /// Replace an existing execution record
    ///
    /// ## Errors
    /// - `NotFound` if the execution was never created
    async fn update_execution(&self, record: ChainExecutionRecord) -> Result<ChainExecutionRecord>;

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ChainExecutionRecord>>;

    /// Executions ordered by `execution_number`, optionally filtered by chain id
    async fn list_executions(&self, chain_id: Option<&str>) -> Result<Vec<ChainExecutionRecord>>;

    /// Append a step record, assigning its `record_number`
    async fn record_step(&self, record: ChainStepRecord) -> Result<ChainStepRecord>;

    /// Step records of one execution in recording order
    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<ChainStepRecord>>;

    /// Store an immutable handoff, assigning its `handoff_number`
    async fn store_handoff(&self, handoff: HandoffData) -> Result<HandoffData>;

    async fn get_handoff(&self, id: &Uuid) -> Result<Option<HandoffData>>;

    /// Handoffs of one execution ordered by `handoff_number`
    async fn list_handoffs(&self, execution_id: &Uuid) -> Result<Vec<HandoffData>>;

    async fn store_template(&self, template: ChainTemplate) -> Result<ChainTemplate>;

    async fn get_template(&self, id: &str) -> Result<Option<ChainTemplate>>;

    async fn list_templates(&self) -> Result<Vec<ChainTemplate>>;

    /// Replace an existing template
    ///
    /// ## Errors
    /// - `NotFound` if no template with that id exists
    async fn update_template(&self, template: ChainTemplate) -> Result<ChainTemplate>;

    /// Store an out-of-band payload for a reference handoff
    async fn store_blob(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
struct ExecutionSequences {
    next_execution: u64,
    next_step: HashMap<Uuid, u64>,
    next_handoff: HashMap<Uuid, u64>,
}

/// In-memory backend
///
/// ## Limitations
/// - **Not persistent**: data is lost when the process exits
/// - **Not distributed**: one process only
///
/// ## Rust Learning Notes:
///
/// ### tokio::sync::RwLock
/// The async `RwLock` is held across no `.await` points here, but using the
/// tokio lock keeps the guards `Send` and avoids poisoning entirely.
#[derive(Default)]
pub struct InMemoryChainStorage {
    executions: RwLock<HashMap<Uuid, ChainExecutionRecord>>,
    steps: RwLock<HashMap<Uuid, Vec<ChainStepRecord>>>,
    handoffs: RwLock<HashMap<Uuid, HandoffData>>,
    templates: RwLock<HashMap<String, ChainTemplate>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    sequences: RwLock<ExecutionSequences>,
}

impl InMemoryChainStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChainStorage for InMemoryChainStorage {
    async fn create_execution(&self, mut record: ChainExecutionRecord) -> Result<ChainExecutionRecord> {
        {
            let mut sequences = self.sequences.write().await;
            sequences.next_execution += 1;
            record.execution_number = sequences.next_execution;
        }
        let mut executions = self.executions.write().await;
        executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_execution(&self, record: ChainExecutionRecord) -> Result<ChainExecutionRecord> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(record)
            }
            None => Err(ChainError::NotFound(format!("execution {}", record.id))),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ChainExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn list_executions(&self, chain_id: Option<&str>) -> Result<Vec<ChainExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut records: Vec<ChainExecutionRecord> = executions
            .values()
            .filter(|record| chain_id.map_or(true, |id| record.chain_id == id))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.execution_number);
        Ok(records)
    }

    async fn record_step(&self, mut record: ChainStepRecord) -> Result<ChainStepRecord> {
        {
            let mut sequences = self.sequences.write().await;
            let next = sequences.next_step.entry(record.execution_id).or_insert(0);
            *next += 1;
            record.record_number = *next;
        }
        let mut steps = self.steps.write().await;
        steps.entry(record.execution_id).or_default().push(record.clone());
        Ok(record)
    }

    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<ChainStepRecord>> {
        let steps = self.steps.read().await;
        Ok(steps.get(execution_id).cloned().unwrap_or_default())
    }

    async fn store_handoff(&self, mut handoff: HandoffData) -> Result<HandoffData> {
        {
            let mut sequences = self.sequences.write().await;
            let next = sequences.next_handoff.entry(handoff.execution_id).or_insert(0);
            *next += 1;
            handoff.handoff_number = *next;
        }
        let mut handoffs = self.handoffs.write().await;
        if handoffs.contains_key(&handoff.id) {
            return Err(ChainError::InvalidInput(format!("handoff {} already stored", handoff.id)));
        }
        handoffs.insert(handoff.id, handoff.clone());
        Ok(handoff)
    }

    async fn get_handoff(&self, id: &Uuid) -> Result<Option<HandoffData>> {
        let handoffs = self.handoffs.read().await;
        Ok(handoffs.get(id).cloned())
    }

    async fn list_handoffs(&self, execution_id: &Uuid) -> Result<Vec<HandoffData>> {
        let handoffs = self.handoffs.read().await;
        let mut found: Vec<HandoffData> = handoffs
            .values()
            .filter(|h| h.execution_id == *execution_id)
            .cloned()
            .collect();
        found.sort_by_key(|h| h.handoff_number);
        Ok(found)
    }

    async fn store_template(&self, template: ChainTemplate) -> Result<ChainTemplate> {
        let mut templates = self.templates.write().await;
        templates.insert(template.id.clone(), template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: &str) -> Result<Option<ChainTemplate>> {
        let templates = self.templates.read().await;
        Ok(templates.get(id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<ChainTemplate>> {
        let templates = self.templates.read().await;
        let mut all: Vec<ChainTemplate> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn update_template(&self, template: ChainTemplate) -> Result<ChainTemplate> {
        let mut templates = self.templates.write().await;
        match templates.get_mut(&template.id) {
            Some(existing) => {
                *existing = template.clone();
                Ok(template)
            }
            None => Err(ChainError::NotFound(format!("template {}", template.id))),
        }
    }

    async fn store_blob(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_string(), data);
        Ok(())
    }

    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AgentKind, ChainDefinition, ExecutionMode, ExecutionStatus, StepExecutionResult,
    };

    fn record(chain_id: &str) -> ChainExecutionRecord {
        ChainExecutionRecord::new(Uuid::new_v4(), chain_id, "Test chain", ExecutionMode::Sequential, 2)
    }

    #[tokio::test]
    async fn test_execution_numbers_increase() {
        let storage = InMemoryChainStorage::new();
        let first = storage.create_execution(record("a")).await.unwrap();
        let second = storage.create_execution(record("b")).await.unwrap();
        let third = storage.create_execution(record("a")).await.unwrap();
        assert!(first.execution_number < second.execution_number);
        assert!(second.execution_number < third.execution_number);

        let for_a = storage.list_executions(Some("a")).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].id, first.id);
        assert_eq!(storage.list_executions(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_requires_existing_execution() {
        let storage = InMemoryChainStorage::new();
        let mut created = storage.create_execution(record("a")).await.unwrap();
        created.status = ExecutionStatus::Completed;
        storage.update_execution(created.clone()).await.unwrap();
        let loaded = storage.get_execution(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);

        let missing = storage.update_execution(record("a")).await;
        let err = tokio_test::assert_err!(missing);
        assert!(matches!(err, ChainError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_step_records_are_numbered_per_execution() {
        let storage = InMemoryChainStorage::new();
        let execution = Uuid::new_v4();
        let other = Uuid::new_v4();
        for n in 1..=3 {
            let result = StepExecutionResult::completed(n, "step", AgentKind::Content, serde_json::json!({}));
            storage.record_step(ChainStepRecord::new(execution, result)).await.unwrap();
        }
        let result = StepExecutionResult::completed(1, "step", AgentKind::Content, serde_json::json!({}));
        let other_record = storage.record_step(ChainStepRecord::new(other, result)).await.unwrap();

        let steps = storage.list_steps(&execution).await.unwrap();
        let numbers: Vec<u64> = steps.iter().map(|s| s.record_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(other_record.record_number, 1);
        assert!(storage.list_steps(&Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn test_templates_and_blobs() {
        let storage = InMemoryChainStorage::new();
        let definition = ChainDefinition::new("t", "Template", ExecutionMode::Sequential);
        let template = ChainTemplate::new("t", "Template", "custom", definition);
        tokio_test::block_on(async {
            tokio_test::assert_ok!(storage.store_template(template.clone()).await);

            let mut updated = template.clone();
            updated.stats.record(true, 1.0, 10.0);
            tokio_test::assert_ok!(storage.update_template(updated).await);
            let loaded = tokio_test::assert_ok!(storage.get_template("t").await);
            assert_eq!(loaded.map(|t| t.stats.usage_count), Some(1));
            assert!(tokio_test::assert_ok!(storage.get_template("missing").await).is_none());

            tokio_test::assert_ok!(storage.store_blob("k", vec![1, 2, 3]).await);
            assert_eq!(tokio_test::assert_ok!(storage.load_blob("k").await), Some(vec![1, 2, 3]));
            assert_eq!(tokio_test::assert_ok!(storage.load_blob("nope").await), None);
        });
    }
}
