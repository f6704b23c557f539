//! End-to-end properties of the chain engine, exercised through the public API

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use agent_chain::engine::protocol::optimization::optimize_payload;
use agent_chain::{
    AgentCommunicationProtocol, AgentDispatcher, AgentKind, AgentOutput, BottleneckThresholds,
    CapabilityRegistry, ChainDefinition, ChainDefinitionEngine, ChainGoal, ChainOrchestrator,
    ChainPerformanceAnalyzer, ChainRunContext, ChainStepDefinition, ChainStorage, EngineConfig,
    ExecutionMode, ExecutionStatus, HandoffContext, HandoffPayload, InMemoryChainStorage,
    ProtocolConfig, RecommendationSource, Severity, StepStatus, SuccessCriteria,
};

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.orchestrator.retry_backoff_ms = 0;
    config
}

fn orchestrator(dispatcher: AgentDispatcher, storage: Arc<InMemoryChainStorage>) -> ChainOrchestrator {
    ChainOrchestrator::new(
        engine_config(),
        Arc::new(CapabilityRegistry::with_defaults()),
        Arc::new(dispatcher),
        storage,
    )
}

fn simulated() -> AgentDispatcher {
    AgentDispatcher::simulated(&CapabilityRegistry::with_defaults())
}

/// Random acyclic definition: every step only depends on lower-numbered steps
fn random_definition(rng: &mut StdRng, steps: u32) -> ChainDefinition {
    let kinds = AgentKind::all();
    let mut definition = ChainDefinition::new("random", "Random", ExecutionMode::Parallel);
    for n in 1..=steps {
        let deps: Vec<u32> = (1..n).filter(|_| rng.gen_bool(0.3)).collect();
        let kind = kinds[rng.gen_range(0..kinds.len())];
        definition = definition.with_step(ChainStepDefinition::new(n, format!("s{}", n), kind).depends_on(deps));
    }
    definition
}

#[test]
fn waves_place_every_step_after_its_dependencies() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let size = rng.gen_range(1..12);
        let definition = random_definition(&mut rng, size);
        let waves = definition.dependency_waves().unwrap();

        let mut wave_of = HashMap::new();
        for (index, wave) in waves.iter().enumerate() {
            for step in wave {
                assert!(wave_of.insert(*step, index).is_none(), "step {} in two waves", step);
            }
        }
        assert_eq!(wave_of.len(), definition.steps.len());

        for step in &definition.steps {
            for dep in &step.depends_on {
                assert!(wave_of[&step.step_number] > wave_of[dep]);
            }
        }
    }
}

#[test]
fn cyclic_definitions_are_rejected() {
    let definition = ChainDefinition::new("cycle", "Cycle", ExecutionMode::Parallel)
        .with_step(ChainStepDefinition::new(1, "a", AgentKind::Content).depends_on([2]))
        .with_step(ChainStepDefinition::new(2, "b", AgentKind::Seo).depends_on([1]));
    assert!(definition.validate().is_err());
    assert!(definition.dependency_waves().is_err());
}

#[tokio::test]
async fn received_handoff_equals_the_optimized_payload() {
    let storage = Arc::new(InMemoryChainStorage::new());
    let registry = Arc::new(CapabilityRegistry::with_defaults());
    let config = ProtocolConfig {
        compression_threshold_bytes: 128,
        ..ProtocolConfig::default()
    };
    let protocol = AgentCommunicationProtocol::new(config, registry, storage.clone());
    let execution_id = uuid::Uuid::new_v4();
    protocol.register_sequence(execution_id, [(1, AgentKind::Content), (2, AgentKind::SocialMedia)]);

    let body = "A long form article about oat milk. ".repeat(40);
    let output = AgentOutput::new(json!({
        "title": "Oat milk, explained",
        "body": body,
        "keywords": ["oat milk", "dairy free"],
        "internal_notes": "not for the social agent",
    }));
    let (expected, _) = optimize_payload(AgentKind::Content, AgentKind::SocialMedia, output.output.clone());

    let created = protocol
        .create_handoff(execution_id, 1, AgentKind::Content, &output, HandoffContext::default())
        .await
        .unwrap();
    assert!(created.success);
    let handoff = created.handoff.unwrap();
    assert!(matches!(handoff.payload, HandoffPayload::Compressed { .. }));
    assert!(expected.get("internal_notes").is_none());

    let received = protocol
        .receive_handoff(execution_id, 2, AgentKind::SocialMedia)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.data, expected);
    assert_eq!(received.handoff_id, handoff.id);
    assert_eq!(storage.list_handoffs(&execution_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sequential_chain_halts_when_a_step_fails_without_retries() {
    let storage = Arc::new(InMemoryChainStorage::new());
    let orchestrator = orchestrator(simulated(), storage.clone());
    let definition = ChainDefinition::new("halt", "Halt", ExecutionMode::Sequential)
        .with_step(ChainStepDefinition::new(1, "trends", AgentKind::TrendAnalysis))
        .with_step(
            ChainStepDefinition::new(2, "content", AgentKind::Content)
                .with_retries(0)
                .with_config("simulate_failure", json!("transient")),
        )
        .with_step(ChainStepDefinition::new(3, "social", AgentKind::SocialMedia));

    let result = orchestrator.execute_chain(&definition, ChainRunContext::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(!result.success);
    assert_eq!(result.failed_steps().len(), 1);
    let completed = result
        .step_results
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .count();
    assert!(completed <= 1);
    assert!(result.step(3).map_or(true, |r| r.status == StepStatus::Skipped));

    let record = storage.get_execution(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(!record.errors.is_empty());
}

#[tokio::test]
async fn min_steps_completed_accepts_a_partial_run() {
    let storage = Arc::new(InMemoryChainStorage::new());
    let orchestrator = orchestrator(simulated(), storage);
    let definition = ChainDefinition::new("partial", "Partial", ExecutionMode::Sequential)
        .with_step(ChainStepDefinition::new(1, "seo", AgentKind::Seo))
        .with_step(
            ChainStepDefinition::new(2, "outreach", AgentKind::Outreach)
                .with_retries(0)
                .with_config("simulate_failure", json!("permanent"))
                .continue_on_failure(),
        )
        .with_step(ChainStepDefinition::new(3, "email", AgentKind::Email))
        .with_success_criteria(SuccessCriteria {
            min_steps_completed: Some(2),
            ..Default::default()
        });

    let result = orchestrator.execute_chain(&definition, ChainRunContext::new()).await.unwrap();
    assert_eq!(result.failed_steps().len(), 1);
    assert!(result.success);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.criteria_failures.is_empty());
}

#[tokio::test]
async fn analysis_is_idempotent_and_classifies_severity() {
    let storage = Arc::new(InMemoryChainStorage::new());
    let orchestrator = orchestrator(simulated(), storage.clone());
    let definition = ChainDefinition::new("timed", "Timed", ExecutionMode::Sequential)
        .with_step(ChainStepDefinition::new(1, "seo", AgentKind::Seo).with_config("simulated_latency_ms", json!(250)))
        .with_step(ChainStepDefinition::new(2, "email", AgentKind::Email).with_config("simulated_latency_ms", json!(140)))
        .with_step(ChainStepDefinition::new(3, "trends", AgentKind::TrendAnalysis).with_config("simulated_latency_ms", json!(350)));
    let result = orchestrator.execute_chain(&definition, ChainRunContext::new()).await.unwrap();

    let analyzer = ChainPerformanceAnalyzer::new(engine_config().analyzer, storage);
    let first = analyzer.analyze_chain_execution(&result.execution_id).await.unwrap().unwrap();
    let second = analyzer.analyze_chain_execution(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.steps_completed, 3);

    // Sleep-based timings only ever overshoot, so assert the lower bands loosely
    let thresholds = BottleneckThresholds {
        max_step_time_ms: 100,
        max_step_cost: 10.0,
        min_quality_score: 0.0,
    };
    let bottlenecks = analyzer
        .detect_bottlenecks(&result.execution_id, Some(&thresholds))
        .await
        .unwrap();
    let severity = |step: u32| {
        bottlenecks
            .iter()
            .find(|b| b.location.step_number == step)
            .map(|b| b.severity)
    };
    assert!(severity(1) >= Some(Severity::High));
    assert!(severity(2) >= Some(Severity::Low));
    assert_eq!(severity(3), Some(Severity::Critical));
}

#[tokio::test]
async fn social_engagement_goal_matches_the_viral_template() {
    let storage = Arc::new(InMemoryChainStorage::new());
    let engine = ChainDefinitionEngine::new(Arc::new(CapabilityRegistry::with_defaults()), storage.clone());
    engine.install_predefined_templates().await.unwrap();

    let recommendation = engine
        .recommend_chain(&ChainGoal::new("increase social engagement"), None, None)
        .await
        .unwrap();
    assert!(recommendation.agent_kinds.contains(&AgentKind::SocialMedia));
    if let RecommendationSource::Template { template_id, .. } = &recommendation.source {
        assert_eq!(template_id, "viral-content");
        assert!(recommendation.confidence >= 0.6);
    }

    let orchestrator = orchestrator(simulated(), storage.clone());
    let result = orchestrator
        .execute_chain(
            &recommendation.definition,
            ChainRunContext::new().with_trigger("topic", json!("oat milk")),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    if let Some(template_id) = &recommendation.definition.template_id {
        let template = storage.get_template(template_id).await.unwrap().unwrap();
        let seeded = agent_chain::engine::definition::predefined_templates()
            .into_iter()
            .find(|t| &t.id == template_id)
            .unwrap();
        assert_eq!(template.stats.usage_count, seeded.stats.usage_count + 1);
    }
}
