//! Agent Chain CLI
//!
//! Recommends chains for a goal, runs chain definitions against simulated
//! agents and lists the installed templates. Everything runs in-process on
//! in-memory storage.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use agent_chain::{
    AgentDispatcher, AgentKind, Bottleneck, CapabilityRegistry, ChainConstraints, ChainDefinition,
    ChainDefinitionEngine, ChainExecutionResult, ChainGoal, ChainOrchestrator, ChainPerformanceAnalyzer,
    ChainRecommendation, ChainRunContext, EngineConfig, InMemoryChainStorage, Recommendation, StepStatus,
};

#[derive(Parser)]
#[command(name = "chainctl")]
#[command(about = "Agent Chain CLI - recommend, run and inspect multi-agent chains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file layered over config/agent-chain.*
    #[arg(long, global = true, env = "AGENT_CHAIN_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Recommend a chain for a goal
    Recommend {
        /// Primary objective, e.g. "increase social engagement"
        #[arg(long)]
        goal: String,

        #[arg(long)]
        max_cost: Option<f64>,

        #[arg(long)]
        max_time_ms: Option<u64>,

        /// Agent kind that must be part of the chain (repeatable)
        #[arg(long = "require")]
        required: Vec<AgentKind>,

        /// Agent kind that must not be part of the chain (repeatable)
        #[arg(long = "forbid")]
        forbidden: Vec<AgentKind>,

        /// Topic passed to synthesized steps and to the run context
        #[arg(long)]
        topic: Option<String>,

        /// Execute the recommended chain right away
        #[arg(long)]
        run: bool,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Run a chain definition with simulated agents
    Run {
        /// Path to a JSON chain definition
        #[arg(long)]
        definition: String,

        /// JSON object passed as trigger context
        #[arg(long)]
        input: Option<String>,

        #[arg(long)]
        campaign: Option<String>,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List the installed chain templates
    Templates,
}

/// Everything one CLI invocation needs
struct Engine {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    storage: Arc<InMemoryChainStorage>,
    definitions: ChainDefinitionEngine,
}

impl Engine {
    async fn new(config: EngineConfig) -> Result<Self> {
        let registry = Arc::new(CapabilityRegistry::with_defaults());
        let storage = Arc::new(InMemoryChainStorage::new());
        let definitions = ChainDefinitionEngine::new(registry.clone(), storage.clone());
        let installed = definitions.install_predefined_templates().await?;
        debug!(installed, "predefined templates installed");
        Ok(Self {
            config,
            registry,
            storage,
            definitions,
        })
    }

    async fn run(&self, definition: &ChainDefinition, context: ChainRunContext, json: bool) -> Result<()> {
        let dispatcher = Arc::new(AgentDispatcher::simulated(&self.registry));
        let orchestrator = ChainOrchestrator::new(
            self.config.clone(),
            self.registry.clone(),
            dispatcher,
            self.storage.clone(),
        );
        let result = orchestrator.execute_chain(definition, context).await?;

        let analyzer = ChainPerformanceAnalyzer::new(self.config.analyzer.clone(), self.storage.clone());
        let bottlenecks = analyzer.detect_bottlenecks(&result.execution_id, None).await?;
        let recommendations = analyzer
            .generate_recommendations(&result.execution_id, &bottlenecks)
            .await?;

        if json {
            let report = serde_json::json!({
                "result": result,
                "bottlenecks": bottlenecks,
                "recommendations": recommendations,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_result(&result);
            print_analysis(&bottlenecks, &recommendations);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        debug!("no .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = EngineConfig::load_from(cli.config.as_deref()).context("loading configuration")?;

    let log_level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let engine = Engine::new(config).await?;

    match cli.command {
        Commands::Recommend {
            goal,
            max_cost,
            max_time_ms,
            required,
            forbidden,
            topic,
            run,
            json,
        } => {
            let goal = ChainGoal::new(goal).with_constraints(ChainConstraints {
                max_cost,
                max_time_ms,
                required_agents: required,
                forbidden_agents: forbidden,
            });
            let mut context = HashMap::new();
            if let Some(topic) = &topic {
                context.insert("topic".to_string(), Value::String(topic.clone()));
            }

            let recommendation = engine
                .definitions
                .recommend_chain(&goal, Some(&context), None)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recommendation)?);
            } else {
                print_recommendation(&recommendation);
            }

            if run {
                let run_context = context
                    .into_iter()
                    .fold(ChainRunContext::new(), |ctx, (key, value)| ctx.with_trigger(key, value));
                engine.run(&recommendation.definition, run_context, json).await?;
            }
        }

        Commands::Run {
            definition,
            input,
            campaign,
            json,
        } => {
            let raw = std::fs::read_to_string(&definition)
                .with_context(|| format!("reading chain definition {}", definition))?;
            let definition: ChainDefinition =
                serde_json::from_str(&raw).with_context(|| format!("parsing chain definition {}", definition))?;

            let mut context = ChainRunContext::new();
            if let Some(input) = input {
                let trigger: HashMap<String, Value> =
                    serde_json::from_str(&input).context("--input must be a JSON object")?;
                context.trigger = trigger;
            }
            if let Some(campaign) = campaign {
                context = context.with_campaign(campaign);
            }
            engine.run(&definition, context, json).await?;
        }

        Commands::Templates => {
            let templates = engine.definitions.list_templates().await?;
            if templates.is_empty() {
                warn!("no templates installed");
            }
            for template in templates {
                let kinds: Vec<String> = template
                    .definition
                    .agent_kinds()
                    .iter()
                    .map(|k| k.to_string())
                    .collect();
                println!(
                    "{} {} ({})",
                    template.id.bold(),
                    template.name,
                    template.category.dimmed()
                );
                println!("    agents: {}", kinds.join(" -> "));
                println!(
                    "    runs: {}  success: {:.0}%  avg cost: {:.2}  avg time: {:.1}s",
                    template.stats.usage_count,
                    template.stats.success_rate * 100.0,
                    template.stats.average_cost,
                    template.stats.average_execution_time_ms / 1000.0
                );
            }
        }
    }

    Ok(())
}

fn print_recommendation(recommendation: &ChainRecommendation) {
    let confidence = format!("{:.0}%", recommendation.confidence * 100.0);
    let confidence = if recommendation.high_confidence {
        confidence.green()
    } else {
        confidence.yellow()
    };
    println!(
        "{} {} (confidence {})",
        "Recommended:".bold(),
        recommendation.definition.name,
        confidence
    );
    println!("  source: {:?}", recommendation.source);
    for step in recommendation.definition.steps_in_order() {
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {:?}", step.depends_on)
        };
        println!("  {}. {} [{}]{}", step.step_number, step.step_name, step.agent_kind, deps);
    }
    println!(
        "  estimate: {:.2} cost, {:.1}s",
        recommendation.estimated_cost,
        recommendation.estimated_duration_ms as f64 / 1000.0
    );
    for reason in &recommendation.reasoning {
        println!("  - {}", reason.dimmed());
    }
}

fn print_result(result: &ChainExecutionResult) {
    let status = format!("{:?}", result.status).to_uppercase();
    let status = if result.success { status.green() } else { status.red() };
    println!(
        "{} #{} {} in {}ms, cost {:.2}",
        "Execution".bold(),
        result.execution_number,
        status,
        result.total_time_ms,
        result.total_cost
    );
    for step in &result.step_results {
        let marker = match step.status {
            StepStatus::Completed => "ok".green(),
            StepStatus::Failed => "failed".red(),
            StepStatus::Skipped => "skipped".yellow(),
            _ => "pending".normal(),
        };
        println!(
            "  {}. {} [{}] {} ({}ms)",
            step.step_number, step.step_name, step.agent_kind, marker, step.execution_time_ms
        );
        if let Some(error) = &step.error {
            println!("     {}", error.red());
        }
    }
    for failure in &result.criteria_failures {
        println!("  {} {}", "criteria:".red(), failure);
    }
}

fn print_analysis(bottlenecks: &[Bottleneck], recommendations: &[Recommendation]) {
    if !bottlenecks.is_empty() {
        println!("{}", "Bottlenecks".bold());
        for bottleneck in bottlenecks {
            println!("  [{:?}] {}", bottleneck.severity, bottleneck.description);
        }
    }
    if !recommendations.is_empty() {
        println!("{}", "Recommendations".bold());
        for recommendation in recommendations {
            println!(
                "  [{:?}] {} (+{:.0}%)",
                recommendation.priority,
                recommendation.title,
                recommendation.expected_improvement * 100.0
            );
        }
    }
}
