use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use drover::activity::ActivityLog;
use drover::aggregator::CostAggregator;
use drover::api::{self, AppState};
use drover::clock::{Clock, SystemClock};
use drover::definitions::AgentRegistry;
use drover::ledger::CostLedger;
use drover::liveness::LivenessMonitor;
use drover::logging;
use drover::spawner::{DispatchHandle, Dispatcher, ProcessDispatcher, TaskSpawner};
use drover::storage::{InMemoryStore, Store};
use drover::sweeper::Sweeper;
use drover::{Config, Task};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Budget-aware task orchestration for agent fleets", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML config file; `DROVER_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and its HTTP API
    Serve,
    /// Print the agent roster
    Agents,
    /// Estimate what a task would cost an agent
    Estimate {
        agent: String,
        #[arg(help = "Token estimate for the work")]
        tokens: u64,
    },
    /// Validate configuration and roster, then exit
    CheckConfig,
}

/// Used when no executor program is configured.
struct NoExecutor;

#[async_trait]
impl Dispatcher for NoExecutor {
    async fn dispatch(&self, _task: &Task) -> Result<DispatchHandle> {
        bail!("no executor configured (set executor.program or DROVER_EXECUTOR)")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::DEFAULT_FILTER)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Agents => print_agents(&config)?,
        Commands::Estimate { agent, tokens } => {
            let registry = load_registry(&config)?;
            let cost = registry.estimate_cost(&agent, tokens)?;
            let budget = registry.get(&agent)?.cost_profile.daily_budget;
            println!("{} tokens on {}: ${} (daily budget ${})", tokens, agent, cost, budget);
        }
        Commands::CheckConfig => {
            let registry = load_registry(&config)?;
            println!(
                "Config OK: {} agents, controller {}, listening on {}",
                registry.len(),
                registry.controller().id,
                config.bind_address()
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

fn load_registry(config: &Config) -> Result<AgentRegistry> {
    let registry = match &config.roster_path {
        Some(path) => AgentRegistry::load_yaml(path)
            .with_context(|| format!("Failed to load roster {}", path.display()))?,
        None => AgentRegistry::builtin()?,
    };
    Ok(registry)
}

fn print_agents(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    for agent in registry.iter() {
        let triggers: Vec<_> = agent
            .escalation_triggers
            .iter()
            .map(|t| t.as_str())
            .collect();
        println!(
            "{:<10} {:<28} ${}/1K tokens  ${}/day  {}{}",
            agent.id,
            agent.role,
            agent.cost_profile.estimated_cost_per_1k_tokens,
            agent.cost_profile.daily_budget,
            if agent.controller { "[controller] " } else { "" },
            triggers.join(",")
        );
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let registry = Arc::new(load_registry(&config)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let activity = ActivityLog::new(store.clone());

    let ledger = Arc::new(CostLedger::new(registry.clone(), clock.clone()));
    // Only a persistent Store has history here; the in-memory one starts empty.
    let today = drover::clock::start_of_local_day(clock.today());
    ledger.init_from_events(&activity.since(today).await?);

    let dispatcher: Arc<dyn Dispatcher> = match &config.executor.program {
        Some(program) => Arc::new(ProcessDispatcher::new(
            program.as_str(),
            config.executor.args.clone(),
        )),
        None => {
            log::warn!("No executor configured; spawned tasks will fail dispatch");
            Arc::new(NoExecutor)
        }
    };

    let liveness = LivenessMonitor::new(
        registry.clone(),
        store.clone(),
        clock.clone(),
        activity.clone(),
    );
    let spawner = TaskSpawner::new(
        registry.clone(),
        ledger.clone(),
        store.clone(),
        dispatcher,
        clock.clone(),
    );

    let (stop, shutdown) = watch::channel(false);
    let (aggregator, aggregator_task) =
        CostAggregator::spawn(store.clone(), clock.clone(), shutdown.clone());

    let sweeper = Arc::new(Sweeper::new(
        liveness.clone(),
        ledger.clone(),
        config.liveness.staleness_threshold(),
        config.liveness.sweep_interval(),
    ));
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    let state = AppState {
        registry: registry.clone(),
        ledger: ledger.clone(),
        store,
        liveness,
        spawner,
        activity,
        aggregator,
    };

    log::info!(
        "Starting drover with {} agents (controller {})",
        registry.len(),
        registry.controller().id
    );

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        log::info!("Shutdown requested");
        let _ = stop.send(true);
    });

    let mut server_shutdown = shutdown;
    api::serve(state, &config.bind_address(), async move {
        let _ = server_shutdown.changed().await;
    })
    .await?;

    let _ = tokio::join!(aggregator_task, sweeper_task);
    ledger.teardown();
    Ok(())
}
