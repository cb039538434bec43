//! provbench - benchmark marketplace providers and report their reputation.

use std::sync::Arc;

use clap::Parser;
use provbench_backend::HttpBackend;
use provbench_core::{Offer, Pricing, ProviderId};
use provbench_market::{ProviderBehavior, SimulatedMarket};
use provbench_orchestrator::config::parse_cron_time;
use provbench_orchestrator::{
    BenchmarkRun, Config, DailyScheduler, FileStore, ProviderScope, RunError, RunSummary, Suite,
};
use thiserror::Error;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "provbench")]
#[command(about = "Rent marketplace providers, benchmark them and report the results")]
#[command(version)]
struct Cli {
    /// Number of providers to benchmark
    #[arg(long, env = "PROVBENCH_COUNT", default_value = "30")]
    count: usize,

    /// Maximum activities rented at once (defaults to --count)
    #[arg(long, env = "PROVBENCH_MAX_REPLICAS")]
    max_replicas: Option<usize>,

    /// Reference price in GLM per CPU hour used for the budget
    #[arg(long, env = "PROVBENCH_PRICE_PER_HOUR", default_value = "3.0")]
    price_per_hour: f64,

    /// Total budget in GLM (estimated from the price when omitted)
    #[arg(long, env = "PROVBENCH_BUDGET")]
    budget: Option<f64>,

    /// Reputation backend root URL
    #[arg(long, env = "PROVBENCH_BACKEND_URL", default_value = "http://api.localhost")]
    backend_url: String,

    /// Bearer token for the reputation backend
    #[arg(long, env = "PROVBENCH_API_TOKEN")]
    api_token: Option<String>,

    /// URL of the provider reputation snapshot; enables reputation pricing
    #[arg(long, env = "PROVBENCH_REPUTATION_URL")]
    reputation_url: Option<String>,

    /// Benchmark suite to run
    #[arg(long, value_enum, default_value = "cpu")]
    suite: Suite,

    /// Skip the network stage of the CPU suite
    #[arg(long)]
    no_network: bool,

    /// Only rent these providers
    #[arg(long, value_delimiter = ',', conflicts_with = "deny")]
    allow: Vec<String>,

    /// Never rent these providers
    #[arg(long, value_delimiter = ',')]
    deny: Vec<String>,

    /// File holding the last run date
    #[arg(long, env = "PROVBENCH_STORE_PATH", default_value = "provbench-state.json")]
    store_path: String,

    /// Key the last run date is stored under
    #[arg(long, env = "PROVBENCH_REDIS_KEY", default_value = "benchmark-last-run")]
    redis_key: String,

    /// Daily trigger time (UTC, HH:MM)
    #[arg(long, default_value = "00:00")]
    cron_time: String,

    /// Run once a day instead of once
    #[arg(long)]
    daily: bool,

    /// Debug logging, no start delay and no last-run check
    #[arg(long)]
    debug: bool,

    /// Evaluate offers without renting anything
    #[arg(long)]
    dry_run: bool,

    /// Rent from the built-in simulated marketplace
    #[arg(long)]
    simulate: bool,

    /// Number of providers offered by the built-in simulated marketplace
    #[arg(long, default_value = "10")]
    sim_providers: usize,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("No marketplace connector configured - pass --simulate to use the built-in simulated marketplace")]
    NoMarketplace,
}

impl Cli {
    fn config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let scope = if !self.allow.is_empty() {
            Some(ProviderScope::allow(self.allow.iter().map(ProviderId::new)))
        } else if !self.deny.is_empty() {
            Some(ProviderScope::deny(self.deny.iter().map(ProviderId::new)))
        } else {
            None
        };

        let config = Config {
            backend_url: self.backend_url.clone(),
            api_token: self.api_token.clone(),
            reputation_url: self.reputation_url.clone(),
            count: self.count,
            max_replicas: self.max_replicas,
            price_per_hour: self.price_per_hour,
            budget: self.budget,
            suite: self.suite,
            include_network: !self.no_network,
            scope,
            dry_run: self.dry_run,
            store_path: self.store_path.clone().into(),
            store_key: self.redis_key.clone(),
            cron_time: parse_cron_time(&self.cron_time)?,
            debug: self.debug,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Providers offered by the simulated marketplace. The simulator is the
    /// only marketplace this binary can rent from and must be opted into.
    fn simulated_providers(&self) -> Result<usize, CliError> {
        if self.simulate {
            Ok(self.sim_providers)
        } else {
            Err(CliError::NoMarketplace)
        }
    }
}

/// Marketplace with `providers` well-behaved providers charging their
/// estimated rent.
fn simulated_market(providers: usize, config: &Config) -> SimulatedMarket {
    (0..providers).fold(SimulatedMarket::new(), |market, i| {
        let offer = Offer::new(
            ProviderId::new(format!("sim-provider-{i}")),
            Pricing::new(0.0, 0.02, 0.005),
            4,
        );
        let amount = format!("{:.6}", offer.estimate_cost(config.rent_hours()));
        market.with_provider(offer, ProviderBehavior::default().paying(amount))
    })
}

async fn run_once(config: &Config, providers: usize) -> Result<RunSummary, RunError> {
    let mut backend = HttpBackend::new(&config.backend_url);
    if let Some(token) = &config.api_token {
        backend = backend.with_token(token.clone());
    }
    let market = simulated_market(providers, config);
    BenchmarkRun::new(config.clone(), Arc::new(backend), Arc::new(market))
        .execute()
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(
            subscriber.with_env_filter(filter).finish(),
        )?,
        Err(_) => tracing::subscriber::set_global_default(subscriber.finish())?,
    }

    let config = cli.config()?;
    let providers = cli.simulated_providers()?;
    warn!(
        providers,
        backend_url = %config.backend_url,
        "Renting from the simulated marketplace - results are reported to the backend"
    );
    info!(
        count = config.count,
        max_replicas = config.max_replicas(),
        suite = ?config.suite,
        backend_url = %config.backend_url,
        "provbench starting"
    );

    if !cli.daily {
        let summary = run_once(&config, providers).await.map_err(|e| {
            error!(error = %e, "Run failed");
            e
        })?;
        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            failed = summary.failed,
            total_cost = summary.total_cost,
            "Done"
        );
        return Ok(());
    }

    let store = Arc::new(FileStore::new(config.store_path.clone()));
    let scheduler = DailyScheduler::from_config(store, &config);
    scheduler
        .run(|| run_once(&config, providers))
        .await?;
    Ok(())
}
