//! bundle-engine
//!
//! Thin command line front end for the execution engine.
//!
//! - `simulate`: routes intents from a JSON lines file through the engine
//!   with simulated builder and price source, printing one outcome per line.
//!   Bundles go to the scripted relay, or to the block engine configured
//!   under `[relay]` with `--relay jito`.
//! - `health`: prints persisted market state and breaker health.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bundle_engine::breaker::CircuitBreaker;
use bundle_engine::config::{Config, SigningConfig};
use bundle_engine::dedup::Deduplicator;
use bundle_engine::endpoints;
use bundle_engine::fees::{Escalation, FeeEstimator};
use bundle_engine::market::MarketStateCache;
use bundle_engine::relay::{BundleRelay, JitoRelayClient};
use bundle_engine::router::{OrderRouter, RouterComponents};
use bundle_engine::signing::KeypairSigningModule;
use bundle_engine::simulation::{ScriptedRelay, SimulatedBuilder, StaticPriceSource};
use bundle_engine::storage::{SledStore, StateStore};
use bundle_engine::types::OrderIntent;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// Where simulated bundles are submitted
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RelayKind {
    /// In-process relay that confirms every bundle
    Scripted,
    /// Block engine at `relay.url`
    Jito,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route intents through the engine with simulated collaborators
    Simulate {
        /// JSON lines file, one intent per line
        #[arg(short, long)]
        intents: PathBuf,

        /// Intents routed concurrently
        #[arg(long, default_value = "8")]
        concurrency: usize,

        /// Relay the bundles are submitted to
        #[arg(long, value_enum, default_value_t = RelayKind::Scripted)]
        relay: RelayKind,

        /// Simulated confirmation latency (scripted relay only)
        #[arg(long, default_value = "50")]
        latency_ms: u64,

        /// Volatility reported by the simulated price source
        #[arg(long, default_value = "0.2")]
        volatility: f64,
    },
    /// Print persisted market state and breaker health
    Health {
        /// Instruments to report; all stored instruments when empty
        instruments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs)?;

    info!("Starting bundle-engine {}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from: {}", args.config);
    let config = load_config(&args.config)?;

    match args.command {
        Command::Simulate {
            intents,
            concurrency,
            relay,
            latency_ms,
            volatility,
        } => {
            let relay = build_relay(&config, relay, latency_ms)?;
            run_simulation(config, &intents, concurrency, relay, volatility).await
        }
        Command::Health { instruments } => report_health(&config, instruments),
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "bundle_engine=debug,info"
    } else {
        "bundle_engine=info,warn,error"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    // stdout carries outcomes, logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        let mut config = Config::default();
        dotenvy::dotenv().ok();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn load_signer(config: &SigningConfig) -> KeypairSigningModule {
    let path = expand_home(&config.keypair_path);
    match KeypairSigningModule::from_file(&path, config) {
        Ok(signer) => {
            info!("Signing with keypair {}", signer.pubkey());
            signer
        }
        Err(e) => {
            warn!(
                "Keypair {} unavailable ({}), signing with an ephemeral key",
                path.display(),
                e
            );
            KeypairSigningModule::ephemeral(config)
        }
    }
}

fn read_intents(path: &Path) -> Result<Vec<OrderIntent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read intents from {}", path.display()))?;

    let mut intents = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<OrderIntent>(line) {
            Ok(intent) => intents.push(intent),
            Err(e) => warn!("Skipping line {}: {}", line_no + 1, e),
        }
    }
    Ok(intents)
}

fn build_relay(config: &Config, kind: RelayKind, latency_ms: u64) -> Result<Arc<dyn BundleRelay>> {
    match kind {
        RelayKind::Scripted => Ok(Arc::new(
            ScriptedRelay::new().with_latency(Duration::from_millis(latency_ms)),
        )),
        RelayKind::Jito => {
            info!("Submitting bundles to {}", config.relay.url);
            let client = JitoRelayClient::new(&config.relay)
                .with_context(|| format!("Failed to build relay client for {}", config.relay.url))?;
            Ok(Arc::new(client))
        }
    }
}

async fn run_simulation(
    config: Config,
    intents_path: &Path,
    concurrency: usize,
    relay: Arc<dyn BundleRelay>,
    volatility: f64,
) -> Result<()> {
    let intents = read_intents(intents_path)?;
    info!("Loaded {} intents", intents.len());

    let store: Arc<dyn StateStore> = Arc::new(
        SledStore::open(&config.storage.path)
            .with_context(|| format!("Failed to open store at {}", config.storage.path))?,
    );
    let market = Arc::new(MarketStateCache::new(
        config.market.clone(),
        Arc::clone(&store),
        Arc::new(StaticPriceSource::new(volatility)),
    ));
    let breaker = Arc::new(CircuitBreaker::with_store(
        config.breaker.clone(),
        Arc::clone(&store),
    )?);
    let components = RouterComponents {
        dedup: Arc::new(Deduplicator::with_store(config.dedup.clone(), Arc::clone(&store))?),
        market: Arc::clone(&market),
        fees: Arc::new(FeeEstimator::new(
            config.fees.clone(),
            Escalation::from(&config.router),
        )),
        breaker: Arc::clone(&breaker),
        builder: Arc::new(SimulatedBuilder::new(0)),
        relay,
        signer: Arc::new(load_signer(&config.signing)),
    };
    let router = Arc::new(OrderRouter::new(config.router.clone(), components));

    let shutdown = CancellationToken::new();
    if config.monitoring.enable_metrics {
        let port = config.monitoring.metrics_port;
        let breaker = Arc::clone(&breaker);
        let shutdown = shutdown.clone();
        info!("Starting metrics server on port {}", port);
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(port, breaker, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, cancelling in-flight intents");
                shutdown.cancel();
            }
        });
    }

    for instrument in intents
        .iter()
        .map(|i| i.instrument().to_string())
        .collect::<std::collections::BTreeSet<_>>()
    {
        if let Err(e) = market.refresh_volatility(&instrument).await {
            warn!(instrument = %instrument, error = %e, "Volatility refresh failed");
        }
    }

    let mut confirmed = 0usize;
    let mut failed = 0usize;
    let mut outcomes = futures::stream::iter(intents)
        .map(|intent| {
            let router = Arc::clone(&router);
            let cancel = shutdown.child_token();
            async move { router.execute_order_with_cancel(intent, cancel).await }
        })
        .buffer_unordered(concurrency.max(1));

    while let Some(outcome) = outcomes.next().await {
        if outcome.succeeded {
            confirmed += 1;
        } else {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&outcome)?);
    }

    info!(confirmed, failed, "Simulation finished");
    shutdown.cancel();
    store.flush()?;
    Ok(())
}

fn report_health(config: &Config, instruments: Vec<String>) -> Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(
        SledStore::open(&config.storage.path)
            .with_context(|| format!("Failed to open store at {}", config.storage.path))?,
    );
    let breaker = CircuitBreaker::with_store(config.breaker.clone(), Arc::clone(&store))?;
    let market = MarketStateCache::new(
        config.market.clone(),
        Arc::clone(&store),
        Arc::new(StaticPriceSource::new(0.0)),
    );

    let instruments = if instruments.is_empty() {
        market.instruments()?
    } else {
        instruments
    };
    let mut markets = Vec::with_capacity(instruments.len());
    for instrument in &instruments {
        if let Some(state) = market.get(instrument)? {
            markets.push(state);
        }
    }

    let report = serde_json::json!({
        "breaker": breaker.health(),
        "markets": markets,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
