//! Faucetful Router - deploys a token router to every configured chain and
//! runs the cross-chain transfer protocol between them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use faucetful_router::api::{self, AppState};
use faucetful_router::chain::provider::load_bytecode;
use faucetful_router::chain::{ChainClients, EthersChainClient};
use faucetful_router::config::Settings;
use faucetful_router::deploy::{
    DeployPolicy, DeploymentReport, JsonFileStore, RecordStore, RouterDeployer,
};
use faucetful_router::devnet;
use faucetful_router::metrics::MetricsServer;
use faucetful_router::relay::RelayWorker;
use faucetful_router::state::StateManager;

/// Hardhat's first default account, used as the devnet operator when no
/// deployer key is configured
const DEV_OPERATOR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

#[derive(Parser)]
#[command(name = "faucetful-router", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "ROUTER_CONFIG", default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and resolve the configuration without contacting any chain
    Check,
    /// Deploy and connect routers on the configured chains
    Deploy,
    /// Print the deployment record
    Status,
    /// Run an in-process network with the HTTP API until interrupted
    Devnet,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    let cli = Cli::parse();
    info!("Starting Faucetful Router v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load_from(&cli.config)?;
    info!("Loaded configuration for {} chains", settings.chains.len());

    match cli.command {
        Command::Check => check(&settings),
        Command::Deploy => deploy(&settings).await,
        Command::Status => status(&settings).await,
        Command::Devnet => run_devnet(&settings).await,
    }
}

fn check(settings: &Settings) -> Result<()> {
    let owner = load_wallet(settings)
        .map(|w| w.address())
        .unwrap_or_else(|_| {
            warn!("No deployer key available, owner defaults to the zero address");
            Address::zero()
        });
    let resolved = settings.resolve(owner)?;

    println!("mainnet: {}", resolved.mainnet().chain());
    for config in resolved.iter() {
        println!(
            "  {:<16} chain_id={:<10} role={:<9} owner={:?} initial_supply={}",
            config.chain(),
            config.chain_id(),
            if config.role().is_mainnet() { "mainnet" } else { "secondary" },
            config.owner(),
            config.initial_supply()
        );
    }
    Ok(())
}

async fn deploy(settings: &Settings) -> Result<()> {
    let wallet = load_wallet(settings)?;
    let resolved = settings.resolve(wallet.address())?;

    let artifact_path = &settings.deployment.artifact_path;
    let artifact = std::fs::read_to_string(artifact_path)
        .with_context(|| format!("Failed to read router artifact: {:?}", artifact_path))?;
    let bytecode = load_bytecode(&serde_json::from_str(&artifact)?)?;

    let mut clients: ChainClients = BTreeMap::new();
    for config in resolved.iter() {
        let client = EthersChainClient::new(
            config.chain(),
            config.connection().clone(),
            wallet.clone(),
            bytecode.clone(),
        )?;
        clients.insert(config.chain().to_string(), Arc::new(client));
    }

    let store = open_store(settings).await?;
    let deployer = RouterDeployer::new(clients, store, DeployPolicy::from(&settings.deployment));
    let report = deployer.deploy(&resolved).await?;
    print_report(&report);

    if !report.is_success() {
        anyhow::bail!("{} chain(s) failed to deploy", report.failed.len());
    }
    Ok(())
}

async fn status(settings: &Settings) -> Result<()> {
    let record = open_store(settings).await?.load().await?;

    if record.is_empty() {
        println!("No routers deployed");
        return Ok(());
    }
    for (chain, entry) in &record.routers {
        println!(
            "  {:<16} chain_id={:<10} router={:?} deployed_at={}",
            chain, entry.chain_id, entry.address, entry.deployed_at
        );
    }
    for (chain, entry) in &record.pending {
        println!(
            "  {:<16} chain_id={:<10} router={:?} PENDING initialization",
            chain, entry.chain_id, entry.address
        );
    }
    Ok(())
}

async fn run_devnet(settings: &Settings) -> Result<()> {
    let operator = match load_wallet(settings) {
        Ok(wallet) => wallet.address(),
        Err(_) => DEV_OPERATOR.parse().context("Invalid devnet operator")?,
    };
    let resolved = settings.resolve(operator)?;
    let net = devnet::launch(&resolved, operator).await?;

    let worker = Arc::new(RelayWorker::new(
        net.relay.clone(),
        net.orchestrator.clone(),
        Duration::from_millis(settings.relay.poll_interval_ms),
    ));

    // Start relay worker
    let relay_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            orchestrator: net.orchestrator.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Devnet is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    worker.stop().await;
    api_handle.abort();
    relay_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Devnet stopped");
    Ok(())
}

/// Postgres when a database is configured, the JSON record file otherwise
async fn open_store(settings: &Settings) -> Result<Arc<dyn RecordStore>> {
    match &settings.database {
        Some(database) => {
            let state_manager = StateManager::new(database).await?;
            state_manager.run_migrations().await?;
            state_manager.health_check().await?;
            info!("Database connection established");
            Ok(Arc::new(state_manager))
        }
        None => Ok(Arc::new(JsonFileStore::new(&settings.deployment.record_path))),
    }
}

fn load_wallet(settings: &Settings) -> Result<LocalWallet> {
    let var = &settings.wallet.private_key_env;
    let key = std::env::var(var).with_context(|| format!("{} is not set", var))?;
    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .with_context(|| format!("{} does not hold a valid private key", var))
}

fn print_report(report: &DeploymentReport) {
    println!("run {}", report.run_id);
    for (chain, router) in &report.deployed {
        println!("  {:<16} deployed {:?}", chain, router);
    }
    for chain in &report.skipped {
        println!("  {:<16} already deployed", chain);
    }
    for (chain, err) in &report.failed {
        println!("  {:<16} FAILED {}", chain, err);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,faucetful_router=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
