use axum::{extract::State, routing::get, Json, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ladder::application::runtime::LiveRuntime;
use ladder::application::workers::bootstrap::Bootstrapper;
use ladder::application::workers::consistency::ConsistencyChecker;
use ladder::application::workers::order_janitor::OrderJanitor;
use ladder::application::workers::spawn_periodic;
use ladder::application::workers::stuck_sells::StuckSellSweeper;
use ladder::application::Dependencies;
use ladder::config::Config;
use ladder::infrastructure::alpaca_client::{AlpacaClient, AlpacaConfig};
use ladder::infrastructure::market_stream::{MarketStream, MarketStreamConfig};
use ladder::infrastructure::trade_stream::{TradeStream, TradeStreamConfig};
use ladder::persistence;
use ladder::persistence::repository::{AssetRepository, CycleRepository};
use ladder::task_runner::{supervise, RestartPolicy};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

const JANITOR_PERIOD: Duration = Duration::from_secs(60);
const STUCK_SELL_PERIOD: Duration = Duration::from_secs(60);
const CONSISTENCY_PERIOD: Duration = Duration::from_secs(300);
const BOOTSTRAP_PERIOD: Duration = Duration::from_secs(900);

struct HealthState {
    market_connected: Arc<AtomicBool>,
    trade_connected: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ladder={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("DCA trading engine starting");
    config.log_summary();

    create_pid_file(&config);

    let pool = persistence::init_database(&config.database_url, config.database_max_connections)
        .await?;
    let assets = AssetRepository::new(pool.clone());
    let cycles = CycleRepository::new(pool.clone());
    let broker = Arc::new(AlpacaClient::new(AlpacaConfig::new(
        &config.api_key,
        &config.api_secret,
        Some(&config.api_base_url),
    )));

    let deps = Dependencies::new(config.engine_settings(), assets, cycles, broker);

    // Make sure every enabled asset has its cycle before events flow.
    let bootstrapper = Bootstrapper::new(deps.clone());
    if let Err(e) = bootstrapper.run_once().await {
        error!("Startup bootstrap sweep failed: {}", e);
    }

    let symbols: Vec<String> = match deps.assets.list_enabled().await {
        Ok(list) => list.into_iter().map(|asset| asset.symbol).collect(),
        Err(e) => {
            error!("Failed to list enabled assets: {}", e);
            Vec::new()
        }
    };
    if symbols.is_empty() {
        warn!("No enabled assets configured; the engine will idle until bootstrap finds some");
    } else {
        info!("Trading {} asset(s): {}", symbols.len(), symbols.join(", "));
    }

    let (quote_tx, quote_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (update_tx, update_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let market_connected = Arc::new(AtomicBool::new(false));
    let trade_connected = Arc::new(AtomicBool::new(false));

    // Stream consumers reconnect internally; the supervisor only has to
    // bring them back from panics.
    {
        let stream_config =
            MarketStreamConfig::new(&config.api_key, &config.api_secret, None);
        let symbols = symbols.clone();
        let connected = market_connected.clone();
        tokio::spawn(supervise("market_stream", RestartPolicy::default(), move || {
            MarketStream::spawn(
                stream_config.clone(),
                symbols.clone(),
                quote_tx.clone(),
                connected.clone(),
            )
        }));
    }
    {
        let stream_config = TradeStreamConfig::from_rest_base(
            &config.api_key,
            &config.api_secret,
            &config.api_base_url,
        );
        let connected = trade_connected.clone();
        tokio::spawn(supervise("trade_stream", RestartPolicy::default(), move || {
            TradeStream::spawn(stream_config.clone(), update_tx.clone(), connected.clone())
        }));
    }

    let runtime = LiveRuntime::new(deps.clone());
    let runtime_handle = tokio::spawn(runtime.run(quote_rx, update_rx, shutdown_rx.clone()));

    let janitor = Arc::new(OrderJanitor::new(deps.clone()));
    spawn_periodic("order_janitor", JANITOR_PERIOD, shutdown_rx.clone(), move || {
        let janitor = janitor.clone();
        async move { janitor.run_once().await }
    });

    let stuck_sells = Arc::new(StuckSellSweeper::new(deps.clone()));
    spawn_periodic("stuck_sells", STUCK_SELL_PERIOD, shutdown_rx.clone(), move || {
        let stuck_sells = stuck_sells.clone();
        async move { stuck_sells.run_once().await }
    });

    let consistency = Arc::new(ConsistencyChecker::new(deps.clone()));
    spawn_periodic("consistency", CONSISTENCY_PERIOD, shutdown_rx.clone(), move || {
        let consistency = consistency.clone();
        async move { consistency.run_once().await }
    });

    let bootstrapper = Arc::new(bootstrapper);
    spawn_periodic("bootstrap", BOOTSTRAP_PERIOD, shutdown_rx.clone(), move || {
        let bootstrapper = bootstrapper.clone();
        async move { bootstrapper.run_once().await }
    });

    // Health endpoint for operators and the watchdog.
    let health_state = Arc::new(HealthState {
        market_connected,
        trade_connected,
    });
    let app = Router::new()
        .route("/health", get(health_check))
        .with_state(health_state);
    let addr = SocketAddr::from(([127, 0, 0, 1], config.health_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);
    {
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                error!("Health server error: {}", e);
            }
        });
    }

    info!("Engine running; Ctrl+C or SIGTERM to stop");
    wait_for_shutdown_signal().await;

    info!("Shutting down: draining in-flight work (up to {:?})", SHUTDOWN_DRAIN);
    let _ = shutdown_tx.send(true);
    let aborter = runtime_handle.abort_handle();
    if tokio::time::timeout(SHUTDOWN_DRAIN, runtime_handle).await.is_err() {
        warn!("Drain deadline exceeded, aborting remaining work");
        aborter.abort();
    }

    remove_pid_file(&config);
    info!("DCA trading engine stopped");
    Ok(())
}

async fn health_check(
    State(state): State<Arc<HealthState>>,
) -> Json<HashMap<String, serde_json::Value>> {
    let market = state.market_connected.load(Ordering::Relaxed);
    let trade = state.trade_connected.load(Ordering::Relaxed);

    let mut response = HashMap::new();
    response.insert("status".to_string(), serde_json::json!("running"));
    response.insert("market_stream_connected".to_string(), serde_json::json!(market));
    response.insert("trade_stream_connected".to_string(), serde_json::json!(trade));
    response.insert("healthy".to_string(), serde_json::json!(market && trade));
    Json(response)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn create_pid_file(config: &Config) {
    match std::fs::write(&config.pid_file, std::process::id().to_string()) {
        Ok(()) => info!("Created PID file {:?} (pid {})", config.pid_file, std::process::id()),
        Err(e) => error!("Failed to create PID file {:?}: {}", config.pid_file, e),
    }
}

fn remove_pid_file(config: &Config) {
    if config.pid_file.exists() {
        if let Err(e) = std::fs::remove_file(&config.pid_file) {
            error!("Failed to remove PID file {:?}: {}", config.pid_file, e);
        }
    }
}
