//! StudyMon - study-room activity monitor
//!
//! Runs the monitor engine behind an HTTP/WebSocket API. The chat bridge
//! connects to `/ws/bridge`, feeds presence changes in and executes the
//! outbound commands it receives.

use std::sync::Arc;
use std::time::Duration;

use studymon::config::{MonitorConfig, ServerSettings};
use studymon::crypto::KeyManager;
use studymon::database::Database;
use studymon::monitor::{spawn_worker, Dispatcher, RuntimeClock, StudyMonitor};
use studymon::server::{self, state::AppState, BridgePlatform};
use studymon::verify::VerdictWaiters;

/// How long to wait for queued actions to drain on exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("studymon=info")),
        )
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              StudyMon - Study Room Monitor                 ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let settings = ServerSettings::from_env();

    println!("🔧 Initializing database...");
    let db = Arc::new(Database::open(&settings.db_path)?);
    let config = MonitorConfig::from_database(&db);
    println!("   ✓ Database ready at {}", settings.db_path.display());

    println!("🔧 Loading signing keys...");
    let keys = Arc::new(KeyManager::load_or_generate(&settings.key_dir)?);
    println!("   ✓ Public key: {}", keys.public_key_base64());

    let events = studymon::feed::channel(100);
    let bridge = studymon::feed::channel(100);

    let (dispatcher, rx) = Dispatcher::channel();
    let worker = spawn_worker(
        rx,
        Arc::new(BridgePlatform::new(bridge.clone())),
        db.clone(),
        Some(events.clone()),
    );

    let monitor = StudyMonitor::new(config, db.clone(), dispatcher, Arc::new(RuntimeClock::new()));
    let sweeper = monitor.spawn_exemption_sweeper();
    tracing::info!(
        grace_secs = monitor.config().grace_period.as_secs(),
        exemption_secs = monitor.config().exemption_window.as_secs(),
        "Monitor started"
    );

    // Ctrl+C stops the server; cleanup runs below
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        println!("\n🛑 Shutdown signal received...");
        let _ = shutdown_tx.send(true);
    })?;

    let state = Arc::new(AppState {
        monitor: monitor.clone(),
        db,
        waiters: Arc::new(VerdictWaiters::new()),
        keys,
        events,
        bridge,
        public_url: settings.public_url.clone(),
    });

    println!();
    println!("════════════════════════════════════════════════════════════════");
    println!("🌐 API available at http://{}", settings.bind);
    println!("   • POST /api/presence        - Presence changes");
    println!("   • GET  /api/monitor         - Tracked users");
    println!("   • GET  /api/leaderboard     - Study time leaderboard");
    println!("   • WS   /ws/bridge           - Platform bridge");
    println!("   • WS   /ws                  - Real-time updates");
    println!("════════════════════════════════════════════════════════════════");
    println!();

    let shutdown = async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    };
    server::serve(settings.bind, state, shutdown).await?;

    // Cleanup
    println!("\n⏳ Shutting down...");
    sweeper.abort();
    let closed = monitor.shutdown().await;
    println!("💾 Saving {} open sessions...", closed.len());

    // Bridge sockets and verification tasks may still hold the monitor
    match tokio::time::timeout(DRAIN_TIMEOUT, worker.finish()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Dispatch worker failed"),
        Err(_) => tracing::warn!("Timed out waiting for queued actions"),
    }

    println!("\n👋 StudyMon has exited. Goodbye!");
    Ok(())
}
