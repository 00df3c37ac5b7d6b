mod logging;
mod routes;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use remedy_agent::claude::ClaudeFixBackend;
use remedy_core::{
    agent::FixBackend,
    backup::BackupManager,
    config::Config,
    db::Db,
    engine::RemediationEngine,
    extractor::Extractor,
    service::{ServiceControl, SystemdControl},
    tailer::{LogBatch, Tailer},
    types::EngineEvent,
    updater::Updater,
    verify::{FixVerifier, LogVerifier},
};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub engine: Arc<RemediationEngine>,
    pub updater: Arc<Updater>,
    pub event_tx: broadcast::Sender<EngineEvent>,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(512);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remedy_server=info,remedy_core=info,remedy_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/remedy.db", config.data_dir);
    let mut db = Db::open(&db_path)?;
    db.migrate()?;
    let db = Arc::new(db);
    let config = Arc::new(config);

    // Shared restart lock: one mutating operation may hold the service
    // stopped at a time.
    let restart_lock = Arc::new(Mutex::new(()));

    let service: Arc<dyn ServiceControl> =
        Arc::new(SystemdControl::new(&config.service_name, &config.health_url));

    let backend: Arc<dyn FixBackend> = Arc::new(ClaudeFixBackend::new(&config.agent_bin));

    let verifier: Arc<dyn FixVerifier> = Arc::new(LogVerifier::new(
        &config.log_file,
        &config.syntax_check_cmd,
        config.context_lines,
        std::time::Duration::from_secs(config.stabilization_s),
        std::time::Duration::from_secs(config.ready_timeout_s),
        Arc::clone(&service),
        Arc::clone(&restart_lock),
    ));

    let backup = Arc::new(BackupManager::new(
        &config.backup_dir,
        &config.database,
        config.backup_retention_days,
        config.backup_compression,
        Arc::clone(&db),
    ));

    let (engine, _event_rx) = RemediationEngine::new(
        Arc::clone(&db),
        backend,
        verifier,
        Arc::clone(&backup),
        Arc::clone(&config),
        Arc::clone(&restart_lock),
    );
    let event_tx = engine.event_tx.clone();

    // Attempts interrupted by the previous process resume with correct
    // counts before anything new is dispatched.
    engine.recover()?;

    let updater = Arc::new(Updater::new(
        Arc::clone(&config),
        Arc::clone(&db),
        Arc::clone(&backup),
        Arc::clone(&service),
        Arc::clone(&restart_lock),
        event_tx.clone(),
    ));

    // Tailer → extractor → classifier/engine pipeline. The bounded channel
    // is the backpressure point: a slow engine pauses polling instead of
    // buffering the log stream.
    let (batch_tx, mut batch_rx) = mpsc::channel::<LogBatch>(config.tail_buffer);
    {
        let tailer = Tailer::new(&config.log_file, Arc::clone(&db), config.tail_poll_ms);
        tokio::spawn(tailer.run(batch_tx));
    }
    {
        let engine = Arc::clone(&engine);
        let context_lines = config.context_lines;
        tokio::spawn(async move {
            let mut extractor = Extractor::new(context_lines);
            while let Some(batch) = batch_rx.recv().await {
                if batch.reset {
                    info!("log source reset, downstream extractor state cleared");
                }
                for candidate in extractor.push_batch(&batch) {
                    if let Err(e) = engine.admit(candidate) {
                        warn!("admit failed: {e}");
                    }
                }
            }
        });
    }

    // Engine scheduler loop.
    {
        let engine = Arc::clone(&engine);
        let tick_s = config.engine_tick_s;
        tokio::spawn(async move {
            loop {
                if let Err(e) = engine.tick().await {
                    tracing::error!("engine tick error: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_secs(tick_s)).await;
            }
        });
    }

    // Snapshot retention sweep, independent of the remediation flow.
    {
        let backup = Arc::clone(&backup);
        let db_sweep = Arc::clone(&db);
        tokio::spawn(async move {
            const SWEEP_INTERVAL_S: i64 = 3600;
            loop {
                let now = chrono::Utc::now().timestamp();
                if now - db_sweep.get_ts("last_sweep_ts") >= SWEEP_INTERVAL_S {
                    db_sweep.set_ts("last_sweep_ts", now);
                    match backup.sweep().await {
                        Ok(0) => {}
                        Ok(n) => info!("retention sweep removed {n} snapshot(s)"),
                        Err(e) => warn!("retention sweep: {e}"),
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        });
    }

    let state = Arc::new(AppState {
        db,
        engine,
        updater,
        event_tx,
        log_tx,
        log_ring,
        start_time: Instant::now(),
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Errors
        .route("/api/errors", get(routes::list_errors))
        .route("/api/errors/:id", get(routes::get_error))
        .route("/api/errors/:id/retry", post(routes::retry_error))
        .route("/api/errors/:id/ignore", post(routes::ignore_error))
        // Status
        .route("/api/status", get(routes::get_status))
        // Snapshots
        .route("/api/snapshots", get(routes::list_snapshots))
        // Module updates
        .route("/api/updates", post(routes::trigger_update))
        // SSE
        .route("/api/events", get(routes::sse_events))
        .route("/api/logs", get(routes::sse_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
