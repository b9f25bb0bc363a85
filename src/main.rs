// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Semaphore;

use ongarde::allowlist::Allowlist;
use ongarde::audit::{start_pipeline, SqliteAuditStore};
use ongarde::auth::{default_keys_path, KeyStore, RateLimiter};
use ongarde::config::{self, Config, ScannerMode};
use ongarde::metrics::Metrics;
use ongarde::proxy::{build_router, AppState, MAX_CONCURRENT_REQUESTS};
use ongarde::scanner::calibration::{run_calibration, CalibrationResult};
use ongarde::scanner::gate::ScanGate;
use ongarde::scanner::nlp::NlpScanner;
use ongarde::upstream::ReqwestSender;

/// Pending-connection backlog for the listener.
const TCP_BACKLOG: u32 = 50;

#[derive(Parser)]
#[command(name = "ongarde", about = "Transparent security proxy for AI agents")]
struct Cli {
    /// Path to config.yaml (falls back to the state directory)
    #[arg(long)]
    config: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────────────
    let mut cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        cfg.proxy.port = port;
    }
    let config = Arc::new(cfg);

    // ── State directory and PID file ────────────────────────────────────
    let state_dir = config::state_dir();
    if let Err(e) = prepare_state_dir(&state_dir) {
        tracing::error!("failed to prepare state directory: {e}");
        std::process::exit(1);
    }
    let pid_path = state_dir.join("proxy.pid");
    if let Err(e) = write_pid_file(&pid_path) {
        tracing::warn!("failed to write pid file: {e}");
    }

    // ── Stores ──────────────────────────────────────────────────────────
    let audit_path = resolve_audit_path(&config);
    let audit_store = match SqliteAuditStore::open(&audit_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to open audit store: {e}");
            std::process::exit(1);
        }
    };
    let keys = match KeyStore::open(&default_keys_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to open key store: {e}");
            std::process::exit(1);
        }
    };

    // ── Scanner initialization ──────────────────────────────────────────
    // Rule catalog compiles on first access; a bad pattern aborts startup.
    let rule_count = ongarde::scanner::rules::catalog().len();

    let nlp = match config.scanner.mode {
        ScannerMode::Full => Some(Arc::new(NlpScanner::new(&config.scanner.entity_set))),
        ScannerMode::Lite => None,
    };

    let calibration = Arc::new(match &nlp {
        Some(scanner) => {
            let scanner = scanner.clone();
            tokio::task::spawn_blocking(move || run_calibration(&scanner))
                .await
                .unwrap_or_else(|_| {
                    CalibrationResult::conservative_fallback("calibration task failed")
                })
        }
        None => CalibrationResult::conservative_fallback("lite mode — nlp disabled"),
    });

    // ── Allowlist ───────────────────────────────────────────────────────
    let allowlist = Allowlist::load(&state_dir.join("allowlist.yaml"));
    let _watcher = match Allowlist::start_watcher(&allowlist) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!("allowlist watcher unavailable — hot reload disabled: {e}");
            None
        }
    };

    // ── Audit pipeline and retention pruner ─────────────────────────────
    let metrics = Arc::new(Metrics::new());
    let audit = start_pipeline(audit_store.clone(), None, metrics.clone());
    spawn_retention_pruner(audit_store.clone(), config.audit.retention_days);

    // ── Gate and router ─────────────────────────────────────────────────
    let gate = Arc::new(ScanGate::new(
        &config,
        nlp.clone(),
        &calibration,
        allowlist.clone(),
        metrics.clone(),
        audit.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        gate,
        sender: Arc::new(ReqwestSender::new()),
        keys,
        audit,
        audit_store,
        metrics,
        nlp,
        calibration: calibration.clone(),
        allowlist,
        limiter: Arc::new(RateLimiter::key_management()),
        ready: Arc::new(AtomicBool::new(false)),
        conn_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
    };

    tracing::info!(
        rules = rule_count,
        scanner_mode = config.scanner.mode.as_str(),
        tier = calibration.tier.as_str(),
        sync_threshold = calibration.sync_threshold,
        "scanner ready"
    );
    state.mark_ready();

    let app = build_router(state);

    // ── Listener ────────────────────────────────────────────────────────
    let addr: SocketAddr = match format!("{}:{}", config.proxy.host, config.proxy.port).parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("invalid proxy bind address: {e}");
            std::process::exit(1);
        }
    };

    let listener = match bind_with_backlog(addr) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%addr, "failed to bind: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "ongarde listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    if let Err(e) = serve.await {
        tracing::error!("server error: {e}");
    }
    let _ = std::fs::remove_file(&pid_path);
}

fn load_config(explicit: Option<&str>) -> Result<Config, config::ConfigError> {
    match config::resolve_config_path(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            config::load_config(&config::FileSource { path })
        }
        None => {
            tracing::info!("no config file found — using defaults");
            config::default_config()
        }
    }
}

fn bind_with_backlog(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(TCP_BACKLOG)
}

fn prepare_state_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn resolve_audit_path(config: &Config) -> std::path::PathBuf {
    let configured = &config.audit.path;
    if configured == "~/.ongarde/audit.db" {
        // Default location follows the state directory (ONGARDE_HOME-aware)
        return config::state_dir().join("audit.db");
    }
    if let Some(rest) = configured.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return std::path::PathBuf::from(home).join(rest);
    }
    configured.into()
}

fn spawn_retention_pruner(store: Arc<SqliteAuditStore>, retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
        interval.tick().await; // first tick fires immediately; prune at startup
        loop {
            let store = store.clone();
            let result =
                tokio::task::spawn_blocking(move || store.prune_old_events(retention_days)).await;
            if let Ok(Err(e)) = result {
                tracing::warn!("audit retention prune failed: {e}");
            }
            interval.tick().await;
        }
    });
}
