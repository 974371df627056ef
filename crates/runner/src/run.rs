use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use spacelink_client::settings::load_dotenv;
use spacelink_client::telemetry::{init_tracing, DEFAULT_DIRECTIVE};
use spacelink_client::{
    ClientSettings, ConnectionOptions, ConnectionPool, CredentialStore, DefaultConnectionFactory,
    EventDispatcher, EventKind, FileCredentialStore, TungsteniteConnector,
};
use spacelink_domain::{ConnectionState, EntityKind, PoolKey};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::subscriber::LoggingSubscriber;

/// TOML settings file, used when no path is given on the command line
const CONFIG_ENV: &str = "SPACELINK_CONFIG";
/// Comma-separated table list overriding the canonical tables
const TABLES_ENV: &str = "SPACELINK_TABLES";

const CANONICAL_TABLES: [EntityKind; 5] = [
    EntityKind::Player,
    EntityKind::Entity,
    EntityKind::Circle,
    EntityKind::Food,
    EntityKind::Config,
];

/// Pause before re-acquiring after a failed acquire or subscribe
const REACQUIRE_DELAY: Duration = Duration::from_secs(2);

/// Cancels `cancel_token` on SIGTERM/SIGINT
fn setup_shutdown_signal(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        cancel_token.cancel();
    });
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn parse_tables(raw: Option<&str>) -> Vec<String> {
    let tables: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tables.is_empty() {
        CANONICAL_TABLES
            .iter()
            .map(|kind| kind.table_name().to_string())
            .collect()
    } else {
        tables
    }
}

/// Resolves once the connection leaves the open states.
async fn until_closed(mut state: watch::Receiver<ConnectionState>) {
    loop {
        if !state.borrow_and_update().is_open() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Keep one subscribed connection checked out for `key` until cancelled.
/// A dropped connection is reported to the pool and replaced.
async fn hold_subscription(
    pool: ConnectionPool,
    key: PoolKey,
    tables: Vec<String>,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        let mut conn = match pool.acquire(&key).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Could not acquire a connection");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(REACQUIRE_DELAY) => continue,
                }
            }
        };

        if let Err(e) = conn.subscribe(&tables).await {
            tracing::error!(key = %key, error = %e, "Subscription failed");
            if e.is_retryable() {
                conn.report_failure();
            }
            drop(conn);
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(REACQUIRE_DELAY) => continue,
            }
        }

        tracing::info!(
            key = %key,
            connection_id = %conn.id(),
            tables = ?tables,
            "Subscribed"
        );

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = until_closed(conn.watch_state()) => {
                tracing::warn!(key = %key, connection_id = %conn.id(), "Connection dropped, re-acquiring");
                conn.report_failure();
            }
        }
    }
    tracing::debug!(key = %key, "Subscription holder stopped");
}

pub async fn run() -> Result<()> {
    load_dotenv();
    init_tracing(DEFAULT_DIRECTIVE);

    tracing::info!("Starting Spacelink runner");

    let cancel_token = CancellationToken::new();
    setup_shutdown_signal(cancel_token.clone());

    let config_path = config_path();
    let settings = ClientSettings::load(config_path.as_deref()).context("failed to load settings")?;
    if settings.servers.is_empty() {
        bail!("no servers configured; pass a TOML file or set SPACELINK__SERVERS");
    }
    tracing::info!("Configuration loaded");
    for server in &settings.servers {
        tracing::info!(
            url = %server.url(),
            language = ?server.language(),
            protocol = %server.protocol(),
            "  Server"
        );
    }

    let dispatcher = EventDispatcher::new();
    let logger = Arc::new(LoggingSubscriber::default());
    let _log_subscription = dispatcher.subscribe(&EventKind::ALL, logger.clone());

    let credentials_dir = settings.credentials_dir();
    tracing::info!(dir = %credentials_dir.display(), "Using credential directory");
    let credentials: Arc<dyn CredentialStore> = Arc::new(
        FileCredentialStore::new(&credentials_dir).context("failed to open credential store")?,
    );

    let factory = DefaultConnectionFactory::new(
        Arc::new(TungsteniteConnector),
        credentials,
        ConnectionOptions {
            settings: settings.connection.clone(),
            pipeline: settings.pipeline.clone(),
            events: Some(dispatcher.clone()),
        },
    );
    let pool = ConnectionPool::new(settings.pool.clone(), Arc::new(factory))?;

    let mut keys = Vec::new();
    for server in &settings.servers {
        let key = pool.register(server.clone())?;
        match pool.warm_up(&key).await {
            Ok(opened) => tracing::info!(key = %key, opened, "Pool ready"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Warm-up failed, will retry on demand"),
        }
        keys.push(key);
    }
    pool.start_health_checks();

    let tables = parse_tables(std::env::var(TABLES_ENV).ok().as_deref());
    let holders: Vec<_> = keys
        .into_iter()
        .map(|key| {
            tokio::spawn(hold_subscription(
                pool.clone(),
                key,
                tables.clone(),
                cancel_token.clone(),
            ))
        })
        .collect();

    cancel_token.cancelled().await;

    for holder in holders {
        if let Err(e) = holder.await {
            tracing::error!(error = %e, "Subscription holder panicked");
        }
    }

    dispatcher.flush().await;
    let metrics = pool.metrics();
    match serde_json::to_string(&metrics) {
        Ok(json) => tracing::info!(metrics = %json, "Final pool metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to render pool metrics"),
    }
    pool.close().await;

    let (inserts, updates, deletes) = logger.totals();
    tracing::info!(
        inserts,
        updates,
        deletes,
        events = dispatcher.metrics().delivered,
        "Spacelink runner stopped"
    );
    Ok(())
}
