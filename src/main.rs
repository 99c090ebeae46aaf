// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Result};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vylet_social_indexer::api::{self, AppState};
use vylet_social_indexer::blobs::BlobTracker;
use vylet_social_indexer::bus::{
    run_retention, ConsumerGroup, LogCursorStore, LogStore, MemoryLog, PgLog, Producer,
};
use vylet_social_indexer::config::{Backend, Config};
use vylet_social_indexer::db::Database;
use vylet_social_indexer::firehose::Ingestor;
use vylet_social_indexer::indexer::Indexer;
use vylet_social_indexer::metrics::{PrometheusMetrics, SharedMetrics};
use vylet_social_indexer::store::{MemoryStore, PgStore, RpcStore, SocialStore};

const RETENTION_SWEEP: Duration = Duration::from_secs(10 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

type RoleResult = (&'static str, Result<()>);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    dotenv().ok();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vylet_social_indexer=debug".into()),
    );
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let config = Config::from_env()?;
    info!("Initialized configuration");

    let prometheus = Arc::new(PrometheusMetrics::new());
    let metrics: SharedMetrics = prometheus.clone();

    // Initialize database
    let db = if config.store.backend == Backend::Postgres || config.bus.backend == Backend::Postgres {
        let db = Arc::new(Database::new(&config.database).await?);
        info!("Connected to database");
        Some(db)
    } else {
        None
    };

    let store = build_store(&config, db.as_ref())?;
    let log = build_log(&config, db.as_ref())?;

    let cancel = CancellationToken::new();
    let mut roles: JoinSet<RoleResult> = JoinSet::new();

    if config.roles.ingestor {
        let producer = Arc::new(Producer::new(
            log.clone(),
            config.bus.topic.clone(),
            config.bus.partitions,
            config.bus.max_in_flight,
            metrics.clone(),
        ));
        let cursors = Arc::new(LogCursorStore::new(log.clone(), config.bus.cursor_topic()));
        let ingestor = Arc::new(Ingestor::new(&config.firehose, producer, metrics.clone()));
        let token = cancel.clone();
        roles.spawn(async move { ("ingestor", ingestor.run(cursors, token).await) });

        let (log, topic, token) = (log.clone(), config.bus.topic.clone(), cancel.clone());
        let retention = config.bus.retention();
        roles.spawn(async move {
            run_retention(log, topic, retention, RETENTION_SWEEP, token).await;
            ("retention", Ok(()))
        });
    }

    if config.roles.indexer {
        let indexer = Arc::new(
            Indexer::new(store.clone(), metrics.clone())
                .skip_unsupported_updates(config.indexer.skip_unsupported_updates),
        );
        let group = consumer_group(&config, log.clone(), &config.indexer.consumer_group, metrics.clone());
        let token = cancel.clone();
        roles.spawn(async move { ("indexer", group.run(indexer, token).await) });
    }

    if config.roles.blob_tracker {
        let tracker = Arc::new(BlobTracker::new(store.clone(), metrics.clone()));
        let group = consumer_group(
            &config,
            log.clone(),
            &config.indexer.blobs_consumer_group,
            metrics.clone(),
        );
        let token = cancel.clone();
        roles.spawn(async move { ("blob tracker", group.run(tracker, token).await) });
    }

    if config.roles.rpc_server {
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
        let mut state = AppState::new(store.clone()).with_metrics(prometheus.clone());
        if let Some(db) = &db {
            state = state.with_database(db.clone());
        }
        let token = cancel.clone();
        roles.spawn(async move { ("rpc server", api::serve(addr, state, token).await) });
    }

    if roles.is_empty() {
        return Err(anyhow!("no roles enabled; set at least one RUN_* variable"));
    }

    // Run until a signal arrives or a role stops on its own
    let mut failed = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
        Some(joined) = roles.join_next() => {
            failed = !report(joined);
            warn!("A role stopped unexpectedly, shutting down the rest");
        }
    }
    cancel.cancel();

    let drain = async {
        while let Some(joined) = roles.join_next().await {
            if !report(joined) {
                failed = true;
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Roles did not stop within {:?}; aborting", SHUTDOWN_GRACE);
        roles.abort_all();
        failed = true;
    }

    info!("Vylet indexer shutdown complete");
    if failed {
        return Err(anyhow!("one or more roles failed"));
    }
    Ok(())
}

fn build_store(config: &Config, db: Option<&Arc<Database>>) -> Result<Arc<dyn SocialStore>> {
    let store: Arc<dyn SocialStore> = match config.store.backend {
        Backend::Memory => {
            warn!("Using the in-memory store; indexed data is lost on restart");
            Arc::new(MemoryStore::new())
        }
        Backend::Postgres => {
            let db = db.ok_or_else(|| anyhow!("postgres store requires a database"))?;
            Arc::new(PgStore::new(db.clone()))
        }
        Backend::Rpc => Arc::new(RpcStore::new(&config.store.rpc_url)?),
    };
    Ok(store)
}

fn build_log(config: &Config, db: Option<&Arc<Database>>) -> Result<Arc<dyn LogStore>> {
    let log: Arc<dyn LogStore> = match config.bus.backend {
        Backend::Memory => Arc::new(MemoryLog::new()),
        Backend::Postgres => {
            let db = db.ok_or_else(|| anyhow!("postgres relay requires a database"))?;
            Arc::new(PgLog::new(db.clone()))
        }
        Backend::Rpc => return Err(anyhow!("the relay cannot run over RPC")),
    };
    Ok(log)
}

fn consumer_group(
    config: &Config,
    log: Arc<dyn LogStore>,
    group: &str,
    metrics: SharedMetrics,
) -> ConsumerGroup {
    ConsumerGroup::new(log, group, config.bus.topic.clone(), config.bus.partitions, metrics)
        .with_membership(config.bus.member_index, config.bus.member_count)
        .with_poll_interval(config.bus.poll_interval())
}

/// Log how a role ended; false when it failed
fn report(joined: Result<RoleResult, tokio::task::JoinError>) -> bool {
    match joined {
        Ok((role, Ok(()))) => {
            info!("{} stopped", role);
            true
        }
        Ok((role, Err(e))) => {
            error!("{} failed: {:#}", role, e);
            false
        }
        Err(e) => {
            error!("Role task panicked: {}", e);
            false
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
