//! Service construction and the process lifecycle.
//!
//! # Design
//! - Configuration is loaded once; the store is Postgres when a database URL is set and
//!   in-memory otherwise.
//! - Background tasks (scheduler, relocation worker, task sweeper) are spawned together
//!   and aborted together on shutdown.

use std::path::Path;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tierkeep_config::{ConfigLoader, EngineConfig};
use tierkeep_data::{MemoryStore, PgStore, Store};
use tierkeep_engine::{
    AssumeSupported, CriteriaMatcher, FileWorkflow, Fs2DiskUsage, RelocationManager,
    ScanProgressManager, StorageRouter, WorkflowDeps,
};
use tierkeep_fsops::{EncryptionService, FileMover};
use tierkeep_telemetry::{LoggingConfig, Metrics};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::scheduler::Scheduler;

const DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Long-lived services shared by the scheduler and any presentation layer.
#[derive(Clone)]
pub struct Services {
    /// Repository.
    pub store: Arc<dyn Store>,
    /// Scan and per-file operations.
    pub workflow: FileWorkflow,
    /// Cold-to-cold migration queue.
    pub relocations: RelocationManager,
    /// Metrics registry.
    pub metrics: Metrics,
}

/// Build every service from a validated configuration.
///
/// # Errors
///
/// Returns an error if the database, key file, or metrics registry cannot be set up.
pub async fn build_services(config: &EngineConfig) -> AppResult<Services> {
    let store = open_store(config.database_url.as_deref()).await?;
    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let encryption = EncryptionService::from_key_file(&config.encryption.key_file)
        .map_err(|err| AppError::fsops("encryption.key_file", err))?;
    let mover = FileMover::new(Some(Arc::new(encryption)));

    let workflow = FileWorkflow::new(WorkflowDeps {
        store: Arc::clone(&store),
        router: StorageRouter::new(
            Arc::clone(&store),
            Arc::new(Fs2DiskUsage),
            config.routing.clone(),
        ),
        mover: mover.clone(),
        progress: ScanProgressManager::new(&config.progress),
        matcher: CriteriaMatcher::default(),
        capability: Arc::new(AssumeSupported),
        metrics: metrics.clone(),
        settings: config.scan.clone(),
    });
    let relocations = RelocationManager::new(
        Arc::clone(&store),
        mover,
        metrics.clone(),
        &config.relocation,
    );
    Ok(Services {
        store,
        workflow,
        relocations,
        metrics,
    })
}

/// Entry point for the tierkeep boot sequence; runs until Ctrl-C.
///
/// # Errors
///
/// Returns an error if configuration, logging, or service construction fails.
pub async fn run_app(config_path: Option<&Path>) -> AppResult<()> {
    let config = ConfigLoader::from_env()
        .load(config_path)
        .map_err(|err| AppError::config("config.load", err))?;
    tierkeep_telemetry::init_logging(&LoggingConfig::from(&config.logging))
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!(
        store = if config.database_url.is_some() { "postgres" } else { "memory" },
        "tierkeep bootstrap starting"
    );

    let services = build_services(&config).await?;
    let handles = start_background(&services, &config)?;
    info!(tick_secs = config.scheduler.tick_secs, "scheduler running");

    let signal = tokio::signal::ctrl_c().await;
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        if let Err(err) = handle.await
            && !err.is_cancelled()
        {
            warn!(error = %err, "background task join failed");
        }
    }
    signal.map_err(|source| AppError::Signal { source })?;
    info!("tierkeep shutdown complete");
    Ok(())
}

/// Spawn the relocation worker, both sweepers, and the scheduler.
///
/// # Errors
///
/// Returns an error when the relocation worker was already started.
pub fn start_background(services: &Services, config: &EngineConfig) -> AppResult<Vec<JoinHandle<()>>> {
    let worker = services
        .relocations
        .spawn_worker()
        .map_err(|err| AppError::engine("relocation.spawn_worker", err))?;
    let scheduler = Scheduler::new(
        Arc::clone(&services.store),
        services.workflow.clone(),
        config.scheduler.tick(),
    );
    Ok(vec![
        worker,
        services
            .relocations
            .spawn_sweeper(config.relocation.sweep_interval()),
        services
            .workflow
            .progress()
            .spawn_sweeper(config.progress.sweep_interval()),
        scheduler.spawn(),
    ])
}

async fn open_store(database_url: Option<&str>) -> AppResult<Arc<dyn Store>> {
    let Some(url) = database_url else {
        warn!("no database configured; using the in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(DATABASE_MAX_CONNECTIONS)
        .connect(url)
        .await
        .map_err(|source| AppError::Database {
            operation: "database.connect",
            source,
        })?;
    let store = PgStore::new(pool)
        .await
        .map_err(|err| AppError::data("database.migrate", err))?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_services_start_and_stop() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut config = EngineConfig::default();
        config.encryption.key_file = dir.path().join("tierkeep.key");

        let services = build_services(&config).await?;
        assert!(config.encryption.key_file.exists());

        let handles = start_background(&services, &config)?;
        assert_eq!(handles.len(), 4);
        assert!(matches!(
            start_background(&services, &config),
            Err(AppError::Engine { operation: "relocation.spawn_worker", .. })
        ));
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}
