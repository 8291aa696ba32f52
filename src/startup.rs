//! Wiring of the store, the brokerpaks and the broker into one running core.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{Catalog, ServiceBroker};
use crate::brokerpak::{registrar, Registry};
use crate::config::Config;
use crate::deployment::DeploymentManager;
use crate::encryption::rotation;
use crate::executor::CommandRunner;
use crate::storage::recovery::{self, LockFiles};
use crate::storage::{migration, Database, Storage};

/// Connect, migrate and reconcile encryption keys.
pub fn open_storage(config: &Config) -> Result<Storage> {
    let db = Database::connect(&config.db_type, &config.db_path)
        .with_context(|| format!("error connecting to {} database", config.db_type))?;
    migration::run_migrations(&db)?;

    let setup = rotation::setup_encryption(&db, config.encryption_enabled, &config.encryption_passwords)
        .context("error setting up encryption")?;
    if setup.rotated {
        tracing::info!(
            primary = ?setup.encryptor.primary_label(),
            deleted = ?setup.deleted_labels,
            "encryption keys rotated"
        );
    }
    Ok(Storage::new(Arc::new(db), setup.encryptor))
}

/// A broker ready to serve, plus the resources it must outlive.
pub struct Core {
    pub broker: Arc<ServiceBroker>,
    pub tasks: TaskTracker,
    pub cancel: CancellationToken,
    _registry: Registry,
}

impl Core {
    /// Cancel running tool invocations and wait for their tasks to record an outcome.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("background operations drained");
    }
}

/// Open the store, recover interrupted operations and load every brokerpak.
pub async fn start(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Core> {
    let storage = open_storage(config)?;

    let lockfiles = config.lockfile_dir.as_ref().map(LockFiles::new).transpose()?;
    let failed = recovery::recover_in_progress_operations(
        storage.database(),
        config.running_on_platform(),
        lockfiles.as_ref(),
    )?;
    if !failed.is_empty() {
        tracing::warn!(count = failed.len(), ids = ?failed, "marked interrupted operations as failed");
    }

    let registry = registrar::register_all(config).await?;
    let catalog = Catalog::build(registry.services.clone(), config)?;
    tracing::info!(services = catalog.services().len(), "catalog loaded");

    let manager = Arc::new(DeploymentManager::new(storage, lockfiles, config.flags));
    let tasks = TaskTracker::new();
    let cancel = CancellationToken::new();
    let broker = ServiceBroker::new(
        catalog,
        manager,
        runner,
        cancel.clone(),
        tasks.clone(),
        config.brokerpak_config.labels(),
    );

    Ok(Core {
        broker: Arc::new(broker),
        tasks,
        cancel,
        _registry: registry,
    })
}
