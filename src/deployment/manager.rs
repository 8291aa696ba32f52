use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::ids::instance_deployment_id;
use crate::brokerpak::ActionDefinition;
use crate::config::FeatureFlags;
use crate::error::BrokerError;
use crate::storage::recovery::LockFiles;
use crate::storage::{operation_state, Storage, TerraformDeployment};
use crate::workspace::{TfTransformer, Workspace};

/// Status of the most recent operation on a deployment, as reported to pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperation {
    pub operation_type: String,
    pub state: String,
    pub description: String,
}

impl LastOperation {
    pub fn is_done(&self) -> bool {
        self.state != operation_state::IN_PROGRESS
    }

    pub fn is_failed(&self) -> bool {
        self.state == operation_state::FAILED
    }
}

/// Owns deployment rows and the per-deployment operation lock.
///
/// A guard returned by [`DeploymentManager::acquire`] is held by the
/// background task for the whole operation, so a second request for the same
/// deployment is refused rather than queued.
pub struct DeploymentManager {
    storage: Storage,
    locks: DashMap<String, Arc<Mutex<()>>>,
    lockfiles: Option<LockFiles>,
    flags: FeatureFlags,
}

impl DeploymentManager {
    pub fn new(storage: Storage, lockfiles: Option<LockFiles>, flags: FeatureFlags) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
            lockfiles,
            flags,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn flags(&self) -> FeatureFlags {
        self.flags
    }

    /// Take the operation lock for a deployment without waiting.
    pub fn try_lock(&self, deployment_id: &str) -> Result<OwnedMutexGuard<()>, BrokerError> {
        let lock = self
            .locks
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().map_err(|_| {
            tracing::info!(deployment = %deployment_id, "refusing concurrent operation");
            BrokerError::concurrency()
        })
    }

    /// Take the operation lock, then refuse if the stored row still reports an
    /// operation in progress, as a row left behind by a restart would.
    pub fn acquire(&self, deployment_id: &str) -> Result<OwnedMutexGuard<()>> {
        let guard = self.try_lock(deployment_id)?;
        self.check_not_in_progress(deployment_id)?;
        Ok(guard)
    }

    /// Refuse when the stored deployment still reports an operation in progress.
    pub fn check_not_in_progress(&self, deployment_id: &str) -> Result<()> {
        if !self.storage.exists_terraform_deployment(deployment_id)? {
            return Ok(());
        }
        if self.storage.get_terraform_deployment(deployment_id)?.is_in_progress() {
            tracing::info!(deployment = %deployment_id, "refusing operation on in-progress row");
            return Err(BrokerError::concurrency().into());
        }
        Ok(())
    }

    // ─── Rows ───────────────────────────────────────────────────────────────

    /// Load the row for `id` if there is one, swap in `workspace`, and store it.
    pub fn create_and_save_deployment(&self, id: &str, workspace: Workspace) -> Result<TerraformDeployment> {
        let mut deployment = if self.storage.exists_terraform_deployment(id)? {
            self.storage.get_terraform_deployment(id)?
        } else {
            TerraformDeployment::new(id, Workspace::default())
        };
        deployment.workspace = workspace;
        self.storage.store_terraform_deployment(&deployment)?;
        Ok(deployment)
    }

    pub fn get(&self, id: &str) -> Result<TerraformDeployment> {
        self.storage.get_terraform_deployment(id)
    }

    pub fn store(&self, deployment: &TerraformDeployment) -> Result<()> {
        self.storage.store_terraform_deployment(deployment)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.storage.delete_terraform_deployment(id)
    }

    /// Deployment ids of every binding recorded for an instance.
    pub fn binding_deployment_ids(&self, instance_id: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .get_service_binding_ids_for_service_instance(instance_id)?
            .iter()
            .map(|binding_id| super::ids::binding_deployment_id(instance_id, binding_id))
            .collect())
    }

    // ─── Operation status ───────────────────────────────────────────────────

    pub fn mark_operation_started(&self, deployment: &mut TerraformDeployment, operation_type: &str) -> Result<()> {
        deployment.last_operation_type = operation_type.to_string();
        deployment.last_operation_state = operation_state::IN_PROGRESS.to_string();
        deployment.last_operation_message = format!("{operation_type} {}", operation_state::IN_PROGRESS);
        self.storage.store_terraform_deployment(deployment)?;

        if let Some(locks) = &self.lockfiles {
            locks.write(&deployment.id)?;
        }
        tracing::info!(deployment = %deployment.id, operation = operation_type, "operation started");
        Ok(())
    }

    /// Record the outcome of the running operation along with the workspace it produced.
    pub fn mark_operation_finished(&self, deployment: &mut TerraformDeployment, outcome: &Result<()>) -> Result<()> {
        let op = deployment.last_operation_type.clone();
        match outcome {
            Ok(()) => {
                deployment.last_operation_state = operation_state::SUCCEEDED.to_string();
                deployment.last_operation_message = match deployment.workspace.outputs() {
                    Ok(outputs) => match outputs.get("status") {
                        Some(status) => format!("{op} succeeded: {}", crate::brokerpak::interpolation::to_display(status)),
                        None => format!("{op} succeeded"),
                    },
                    Err(_) => format!("{op} succeeded"),
                };
                tracing::info!(deployment = %deployment.id, operation = %op, "operation succeeded");
            }
            Err(err) => {
                deployment.last_operation_state = operation_state::FAILED.to_string();
                deployment.last_operation_message = format!("{op} failed: {err:#}");
                tracing::error!(deployment = %deployment.id, operation = %op, error = %format!("{err:#}"), "operation failed");
            }
        }
        self.storage.store_terraform_deployment(deployment)?;

        if let Some(locks) = &self.lockfiles {
            locks.remove(&deployment.id)?;
        }
        Ok(())
    }

    pub fn operation_status(&self, deployment_id: &str) -> Result<LastOperation> {
        let d = self.storage.get_terraform_deployment(deployment_id)?;
        Ok(LastOperation {
            operation_type: d.last_operation_type,
            state: d.last_operation_state,
            description: d.last_operation_message,
        })
    }

    /// Root outputs of an instance's deployment.
    pub fn instance_outputs(&self, instance_id: &str) -> Result<Map<String, Value>> {
        self.storage
            .get_terraform_deployment(&instance_deployment_id(instance_id))?
            .workspace
            .outputs()
    }

    // ─── HCL refresh ────────────────────────────────────────────────────────

    /// Re-render a deployment's modules from the current pak, keeping its state.
    ///
    /// A no-op unless brokerpak updates or tool upgrades are enabled.
    pub fn update_workspace_hcl(&self, id: &str, action: &ActionDefinition, vars: &Map<String, Value>) -> Result<()> {
        if !self.flags.dynamic_hcl && !self.flags.tf_upgrades {
            return Ok(());
        }

        let mut deployment = self.storage.get_terraform_deployment(id)?;
        let mut workspace = Workspace::new(vars, &action.template, &action.templates, TfTransformer::default())?;
        workspace.state = deployment.workspace.state.take();
        workspace.pinned_version = deployment.workspace.pinned_version.take();
        deployment.workspace = workspace;

        tracing::debug!(deployment = %id, "refreshed workspace HCL from brokerpak");
        self.storage.store_terraform_deployment(&deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::noop::NoopEncryptor;
    use crate::storage::{migration, Database};
    use tempfile::TempDir;

    fn manager(flags: FeatureFlags, locks: Option<LockFiles>) -> DeploymentManager {
        let db = Arc::new(Database::open_memory().unwrap());
        migration::run_migrations(&db).unwrap();
        DeploymentManager::new(Storage::new(db, Arc::new(NoopEncryptor::new())), locks, flags)
    }

    #[test]
    fn lock_is_exclusive_per_deployment() {
        let m = manager(FeatureFlags::default(), None);
        let guard = m.try_lock("tf:a:").unwrap();
        let err = m.try_lock("tf:a:").unwrap_err();
        assert_eq!(err.to_string(), "operation already in progress");
        assert!(m.try_lock("tf:b:").is_ok());
        drop(guard);
        assert!(m.try_lock("tf:a:").is_ok());
    }

    #[test]
    fn acquire_refuses_rows_left_in_progress() {
        let m = manager(FeatureFlags::default(), None);
        assert!(m.acquire("tf:new:").is_ok());

        let mut d = m.create_and_save_deployment("tf:a:", Workspace::default()).unwrap();
        m.mark_operation_started(&mut d, "provision").unwrap();
        let err = m.acquire("tf:a:").unwrap_err();
        assert_eq!(err.to_string(), "operation already in progress");
        // The in-memory lock is released on refusal.
        assert!(m.try_lock("tf:a:").is_ok());

        m.mark_operation_finished(&mut d, &Ok(())).unwrap();
        assert!(m.acquire("tf:a:").is_ok());
    }

    #[test]
    fn status_messages_follow_the_operation() {
        let dir = TempDir::new().unwrap();
        let locks = LockFiles::new(dir.path()).unwrap();
        let m = manager(FeatureFlags::default(), Some(locks.clone()));

        let mut d = m.create_and_save_deployment("tf:a:", Workspace::default()).unwrap();
        m.mark_operation_started(&mut d, "provision").unwrap();
        assert!(locks.any_exist());
        let status = m.operation_status("tf:a:").unwrap();
        assert!(!status.is_done());
        assert_eq!(status.description, "provision in progress");

        m.mark_operation_finished(&mut d, &Err(anyhow::anyhow!("boom"))).unwrap();
        assert!(!locks.any_exist());
        let status = m.operation_status("tf:a:").unwrap();
        assert!(status.is_failed());
        assert_eq!(status.description, "provision failed: boom");

        d.workspace.state = Some(
            br#"{"version":4,"terraform_version":"1.6.2","outputs":{"status":{"value":"created db","type":"string"}}}"#
                .to_vec(),
        );
        m.mark_operation_started(&mut d, "update").unwrap();
        m.mark_operation_finished(&mut d, &Ok(())).unwrap();
        let status = m.operation_status("tf:a:").unwrap();
        assert_eq!(status.state, "succeeded");
        assert_eq!(status.description, "update succeeded: created db");
    }

    #[test]
    fn existing_rows_keep_their_status_on_recreate() {
        let m = manager(FeatureFlags::default(), None);
        let mut d = m.create_and_save_deployment("tf:a:b", Workspace::default()).unwrap();
        m.mark_operation_started(&mut d, "bind").unwrap();
        let again = m.create_and_save_deployment("tf:a:b", Workspace::default()).unwrap();
        assert_eq!(again.last_operation_type, "bind");
    }

    #[test]
    fn hcl_refresh_requires_a_flag_and_keeps_state() {
        let action = ActionDefinition {
            template: "variable \"name\" {}\noutput \"n\" { value = var.name }\n".into(),
            ..Default::default()
        };
        let vars: Map<String, Value> = serde_json::json!({"name": "x", "other": 1}).as_object().cloned().unwrap();

        let m = manager(FeatureFlags::default(), None);
        let mut ws = Workspace::default();
        ws.state = Some(b"{\"version\":4}".to_vec());
        m.create_and_save_deployment("tf:a:", ws.clone()).unwrap();
        m.update_workspace_hcl("tf:a:", &action, &vars).unwrap();
        assert!(m.get("tf:a:").unwrap().workspace.modules.is_empty());

        let m = manager(
            FeatureFlags {
                dynamic_hcl: true,
                ..Default::default()
            },
            None,
        );
        m.create_and_save_deployment("tf:a:", ws).unwrap();
        m.update_workspace_hcl("tf:a:", &action, &vars).unwrap();
        let refreshed = m.get("tf:a:").unwrap().workspace;
        assert_eq!(refreshed.modules[0].definition, action.template);
        assert_eq!(refreshed.instances[0].configuration.len(), 1);
        assert!(refreshed.has_state());
    }
}
