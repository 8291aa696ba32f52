//! Database surgery for instances lost out-of-band. Nothing here runs the tool.

use anyhow::{Context, Result};

use crate::deployment::{binding_deployment_id, instance_deployment_id};
use crate::storage::Storage;

/// Remove an instance, every binding of it, and all their deployments.
pub fn purge_instance(storage: &Storage, instance_id: &str) -> Result<()> {
    for binding_id in storage.get_service_binding_ids_for_service_instance(instance_id)? {
        purge_binding(storage, instance_id, &binding_id)?;
    }
    storage
        .delete_terraform_deployment(&instance_deployment_id(instance_id))
        .context("error deleting instance deployment")?;
    storage.delete_provision_request_details(instance_id)?;
    storage.delete_service_instance_details(instance_id)?;
    tracing::info!(instance = %instance_id, "purged service instance");
    Ok(())
}

pub fn purge_binding(storage: &Storage, instance_id: &str, binding_id: &str) -> Result<()> {
    storage
        .delete_terraform_deployment(&binding_deployment_id(instance_id, binding_id))
        .context("error deleting binding deployment")?;
    storage.delete_bind_request_details(binding_id, instance_id)?;
    storage.delete_service_binding_credentials(binding_id, instance_id)?;
    tracing::info!(instance = %instance_id, binding = %binding_id, "purged service binding");
    Ok(())
}
