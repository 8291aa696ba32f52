use serde_json::{Map, Value};

use crate::workspace::Workspace;

/// Opaque JSON object persisted (encrypted) in a blob column.
pub type JsonObject = Map<String, Value>;

/// Values of `last_operation_type` and `operation_type`.
pub mod operation_type {
    pub const PROVISION: &str = "provision";
    pub const DEPROVISION: &str = "deprovision";
    pub const UPDATE: &str = "update";
    pub const UPGRADE: &str = "upgrade";
    pub const BIND: &str = "bind";
    pub const UNBIND: &str = "unbind";
}

/// Values of `last_operation_state`.
pub mod operation_state {
    pub const IN_PROGRESS: &str = "in progress";
    pub const SUCCEEDED: &str = "succeeded";
    pub const FAILED: &str = "failed";
}

// ─── Service Instances ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInstanceDetails {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub plan_id: String,
    pub space_id: String,
    pub organization_id: String,
    pub outputs: JsonObject,
    pub operation_type: String,
    pub operation_id: String,
}

// ─── Bindings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceBindingCredentials {
    pub service_id: String,
    pub service_instance_id: String,
    pub binding_id: String,
    pub credentials: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindRequestDetails {
    pub service_instance_id: String,
    pub binding_id: String,
    pub request_details: JsonObject,
}

// ─── Deployments ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerraformDeployment {
    pub id: String,
    pub workspace: Workspace,
    pub last_operation_type: String,
    pub last_operation_state: String,
    pub last_operation_message: String,
}

impl TerraformDeployment {
    pub fn new(id: &str, workspace: Workspace) -> Self {
        Self {
            id: id.to_string(),
            workspace,
            ..Default::default()
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.last_operation_state == operation_state::IN_PROGRESS
    }
}

/// Summary row used by `tf list`-style views and recovery.
#[derive(Debug, Clone)]
pub struct TerraformDeploymentListEntry {
    pub id: String,
    pub last_operation_type: String,
    pub last_operation_state: String,
    pub last_operation_message: String,
    pub updated_at: String,
}

// ─── Encryption Metadata ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMetadata {
    pub label: String,
    pub salt: Vec<u8>,
    pub canary: Vec<u8>,
    pub primary: bool,
}
