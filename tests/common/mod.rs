#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tofu_broker::broker::models::LastOperationResponse;
use tofu_broker::broker::{Catalog, ServiceBroker};
use tofu_broker::brokerpak::registrar::maintenance_info;
use tofu_broker::brokerpak::{RegisteredService, ServiceDefinition};
use tofu_broker::config::Config;
use tofu_broker::deployment::DeploymentManager;
use tofu_broker::encryption::noop::NoopEncryptor;
use tofu_broker::executor::{CommandRunner, ExecutionOutput, Invocation, TfBinariesContext, TfVersion, TofuCommand};
use tofu_broker::storage::{migration, Database, Storage};

pub const SERVICE_ID: &str = "5c2c7c3e-3a53-4e47-9b6a-1a1f4a8b0c11";
pub const PLAN_ID: &str = "8b52a460-b246-11eb-a8f5-d349948e2480";
pub const SUBSUME_PLAN_ID: &str = "0f6c2a4e-4e1b-4b63-a5a5-0c3f5b9a7d21";

pub const DEFINITION: &str = r#"
version: 1
name: csb-test-db
id: 5c2c7c3e-3a53-4e47-9b6a-1a1f4a8b0c11
description: a test database
display_name: Test DB
plan_updateable: true
plans:
  - name: small
    id: 8b52a460-b246-11eb-a8f5-d349948e2480
    description: small plan
    display_name: Small
    properties:
      size: 1
  - name: subsume
    id: 0f6c2a4e-4e1b-4b63-a5a5-0c3f5b9a7d21
    description: adopt an existing database
    display_name: Subsume
    properties:
      subsume: true
provision:
  plan_inputs:
    - field_name: size
      type: integer
    - field_name: subsume
      type: boolean
  user_inputs:
    - field_name: name
      type: string
      default: "db-${request.instance_id}"
    - field_name: region
      type: string
      default: us-east-1
      prohibit_update: true
  import_inputs:
    - field_name: database_id
      type: string
      tf_resource: random_pet.db
  template: |
    variable "size" { type = number }
    variable "name" { type = string }
    variable "region" { type = string }
    output "name" { value = var.name }
    output "status" { value = "created" }
  outputs:
    - field_name: name
      type: string
bind:
  user_inputs:
    - field_name: role
      type: string
      default: reader
  template: |
    variable "role" { type = string }
    output "username" { value = "admin" }
  outputs:
    - field_name: username
      type: string
"#;

// ─── Fake tofu ──────────────────────────────────────────────────────────────

/// Stands in for the tofu binary.
///
/// `apply` and `import` write a tfstate stamped with the version directory of
/// the binary that was invoked; `plan` reports `plan_removes` deletions.
#[derive(Default)]
pub struct FakeTofu {
    pub calls: Mutex<Vec<(String, String)>>,
    pub plan_removes: AtomicUsize,
    pub fail_apply: AtomicBool,
    /// Fail `apply` only when run by this version.
    pub fail_apply_at: Mutex<Option<String>>,
}

impl FakeTofu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn apply_fails(&self, version: &str) -> bool {
        self.fail_apply.load(Ordering::SeqCst) || self.fail_apply_at.lock().unwrap().as_deref() == Some(version)
    }

    /// Versions that ran one command name, in call order.
    pub fn versions_of(&self, command: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c == command)
            .map(|(v, _)| v.clone())
            .collect()
    }
}

fn version_dir(invocation: &Invocation) -> String {
    invocation
        .binary
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl CommandRunner for FakeTofu {
    async fn run(&self, invocation: &Invocation, _cancel: &CancellationToken) -> Result<ExecutionOutput> {
        let version = version_dir(invocation);
        self.calls
            .lock()
            .unwrap()
            .push((version.clone(), invocation.command.name().to_string()));

        let mut out = ExecutionOutput::default();
        let state_path = invocation.dir.join("terraform.tfstate");
        match &invocation.command {
            TofuCommand::Apply if self.apply_fails(&version) => {
                out.exit_code = 1;
                out.stderr_lines.push("Error: quota exceeded".into());
            }
            TofuCommand::Apply | TofuCommand::Import { .. } => {
                let state = json!({
                    "version": 4,
                    "terraform_version": version,
                    "outputs": {
                        "name": {"value": "db1"},
                        "status": {"value": "created"},
                        "username": {"value": "admin"},
                    }
                });
                std::fs::write(&state_path, serde_json::to_vec(&state)?)?;
            }
            TofuCommand::Destroy => {
                let state = json!({"version": 4, "terraform_version": version, "outputs": {}});
                std::fs::write(&state_path, serde_json::to_vec(&state)?)?;
            }
            TofuCommand::Plan => {
                let removes = self.plan_removes.load(Ordering::SeqCst);
                out.stdout_lines.push(
                    json!({"type": "change_summary", "changes": {"add": 1, "change": 0, "remove": removes}}).to_string(),
                );
            }
            TofuCommand::Show => {
                out.stdout_lines = [
                    r#"resource "random_pet" "db" {"#,
                    r#"    id     = "pet-db""#,
                    r#"    length = 2"#,
                    r#"}"#,
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
            }
            _ => {}
        }
        Ok(out)
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

pub fn memory_storage() -> Storage {
    let db = Database::open_memory().unwrap();
    migration::run_migrations(&db).unwrap();
    Storage::new(Arc::new(db), Arc::new(NoopEncryptor::new()))
}

pub fn config(upgrades: bool) -> Config {
    let mut env = HashMap::new();
    if upgrades {
        env.insert("TERRAFORM_UPGRADES_ENABLED".to_string(), "true".to_string());
    }
    Config::load(env).unwrap()
}

/// The test offering running at `version`, with an optional upgrade path.
pub fn service(version: &str, upgrade_path: &[&str], upgrades: bool) -> RegisteredService {
    let default_version = TfVersion::parse(version).unwrap();
    let mut def = ServiceDefinition::from_yaml(DEFINITION).unwrap();
    if upgrades {
        for plan in &mut def.plans {
            plan.maintenance_info = Some(maintenance_info(&default_version));
        }
    }
    RegisteredService {
        definition: Arc::new(def),
        binaries: Arc::new(TfBinariesContext {
            dir: PathBuf::from("/nonexistent/pak"),
            default_version,
            upgrade_path: upgrade_path.iter().map(|v| TfVersion::parse(v).unwrap()).collect(),
            provider_replacements: BTreeMap::new(),
            env: BTreeMap::new(),
        }),
        pak_config: Arc::new(Map::new()),
        pak_name: "test-pak".to_string(),
    }
}

pub fn broker(storage: &Storage, svc: RegisteredService, upgrades: bool, runner: Arc<FakeTofu>) -> ServiceBroker {
    let config = config(upgrades);
    let catalog = Catalog::build(vec![svc], &config).unwrap();
    let manager = Arc::new(DeploymentManager::new(storage.clone(), None, config.flags));
    ServiceBroker::new(
        catalog,
        manager,
        runner,
        CancellationToken::new(),
        TaskTracker::new(),
        BTreeMap::new(),
    )
}

/// Poll until the instance's operation leaves `in progress`.
pub async fn wait_for_instance(broker: &ServiceBroker, instance_id: &str) -> LastOperationResponse {
    for _ in 0..500 {
        let op = broker.last_operation(instance_id).unwrap();
        if op.state != "in progress" {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation on {instance_id} did not finish");
}
