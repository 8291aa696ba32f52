mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use tofu_broker::encryption::noop::NoopEncryptor;
use tofu_broker::storage::recovery::{recover_in_progress_operations, LockFiles, FAILED_MESSAGE};
use tofu_broker::storage::{
    migration, operation_state, operation_type, BindRequestDetails, Database, ServiceBindingCredentials,
    ServiceInstanceDetails, Storage, TerraformDeployment,
};
use tofu_broker::workspace::{TfTransformer, Workspace};

use common::memory_storage;

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn deployment(id: &str, state: &str, message: &str) -> TerraformDeployment {
    let workspace = Workspace::new(
        &obj(json!({"name": "orders"})),
        "variable \"name\" { type = string }\noutput \"name\" { value = var.name }\n",
        &BTreeMap::new(),
        TfTransformer::default(),
    )
    .unwrap();
    let mut d = TerraformDeployment::new(id, workspace);
    d.last_operation_type = operation_type::PROVISION.to_string();
    d.last_operation_state = state.to_string();
    d.last_operation_message = message.to_string();
    d
}

fn file_storage(dir: &TempDir) -> Storage {
    let db = Database::open(dir.path().join("broker.sqlite3").to_str().unwrap()).unwrap();
    migration::run_migrations(&db).unwrap();
    Storage::new(Arc::new(db), Arc::new(NoopEncryptor::new()))
}

// ─── CRUD ───────────────────────────────────────────────────────────────────

#[test]
fn test_service_instance_details_crud() {
    let storage = memory_storage();
    assert!(!storage.exists_service_instance_details("i1").unwrap());

    let mut details = ServiceInstanceDetails {
        id: "i1".into(),
        name: "orders-db".into(),
        service_id: "svc".into(),
        plan_id: "plan".into(),
        space_id: "space".into(),
        organization_id: "org".into(),
        outputs: obj(json!({"host": "db.internal"})),
        operation_type: operation_type::PROVISION.into(),
        operation_id: "tf:i1:".into(),
    };
    storage.store_service_instance_details(&details).unwrap();
    assert!(storage.exists_service_instance_details("i1").unwrap());
    assert_eq!(storage.get_service_instance_details("i1").unwrap(), details);

    details.plan_id = "bigger".into();
    storage.store_service_instance_details(&details).unwrap();
    assert_eq!(storage.get_service_instance_details("i1").unwrap().plan_id, "bigger");

    storage.delete_service_instance_details("i1").unwrap();
    assert!(!storage.exists_service_instance_details("i1").unwrap());
    let err = storage.get_service_instance_details("i1").unwrap_err();
    assert!(err.to_string().contains("i1"), "{err:#}");
}

#[test]
fn test_provision_request_details_upsert() {
    let storage = memory_storage();
    storage
        .store_provision_request_details("i1", &obj(json!({"name": "a"})))
        .unwrap();
    storage
        .store_provision_request_details("i1", &obj(json!({"name": "b", "size": 2})))
        .unwrap();
    assert_eq!(
        storage.get_provision_request_details("i1").unwrap(),
        obj(json!({"name": "b", "size": 2}))
    );

    storage.delete_provision_request_details("i1").unwrap();
    assert!(storage.get_provision_request_details("i1").is_err());
}

#[test]
fn test_binding_records() {
    let storage = memory_storage();
    for binding in ["b2", "b1"] {
        storage
            .create_service_binding_credentials(&ServiceBindingCredentials {
                service_id: "svc".into(),
                service_instance_id: "i1".into(),
                binding_id: binding.into(),
                credentials: obj(json!({"username": binding})),
            })
            .unwrap();
        storage
            .store_bind_request_details(&BindRequestDetails {
                service_instance_id: "i1".into(),
                binding_id: binding.into(),
                request_details: obj(json!({"role": "reader"})),
            })
            .unwrap();
    }

    let mut ids = storage.get_service_binding_ids_for_service_instance("i1").unwrap();
    ids.sort();
    assert_eq!(ids, vec!["b1", "b2"]);
    assert!(storage.get_service_binding_ids_for_service_instance("i2").unwrap().is_empty());

    let creds = storage.get_service_binding_credentials("b1", "i1").unwrap();
    assert_eq!(creds.credentials, obj(json!({"username": "b1"})));
    assert_eq!(
        storage.get_bind_request_details("b2", "i1").unwrap(),
        obj(json!({"role": "reader"}))
    );
    assert!(!storage.exists_service_binding_credentials("b1", "other").unwrap());

    storage.delete_service_binding_credentials("b1", "i1").unwrap();
    storage.delete_bind_request_details("b1", "i1").unwrap();
    assert!(!storage.exists_service_binding_credentials("b1", "i1").unwrap());
    assert!(storage.get_bind_request_details("b1", "i1").unwrap().is_empty());
    assert!(storage.exists_service_binding_credentials("b2", "i1").unwrap());
}

#[test]
fn test_terraform_deployment_round_trip() {
    let storage = memory_storage();
    let d = deployment("tf:i1:", operation_state::SUCCEEDED, "provision succeeded");
    storage.store_terraform_deployment(&d).unwrap();

    assert!(storage.exists_terraform_deployment("tf:i1:").unwrap());
    let loaded = storage.get_terraform_deployment("tf:i1:").unwrap();
    assert_eq!(loaded, d);
    assert!(!loaded.is_in_progress());

    let list = storage.get_all_terraform_deployments().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, "tf:i1:");
    assert_eq!(list[0].last_operation_state, operation_state::SUCCEEDED);

    storage.delete_terraform_deployment("tf:i1:").unwrap();
    assert!(!storage.exists_terraform_deployment("tf:i1:").unwrap());
}

#[test]
fn test_migrations_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    storage
        .store_provision_request_details("i1", &obj(json!({"name": "kept"})))
        .unwrap();
    drop(storage);

    let reopened = file_storage(&dir);
    migration::run_migrations(reopened.database()).unwrap();
    assert_eq!(
        reopened.get_provision_request_details("i1").unwrap(),
        obj(json!({"name": "kept"}))
    );
}

// ─── Restart recovery ───────────────────────────────────────────────────────

#[test]
fn test_recovery_on_platform_fails_in_progress_operations() {
    let dir = TempDir::new().unwrap();
    {
        let storage = file_storage(&dir);
        storage
            .store_terraform_deployment(&deployment("tf:abc:", operation_state::IN_PROGRESS, "provision in progress"))
            .unwrap();
        storage
            .store_terraform_deployment(&deployment("tf:done:", operation_state::SUCCEEDED, "provision succeeded"))
            .unwrap();
    }

    let storage = file_storage(&dir);
    let recovered = recover_in_progress_operations(storage.database(), true, None).unwrap();
    assert_eq!(recovered, vec!["tf:abc:"]);

    let d = storage.get_terraform_deployment("tf:abc:").unwrap();
    assert_eq!(d.last_operation_state, operation_state::FAILED);
    assert_eq!(d.last_operation_message, FAILED_MESSAGE);
    assert_eq!(d.last_operation_type, operation_type::PROVISION);

    let untouched = storage.get_terraform_deployment("tf:done:").unwrap();
    assert_eq!(untouched.last_operation_state, operation_state::SUCCEEDED);
}

#[test]
fn test_recovery_off_platform_uses_lockfiles() {
    let dir = TempDir::new().unwrap();
    let locks = LockFiles::new(dir.path().join("locks")).unwrap();
    let storage = file_storage(&dir);
    storage
        .store_terraform_deployment(&deployment("tf:abc:", operation_state::IN_PROGRESS, "provision in progress"))
        .unwrap();
    storage
        .store_terraform_deployment(&deployment("tf:xyz:", operation_state::IN_PROGRESS, "provision in progress"))
        .unwrap();
    storage
        .store_terraform_deployment(&deployment("tf:my_db:b_1", operation_state::IN_PROGRESS, "bind in progress"))
        .unwrap();
    locks.write("tf:abc:").unwrap();
    locks.write("tf:my_db:b_1").unwrap();

    let recovered = recover_in_progress_operations(storage.database(), false, Some(&locks)).unwrap();
    assert_eq!(recovered, vec!["tf:abc:", "tf:my_db:b_1"]);
    assert!(!locks.any_exist());
    assert_eq!(
        storage.get_terraform_deployment("tf:abc:").unwrap().last_operation_state,
        operation_state::FAILED
    );
    assert_eq!(
        storage.get_terraform_deployment("tf:my_db:b_1").unwrap().last_operation_state,
        operation_state::FAILED
    );
    assert_eq!(
        storage.get_terraform_deployment("tf:xyz:").unwrap().last_operation_state,
        operation_state::IN_PROGRESS
    );
}

#[test]
fn test_recovery_without_identity_or_lockfiles_is_a_no_op() {
    let storage = memory_storage();
    storage
        .store_terraform_deployment(&deployment("tf:abc:", operation_state::IN_PROGRESS, "provision in progress"))
        .unwrap();
    assert!(recover_in_progress_operations(storage.database(), false, None)
        .unwrap()
        .is_empty());
    assert!(storage.get_terraform_deployment("tf:abc:").unwrap().is_in_progress());
}
