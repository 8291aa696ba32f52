use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use super::database::Database;
use super::models::*;
use crate::encryption::Encryptor;
use crate::error::BrokerError;
use crate::workspace::Workspace;

/// Encrypting CRUD layer over the broker tables.
///
/// Every blob column is JSON-encoded then passed through the active
/// [`Encryptor`]; reads reverse the two steps.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
    encryptor: Arc<dyn Encryptor>,
}

pub(crate) fn encode_json<T: Serialize + ?Sized>(encryptor: &dyn Encryptor, value: &T) -> Result<Vec<u8>> {
    let plain = serde_json::to_vec(value).context("error encoding JSON")?;
    Ok(encryptor.encrypt(&plain).map_err(BrokerError::from)?)
}

pub(crate) fn decode_json<T: DeserializeOwned + Default>(encryptor: &dyn Encryptor, blob: &[u8]) -> Result<T> {
    if blob.is_empty() {
        return Ok(T::default());
    }
    let plain = encryptor.decrypt(blob).map_err(BrokerError::from)?;
    if plain.is_empty() || plain == b"null" {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&plain).map_err(|e| BrokerError::Decode(e.to_string()))?)
}

impl Storage {
    pub fn new(db: Arc<Database>, encryptor: Arc<dyn Encryptor>) -> Self {
        Self { db, encryptor }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        encode_json(self.encryptor.as_ref(), value)
    }

    fn decode<T: DeserializeOwned + Default>(&self, blob: &[u8]) -> Result<T> {
        decode_json(self.encryptor.as_ref(), blob)
    }

    // ─── Service Instance Details ───────────────────────────────────────────

    pub fn store_service_instance_details(&self, d: &ServiceInstanceDetails) -> Result<()> {
        let outputs = self.encode(&d.outputs).context("error encoding details")?;
        let now = Database::now();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO service_instance_details
                (id, name, service_id, plan_id, space_guid, organization_guid, other_details,
                 operation_type, operation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                service_id = excluded.service_id,
                plan_id = excluded.plan_id,
                space_guid = excluded.space_guid,
                organization_guid = excluded.organization_guid,
                other_details = excluded.other_details,
                operation_type = excluded.operation_type,
                operation_id = excluded.operation_id,
                updated_at = excluded.updated_at",
            params![
                d.id,
                d.name,
                d.service_id,
                d.plan_id,
                d.space_id,
                d.organization_id,
                outputs,
                d.operation_type,
                d.operation_id,
                now,
            ],
        )
        .context("error saving service instance details")?;
        Ok(())
    }

    pub fn exists_service_instance_details(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM service_instance_details WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("error counting service instance details")?;
        Ok(count != 0)
    }

    pub fn get_service_instance_details(&self, id: &str) -> Result<ServiceInstanceDetails> {
        let row = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT id, name, service_id, plan_id, space_guid, organization_guid,
                        other_details, operation_type, operation_id
                 FROM service_instance_details WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        ServiceInstanceDetails {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            service_id: row.get(2)?,
                            plan_id: row.get(3)?,
                            space_id: row.get(4)?,
                            organization_id: row.get(5)?,
                            outputs: JsonObject::new(),
                            operation_type: row.get(7)?,
                            operation_id: row.get(8)?,
                        },
                        row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
                    ))
                },
            )
            .optional()
            .context("error finding service instance details")?
        };

        let (mut details, blob) = row.ok_or_else(|| {
            BrokerError::NotFound(format!("could not find service instance details for: {id}"))
        })?;
        details.outputs = self
            .decode(&blob)
            .with_context(|| format!("error decoding service instance outputs {id:?}"))?;
        Ok(details)
    }

    pub fn delete_service_instance_details(&self, id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM service_instance_details WHERE id = ?1", params![id])
            .context("error deleting service instance details")?;
        Ok(())
    }

    // ─── Provision Request Details ──────────────────────────────────────────

    /// Upsert the merged provision parameters for an instance.
    pub fn store_provision_request_details(&self, instance_id: &str, details: &JsonObject) -> Result<()> {
        let encoded = self.encode(details).context("error encoding details")?;
        let now = Database::now();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO provision_request_details (service_instance_id, request_details, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(service_instance_id) DO UPDATE SET
                request_details = excluded.request_details,
                updated_at = excluded.updated_at",
            params![instance_id, encoded, now],
        )
        .context("error saving provision request details")?;
        Ok(())
    }

    pub fn get_provision_request_details(&self, instance_id: &str) -> Result<JsonObject> {
        let blob: Option<Option<Vec<u8>>> = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT request_details FROM provision_request_details WHERE service_instance_id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()
            .context("error finding provision request details record")?
        };
        let blob = blob.ok_or_else(|| {
            BrokerError::NotFound(format!("could not find provision request details for: {instance_id}"))
        })?;
        self.decode(&blob.unwrap_or_default())
            .context("error decoding provision request details")
    }

    pub fn delete_provision_request_details(&self, instance_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM provision_request_details WHERE service_instance_id = ?1",
            params![instance_id],
        )
        .context("error deleting provision request details")?;
        Ok(())
    }

    // ─── Service Binding Credentials ────────────────────────────────────────

    pub fn create_service_binding_credentials(&self, c: &ServiceBindingCredentials) -> Result<()> {
        let encoded = self.encode(&c.credentials).context("error encoding credentials")?;
        let now = Database::now();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO service_binding_credentials
                (service_id, service_instance_id, binding_id, other_details, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![c.service_id, c.service_instance_id, c.binding_id, encoded, now],
        )
        .context("error creating service credential binding")?;
        Ok(())
    }

    pub fn get_service_binding_credentials(
        &self,
        binding_id: &str,
        instance_id: &str,
    ) -> Result<ServiceBindingCredentials> {
        let row = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT service_id, other_details FROM service_binding_credentials
                 WHERE binding_id = ?1 AND service_instance_id = ?2",
                params![binding_id, instance_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?)),
            )
            .optional()
            .context("error finding service credential binding")?
        };
        let (service_id, blob) = row.ok_or_else(|| {
            BrokerError::NotFound(format!(
                "could not find binding credentials for binding {binding_id:?} and service instance {instance_id:?}"
            ))
        })?;
        Ok(ServiceBindingCredentials {
            service_id,
            service_instance_id: instance_id.to_string(),
            binding_id: binding_id.to_string(),
            credentials: self
                .decode(&blob.unwrap_or_default())
                .context("error decoding credentials")?,
        })
    }

    pub fn exists_service_binding_credentials(&self, binding_id: &str, instance_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM service_binding_credentials
                 WHERE binding_id = ?1 AND service_instance_id = ?2",
                params![binding_id, instance_id],
                |row| row.get(0),
            )
            .context("error counting service credential binding")?;
        Ok(count != 0)
    }

    /// Binding ids are unique across all instances.
    pub fn exists_service_binding_id(&self, binding_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM service_binding_credentials WHERE binding_id = ?1",
                params![binding_id],
                |row| row.get(0),
            )
            .context("error counting service credential binding")?;
        Ok(count != 0)
    }

    pub fn delete_service_binding_credentials(&self, binding_id: &str, instance_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM service_binding_credentials WHERE binding_id = ?1 AND service_instance_id = ?2",
            params![binding_id, instance_id],
        )
        .context("error deleting service binding credentials")?;
        Ok(())
    }

    pub fn get_service_binding_ids_for_service_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT binding_id FROM service_binding_credentials
             WHERE service_instance_id = ?1 ORDER BY binding_id",
        )?;
        let ids = stmt
            .query_map(params![instance_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()
            .context("error listing service binding ids")?;
        Ok(ids)
    }

    // ─── Bind Request Details ───────────────────────────────────────────────

    /// Persist bind parameters; empty parameter maps are not stored.
    pub fn store_bind_request_details(&self, d: &BindRequestDetails) -> Result<()> {
        if d.request_details.is_empty() {
            return Ok(());
        }
        let encoded = self.encode(&d.request_details).context("error encoding details")?;
        let now = Database::now();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO bind_request_details
                (service_binding_id, service_instance_id, request_details, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(service_binding_id) DO UPDATE SET
                request_details = excluded.request_details,
                updated_at = excluded.updated_at",
            params![d.binding_id, d.service_instance_id, encoded, now],
        )
        .context("error saving bind request details")?;
        Ok(())
    }

    /// Stored bind parameters, or an empty map when none were recorded.
    pub fn get_bind_request_details(&self, binding_id: &str, instance_id: &str) -> Result<JsonObject> {
        let blob: Option<Option<Vec<u8>>> = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT request_details FROM bind_request_details
                 WHERE service_binding_id = ?1 AND service_instance_id = ?2",
                params![binding_id, instance_id],
                |row| row.get(0),
            )
            .optional()
            .context("error finding bind request details record")?
        };
        match blob {
            None => Ok(JsonObject::new()),
            Some(blob) => self
                .decode(&blob.unwrap_or_default())
                .context("error decoding bind request details"),
        }
    }

    pub fn delete_bind_request_details(&self, binding_id: &str, instance_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM bind_request_details WHERE service_binding_id = ?1 AND service_instance_id = ?2",
            params![binding_id, instance_id],
        )
        .context("error deleting bind request details")?;
        Ok(())
    }

    // ─── Terraform Deployments ──────────────────────────────────────────────

    pub fn store_terraform_deployment(&self, t: &TerraformDeployment) -> Result<()> {
        let encoded = self.encode(&t.workspace).context("error encoding workspace")?;
        let now = Database::now();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO terraform_deployments
                (id, workspace, last_operation_type, last_operation_state, last_operation_message,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                workspace = excluded.workspace,
                last_operation_type = excluded.last_operation_type,
                last_operation_state = excluded.last_operation_state,
                last_operation_message = excluded.last_operation_message,
                updated_at = excluded.updated_at",
            params![
                t.id,
                encoded,
                t.last_operation_type,
                t.last_operation_state,
                t.last_operation_message,
                now,
            ],
        )
        .context("error saving terraform deployment")?;
        Ok(())
    }

    pub fn exists_terraform_deployment(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM terraform_deployments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("error counting terraform deployments")?;
        Ok(count != 0)
    }

    pub fn get_terraform_deployment(&self, id: &str) -> Result<TerraformDeployment> {
        let row = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT workspace, last_operation_type, last_operation_state, last_operation_message
                 FROM terraform_deployments WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("error finding terraform deployment")?
        };
        let (blob, op_type, op_state, op_message) =
            row.ok_or_else(|| BrokerError::NotFound(format!("could not find terraform deployment: {id}")))?;

        let workspace: Workspace = self
            .decode(&blob.unwrap_or_default())
            .with_context(|| format!("error decoding workspace {id:?}"))?;
        Ok(TerraformDeployment {
            id: id.to_string(),
            workspace,
            last_operation_type: op_type,
            last_operation_state: op_state,
            last_operation_message: op_message,
        })
    }

    pub fn get_all_terraform_deployments(&self) -> Result<Vec<TerraformDeploymentListEntry>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, last_operation_type, last_operation_state, last_operation_message, updated_at
             FROM terraform_deployments ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TerraformDeploymentListEntry {
                    id: row.get(0)?,
                    last_operation_type: row.get(1)?,
                    last_operation_state: row.get(2)?,
                    last_operation_message: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("error reading terraform deployments")?;
        Ok(rows)
    }

    pub fn delete_terraform_deployment(&self, id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM terraform_deployments WHERE id = ?1", params![id])
            .context("error deleting terraform deployment")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::noop::NoopEncryptor;
    use crate::storage::migration;
    use serde_json::json;

    fn storage() -> Storage {
        let db = Arc::new(Database::open_memory().unwrap());
        migration::run_migrations(&db).unwrap();
        Storage::new(db, Arc::new(NoopEncryptor::new()))
    }

    fn bind_rows(s: &Storage) -> i64 {
        s.db
            .conn()
            .query_row("SELECT COUNT(*) FROM bind_request_details", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn empty_bind_params_are_not_stored() {
        let s = storage();
        s.store_bind_request_details(&BindRequestDetails {
            service_instance_id: "i1".into(),
            binding_id: "b1".into(),
            request_details: JsonObject::new(),
        })
        .unwrap();
        assert_eq!(bind_rows(&s), 0);
        assert!(s.get_bind_request_details("b1", "i1").unwrap().is_empty());

        let params = json!({"role": "reader"}).as_object().cloned().unwrap();
        s.store_bind_request_details(&BindRequestDetails {
            service_instance_id: "i1".into(),
            binding_id: "b1".into(),
            request_details: params.clone(),
        })
        .unwrap();
        assert_eq!(bind_rows(&s), 1);
        assert_eq!(s.get_bind_request_details("b1", "i1").unwrap(), params);
    }

    #[test]
    fn binding_ids_are_checked_across_instances() {
        let s = storage();
        s.create_service_binding_credentials(&ServiceBindingCredentials {
            service_id: "svc".into(),
            service_instance_id: "i1".into(),
            binding_id: "b1".into(),
            credentials: JsonObject::new(),
        })
        .unwrap();
        assert!(s.exists_service_binding_id("b1").unwrap());
        assert!(!s.exists_service_binding_credentials("b1", "i2").unwrap());
        assert!(!s.exists_service_binding_id("b2").unwrap());
    }
}
