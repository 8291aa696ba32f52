use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::params;

use super::database::Database;
use super::models::operation_state;

/// Message recorded on operations interrupted by a broker restart.
pub const FAILED_MESSAGE: &str = "the broker restarted while the operation was in progress";

/// Per-deployment marker files written while an operation runs.
///
/// Used on VM-hosted brokers where the platform does not provide an instance
/// identity; a leftover file at start-up means the operation was interrupted.
#[derive(Debug, Clone)]
pub struct LockFiles {
    dir: PathBuf,
}

/// File names are the hex of the deployment id, so any id maps back exactly.
fn lock_file_name(deployment_id: &str) -> String {
    hex::encode(deployment_id)
}

fn deployment_id_of(file_name: &str) -> Option<String> {
    hex::decode(file_name).ok().and_then(|bytes| String::from_utf8(bytes).ok())
}

impl LockFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create lockfile directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, deployment_id: &str) -> PathBuf {
        self.dir.join(lock_file_name(deployment_id))
    }

    pub fn write(&self, deployment_id: &str) -> Result<()> {
        let info = format!("pid={}\ntime={}", std::process::id(), chrono::Utc::now().to_rfc3339());
        fs::write(self.path_for(deployment_id), info)?;
        Ok(())
    }

    pub fn remove(&self, deployment_id: &str) -> Result<()> {
        let path = self.path_for(deployment_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn any_exist(&self) -> bool {
        fs::read_dir(&self.dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Deployment ids with a leftover lock file.
    pub fn locked_deployment_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            match deployment_id_of(&name) {
                Some(id) => ids.push(id),
                None => tracing::warn!(file = %name, "ignoring unrecognised lock file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Mark interrupted operations as failed.
///
/// On the platform (`running_on_platform`) every deployment still in progress
/// is failed. Otherwise only deployments with a leftover lock file are, and the
/// lock files are cleared.
pub fn recover_in_progress_operations(
    db: &Database,
    running_on_platform: bool,
    lockfiles: Option<&LockFiles>,
) -> Result<Vec<String>> {
    if running_on_platform {
        return mark_all_in_progress_failed(db);
    }
    match lockfiles {
        Some(locks) => mark_locked_failed(db, locks),
        None => {
            tracing::debug!("no instance identity and no lockfile directory, skipping recovery");
            Ok(Vec::new())
        }
    }
}

fn mark_all_in_progress_failed(db: &Database) -> Result<Vec<String>> {
    let mut conn = db.conn();
    let tx = conn.transaction()?;
    let ids = {
        let mut stmt = tx.prepare("SELECT id FROM terraform_deployments WHERE last_operation_state = ?1")?;
        let ids = stmt
            .query_map(params![operation_state::IN_PROGRESS], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    for id in &ids {
        tx.execute(
            "UPDATE terraform_deployments
             SET last_operation_state = ?1, last_operation_message = ?2, updated_at = ?3
             WHERE id = ?4",
            params![operation_state::FAILED, FAILED_MESSAGE, Database::now(), id],
        )?;
        tracing::info!(deployment = %id, "marked interrupted operation as failed");
    }
    tx.commit()?;
    Ok(ids)
}

fn mark_locked_failed(db: &Database, locks: &LockFiles) -> Result<Vec<String>> {
    let ids = locks.locked_deployment_ids()?;
    {
        let conn = db.conn();
        for id in &ids {
            conn.execute(
                "UPDATE terraform_deployments
                 SET last_operation_state = ?1, last_operation_message = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![operation_state::FAILED, FAILED_MESSAGE, Database::now(), id],
            )?;
            tracing::info!(deployment = %id, "marked interrupted operation as failed");
        }
    }
    for id in &ids {
        locks.remove(id)?;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lockfile_names_round_trip() {
        let dir = TempDir::new().unwrap();
        let locks = LockFiles::new(dir.path().join("locks")).unwrap();
        assert!(!locks.any_exist());

        locks.write("tf:abc:def").unwrap();
        locks.write("tf:my_instance:my_binding").unwrap();
        assert!(dir.path().join("locks").join(hex::encode("tf:abc:def")).exists());
        assert!(locks.any_exist());
        assert_eq!(
            locks.locked_deployment_ids().unwrap(),
            vec!["tf:abc:def", "tf:my_instance:my_binding"]
        );
        locks.remove("tf:my_instance:my_binding").unwrap();

        locks.remove("tf:abc:def").unwrap();
        locks.remove("tf:abc:def").unwrap();
        assert!(!locks.any_exist());
    }

    #[test]
    fn stray_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let locks = LockFiles::new(dir.path()).unwrap();
        fs::write(dir.path().join("README"), "").unwrap();
        locks.write("tf:a:").unwrap();
        assert_eq!(locks.locked_deployment_ids().unwrap(), vec!["tf:a:"]);
    }
}
