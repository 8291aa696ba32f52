use anyhow::{Context, Result};
use rusqlite::params;

use super::database::Database;
use super::models::PasswordMetadata;

impl Database {
    pub fn load_password_metadata(&self) -> Result<Vec<PasswordMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT label, salt, canary, \"primary\" FROM password_metadata ORDER BY label",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PasswordMetadata {
                    label: row.get(0)?,
                    salt: row.get(1)?,
                    canary: row.get(2)?,
                    primary: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("error reading password metadata")?;
        Ok(rows)
    }

    pub fn create_password_metadata(&self, m: &PasswordMetadata) -> Result<()> {
        let now = Self::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO password_metadata (label, salt, canary, \"primary\", created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![m.label, m.salt, m.canary, m.primary as i64, now],
        )
        .with_context(|| format!("error creating password metadata for {:?}", m.label))?;
        Ok(())
    }

    /// Mark `label` as the only primary. `None` clears every primary flag.
    pub fn set_primary_password(&self, label: Option<&str>) -> Result<()> {
        let now = Self::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE password_metadata SET \"primary\" = 0, updated_at = ?1 WHERE \"primary\" != 0",
            params![now],
        )?;
        if let Some(label) = label {
            let updated = tx.execute(
                "UPDATE password_metadata SET \"primary\" = 1, updated_at = ?2 WHERE label = ?1",
                params![label, now],
            )?;
            if updated == 0 {
                anyhow::bail!("cannot find metadata for password labelled {label:?}");
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_password_metadata(&self, label: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM password_metadata WHERE label = ?1", params![label])
            .context("error deleting password metadata")?;
        Ok(())
    }
}
