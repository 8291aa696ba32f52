//! Whole-database passes used by key rotation.

use anyhow::{bail, Context, Result};
use rusqlite::params;

use super::database::Database;
use crate::encryption::Encryptor;
use crate::workspace::Workspace;

/// Rows are read and rewritten this many at a time.
pub const BATCH_SIZE: i64 = 100;

struct BlobTable {
    table: &'static str,
    key_column: &'static str,
    blob_column: &'static str,
    description: &'static str,
}

const BLOB_TABLES: [BlobTable; 5] = [
    BlobTable {
        table: "service_binding_credentials",
        key_column: "binding_id",
        blob_column: "other_details",
        description: "service binding credential",
    },
    BlobTable {
        table: "bind_request_details",
        key_column: "service_binding_id",
        blob_column: "request_details",
        description: "binding request details",
    },
    BlobTable {
        table: "provision_request_details",
        key_column: "service_instance_id",
        blob_column: "request_details",
        description: "provision request details",
    },
    BlobTable {
        table: "service_instance_details",
        key_column: "id",
        blob_column: "other_details",
        description: "service instance details",
    },
    BlobTable {
        table: "terraform_deployments",
        key_column: "id",
        blob_column: "workspace",
        description: "terraform deployment",
    },
];

struct Row {
    rowid: i64,
    key: String,
    blob: Vec<u8>,
}

fn read_batch(db: &Database, t: &BlobTable, after: i64) -> Result<Vec<Row>> {
    let conn = db.conn();
    let sql = format!(
        "SELECT rowid, {key}, {blob} FROM {table} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
        key = t.key_column,
        blob = t.blob_column,
        table = t.table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![after, BATCH_SIZE], |row| {
            Ok(Row {
                rowid: row.get(0)?,
                key: row.get(1)?,
                blob: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Decrypt a blob and confirm the plaintext is the JSON the table expects.
fn open_blob(encryptor: &dyn Encryptor, t: &BlobTable, blob: &[u8]) -> Result<Vec<u8>> {
    let plain = encryptor.decrypt(blob)?;
    if t.table == "terraform_deployments" {
        let text = std::str::from_utf8(&plain).context("workspace is not UTF-8")?;
        Workspace::from_json(text)?;
    } else {
        serde_json::from_slice::<serde_json::Value>(&plain).context("JSON parse error")?;
    }
    Ok(plain)
}

/// Confirm every stored blob decrypts and decodes with `encryptor`.
///
/// All failures are collected so the operator sees the full list at once.
pub fn check_all_records(db: &Database, encryptor: &dyn Encryptor) -> Result<()> {
    let mut failures = Vec::new();

    for t in &BLOB_TABLES {
        let mut after = 0;
        loop {
            let batch = read_batch(db, t, after)
                .with_context(|| format!("error reading {}", t.description))?;
            let Some(last) = batch.last() else { break };
            after = last.rowid;

            for row in batch.iter().filter(|r| !r.blob.is_empty()) {
                if let Err(e) = open_blob(encryptor, t, &row.blob) {
                    failures.push(format!("decode error for {} {:?}: {e:#}", t.description, row.key));
                }
            }
        }
    }

    if !failures.is_empty() {
        tracing::error!(count = failures.len(), "records failed to decode");
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}

/// Re-encrypt every stored blob from `previous` to `next`, one transaction per batch.
pub fn update_all_records(db: &Database, previous: &dyn Encryptor, next: &dyn Encryptor) -> Result<()> {
    for t in &BLOB_TABLES {
        let mut after = 0;
        let mut rewritten = 0usize;
        loop {
            let batch = read_batch(db, t, after)?;
            let Some(last) = batch.last() else { break };
            after = last.rowid;

            let mut sealed = Vec::with_capacity(batch.len());
            for row in batch.iter().filter(|r| !r.blob.is_empty()) {
                let plain = open_blob(previous, t, &row.blob)
                    .with_context(|| format!("decode error for {} {:?}", t.description, row.key))?;
                sealed.push((row.rowid, next.encrypt(&plain)?));
            }

            let mut conn = db.conn();
            let tx = conn.transaction()?;
            {
                let sql = format!("UPDATE {} SET {} = ?1 WHERE rowid = ?2", t.table, t.blob_column);
                let mut stmt = tx.prepare(&sql)?;
                for (rowid, blob) in &sealed {
                    stmt.execute(params![blob, rowid])?;
                }
            }
            tx.commit()
                .with_context(|| format!("error re-encrypting {}", t.description))?;
            rewritten += sealed.len();
        }
        tracing::debug!(table = t.table, rows = rewritten, "re-encrypted");
    }
    Ok(())
}
