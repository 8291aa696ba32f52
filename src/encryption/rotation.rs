//! Start-up reconciliation of configured passwords with stored key metadata.
//!
//! Decides the active [`Encryptor`], verifies each configured passphrase
//! against its canary, and re-encrypts the database when the primary label
//! changes. A rotation only starts after every record decodes with the
//! previous key, so a bad row never leaves the database half rotated.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use super::gcm::{derive_key, random_salt, GcmEncryptor, KEY_LEN};
use super::noop::NoopEncryptor;
use super::passwords::{configured_primary, parse_passwords, PasswordEntry};
use super::Encryptor;
use crate::storage::records::{check_all_records, update_all_records};
use crate::storage::{Database, PasswordMetadata};

/// Fixed plaintext sealed under each password to detect passphrase changes.
pub const CANARY_INPUT: &str = "canary value";

/// A configured password joined with its stored salt.
struct CombinedPassword {
    label: String,
    key: [u8; KEY_LEN],
    configured_primary: bool,
    stored_primary: bool,
}

/// Outcome of [`setup_encryption`].
pub struct EncryptionSetup {
    pub encryptor: Arc<dyn Encryptor>,
    pub rotated: bool,
    pub deleted_labels: Vec<String>,
}

impl std::fmt::Debug for EncryptionSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSetup")
            .field("primary", &self.encryptor.primary_label())
            .field("rotated", &self.rotated)
            .field("deleted_labels", &self.deleted_labels)
            .finish()
    }
}

/// Reconcile `ENCRYPTION_ENABLED` / `ENCRYPTION_PASSWORDS` with the database.
pub fn setup_encryption(db: &Database, enabled: bool, raw_passwords: &str) -> Result<EncryptionSetup> {
    let configured = parse_passwords(raw_passwords)?;
    let configured_primary_label = configured_primary(&configured).map(|p| p.label.clone());

    match (enabled, &configured_primary_label) {
        (true, None) => bail!("encryption is enabled but no primary password is set"),
        (false, Some(_)) => bail!("encryption is disabled but a primary password is set"),
        _ => {}
    }

    let stored = db.load_password_metadata()?;
    let combined = combine(db, &configured, &stored)?;

    let stored_primary = combined.iter().find(|c| c.stored_primary);
    let previous: Arc<dyn Encryptor> = match stored_primary {
        Some(p) => Arc::new(keyring(&p.label, &combined)?),
        None => Arc::new(NoopEncryptor::new()),
    };
    let next: Arc<dyn Encryptor> = match combined.iter().find(|c| c.configured_primary) {
        Some(p) => Arc::new(keyring(&p.label, &combined)?),
        None => Arc::new(NoopEncryptor::new()),
    };

    let stored_primary_label = stored_primary.map(|p| p.label.clone());
    let rotated = stored_primary_label != configured_primary_label;
    if rotated {
        tracing::info!(
            from = stored_primary_label.as_deref().unwrap_or("none"),
            to = configured_primary_label.as_deref().unwrap_or("none"),
            "rotating database encryption"
        );
        check_all_records(db, previous.as_ref())
            .context("refusing to rotate encryption key, some records cannot be decoded")?;
        update_all_records(db, previous.as_ref(), next.as_ref()).context("error re-encrypting database")?;
        db.set_primary_password(configured_primary_label.as_deref())?;
    }

    let mut deleted_labels = Vec::new();
    for s in &stored {
        if !configured.iter().any(|c| c.label == s.label) {
            db.delete_password_metadata(&s.label)?;
            tracing::info!(label = %s.label, "removed password metadata no longer in configuration");
            deleted_labels.push(s.label.clone());
        }
    }

    Ok(EncryptionSetup {
        encryptor: next,
        rotated,
        deleted_labels,
    })
}

/// Cipher that encrypts under `primary` and can decrypt with every configured key.
fn keyring(primary: &str, combined: &[CombinedPassword]) -> Result<GcmEncryptor> {
    let keys: BTreeMap<&str, &[u8; KEY_LEN]> = combined.iter().map(|c| (c.label.as_str(), &c.key)).collect();
    let Some(primary_key) = keys.get(primary) else {
        bail!("no key for password labelled {primary:?}");
    };
    let mut enc = GcmEncryptor::new(primary, primary_key)?;
    for (label, key) in keys.iter().filter(|(l, _)| **l != primary) {
        enc = enc.with_key(label, key)?;
    }
    Ok(enc)
}

fn combine(db: &Database, configured: &[PasswordEntry], stored: &[PasswordMetadata]) -> Result<Vec<CombinedPassword>> {
    let stored_primaries: Vec<&PasswordMetadata> = stored.iter().filter(|s| s.primary).collect();
    if stored_primaries.len() > 1 {
        bail!("corrupt database - more than one primary found in table password_metadata; mark only one as primary but do not remove rows");
    }

    let mut result = Vec::with_capacity(configured.len());
    for entry in configured {
        let combined = match stored.iter().find(|s| s.label == entry.label) {
            Some(meta) => verify_canary(entry, meta)?,
            None => save_new_metadata(db, entry)?,
        };
        result.push(combined);
    }

    if let Some(primary) = stored_primaries.first() {
        if !configured.iter().any(|c| c.label == primary.label) {
            bail!(
                "the password labelled {:?} must be supplied to decrypt the database",
                primary.label
            );
        }
    }
    Ok(result)
}

fn verify_canary(entry: &PasswordEntry, meta: &PasswordMetadata) -> Result<CombinedPassword> {
    let key = derive_key(&entry.password.secret, &meta.salt);
    let enc = GcmEncryptor::new(&entry.label, &key)?;
    if enc.decrypt(&meta.canary).is_err() {
        bail!("the password labelled {:?} does not match", entry.label);
    }
    Ok(CombinedPassword {
        label: entry.label.clone(),
        key,
        configured_primary: entry.primary,
        stored_primary: meta.primary,
    })
}

fn save_new_metadata(db: &Database, entry: &PasswordEntry) -> Result<CombinedPassword> {
    let salt = random_salt();
    let key = derive_key(&entry.password.secret, &salt);
    let canary = GcmEncryptor::new(&entry.label, &key)?.encrypt(CANARY_INPUT.as_bytes())?;

    db.create_password_metadata(&PasswordMetadata {
        label: entry.label.clone(),
        salt,
        canary,
        // Promoted once rotation to this label completes.
        primary: false,
    })?;

    Ok(CombinedPassword {
        label: entry.label.clone(),
        key,
        configured_primary: entry.primary,
        stored_primary: false,
    })
}
