use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Minimum passphrase length accepted for key derivation.
pub const MIN_SECRET_LEN: usize = 20;
pub const MAX_SECRET_LEN: usize = 1024;

/// One entry of `ENCRYPTION_PASSWORDS`.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordEntry {
    pub label: String,
    pub password: Secret,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Clone, Deserialize)]
pub struct Secret {
    pub secret: String,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

/// Parse and validate the JSON password list. An empty string yields no entries.
pub fn parse_passwords(raw: &str) -> Result<Vec<PasswordEntry>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PasswordEntry> = serde_json::from_str(raw)
        .context("password reading error: password configuration string could not be parsed as JSON")?;
    validate(&entries).context("password configuration error")?;
    Ok(entries)
}

fn validate(entries: &[PasswordEntry]) -> Result<()> {
    let mut labels = HashSet::new();
    let mut problems = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let secret_len = entry.password.secret.chars().count();
        if !(MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&secret_len) {
            problems.push(format!(
                "expected length {MIN_SECRET_LEN} to {MAX_SECRET_LEN}, got {secret_len}: [{i}].password.secret"
            ));
        }
        if entry.label.is_empty() || entry.label.len() > u8::MAX as usize {
            problems.push(format!("expected label of 1 to 255 bytes: [{i}].label"));
        }
        if !labels.insert(entry.label.as_str()) {
            problems.push(format!("duplicated value, must be unique: {}: [{i}].label", entry.label));
        }
    }

    if entries.iter().filter(|e| e.primary).count() > 1 {
        problems.push(
            "expected exactly one primary, got multiple; mark one password as primary and others as non-primary but do not remove them: [].primary"
                .to_string(),
        );
    }

    if !problems.is_empty() {
        bail!("{}", problems.join("; "));
    }
    Ok(())
}

/// The entry marked primary, if any.
pub fn configured_primary(entries: &[PasswordEntry]) -> Option<&PasswordEntry> {
    entries.iter().find(|e| e.primary)
}
