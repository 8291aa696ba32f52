use anyhow::{bail, Result};

use super::Config;
use crate::storage::database::db_type;

/// Reject configurations the broker cannot start with.
pub fn validate(config: &Config) -> Result<()> {
    match config.db_type.as_str() {
        db_type::SQLITE3 => ensure_non_empty("DB_PATH", &config.db_path)?,
        db_type::MYSQL => bail!("DB_TYPE mysql is not supported by this build, use sqlite3"),
        other => bail!("unknown DB_TYPE {other:?}, expected sqlite3"),
    }

    if config.username.is_empty() != config.password.is_empty() {
        bail!("SECURITY_USER_NAME and SECURITY_USER_PASSWORD must be set together");
    }

    for (name, source) in &config.brokerpak_sources {
        if source.uri.trim().is_empty() {
            bail!("GSB_BROKERPAK_SOURCES entry {name:?} must have a uri");
        }
        if let Some(cfg) = &source.config {
            if !cfg.is_object() && !cfg.is_null() {
                bail!("GSB_BROKERPAK_SOURCES entry {name:?} config must be a JSON object");
            }
        }
    }
    Ok(())
}

fn ensure_non_empty(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{name} must not be empty");
    }
    Ok(())
}
