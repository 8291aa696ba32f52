//! Broker configuration read from the process environment.
//!
//! [`Config::load`] takes an explicit key/value map so callers (and tests)
//! control exactly which variables are visible; [`Config::from_env`] feeds it
//! the real environment. The result is immutable and threaded through the
//! broker; nothing reads the environment afterwards.

pub mod types;
pub mod validator;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

pub use types::{BrokerpakConfig, BrokerpakSourceConfig, FeatureFlags, GlobalLabel};

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    security_user_name: String,
    #[serde(default)]
    security_user_password: String,

    #[serde(default = "default_db_type")]
    db_type: String,
    #[serde(default = "default_db_path")]
    db_path: String,

    #[serde(default)]
    encryption_enabled: bool,
    #[serde(default)]
    encryption_passwords: String,

    #[serde(default)]
    terraform_upgrades_enabled: bool,
    #[serde(default)]
    brokerpak_updates_enabled: bool,
    #[serde(default)]
    csb_disable_request_property_validation: bool,

    #[serde(default)]
    cf_instance_guid: String,
    #[serde(default)]
    csb_lockfile_dir: String,

    #[serde(default = "default_builtin_path")]
    gsb_brokerpak_builtin_path: String,
    #[serde(default)]
    gsb_brokerpak_sources: String,
    #[serde(default)]
    gsb_brokerpak_config: String,
    #[serde(default)]
    brokerpak_cache_path: String,
}

fn default_port() -> u16 {
    8080
}
fn default_db_type() -> String {
    "sqlite3".into()
}
fn default_db_path() -> String {
    "./service-broker-db.sqlite3".into()
}
fn default_builtin_path() -> String {
    "./".into()
}

/// Validated broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_type: String,
    pub db_path: String,
    pub encryption_enabled: bool,
    pub encryption_passwords: String,
    pub flags: FeatureFlags,
    pub cf_instance_guid: Option<String>,
    pub lockfile_dir: Option<PathBuf>,
    pub builtin_brokerpak_path: PathBuf,
    pub brokerpak_sources: BTreeMap<String, BrokerpakSourceConfig>,
    pub brokerpak_config: BrokerpakConfig,
    /// `GSB_SERVICE_<NAME>_PLANS` values keyed by the upper-cased offering name.
    pub user_plans: BTreeMap<String, String>,
    pub brokerpak_cache_path: Option<PathBuf>,
    /// Every variable visible at load time; used by `env(..)` interpolation
    /// and for forwarding `GSB_*` variables to tool invocations.
    pub environment: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from the real process environment.
    pub fn from_env() -> Result<Self> {
        Self::load(std::env::vars().collect())
    }

    /// Load configuration from an explicit variable map.
    pub fn load(env: HashMap<String, String>) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().source(Some(env.clone())).try_parsing(true))
            .build()
            .context("failed to build configuration from environment")?;
        let raw: RawConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        let brokerpak_sources = parse_json_or_default(&raw.gsb_brokerpak_sources, "GSB_BROKERPAK_SOURCES")?;
        let brokerpak_config = parse_brokerpak_config(&raw.gsb_brokerpak_config)?;

        let user_plans = env
            .iter()
            .filter_map(|(k, v)| {
                let upper = k.to_uppercase();
                let name = upper.strip_prefix("GSB_SERVICE_")?.strip_suffix("_PLANS")?;
                Some((name.to_string(), v.clone()))
            })
            .collect();

        let config = Config {
            port: raw.port,
            username: raw.security_user_name,
            password: raw.security_user_password,
            db_type: raw.db_type,
            db_path: raw.db_path,
            encryption_enabled: raw.encryption_enabled,
            encryption_passwords: raw.encryption_passwords,
            flags: FeatureFlags {
                tf_upgrades: raw.terraform_upgrades_enabled,
                dynamic_hcl: raw.brokerpak_updates_enabled,
                disable_request_property_validation: raw.csb_disable_request_property_validation,
            },
            cf_instance_guid: non_empty(raw.cf_instance_guid),
            lockfile_dir: non_empty(raw.csb_lockfile_dir).map(PathBuf::from),
            builtin_brokerpak_path: PathBuf::from(raw.gsb_brokerpak_builtin_path),
            brokerpak_sources,
            brokerpak_config,
            user_plans,
            brokerpak_cache_path: non_empty(raw.brokerpak_cache_path).map(PathBuf::from),
            environment: env.into_iter().collect(),
        };

        validator::validate(&config)?;
        Ok(config)
    }

    /// Whether OSBAPI requests require HTTP basic auth.
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    /// Whether the broker runs as a platform-hosted app with a stable identity.
    pub fn running_on_platform(&self) -> bool {
        self.cf_instance_guid.is_some()
    }

    /// User plan JSON for an offering name, matched case-insensitively with
    /// dashes read as underscores.
    pub fn user_plans_for(&self, offering: &str) -> Option<&str> {
        let key = offering.to_uppercase().replace('-', "_");
        self.user_plans.get(&key).map(String::as_str)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str, name: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).with_context(|| format!("{name} is not valid JSON"))
}

fn parse_brokerpak_config(raw: &str) -> Result<BrokerpakConfig> {
    let mut values: serde_json::Map<String, serde_json::Value> =
        parse_json_or_default(raw, "GSB_BROKERPAK_CONFIG")?;
    let global_labels = match values.remove("global_labels") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v).context("GSB_BROKERPAK_CONFIG global_labels must be a list of {key, value}")?,
    };
    Ok(BrokerpakConfig { global_labels, values })
}
