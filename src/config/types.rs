use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Feature Flags ──────────────────────────────────────────────────────────

/// Snapshot of the three behaviour switches, taken once at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// `TERRAFORM_UPGRADES_ENABLED`: run upgrade chains on version mismatch.
    pub tf_upgrades: bool,
    /// `BROKERPAK_UPDATES_ENABLED`: re-render HCL from the current pak on every operation.
    pub dynamic_hcl: bool,
    /// `CSB_DISABLE_REQUEST_PROPERTY_VALIDATION`: skip request parameter schema checks.
    pub disable_request_property_validation: bool,
}

// ─── Brokerpak Sources ──────────────────────────────────────────────────────

/// One entry of `GSB_BROKERPAK_SOURCES`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerpakSourceConfig {
    /// Local path or URL of the `.brokerpak` file.
    pub uri: String,
    #[serde(default)]
    pub service_prefix: String,
    /// Space or comma separated service ids to skip.
    #[serde(default)]
    pub excluded_services: String,
    /// JSON object merged over the global brokerpak config for this pak.
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub notes: String,
}

impl BrokerpakSourceConfig {
    pub fn excluded_services_list(&self) -> Vec<String> {
        self.excluded_services
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// A `{key, value}` pair from `global_labels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLabel {
    pub key: String,
    pub value: String,
}

/// Parsed `GSB_BROKERPAK_CONFIG`. Unknown keys are kept for variable resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerpakConfig {
    pub global_labels: Vec<GlobalLabel>,
    pub values: Map<String, Value>,
}

impl BrokerpakConfig {
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.global_labels
            .iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect()
    }
}
