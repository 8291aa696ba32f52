use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::executor::version::TfVersion;

/// The only tfstate format version the broker reads.
pub const SUPPORTED_STATE_VERSION: u64 = 4;

/// The parts of a tfstate document the broker cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct TfState {
    pub version: u64,
    #[serde(default)]
    pub terraform_version: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, StateOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateOutput {
    #[serde(default)]
    pub value: serde_json::Value,
}

impl TfState {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let state: TfState = serde_json::from_slice(bytes).context("invalid workspace state")?;
        if state.version != SUPPORTED_STATE_VERSION {
            bail!("unsupported tfstate version: {}", state.version);
        }
        Ok(state)
    }

    /// Root module outputs as a flat name→value map.
    pub fn outputs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Tool version that last wrote the state, `None` for a blank state.
    pub fn tool_version(&self) -> Result<Option<TfVersion>> {
        match self.terraform_version.as_deref() {
            None | Some("") => Ok(None),
            Some(v) => Ok(Some(TfVersion::parse(v)?)),
        }
    }
}
