//! In-memory model of a tofu working directory.
//!
//! A [`Workspace`] holds the HCL modules, the variable values for their single
//! instance, and the opaque tfstate bytes. It serialises to one JSON blob that
//! is stored (encrypted) on the deployment row, and materialises into a
//! scratch directory for each tool invocation.

pub mod parse;
pub mod tfstate;
pub mod transform;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::executor::version::TfVersion;
use tfstate::TfState;
pub use transform::{ParameterMapping, TfTransformer};

/// Name of the module every brokerpak template is rendered into.
pub const DEFAULT_MODULE_NAME: &str = "brokertemplate";

/// Name of the single instance of that module.
pub const DEFAULT_INSTANCE_NAME: &str = "instance";

pub const STATE_FILE: &str = "terraform.tfstate";
pub const TFVARS_FILE: &str = "terraform.tfvars.json";

/// Treat an explicit JSON `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleDefinition {
    pub name: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub definitions: BTreeMap<String, String>,
}

impl ModuleDefinition {
    fn sources(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.definition.as_str()).chain(self.definitions.values().map(String::as_str))
    }

    /// Declared input variable names, sorted.
    pub fn inputs(&self) -> Result<Vec<String>> {
        parse::variable_names(self.sources()).with_context(|| format!("module {:?}", self.name))
    }

    /// Declared output names, sorted.
    pub fn outputs(&self) -> Result<Vec<String>> {
        parse::output_names(self.sources()).with_context(|| format!("module {:?}", self.name))
    }

    fn hcl_len(&self) -> usize {
        self.definition.len() + self.definitions.values().map(String::len).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleInstance {
    pub module_name: String,
    pub instance_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub configuration: Map<String, Value>,
}

impl ModuleInstance {
    /// Root `.tf.json` wiring this instance to its module and re-exporting outputs.
    fn root_definition(&self, outputs: &[String]) -> Result<Vec<u8>> {
        let mut module = Map::new();
        module.insert("source".into(), Value::String(format!("./{}", self.module_name)));
        for (k, v) in &self.configuration {
            module.insert(k.clone(), v.clone());
        }

        let mut output_block = Map::new();
        for name in outputs {
            output_block.insert(
                name.clone(),
                serde_json::json!({ "value": format!("${{module.{}.{}}}", self.instance_name, name) }),
            );
        }

        let mut root = Map::new();
        root.insert(
            "module".into(),
            Value::Object([(self.instance_name.clone(), Value::Object(module))].into_iter().collect()),
        );
        if !output_block.is_empty() {
            root.insert("output".into(), Value::Object(output_block));
        }
        Ok(serde_json::to_vec_pretty(&Value::Object(root))?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default, deserialize_with = "null_as_default")]
    pub modules: Vec<ModuleDefinition>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instances: Vec<ModuleInstance>,
    #[serde(rename = "tfstate", default, with = "state_bytes")]
    pub state: Option<Vec<u8>>,
    #[serde(rename = "transform", default)]
    pub transformer: TfTransformer,
    /// Tool version that most recently ran against this workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_version: Option<TfVersion>,
}

impl Workspace {
    /// Build a single-module workspace, keeping only the variables the module declares.
    pub fn new(
        vars: &Map<String, Value>,
        template: &str,
        templates: &BTreeMap<String, String>,
        transformer: TfTransformer,
    ) -> Result<Self> {
        let module = ModuleDefinition {
            name: DEFAULT_MODULE_NAME.to_string(),
            definition: template.to_string(),
            definitions: templates.clone(),
        };
        let configuration = limit_to_inputs(&module, vars)?;

        Ok(Self {
            instances: vec![ModuleInstance {
                module_name: module.name.clone(),
                instance_name: DEFAULT_INSTANCE_NAME.to_string(),
                configuration,
            }],
            modules: vec![module],
            state: None,
            transformer,
            pinned_version: None,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("error serializing workspace")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("error deserializing workspace")
    }

    pub fn has_state(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Version recorded in the tfstate, `None` when no state has been written.
    pub fn state_version(&self) -> Result<Option<TfVersion>> {
        match &self.state {
            Some(bytes) if !bytes.is_empty() => TfState::parse(bytes)?.tool_version(),
            _ => Ok(None),
        }
    }

    /// Root outputs from the stored state. Empty when there is no state.
    pub fn outputs(&self) -> Result<Map<String, Value>> {
        match &self.state {
            Some(bytes) if !bytes.is_empty() => Ok(TfState::parse(bytes)
                .context("error creating TF state")?
                .outputs()),
            _ => Ok(Map::new()),
        }
    }

    /// Replace the instance variables, limited to the first module's inputs.
    pub fn update_instance_configuration(&mut self, vars: &Map<String, Value>) -> Result<()> {
        let Some(module) = self.modules.first() else {
            bail!("workspace has no modules");
        };
        let configuration = limit_to_inputs(module, vars)?;
        match self.instances.first_mut() {
            Some(instance) => instance.configuration = configuration,
            None => bail!("workspace has no instances"),
        }
        Ok(())
    }

    /// Write modules, variables and state into `dir`.
    pub fn materialise(&self, dir: &Path) -> Result<()> {
        let hcl_len: usize = self.modules.iter().map(ModuleDefinition::hcl_len).sum();
        let flat = self.modules.len() == 1 && self.modules[0].definition.is_empty() && hcl_len > 0;

        if flat {
            self.materialise_flat(dir)?;
        } else {
            self.materialise_modules(dir)?;
        }

        if let Some(state) = self.state.as_ref().filter(|s| !s.is_empty()) {
            fs::write(dir.join(STATE_FILE), state).context("failed to write state file")?;
        }
        Ok(())
    }

    fn materialise_flat(&self, dir: &Path) -> Result<()> {
        if self.instances.len() != 1 {
            bail!("cannot build flat workspace with multiple instances");
        }
        for (name, body) in &self.modules[0].definitions {
            fs::write(dir.join(format!("{name}.tf")), body)?;
        }
        let vars = serde_json::to_vec_pretty(&self.instances[0].configuration)?;
        fs::write(dir.join(TFVARS_FILE), vars)?;
        Ok(())
    }

    fn materialise_modules(&self, dir: &Path) -> Result<()> {
        let mut outputs = BTreeMap::new();
        for module in &self.modules {
            let parent = dir.join(&module.name);
            fs::create_dir_all(&parent)?;
            if !module.definition.is_empty() {
                fs::write(parent.join("definition.tf"), &module.definition)?;
            }
            for (name, body) in &module.definitions {
                fs::write(parent.join(format!("{name}.tf")), body)?;
            }
            outputs.insert(module.name.clone(), module.outputs()?);
        }

        for instance in &self.instances {
            let module_outputs = outputs.get(&instance.module_name).cloned().unwrap_or_default();
            let contents = instance.root_definition(&module_outputs)?;
            fs::write(dir.join(format!("{}.tf.json", instance.instance_name)), contents)?;
        }
        Ok(())
    }

    /// Read the state file back after an invocation, if the tool wrote one.
    pub fn ingest(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        if path.exists() {
            self.state = Some(fs::read(&path).context("failed to read state file")?);
        }
        Ok(())
    }

    /// Human readable dump for `tf dump`.
    pub fn describe(&self) -> String {
        let mut b = String::new();
        let _ = writeln!(b, "# Workspace");
        let _ = writeln!(b, "modules: {}", self.modules.len());
        let _ = writeln!(b, "instances: {}", self.instances.len());
        if let Ok(Some(v)) = self.state_version() {
            let _ = writeln!(b, "state version: {v}");
        }
        let _ = writeln!(b);

        for instance in &self.instances {
            let _ = writeln!(b, "## Instance {:?}", instance.instance_name);
            let _ = writeln!(b, "module = {:?}", instance.module_name);
            for (k, v) in &instance.configuration {
                let _ = writeln!(b, "input.{k} = {v}");
            }
            if let Ok(outputs) = self.outputs() {
                for (k, v) in outputs {
                    let _ = writeln!(b, "output.{k} = {v}");
                }
            }
            let _ = writeln!(b);
        }
        b
    }
}

fn limit_to_inputs(module: &ModuleDefinition, vars: &Map<String, Value>) -> Result<Map<String, Value>> {
    Ok(module
        .inputs()?
        .into_iter()
        .map(|name| {
            let value = vars.get(&name).cloned().unwrap_or(Value::Null);
            (name, value)
        })
        .collect())
}

/// tfstate travels as a base64 string inside the workspace JSON, `null` when absent.
mod state_bytes {
    use super::*;
    use base64::Engine as _;

    pub fn serialize<S: Serializer>(state: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match state {
            Some(bytes) => s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
