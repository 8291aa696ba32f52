use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tempfile::TempDir;

use super::definition::{MaintenanceInfo, ServiceDefinition};
use super::fetch::{self, Fetcher};
use super::interpolation;
use super::manifest::Manifest;
use super::reader::BrokerpakReader;
use crate::config::{BrokerpakSourceConfig, Config};
use crate::executor::binaries::{passthrough_env, TfBinariesContext};
use crate::executor::TfVersion;

/// An offering loaded from a brokerpak, with everything needed to run it.
#[derive(Debug, Clone)]
pub struct RegisteredService {
    pub definition: Arc<ServiceDefinition>,
    pub binaries: Arc<TfBinariesContext>,
    /// Global brokerpak config overlaid with this pak's source config.
    pub pak_config: Arc<Map<String, Value>>,
    pub pak_name: String,
}

/// Loaded paks. Dropping it removes the unpacked binaries.
#[derive(Debug, Default)]
pub struct Registry {
    pub services: Vec<RegisteredService>,
    staging: Vec<TempDir>,
}

impl Registry {
    /// Keep an unpacked pak directory alive for the life of the registry.
    pub fn hold(&mut self, dir: TempDir) {
        self.staging.push(dir);
    }
}

/// Every configured pak source, plus `*.brokerpak` files in the builtin path.
pub fn list_sources(config: &Config) -> Result<BTreeMap<String, BrokerpakSourceConfig>> {
    let mut sources = config.brokerpak_sources.clone();
    let dir = &config.builtin_brokerpak_path;
    if dir.is_dir() {
        let pattern = format!("{}/*.brokerpak", dir.display());
        for path in glob::glob(&pattern)?.filter_map(|p| p.ok()) {
            let name = path
                .file_stem()
                .map(|s| format!("builtin-{}", s.to_string_lossy()))
                .unwrap_or_else(|| "builtin".to_string());
            sources.entry(name).or_insert_with(|| BrokerpakSourceConfig {
                uri: path.display().to_string(),
                notes: "builtin brokerpak".into(),
                ..Default::default()
            });
        }
    }
    Ok(sources)
}

/// Open, validate and unpack every pak source.
pub async fn register_all(config: &Config) -> Result<Registry> {
    let mut registry = Registry::default();
    let fetcher = Fetcher::new(None);

    for (name, source) in list_sources(config)? {
        tracing::info!(
            name = %name,
            location = %source.uri,
            prefix = %source.service_prefix,
            excluded = ?source.excluded_services_list(),
            notes = %source.notes,
            "registering brokerpak"
        );

        let staging = tempfile::Builder::new().prefix("brokerpak-staging").tempdir()?;
        let local = if fetch::is_remote(&source.uri) {
            let dest = staging.path().join("pack.brokerpak");
            fetcher
                .fetch(&source.uri, &dest)
                .await
                .with_context(|| format!("couldn't download brokerpak {:?}", source.uri))?;
            dest
        } else {
            PathBuf::from(&source.uri)
        };

        let pak_config = merge_config(&config.brokerpak_config.values, source.config.as_ref())
            .with_context(|| format!("couldn't merge config for brokerpak {name:?}"))?;
        let unpacked = tempfile::Builder::new().prefix("brokerpak").tempdir()?;
        let services = register_one(config, &name, &source, &local, unpacked.path().to_path_buf(), pak_config)
            .with_context(|| format!("couldn't open brokerpak: {:?}", source.uri))?;
        registry.services.extend(services);
        registry.hold(unpacked);
    }
    Ok(registry)
}

fn register_one(
    config: &Config,
    name: &str,
    source: &BrokerpakSourceConfig,
    path: &std::path::Path,
    dir: PathBuf,
    pak_config: Map<String, Value>,
) -> Result<Vec<RegisteredService>> {
    let mut reader = BrokerpakReader::open(path)?;
    reader.validate()?;
    reader.extract_platform_bins(&dir)?;
    let manifest = reader.manifest()?;

    for required in &manifest.required_env_variables {
        if !config.environment.contains_key(required) {
            bail!("missing required env var {required}");
        }
    }

    let binaries = Arc::new(binaries_context(config, &manifest, dir, &pak_config)?);
    let maintenance_info = config.flags.tf_upgrades.then(|| maintenance_info(&binaries.default_version));

    let excluded = source.excluded_services_list();
    let pak_config = Arc::new(pak_config);
    let mut out = Vec::new();
    for mut def in reader.services()? {
        if excluded.contains(&def.id) {
            tracing::info!(service = %def.name, id = %def.id, "skipping excluded service");
            continue;
        }
        def.name = format!("{}{}", source.service_prefix, def.name);
        for plan in &mut def.plans {
            plan.maintenance_info = maintenance_info.clone();
        }
        out.push(RegisteredService {
            definition: Arc::new(def),
            binaries: binaries.clone(),
            pak_config: pak_config.clone(),
            pak_name: name.to_string(),
        });
    }

    tracing::info!(name, version = %manifest.version, services = out.len(), "registration successful");
    Ok(out)
}

/// Maintenance info advertised on every plan when tool upgrades are enabled.
pub fn maintenance_info(version: &TfVersion) -> MaintenanceInfo {
    MaintenanceInfo {
        version: version.to_string(),
        description: format!(
            "This upgrade provides support for OpenTofu version: {version}. The upgrade operation will take a while. \
             The instance and all associated bindings will be upgraded."
        ),
    }
}

fn merge_config(global: &Map<String, Value>, pak: Option<&Value>) -> Result<Map<String, Value>> {
    let mut merged = global.clone();
    match pak {
        None | Some(Value::Null) => {}
        Some(Value::Object(obj)) => merged.extend(obj.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => {}
        Some(Value::String(s)) => {
            let obj: Map<String, Value> = serde_json::from_str(s).context("pak config is not a JSON object")?;
            merged.extend(obj);
        }
        Some(other) => bail!("pak config must be a JSON object, got {other}"),
    }
    Ok(merged)
}

/// Resolve manifest parameters and env mappings into the tool environment.
pub fn binaries_context(
    config: &Config,
    manifest: &Manifest,
    dir: PathBuf,
    pak_config: &Map<String, Value>,
) -> Result<TfBinariesContext> {
    let mut params = BTreeMap::new();
    for p in &manifest.parameters {
        if let Some(v) = pak_config.get(&p.name) {
            params.insert(p.name.clone(), interpolation::to_display(v));
        }
    }
    for (env_name, key) in &manifest.env_config_mapping {
        if let Some(v) = lookup_dotted(pak_config, key) {
            params.insert(env_name.clone(), interpolation::to_display(v));
        }
    }

    let mut upgrade_path = manifest.upgrade_versions()?;
    let default_version = manifest.default_tool_version()?;
    if upgrade_path.last() != Some(&default_version) && !upgrade_path.is_empty() {
        upgrade_path.push(default_version.clone());
    }

    Ok(TfBinariesContext {
        dir,
        default_version,
        upgrade_path,
        provider_replacements: manifest.provider_replacements.clone(),
        env: passthrough_env(&config.environment, &manifest.required_env_variables, &params),
    })
}

fn lookup_dotted<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(v) = map.get(key) {
        return Some(v);
    }
    let (head, rest) = key.split_once('.')?;
    match map.get(head)? {
        Value::Object(inner) => lookup_dotted(inner, rest),
        _ => None,
    }
}
