//! `pak init` and `pak build`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use zip::write::SimpleFileOptions;

use super::definition::{ActionDefinition, ServiceDefinition, ServicePlan};
use super::fetch::{self, Fetcher};
use super::manifest::{BinaryResource, Manifest, Platform, MANIFEST_NAME};
use super::reader::archive_path;
use super::variables::BrokerVariable;
use crate::executor::binaries::TOFU_BINARY;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Where downloads are cached between builds.
    pub cache_path: Option<PathBuf>,
    /// Also vendor each binary's `source` archive under `src/`.
    pub include_source: bool,
    /// Directory the `.brokerpak` is written to; defaults to the source directory.
    pub output_dir: Option<PathBuf>,
}

/// File name of the built pak for a manifest.
pub fn pak_file_name(manifest: &Manifest) -> String {
    format!("{}-{}.brokerpak", manifest.name, manifest.version)
}

/// Build the pak described by `<dir>/manifest.yml`. Returns the archive path.
pub async fn build(dir: &Path, opts: &BuildOptions) -> Result<PathBuf> {
    let manifest_path = dir.join(MANIFEST_NAME);
    let manifest = Manifest::from_yaml(
        &fs::read_to_string(&manifest_path).with_context(|| format!("couldn't read {}", manifest_path.display()))?,
    )?;
    manifest
        .validate()
        .into_result()
        .context("couldn't validate brokerpak manifest")?;

    let staging = tempfile::TempDir::new()?;
    let tmp = staging.path();
    tracing::info!(staging = %tmp.display(), "packing brokerpak");

    let fetcher = Fetcher::new(opts.cache_path.clone());
    if opts.include_source {
        pack_sources(&manifest, tmp, &fetcher).await?;
    }
    pack_binaries(&manifest, tmp, &fetcher).await?;
    pack_definitions(&manifest, dir, tmp)?;

    let out_dir = opts.output_dir.clone().unwrap_or_else(|| dir.to_path_buf());
    fs::create_dir_all(&out_dir)?;
    let dest = out_dir.join(pak_file_name(&manifest));
    tracing::info!(archive = %dest.display(), "creating archive");
    archive_dir(tmp, &dest)?;
    Ok(dest)
}

async fn pack_sources(manifest: &Manifest, tmp: &Path, fetcher: &Fetcher) -> Result<()> {
    for resource in manifest.binaries.iter().filter(|r| !r.source.is_empty()) {
        let dest = tmp.join("src").join(format!("{}.zip", resource.name));
        tracing::info!(source = %resource.source, dest = %dest.display(), "packing source");
        fetcher.fetch(&resource.source, &dest).await?;
    }
    Ok(())
}

async fn pack_binaries(manifest: &Manifest, tmp: &Path, fetcher: &Fetcher) -> Result<()> {
    let downloads = tempfile::TempDir::new()?;
    for platform in &manifest.platforms {
        for resource in &manifest.binaries {
            let url = resource.url(platform);
            let archive = downloads
                .path()
                .join(format!("{}-{}-{}-{}.zip", resource.name, resource.version, platform.os, platform.arch));
            tracing::info!(url = %url, platform = %platform, "packing binary");
            fetcher.fetch(&url, &archive).await?;
            if let Some(sum) = &resource.sha256 {
                fetch::verify_sha256(&archive, sum)?;
            }
            place_binary(resource, platform, &archive, tmp)?;
        }
    }
    Ok(())
}

fn place_binary(resource: &BinaryResource, platform: &Platform, archive: &Path, tmp: &Path) -> Result<()> {
    let target = tmp.join(archive_path(platform, resource));
    let target_dir = target.parent().context("binary path has no parent")?.to_path_buf();

    let wanted = if resource.is_tool() {
        TOFU_BINARY.to_string()
    } else if resource.is_provider() {
        resource.plugin_file_name()
    } else {
        resource.name.clone()
    };
    let prefix = wanted.clone();
    let written = fetch::extract_matching(archive, &target_dir, move |name| name.starts_with(&prefix))?;
    match written.as_slice() {
        [] => bail!("{} does not contain {wanted}", resource.url(platform)),
        [only] if *only != target => fs::rename(only, &target)?,
        _ => {}
    }
    Ok(())
}

/// Inline template refs and write numbered definitions plus the rewritten manifest.
fn pack_definitions(manifest: &Manifest, base: &Path, tmp: &Path) -> Result<()> {
    let defs_dir = tmp.join("definitions");
    fs::create_dir_all(&defs_dir)?;

    let mut packed = manifest.clone();
    packed.service_definitions.clear();
    for (i, file) in manifest.service_definitions.iter().enumerate() {
        let src = base.join(file);
        let yaml = fs::read_to_string(&src).with_context(|| format!("couldn't read {}", src.display()))?;
        let mut def = ServiceDefinition::from_yaml(&yaml).with_context(|| format!("couldn't parse {file}"))?;
        def.load_templates(base)
            .with_context(|| format!("couldn't load templates for {file}"))?;
        def.provision.clear_template_refs();
        def.bind.clear_template_refs();

        let name = format!("service{i}-{}.yml", def.name);
        tracing::debug!(from = %src.display(), to = %name, "packing definition");
        fs::write(defs_dir.join(&name), serde_yaml::to_string(&def)?)?;
        packed.service_definitions.push(format!("definitions/{name}"));
    }

    fs::write(tmp.join(MANIFEST_NAME), packed.to_yaml()?)?;
    Ok(())
}

/// Zip every file below `dir` with paths relative to it.
pub fn archive_dir(dir: &Path, dest: &Path) -> Result<()> {
    let pattern = format!("{}/**/*", dir.display());
    let mut files: Vec<PathBuf> = glob::glob(&pattern)?
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut writer = zip::ZipWriter::new(File::create(dest)?);
    for path in files {
        let rel = path.strip_prefix(dir)?.to_string_lossy().replace('\\', "/");
        let opts = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(file_mode(&path));
        writer.start_file(rel, opts)?;
        io::copy(&mut File::open(&path)?, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

fn file_mode(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            return meta.permissions().mode() & 0o777;
        }
    }
    let _ = path;
    0o644
}

// ─── pak init ───────────────────────────────────────────────────────────────

const EXAMPLE_TEMPLATE: &str = r#"variable "length" { type = number }

resource "random_string" "value" {
  length = var.length
}

output "value" { value = random_string.value.result }
"#;

/// Write a skeleton manifest, definition and template into `dir`.
pub fn init(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let manifest_path = dir.join(MANIFEST_NAME);
    if manifest_path.exists() {
        bail!("{} already exists", manifest_path.display());
    }
    let manifest = Manifest::example();
    fs::write(&manifest_path, manifest.to_yaml()?)?;

    let definition = example_definition();
    let def_path = dir.join(&manifest.service_definitions[0]);
    fs::write(&def_path, serde_yaml::to_string(&definition)?)?;
    fs::write(dir.join("example-provision.tf"), EXAMPLE_TEMPLATE)?;

    let mut readme = File::create(dir.join("README.md"))?;
    writeln!(readme, "# {}\n", manifest.name)?;
    writeln!(readme, "Run `tofu-broker pak build` in this directory to package it.")?;
    Ok(())
}

fn example_definition() -> ServiceDefinition {
    ServiceDefinition {
        version: 1,
        name: "example-random".into(),
        id: uuid::Uuid::new_v4().to_string(),
        description: "Generates a random string.".into(),
        display_name: "Example Random".into(),
        tags: vec!["example".into()],
        plans: vec![ServicePlan {
            name: "default".into(),
            id: uuid::Uuid::new_v4().to_string(),
            description: "A short string.".into(),
            display_name: "Default".into(),
            properties: serde_json::json!({"length": 8}).as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }],
        provision: ActionDefinition {
            plan_inputs: vec![BrokerVariable {
                field_name: "length".into(),
                var_type: "integer".into(),
                details: "Length of the generated string.".into(),
                ..Default::default()
            }],
            template_ref: "example-provision.tf".into(),
            outputs: vec![BrokerVariable {
                field_name: "value".into(),
                var_type: "string".into(),
                details: "The generated string.".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerpak::reader::BrokerpakReader;
    use tempfile::TempDir;

    #[test]
    fn init_writes_a_loadable_skeleton() {
        let dir = TempDir::new().unwrap();
        init(dir.path()).unwrap();
        let manifest = Manifest::from_yaml(&fs::read_to_string(dir.path().join(MANIFEST_NAME)).unwrap()).unwrap();
        assert!(manifest.validate().is_empty());

        let mut def = ServiceDefinition::from_yaml(
            &fs::read_to_string(dir.path().join("example-service-definition.yml")).unwrap(),
        )
        .unwrap();
        def.load_templates(dir.path()).unwrap();
        assert!(def.validate().is_empty(), "{}", def.validate());

        assert!(init(dir.path()).is_err());
    }

    #[tokio::test]
    async fn build_from_local_archives() {
        let dir = TempDir::new().unwrap();
        let tool_zip = dir.path().join("tofu.zip");
        {
            let mut w = zip::ZipWriter::new(File::create(&tool_zip).unwrap());
            w.start_file("tofu", SimpleFileOptions::default()).unwrap();
            w.write_all(b"#!/bin/sh\n").unwrap();
            w.finish().unwrap();
        }
        init(dir.path()).unwrap();
        let mut manifest = Manifest::example();
        manifest.platforms = vec![Platform::current()];
        manifest.binaries = vec![BinaryResource {
            name: TOFU_BINARY.into(),
            version: "1.6.2".into(),
            url_template: tool_zip.display().to_string(),
            sha256: Some(fetch::sha256_file(&tool_zip).unwrap()),
            default: true,
            ..Default::default()
        }];
        fs::write(dir.path().join(MANIFEST_NAME), manifest.to_yaml().unwrap()).unwrap();

        let out = dir.path().join("out");
        let pak = build(
            dir.path(),
            &BuildOptions {
                output_dir: Some(out.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(pak, out.join("my-services-pack-1.0.0.brokerpak"));

        let mut reader = BrokerpakReader::open(&pak).unwrap();
        reader.validate().unwrap();
        let services = reader.services().unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].provision.template.contains("random_string"));
        assert!(services[0].provision.template_ref.is_empty());

        let unpacked = dir.path().join("unpacked");
        reader.extract_platform_bins(&unpacked).unwrap();
        assert!(unpacked.join("versions/1.6.2/tofu").exists());
    }
}
