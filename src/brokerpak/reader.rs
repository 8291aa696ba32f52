use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use zip::ZipArchive;

use super::definition::ServiceDefinition;
use super::manifest::{BinaryResource, Manifest, Platform, MANIFEST_NAME};
use super::validation::FieldErrors;
use crate::executor::binaries::{version_binary, TOFU_BINARY};
use crate::executor::version::TfVersion;

/// Read access to a packed `.brokerpak` archive.
pub struct BrokerpakReader {
    path: PathBuf,
    archive: ZipArchive<File>,
}

/// One archive entry, as listed by `pak info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakEntry {
    pub name: String,
    pub size: u64,
}

impl BrokerpakReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("couldn't open brokerpak {}", path.display()))?;
        let archive =
            ZipArchive::new(file).with_context(|| format!("{} is not a valid zip archive", path.display()))?;
        Ok(Self { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_string(&mut self, name: &str) -> Result<String> {
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|_| anyhow!("couldn't find the file with the name {name:?}"))?;
        let mut out = String::new();
        entry
            .read_to_string(&mut out)
            .with_context(|| format!("couldn't read {name:?} from brokerpak"))?;
        Ok(out)
    }

    pub fn manifest(&mut self) -> Result<Manifest> {
        let yaml = self.read_string(MANIFEST_NAME)?;
        Manifest::from_yaml(&yaml)
    }

    /// Service definitions in manifest order, templates already inlined.
    pub fn services(&mut self) -> Result<Vec<ServiceDefinition>> {
        let manifest = self.manifest()?;
        let mut services = Vec::with_capacity(manifest.service_definitions.len());
        for name in &manifest.service_definitions {
            let yaml = self.read_string(name)?;
            let def = ServiceDefinition::from_yaml(&yaml).with_context(|| format!("couldn't parse {name}"))?;
            services.push(def);
        }
        Ok(services)
    }

    /// Check manifest, definitions, catalog-wide uniqueness, binary presence,
    /// and the CRC of every entry.
    pub fn validate(&mut self) -> Result<()> {
        let manifest = self.manifest().context("couldn't open brokerpak manifest")?;
        manifest
            .validate()
            .into_result()
            .context("couldn't validate brokerpak manifest")?;

        let services = self.services().context("couldn't list services")?;
        for svc in &services {
            svc.validate()
                .into_result()
                .with_context(|| format!("service {:?} failed validation", svc.name))?;
        }
        unique_across_services(&services).into_result()?;

        for platform in &manifest.platforms {
            for resource in &manifest.binaries {
                let entry = archive_path(platform, resource);
                if self.archive.by_name(&entry).is_err() {
                    bail!("brokerpak is missing {entry} for platform {platform}");
                }
            }
        }

        for i in 0..self.archive.len() {
            let mut entry = self.archive.by_index(i)?;
            let name = entry.name().to_string();
            io::copy(&mut entry, &mut io::sink()).with_context(|| format!("checksum mismatch in {name}"))?;
        }
        Ok(())
    }

    pub fn entries(&mut self) -> Result<Vec<PakEntry>> {
        let mut out = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let entry = self.archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            out.push(PakEntry {
                name: entry.name().to_string(),
                size: entry.size(),
            });
        }
        Ok(out)
    }

    /// Unpack the current platform's binaries into `dest`.
    ///
    /// Tool binaries land in `versions/<v>/tofu`, provider plugins in the
    /// `plugins/` mirror layout, and side-cars at the top level.
    pub fn extract_platform_bins(&mut self, dest: &Path) -> Result<()> {
        let manifest = self.manifest()?;
        let platform = Platform::current();
        if !manifest.applies_to_current_platform() {
            bail!(
                "the package {:?} doesn't contain binaries compatible with the current platform {:?}",
                manifest.name,
                platform.to_string()
            );
        }

        for resource in &manifest.binaries {
            let source = archive_path(&platform, resource);
            let target = install_path(dest, &platform, resource)?;
            self.extract_file(&source, &target)
                .with_context(|| format!("error extracting {source:?} to {:?}", target.display()))?;
        }
        Ok(())
    }

    fn extract_file(&mut self, name: &str, target: &Path) -> Result<()> {
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|_| anyhow!("file {name:?} not found in brokerpak"))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(target)?;
        io::copy(&mut entry, &mut out)?;
        make_executable(target)
    }
}

/// Where a binary lives inside the archive for one platform.
pub fn archive_path(platform: &Platform, resource: &BinaryResource) -> String {
    let base = format!("bin/{}/{}", platform.os, platform.arch);
    if resource.is_tool() {
        format!("{base}/{}/{TOFU_BINARY}", resource.version)
    } else if resource.is_provider() {
        format!("{base}/{}", resource.plugin_file_name())
    } else {
        format!("{base}/{}", resource.name)
    }
}

fn install_path(dest: &Path, platform: &Platform, resource: &BinaryResource) -> Result<PathBuf> {
    Ok(if resource.is_tool() {
        version_binary(dest, &TfVersion::parse(&resource.version)?)
    } else if resource.is_provider() {
        dest.join("plugins")
            .join(&resource.provider)
            .join(&resource.version)
            .join(format!("{}_{}", platform.os, platform.arch))
            .join(resource.plugin_file_name())
    } else {
        dest.join(&resource.name)
    })
}

/// Plan IDs must be unique across every loaded offering.
pub fn unique_across_services(services: &[ServiceDefinition]) -> FieldErrors {
    let mut errs = FieldErrors::new();
    let mut names = BTreeSet::new();
    let mut service_ids = BTreeSet::new();
    let mut plan_ids = BTreeSet::new();
    for (i, svc) in services.iter().enumerate() {
        if !names.insert(svc.name.as_str()) {
            errs.duplicate(&svc.name, format!("services[{i}].Name"));
        }
        if !service_ids.insert(svc.id.as_str()) {
            errs.duplicate(&svc.id, format!("services[{i}].ID"));
        }
        for (j, plan) in svc.plans.iter().enumerate() {
            if !plan_ids.insert(plan.id.as_str()) {
                errs.duplicate(&plan.id, format!("services[{i}].plans[{j}].ID"));
            }
        }
    }
    errs
}

pub(crate) fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
