use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::validation::FieldErrors;
use crate::executor::binaries::TOFU_BINARY;
use crate::executor::version::TfVersion;

pub const MANIFEST_NAME: &str = "manifest.yml";

/// Download location used when a tool entry has no `url_template`.
pub const TOFU_URL_TEMPLATE: &str =
    "https://github.com/opentofu/opentofu/releases/download/v${version}/tofu_${version}_${os}_${arch}.zip";

/// Download location used for other binaries without a `url_template`.
pub const RELEASES_URL_TEMPLATE: &str =
    "https://releases.hashicorp.com/${name}/${version}/${name}_${version}_${os}_${arch}.zip";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub packversion: i32,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(rename = "terraform_binaries", default)]
    pub binaries: Vec<BinaryResource>,
    #[serde(default)]
    pub service_definitions: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ManifestParameter>,
    #[serde(default)]
    pub required_env_variables: Vec<String>,
    /// Tool environment variable → dotted key in the brokerpak config.
    #[serde(default)]
    pub env_config_mapping: BTreeMap<String, String>,
    #[serde(rename = "terraform_upgrade_path", default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade_path: Vec<UpgradePathEntry>,
    #[serde(
        rename = "terraform_state_provider_replacements",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub provider_replacements: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// The platform this process runs on, in Go-style naming.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    pub fn matches_current(&self) -> bool {
        *self == Self::current()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// A binary fetched into the pak: the tool itself, a provider plugin, or a side-car.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryResource {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub default: bool,
    /// Registry address for provider plugins, e.g. `registry.opentofu.org/hashicorp/random`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

impl BinaryResource {
    pub fn is_tool(&self) -> bool {
        self.name == TOFU_BINARY || self.name == "terraform"
    }

    pub fn is_provider(&self) -> bool {
        !self.provider.is_empty()
    }

    /// Expand the download URL for one platform.
    pub fn url(&self, platform: &Platform) -> String {
        let template = match self.url_template.as_str() {
            "" if self.is_tool() => TOFU_URL_TEMPLATE,
            "" => RELEASES_URL_TEMPLATE,
            t => t,
        };
        template
            .replace("${name}", &self.name)
            .replace("${version}", &self.version)
            .replace("${os}", &platform.os)
            .replace("${arch}", &platform.arch)
    }

    /// File name of a provider plugin as the tool expects it.
    pub fn plugin_file_name(&self) -> String {
        format!("{}_v{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestParameter {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePathEntry {
    pub version: String,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid manifest YAML")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialise manifest")
    }

    pub fn validate(&self) -> FieldErrors {
        let mut errs = FieldErrors::new();
        if self.packversion != 1 {
            errs.invalid(self.packversion, "packversion");
        }
        if self.name.trim().is_empty() {
            errs.missing("name");
        }
        if self.version.trim().is_empty() {
            errs.missing("version");
        }

        if self.platforms.is_empty() {
            errs.missing("platforms");
        }
        for (i, p) in self.platforms.iter().enumerate() {
            if p.os.trim().is_empty() {
                errs.missing(format!("platforms[{i}].os"));
            }
            if p.arch.trim().is_empty() {
                errs.missing(format!("platforms[{i}].arch"));
            }
        }

        if self.binaries.is_empty() {
            errs.missing("terraform_binaries");
        }
        for (i, b) in self.binaries.iter().enumerate() {
            if b.name.trim().is_empty() {
                errs.missing(format!("terraform_binaries[{i}].name"));
            }
            if b.version.trim().is_empty() {
                errs.missing(format!("terraform_binaries[{i}].version"));
            } else if TfVersion::parse(&b.version).is_err() {
                errs.invalid(&b.version, format!("terraform_binaries[{i}].version"));
            }
        }

        if self.service_definitions.is_empty() {
            errs.missing("service_definitions");
        }
        for (i, p) in self.parameters.iter().enumerate() {
            if p.name.trim().is_empty() {
                errs.missing(format!("parameters[{i}].name"));
            }
            if p.description.trim().is_empty() {
                errs.missing(format!("parameters[{i}].description"));
            }
        }

        self.validate_tool_versions(&mut errs);
        errs
    }

    fn validate_tool_versions(&self, errs: &mut FieldErrors) {
        let mut seen = BTreeSet::new();
        for (i, b) in self.binaries.iter().enumerate() {
            if b.is_tool() && !seen.insert(b.version.clone()) {
                errs.duplicate(&b.version, format!("terraform_binaries[{i}].version"));
            }
        }

        let tools = self.tool_versions();
        if tools.is_empty() {
            if !self.binaries.is_empty() {
                errs.missing("terraform_binaries: no tofu binary declared");
            }
            return;
        }
        let defaults: Vec<&BinaryResource> = self.binaries.iter().filter(|b| b.is_tool() && b.default).collect();
        if tools.len() > 1 && defaults.is_empty() {
            errs.push("multiple Terraform versions, but none marked as default", "terraform_binaries");
            return;
        }
        if defaults.len() > 1 {
            errs.push("multiple Terraform versions marked as default", "terraform_binaries");
            return;
        }
        let Ok(default) = self.default_tool_version() else {
            return;
        };
        if tools.iter().any(|v| *v > default) {
            errs.push("default version of Terraform must be the highest version", "terraform_binaries");
        }

        let mut previous: Option<TfVersion> = None;
        for (i, step) in self.upgrade_path.iter().enumerate() {
            let path = format!("terraform_upgrade_path[{i}]");
            let Ok(v) = TfVersion::parse(&step.version) else {
                errs.invalid(&step.version, path);
                continue;
            };
            if !tools.contains(&v) {
                errs.push(format!("no tofu binary declared for upgrade version {v}"), &path);
            }
            if previous.as_ref().is_some_and(|p| *p >= v) {
                errs.push("upgrade path versions must be in ascending order", &path);
            }
            previous = Some(v);
        }
        if let Some(last) = previous {
            if last != default {
                errs.push(
                    format!("upgrade path must end at the default version {default}"),
                    "terraform_upgrade_path",
                );
            }
        }
    }

    /// Declared tool versions, ascending.
    pub fn tool_versions(&self) -> Vec<TfVersion> {
        let mut versions: Vec<TfVersion> = self
            .binaries
            .iter()
            .filter(|b| b.is_tool())
            .filter_map(|b| TfVersion::parse(&b.version).ok())
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }

    /// The version new deployments run at: the one marked default, or the only one.
    pub fn default_tool_version(&self) -> Result<TfVersion> {
        let tools: Vec<&BinaryResource> = self.binaries.iter().filter(|b| b.is_tool()).collect();
        let chosen = match tools.as_slice() {
            [] => anyhow::bail!("no tofu binary declared in manifest {:?}", self.name),
            [only] => *only,
            many => many
                .iter()
                .copied()
                .find(|b| b.default)
                .context("multiple Terraform versions, but none marked as default")?,
        };
        TfVersion::parse(&chosen.version)
    }

    pub fn upgrade_versions(&self) -> Result<Vec<TfVersion>> {
        self.upgrade_path.iter().map(|s| TfVersion::parse(&s.version)).collect()
    }

    pub fn applies_to_current_platform(&self) -> bool {
        self.platforms.iter().any(Platform::matches_current)
    }

    /// Starting point written by `pak init`.
    pub fn example() -> Self {
        Manifest {
            packversion: 1,
            name: "my-services-pack".into(),
            version: "1.0.0".into(),
            metadata: BTreeMap::from([("author".to_string(), "me@example.com".to_string())]),
            platforms: vec![
                Platform {
                    os: "linux".into(),
                    arch: "amd64".into(),
                },
                Platform {
                    os: "darwin".into(),
                    arch: "arm64".into(),
                },
            ],
            binaries: vec![
                BinaryResource {
                    name: TOFU_BINARY.into(),
                    version: "1.6.2".into(),
                    source: "https://github.com/opentofu/opentofu/archive/v1.6.2.zip".into(),
                    default: true,
                    ..Default::default()
                },
                BinaryResource {
                    name: "terraform-provider-random".into(),
                    version: "3.6.0".into(),
                    source: "https://github.com/hashicorp/terraform-provider-random/archive/v3.6.0.zip".into(),
                    provider: "registry.opentofu.org/hashicorp/random".into(),
                    ..Default::default()
                },
            ],
            service_definitions: vec!["example-service-definition.yml".into()],
            parameters: vec![ManifestParameter {
                name: "MY_ENVIRONMENT_VARIABLE".into(),
                description: "Set this to whatever you like.".into(),
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(version: &str, default: bool) -> BinaryResource {
        BinaryResource {
            name: TOFU_BINARY.into(),
            version: version.into(),
            default,
            ..Default::default()
        }
    }

    #[test]
    fn example_manifest_is_valid() {
        let errs = Manifest::example().validate();
        assert!(errs.is_empty(), "{errs}");
    }

    #[test]
    fn requires_a_default_among_several_versions() {
        let mut m = Manifest::example();
        m.binaries = vec![tool("1.5.7", false), tool("1.6.2", false)];
        assert!(m
            .validate()
            .to_string()
            .contains("multiple Terraform versions, but none marked as default"));
    }

    #[test]
    fn default_must_be_highest() {
        let mut m = Manifest::example();
        m.binaries = vec![tool("1.5.7", true), tool("1.6.2", false)];
        assert!(m
            .validate()
            .to_string()
            .contains("default version of Terraform must be the highest version"));
    }

    #[test]
    fn upgrade_path_rules() {
        let mut m = Manifest::example();
        m.binaries = vec![tool("0.12.21", false), tool("1.1.6", true)];
        m.upgrade_path = vec![
            UpgradePathEntry { version: "1.1.6".into() },
            UpgradePathEntry { version: "0.12.21".into() },
        ];
        let msg = m.validate().to_string();
        assert!(msg.contains("upgrade path versions must be in ascending order"), "{msg}");
        assert!(msg.contains("upgrade path must end at the default version 1.1.6"), "{msg}");

        m.upgrade_path = vec![
            UpgradePathEntry { version: "0.12.21".into() },
            UpgradePathEntry { version: "1.1.6".into() },
        ];
        assert!(m.validate().is_empty());
        assert_eq!(m.default_tool_version().unwrap().as_str(), "1.1.6");
    }

    #[test]
    fn url_expansion() {
        let linux = Platform {
            os: "linux".into(),
            arch: "amd64".into(),
        };
        assert_eq!(
            tool("1.6.2", true).url(&linux),
            "https://github.com/opentofu/opentofu/releases/download/v1.6.2/tofu_1.6.2_linux_amd64.zip"
        );
        let custom = BinaryResource {
            name: "helper".into(),
            version: "2.0".into(),
            url_template: "/opt/${name}-${os}.zip".into(),
            ..Default::default()
        };
        assert_eq!(custom.url(&linux), "/opt/helper-linux.zip");
    }

    #[test]
    fn yaml_field_names() {
        let m = Manifest::from_yaml(
            r#"
packversion: 1
name: p
version: 0.1.0
platforms: [{os: linux, arch: amd64}]
terraform_binaries:
  - name: tofu
    version: 1.6.2
    default: true
service_definitions: [a.yml]
terraform_state_provider_replacements:
  registry.terraform.io/hashicorp/random: registry.opentofu.org/hashicorp/random
"#,
        )
        .unwrap();
        assert_eq!(m.binaries.len(), 1);
        assert_eq!(m.provider_replacements.len(), 1);
    }
}
