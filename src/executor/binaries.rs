use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::version::TfVersion;

/// Name of the tool binary inside a version directory.
pub const TOFU_BINARY: &str = "tofu";

/// Variables always forwarded to the tool when set.
const BASE_ENV: &[&str] = &["PATH", "HOME", "TMPDIR"];

/// Where a loaded brokerpak unpacked its tool binaries, and how to call them.
#[derive(Debug, Clone)]
pub struct TfBinariesContext {
    /// Root of the unpacked pak: `versions/<v>/tofu` and `plugins/`.
    pub dir: PathBuf,
    pub default_version: TfVersion,
    /// Ascending intermediate versions, ending at `default_version`.
    pub upgrade_path: Vec<TfVersion>,
    /// Provider address rewrites applied to state before init (old → new).
    pub provider_replacements: BTreeMap<String, String>,
    /// Complete child environment.
    pub env: BTreeMap<String, String>,
}

impl TfBinariesContext {
    pub fn binary_path(&self, version: &TfVersion) -> PathBuf {
        version_binary(&self.dir, version)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.dir.join("plugins")
    }
}

pub fn version_binary(dir: &Path, version: &TfVersion) -> PathBuf {
    dir.join("versions").join(version.as_str()).join(TOFU_BINARY)
}

/// Build the child environment from the allow-list.
///
/// Forwards the base variables, every `GSB_*` variable, and the manifest's
/// `required_env_variables`; then overlays the pak's resolved parameters.
pub fn passthrough_env(
    process_env: &BTreeMap<String, String>,
    required: &[String],
    params: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = process_env
        .iter()
        .filter(|(k, _)| {
            BASE_ENV.contains(&k.as_str()) || k.starts_with("GSB_") || required.iter().any(|r| r == *k)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_allowed_variables_pass() {
        let process: BTreeMap<String, String> = [
            ("PATH", "/bin"),
            ("GSB_BROKERPAK_CONFIG", "{}"),
            ("AWS_ACCESS_KEY_ID", "AKIA"),
            ("SECURITY_USER_PASSWORD", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let params = BTreeMap::from([("AWS_DEFAULT_REGION".to_string(), "eu-west-1".to_string())]);

        let env = passthrough_env(&process, &["AWS_ACCESS_KEY_ID".to_string()], &params);
        assert_eq!(env.len(), 4);
        assert!(env.contains_key("GSB_BROKERPAK_CONFIG"));
        assert!(!env.contains_key("SECURITY_USER_PASSWORD"));
        assert_eq!(env["AWS_DEFAULT_REGION"], "eu-west-1");
    }

    #[test]
    fn binary_layout() {
        let v = TfVersion::parse("1.6.2").unwrap();
        assert_eq!(version_binary(Path::new("/pak"), &v), PathBuf::from("/pak/versions/1.6.2/tofu"));
    }
}
