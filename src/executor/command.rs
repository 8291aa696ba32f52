use std::path::PathBuf;

/// One tofu subcommand with the flags the broker always passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TofuCommand {
    Init { plugin_dir: Option<PathBuf> },
    Validate,
    Plan,
    Apply,
    Destroy,
    Show,
    Import { address: String, id: String },
    ReplaceProvider { from: String, to: String },
}

impl TofuCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TofuCommand::Init { .. } => "init",
            TofuCommand::Validate => "validate",
            TofuCommand::Plan => "plan",
            TofuCommand::Apply => "apply",
            TofuCommand::Destroy => "destroy",
            TofuCommand::Show => "show",
            TofuCommand::Import { .. } => "import",
            TofuCommand::ReplaceProvider { .. } => "state replace-provider",
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self {
            TofuCommand::Init { plugin_dir } => {
                let mut a = vec!["init".to_string()];
                if let Some(dir) = plugin_dir {
                    a.push(format!("-plugin-dir={}", dir.display()));
                }
                a
            }
            TofuCommand::Validate => vec!["validate".into()],
            TofuCommand::Plan => vec!["plan".into(), "-json".into()],
            TofuCommand::Apply => vec!["apply".into(), "-json".into(), "-auto-approve".into()],
            TofuCommand::Destroy => vec!["destroy".into(), "-json".into(), "-auto-approve".into()],
            TofuCommand::Show => vec!["show".into()],
            TofuCommand::Import { address, id } => {
                return vec!["import".into(), "-no-color".into(), address.clone(), id.clone()];
            }
            TofuCommand::ReplaceProvider { from, to } => {
                return vec![
                    "state".into(),
                    "replace-provider".into(),
                    "-auto-approve".into(),
                    "-no-color".into(),
                    from.clone(),
                    to.clone(),
                ];
            }
        };
        args.push("-no-color".into());
        args
    }

    /// Extra environment for this subcommand.
    pub fn env(&self) -> Vec<(String, String)> {
        match self {
            // Keep provider addresses in `show` output as written in state.
            TofuCommand::Show => vec![(
                "OPENTOFU_STATEFILE_PROVIDER_ADDRESS_TRANSLATION".to_string(),
                "0".to_string(),
            )],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        assert_eq!(
            TofuCommand::Init { plugin_dir: Some("/pak/plugins".into()) }.args(),
            vec!["init", "-plugin-dir=/pak/plugins", "-no-color"]
        );
        assert_eq!(TofuCommand::Apply.args(), vec!["apply", "-json", "-auto-approve", "-no-color"]);
        assert_eq!(
            TofuCommand::Import { address: "aws_s3_bucket.b".into(), id: "bkt".into() }.args(),
            vec!["import", "-no-color", "aws_s3_bucket.b", "bkt"]
        );
        assert_eq!(TofuCommand::Show.env()[0].1, "0");
    }
}
