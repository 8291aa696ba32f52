use std::fmt;

use regex::Regex;
use std::sync::OnceLock;

/// Accumulates `message: path` field errors so a pak reports every problem at once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FieldErrors(Vec<String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl fmt::Display, path: impl fmt::Display) {
        self.0.push(format!("{message}: {path}"));
    }

    pub fn missing(&mut self, path: impl fmt::Display) {
        self.push("missing field(s)", path);
    }

    pub fn invalid(&mut self, value: impl fmt::Display, path: impl fmt::Display) {
        self.push(format_args!("invalid value: {value}"), path);
    }

    pub fn duplicate(&mut self, value: impl fmt::Display, path: impl fmt::Display) {
        self.push(format_args!("duplicated value, must be unique: {value}"), path);
    }

    /// Nest errors from a child under `prefix`.
    pub fn extend_under(&mut self, prefix: &str, child: FieldErrors) {
        for e in child.0 {
            match e.rsplit_once(": ") {
                Some((msg, path)) => self.0.push(format!("{msg}: {prefix}.{path}")),
                None => self.0.push(format!("{e}: {prefix}")),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{self}"))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

pub fn is_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

/// OSBAPI names: alphanumerics, dots, dashes and underscores.
pub fn is_osb_name(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\-\.]+$").unwrap()).is_match(s)
}

pub fn is_url(s: &str) -> bool {
    reqwest::Url::parse(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nests_paths() {
        let mut inner = FieldErrors::new();
        inner.missing("Name");
        inner.duplicate("abc", "ID");
        let mut outer = FieldErrors::new();
        outer.extend_under("plans[1]", inner);
        assert_eq!(
            outer.to_string(),
            "missing field(s): plans[1].Name\nduplicated value, must be unique: abc: plans[1].ID"
        );
    }

    #[test]
    fn names_and_ids() {
        assert!(is_osb_name("csb-aws-s3.bucket"));
        assert!(!is_osb_name("has space"));
        assert!(is_uuid("8b52a460-b246-11eb-a8f5-d349948e2480"));
        assert!(!is_uuid("nope"));
        assert!(is_url("https://example.com/logo.png"));
    }
}
