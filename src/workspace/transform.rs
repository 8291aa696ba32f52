//! Rewrites applied to `tofu show` output when adopting existing resources.
//!
//! Imported HCL is generated from state, so it carries computed attributes
//! that would fail validation and literal values that should instead come from
//! broker variables. These line-oriented passes clean it up before planning.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maps an attribute path in the imported HCL to a broker variable expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub tf_variable: String,
    pub parameter_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfTransformer {
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub parameter_mappings: Vec<ParameterMapping>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub parameters_to_remove: Vec<String>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub parameters_to_add: Vec<ParameterMapping>,
}

fn brace_depth(line: &str, depth: i64) -> i64 {
    depth + line.matches('{').count() as i64 - line.matches('}').count() as i64
}

fn slot(stack: &mut Vec<String>, depth: i64) -> Option<&mut String> {
    let idx = usize::try_from(depth).ok()?;
    if stack.len() <= idx {
        stack.resize(idx + 1, String::new());
    }
    stack.get_mut(idx)
}

fn read_slot(stack: &[String], depth: i64) -> String {
    usize::try_from(depth)
        .ok()
        .and_then(|i| stack.get(i).cloned())
        .unwrap_or_default()
}

impl TfTransformer {
    /// Drop every attribute or nested block named in `parameters_to_remove`.
    ///
    /// Paths are `<type>.<name>.<attr>` or `<type>.<name>.<block>` for a whole
    /// nested block.
    pub fn clean_tf(&self, tf: &str) -> String {
        let resource = Regex::new(r#"resource "(.*)" "(.*)""#).expect("static regex");
        let value = Regex::new(r"^\s*(\S*)\s*=\s*(.*)\s*$").expect("static regex");
        let block = Regex::new(r"^\s*(\S*)\s*\{\s*$").expect("static regex");

        let mut depth: i64 = 0;
        let mut stack: Vec<String> = Vec::new();
        let mut skip_block_depth: i64 = 0;
        let mut out = String::new();

        for line in tf.lines() {
            let mut skip_line = !(skip_block_depth == 0 || depth < skip_block_depth);
            depth = brace_depth(line, depth);

            if depth < skip_block_depth {
                skip_block_depth = 0;
            }

            if let Some(caps) = resource.captures(line) {
                if let Some(s) = slot(&mut stack, depth) {
                    *s = format!("{}.{}", &caps[1], &caps[2]);
                }
            } else if let Some(caps) = value.captures(line) {
                let path = format!("{}.{}", read_slot(&stack, depth), &caps[1]);
                if self.parameters_to_remove.contains(&path) {
                    skip_line = true;
                }
            } else if let Some(caps) = block.captures(line) {
                let path = format!("{}.{}", read_slot(&stack, depth - 1), &caps[1]);
                if let Some(s) = slot(&mut stack, depth) {
                    *s = path.clone();
                }
                if self.parameters_to_remove.contains(&path) {
                    skip_block_depth = depth;
                    skip_line = true;
                }
            }

            if !skip_line {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Insert `parameters_to_add` attributes right after their resource header.
    pub fn add_parameters_in_tf(&self, tf: &str) -> String {
        let resource = Regex::new(r#"resource "(.*)" "(.*)""#).expect("static regex");
        let mut out = String::new();

        for line in tf.lines() {
            out.push_str(line);
            out.push('\n');

            if let Some(caps) = resource.captures(line) {
                let address = format!("{}.{}", &caps[1], &caps[2]);
                for addition in &self.parameters_to_add {
                    if let Some((prefix, attr)) = addition.tf_variable.rsplit_once('.') {
                        if prefix == address {
                            out.push_str(&format!("{} = {}\n", attr, addition.parameter_name));
                        }
                    }
                }
            }
        }
        out
    }

    /// Replace mapped attribute values with their variable expressions.
    ///
    /// Returns the rewritten HCL and the literal values that were captured for
    /// simple (non-block) attributes, keyed by variable name without the
    /// `var.`/`local.` prefix.
    pub fn replace_parameters_in_tf(&self, tf: &str) -> (String, BTreeMap<String, String>) {
        let captured = self.capture_parameter_values(tf);
        (self.replace_parameters(tf), captured)
    }

    fn capture_parameter_values(&self, tf: &str) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();

        for mapping in &self.parameter_mappings {
            let var = regex::escape(&mapping.tf_variable);
            let Ok(re_block) = Regex::new(&format!(r"(?m){var}\s*=\s+(\{{[\s\S]*?\}})")) else {
                continue;
            };
            let Ok(re_simple) = Regex::new(&format!(r#"(?m){var}\s*=[\s"]*(.*[^"\s])"#)) else {
                continue;
            };

            if re_block.is_match(tf) {
                // Block values are replaced but not captured.
                continue;
            }
            if let Some(caps) = re_simple.captures(tf) {
                let name = &mapping.parameter_name;
                if let Some(key) = name.strip_prefix("var.").or_else(|| name.strip_prefix("local.")) {
                    values.insert(key.to_string(), caps[1].to_string());
                }
            }
        }
        values
    }

    fn replace_parameters(&self, tf: &str) -> String {
        let mut tf = tf.to_string();
        for mapping in &self.parameter_mappings {
            let var = regex::escape(&mapping.tf_variable);
            let replacement = format!("{} = {}", mapping.tf_variable, mapping.parameter_name);
            for pattern in [
                format!(r"(?m){var}\s*=\s+\{{[\s\S]*?\}}"),
                format!(r"(?m){var}\s*=\s+\[[\s\S]*?\]"),
                format!(r"(?m){var}\s*=.*$"),
            ] {
                if let Ok(re) = Regex::new(&pattern) {
                    tf = re.replace_all(&tf, regex::NoExpand(&replacement)).into_owned();
                }
            }
        }
        tf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOWN: &str = r#"resource "google_sql_database_instance" "instance" {
    id = "projects/p/instances/db"
    name = "db"
    self_link = "https://example"
    settings {
        tier = "db-f1-micro"
        ip_configuration {
            ipv4_enabled = true
        }
    }
}
"#;

    fn mapping(var: &str, param: &str) -> ParameterMapping {
        ParameterMapping {
            tf_variable: var.to_string(),
            parameter_name: param.to_string(),
        }
    }

    #[test]
    fn clean_removes_attributes_and_blocks() {
        let t = TfTransformer {
            parameters_to_remove: vec![
                "google_sql_database_instance.instance.id".into(),
                "google_sql_database_instance.instance.self_link".into(),
                "google_sql_database_instance.instance.settings.ip_configuration".into(),
            ],
            ..Default::default()
        };
        let out = t.clean_tf(SHOWN);
        assert!(!out.contains("id = \"projects"));
        assert!(!out.contains("self_link"));
        assert!(!out.contains("ipv4_enabled"));
        assert!(out.contains("tier = \"db-f1-micro\""));
        assert!(out.contains("name = \"db\""));
    }

    #[test]
    fn add_inserts_after_resource_header() {
        let t = TfTransformer {
            parameters_to_add: vec![mapping("google_sql_database_instance.instance.deletion_protection", "false")],
            ..Default::default()
        };
        let out = t.add_parameters_in_tf(SHOWN);
        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("resource"));
        assert_eq!(lines.next().unwrap(), "deletion_protection = false");
    }

    #[test]
    fn replace_rewrites_and_captures() {
        let t = TfTransformer {
            parameter_mappings: vec![mapping("tier", "var.tier"), mapping("name", "local.instance_name")],
            ..Default::default()
        };
        let (out, values) = t.replace_parameters_in_tf(SHOWN);
        assert!(out.contains("tier = var.tier"));
        assert!(out.contains("name = local.instance_name"));
        assert_eq!(values["tier"], "db-f1-micro");
        assert_eq!(values["instance_name"], "db");
    }
}
