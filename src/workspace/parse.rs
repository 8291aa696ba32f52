use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

/// Collect the labels of every top-level block of `kind` in an HCL document.
fn block_labels(content: &str, kind: &str) -> Result<Vec<String>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let body: hcl::Body = hcl::from_str(content).context("HCL parse error")?;

    let mut labels = Vec::new();
    for structure in body.iter() {
        if let hcl::Structure::Block(block) = structure {
            if block.identifier() == kind {
                labels.extend(block.labels().iter().map(|l| l.as_str().to_string()));
            }
        }
    }
    Ok(labels)
}

/// Names of the `variable` blocks declared in a module, sorted.
pub fn variable_names<'a>(sources: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
    collect_sorted(sources, "variable")
}

/// Names of the `output` blocks declared in a module, sorted.
pub fn output_names<'a>(sources: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
    collect_sorted(sources, "output")
}

fn collect_sorted<'a>(sources: impl IntoIterator<Item = &'a str>, kind: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for src in sources {
        names.extend(block_labels(src, kind)?);
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Check that a string is syntactically valid HCL.
pub fn validate_hcl(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Ok(());
    }
    let _: hcl::Body = hcl::from_str(content).context("HCL parse error")?;
    Ok(())
}

/// Read resource attributes out of `tofu show` output.
///
/// `fields` pairs a `<type>.<name>.<attribute>` address with the key the
/// value is returned under. Everything from the `Outputs:` section on is
/// ignored. Every requested field must be found.
pub fn resource_attributes(show_output: &str, fields: &[(String, String)]) -> Result<Map<String, Value>> {
    let resources = show_output.split("Outputs:").next().unwrap_or_default();
    let body: hcl::Body = hcl::from_str(resources).context("error parsing subsumed HCL file")?;

    let mut found = Map::new();
    for structure in body.iter() {
        let hcl::Structure::Block(block) = structure else {
            continue;
        };
        if block.identifier() != "resource" {
            continue;
        }
        let address = block
            .labels()
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(".");
        for (read, write) in fields {
            let Some((resource, attribute)) = read.rsplit_once('.') else {
                continue;
            };
            if resource != address {
                continue;
            }
            let value = block.body().attributes().find(|a| a.key() == attribute);
            if let Some(attr) = value {
                found.insert(write.clone(), expression_value(attr.expr()));
            }
        }
    }

    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, write)| !found.contains_key(write))
        .map(|(read, _)| read.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("cannot find required import values for fields: {}", missing.join(", "));
    }
    Ok(found)
}

fn expression_value(expr: &hcl::Expression) -> Value {
    match expr {
        hcl::Expression::String(s) => Value::String(s.clone()),
        other => match serde_json::to_value(other) {
            Ok(Value::String(s)) => Value::String(s.trim_matches('"').to_string()),
            Ok(v) => Value::String(v.to_string()),
            Err(_) => Value::Null,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = r#"
variable "region" { type = string }
variable "name" {
  type = string
}
output "hostname" { value = "h" }
resource "null_resource" "r" {}
"#;

    #[test]
    fn finds_inputs_and_outputs() {
        assert_eq!(variable_names([MODULE]).unwrap(), vec!["name", "region"]);
        assert_eq!(output_names([MODULE]).unwrap(), vec!["hostname"]);
    }

    #[test]
    fn merges_multiple_files() {
        let names = variable_names([MODULE, r#"variable "zone" {}"#, ""]).unwrap();
        assert_eq!(names, vec!["name", "region", "zone"]);
    }

    #[test]
    fn invalid_hcl_is_an_error() {
        assert!(variable_names(["variable {"]).is_err());
        assert!(validate_hcl("resource \"a\" {").is_err());
    }

    #[test]
    fn reads_attributes_from_show_output() {
        let show = r#"
# azurerm_mssql_database.db:
resource "azurerm_mssql_database" "db" {
    id        = "/subscriptions/1/db"
    name      = "orders"
    max_size_gb = 5
}

Outputs:

name = "orders"
"#;
        let fields = vec![
            ("azurerm_mssql_database.db.name".to_string(), "db_name".to_string()),
            ("azurerm_mssql_database.db.max_size_gb".to_string(), "size".to_string()),
        ];
        let values = resource_attributes(show, &fields).unwrap();
        assert_eq!(values["db_name"], "orders");
        assert_eq!(values["size"], "5");

        let err = resource_attributes(show, &[("a.b.c".to_string(), "c".to_string())]).unwrap_err();
        assert_eq!(err.to_string(), "cannot find required import values for fields: a.b.c");
    }
}
