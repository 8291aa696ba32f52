use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::interpolation::{self, EvalContext};
use crate::error::BrokerError;

/// JSON schema type names accepted on inputs.
pub mod json_type {
    pub const STRING: &str = "string";
    pub const NUMBER: &str = "number";
    pub const INTEGER: &str = "integer";
    pub const BOOLEAN: &str = "boolean";
    pub const OBJECT: &str = "object";
    pub const ARRAY: &str = "array";

    pub const ALL: [&str; 6] = [STRING, NUMBER, INTEGER, BOOLEAN, OBJECT, ARRAY];
}

/// A user, plan or output variable declared by a service definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerVariable {
    pub field_name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enum_values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub constraints: Map<String, Value>,
    #[serde(default)]
    pub prohibit_update: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tf_attribute: String,
    /// Expression over the request variables; when it evaluates to true the
    /// `tf_attribute` lookup is skipped.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tf_attribute_skip: String,
}

impl BrokerVariable {
    pub fn validate(&self) -> Result<()> {
        if self.field_name.trim().is_empty() {
            bail!("missing field(s): field_name");
        }
        if !self.var_type.is_empty() && !json_type::ALL.contains(&self.var_type.as_str()) {
            bail!("invalid value: {}: type", self.var_type);
        }
        Ok(())
    }
}

/// A provision input naming an existing resource to adopt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportVariable {
    #[serde(rename = "field_name")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
    #[serde(default)]
    pub details: String,
    /// Address in the template, e.g. `azurerm_mssql_database.azure_sql_db`.
    pub tf_resource: String,
}

/// A value computed from the evaluation context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultVariable {
    pub name: String,
    pub default: Value,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(rename = "type", default)]
    pub var_type: String,
}

impl DefaultVariable {
    pub fn computed(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            default: Value::String(default.to_string()),
            overwrite: true,
            var_type: String::new(),
        }
    }
}

// ─── Context builder ────────────────────────────────────────────────────────

/// Layers variable sources in resolution order.
///
/// Constants are visible to template evaluation but never appear in the built
/// map, so users cannot override them.
pub struct VarContextBuilder<'a> {
    context: Map<String, Value>,
    constants: Map<String, Value>,
    env: &'a BTreeMap<String, String>,
    config: &'a Map<String, Value>,
    errors: Vec<String>,
}

impl<'a> VarContextBuilder<'a> {
    pub fn new(env: &'a BTreeMap<String, String>, config: &'a Map<String, Value>) -> Self {
        Self {
            context: Map::new(),
            constants: Map::new(),
            env,
            config,
            errors: Vec::new(),
        }
    }

    pub fn constants(mut self, constants: Map<String, Value>) -> Self {
        self.constants = constants;
        self
    }

    pub fn merge_map(mut self, data: &Map<String, Value>) -> Self {
        for (k, v) in data {
            self.context.insert(k.clone(), v.clone());
        }
        self
    }

    /// Merge defaults, evaluating string values as templates.
    pub fn merge_defaults(mut self, defaults: &[DefaultVariable]) -> Self {
        for v in defaults {
            if v.default.is_null() {
                continue;
            }
            if self.context.contains_key(&v.name) && !v.overwrite {
                continue;
            }
            match &v.default {
                Value::String(template) => self.merge_eval_result(&v.name, template, &v.var_type),
                other => {
                    self.context.insert(v.name.clone(), other.clone());
                }
            }
        }
        self
    }

    fn merge_eval_result(&mut self, key: &str, template: &str, result_type: &str) {
        let mut vars = self.context.clone();
        for (k, v) in &self.constants {
            vars.insert(k.clone(), v.clone());
        }
        let ctx = EvalContext::new(&vars, self.env, self.config);
        let result = match interpolation::eval(template, &ctx) {
            Ok(r) => r,
            Err(e) => {
                self.errors
                    .push(format!("couldn't compute the value for {key:?}, template: {template:?}, {e}"));
                return;
            }
        };
        match cast_to(result, result_type) {
            Ok(v) => {
                self.context.insert(key.to_string(), v);
            }
            Err(e) => self.errors.push(e.to_string()),
        }
    }

    pub fn build(self) -> Result<Map<String, Value>> {
        if !self.errors.is_empty() {
            bail!("{}", self.errors.join("; "));
        }
        Ok(self.context)
    }
}

/// Convert an evaluation result to a declared JSON type.
pub fn cast_to(value: Value, json_type: &str) -> Result<Value> {
    let as_str = interpolation::to_display(&value);
    let fail = || anyhow!("couldn't cast {as_str:?} to {json_type}");
    let parsed = || serde_json::from_str::<Value>(&as_str).ok();
    Ok(match json_type {
        "" => value,
        json_type::STRING => Value::String(as_str.clone()),
        json_type::BOOLEAN if value.is_boolean() => value,
        json_type::BOOLEAN => match as_str.as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" | "" => Value::Bool(false),
            _ => return Err(fail()),
        },
        json_type::NUMBER if value.is_number() => value,
        json_type::NUMBER => {
            let n: f64 = as_str.trim().parse().map_err(|_| fail())?;
            serde_json::Number::from_f64(n).map(Value::Number).ok_or_else(fail)?
        }
        json_type::INTEGER if value.is_i64() || value.is_u64() => value,
        json_type::INTEGER => {
            let n: f64 = as_str.trim().parse().map_err(|_| fail())?;
            Value::from(n as i64)
        }
        json_type::OBJECT if value.is_object() => value,
        json_type::OBJECT => parsed().filter(Value::is_object).ok_or_else(fail)?,
        json_type::ARRAY if value.is_array() => value,
        json_type::ARRAY => parsed().filter(Value::is_array).ok_or_else(fail)?,
        other => bail!("couldn't cast {as_str:?} to {other}, unknown type"),
    })
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Check a built context against declared inputs: required, type, enum, constraints.
pub fn validate_variables(context: &Map<String, Value>, vars: &[BrokerVariable]) -> Result<()> {
    let mut errors = Vec::new();
    for v in vars {
        let value = match context.get(&v.field_name) {
            None | Some(Value::Null) => {
                if v.required {
                    errors.push(format!("{}: field is required", v.field_name));
                }
                continue;
            }
            Some(value) => value,
        };
        if !matches_type(value, &v.var_type) {
            errors.push(format!("{}: invalid type, expected {}", v.field_name, v.var_type));
            continue;
        }
        if !v.enum_values.is_empty() && !v.enum_values.contains_key(&interpolation::to_display(value)) {
            let allowed: Vec<&str> = v.enum_values.keys().map(String::as_str).collect();
            errors.push(format!("{}: must be one of: {}", v.field_name, allowed.join(", ")));
        }
        if let Err(e) = check_constraints(&v.field_name, value, &v.constraints) {
            errors.push(e);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::Validation(errors.join("; ")).into())
    }
}

fn matches_type(value: &Value, json_type: &str) -> bool {
    match json_type {
        json_type::STRING => value.is_string(),
        json_type::NUMBER => value.is_number(),
        json_type::INTEGER => value.as_f64().is_some_and(|n| n.fract() == 0.0),
        json_type::BOOLEAN => value.is_boolean(),
        json_type::OBJECT => value.is_object(),
        json_type::ARRAY => value.is_array(),
        _ => true,
    }
}

fn check_constraints(name: &str, value: &Value, constraints: &Map<String, Value>) -> std::result::Result<(), String> {
    for (kind, limit) in constraints {
        let ok = match kind.as_str() {
            "maximum" => value.as_f64().zip(limit.as_f64()).map_or(true, |(v, l)| v <= l),
            "minimum" => value.as_f64().zip(limit.as_f64()).map_or(true, |(v, l)| v >= l),
            "maxLength" => value
                .as_str()
                .zip(limit.as_u64())
                .map_or(true, |(s, l)| s.chars().count() as u64 <= l),
            "minLength" => value
                .as_str()
                .zip(limit.as_u64())
                .map_or(true, |(s, l)| s.chars().count() as u64 >= l),
            "pattern" => match (value.as_str(), limit.as_str()) {
                (Some(s), Some(p)) => regex::Regex::new(p).map(|re| re.is_match(s)).unwrap_or(false),
                _ => true,
            },
            _ => true,
        };
        if !ok {
            return Err(format!("{name}: does not satisfy {kind} {limit}"));
        }
    }
    Ok(())
}

/// Reject request parameters that the plan fixes or that no input declares.
pub fn validate_request_parameters(
    params: &Map<String, Value>,
    user_inputs: &[BrokerVariable],
    import_inputs: &[ImportVariable],
    plan_properties: &Map<String, Value>,
) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    check_plan_defined(params, plan_properties)?;

    let valid: BTreeSet<&str> = user_inputs
        .iter()
        .map(|v| v.field_name.as_str())
        .chain(import_inputs.iter().map(|v| v.name.as_str()))
        .collect();
    let invalid: BTreeSet<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !valid.contains(k))
        .collect();
    if invalid.is_empty() {
        return Ok(());
    }
    let list: Vec<&str> = invalid.into_iter().collect();
    Err(BrokerError::Validation(format!("additional properties are not allowed: {}", list.join(", "))).into())
}

/// Reject request parameters that the plan already fixes.
pub fn check_plan_defined(params: &Map<String, Value>, plan_properties: &Map<String, Value>) -> Result<()> {
    let plan_defined: BTreeSet<&str> = params
        .keys()
        .filter(|k| plan_properties.contains_key(*k))
        .map(String::as_str)
        .collect();
    if plan_defined.is_empty() {
        return Ok(());
    }
    let list: Vec<&str> = plan_defined.into_iter().collect();
    Err(BrokerError::Validation(format!(
        "plan defined properties cannot be changed: {}",
        list.join(", ")
    ))
    .into())
}

/// Names of `prohibit_update` inputs present in an update request.
pub fn prohibited_updates<'v>(params: &Map<String, Value>, inputs: &'v [BrokerVariable]) -> Vec<&'v str> {
    inputs
        .iter()
        .filter(|v| v.prohibit_update && params.contains_key(&v.field_name))
        .map(|v| v.field_name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn resolution_order_and_constants() {
        let env = BTreeMap::new();
        let config = Map::new();
        let built = VarContextBuilder::new(&env, &config)
            .constants(obj(json!({"request.instance_id": "abc"})))
            .merge_map(&obj(json!({"name": "user"})))
            .merge_defaults(&[
                DefaultVariable {
                    name: "name".into(),
                    default: json!("default"),
                    overwrite: false,
                    var_type: "string".into(),
                },
                DefaultVariable {
                    name: "size".into(),
                    default: json!("${1+2}"),
                    overwrite: false,
                    var_type: "integer".into(),
                },
                DefaultVariable::computed("tf_id", "tf:${request.instance_id}:"),
            ])
            .build()
            .unwrap();
        assert_eq!(built["name"], "user");
        assert_eq!(built["size"], 3);
        assert_eq!(built["tf_id"], "tf:abc:");
        assert!(!built.contains_key("request.instance_id"));
    }

    #[test]
    fn eval_errors_are_collected() {
        let env = BTreeMap::new();
        let config = Map::new();
        let err = VarContextBuilder::new(&env, &config)
            .merge_defaults(&[DefaultVariable::computed("x", "${missing}")])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("couldn't compute the value for \"x\""));
    }

    #[test]
    fn request_parameter_checks() {
        let inputs = vec![BrokerVariable {
            field_name: "name".into(),
            var_type: "string".into(),
            ..Default::default()
        }];
        let plan = obj(json!({"tier": "small"}));

        let err = validate_request_parameters(&obj(json!({"tier": "big"})), &inputs, &[], &plan).unwrap_err();
        assert_eq!(err.to_string(), "plan defined properties cannot be changed: tier");

        let err = validate_request_parameters(&obj(json!({"b": 1, "a": 2})), &inputs, &[], &plan).unwrap_err();
        assert_eq!(err.to_string(), "additional properties are not allowed: a, b");

        validate_request_parameters(&obj(json!({"name": "x"})), &inputs, &[], &plan).unwrap();
    }

    #[test]
    fn variable_validation() {
        let vars = vec![
            BrokerVariable {
                field_name: "size".into(),
                var_type: "integer".into(),
                required: true,
                constraints: obj(json!({"maximum": 10})),
                ..Default::default()
            },
            BrokerVariable {
                field_name: "tier".into(),
                var_type: "string".into(),
                enum_values: BTreeMap::from([("small".into(), "Small".into())]),
                ..Default::default()
            },
        ];
        validate_variables(&obj(json!({"size": 3, "tier": "small"})), &vars).unwrap();
        assert!(validate_variables(&obj(json!({})), &vars).is_err());
        assert!(validate_variables(&obj(json!({"size": 30})), &vars).is_err());
        assert!(validate_variables(&obj(json!({"size": 3, "tier": "huge"})), &vars).is_err());
    }

    #[test]
    fn casts() {
        assert_eq!(cast_to(json!("true"), "boolean").unwrap(), json!(true));
        assert_eq!(cast_to(json!("[1,2]"), "array").unwrap(), json!([1, 2]));
        assert_eq!(cast_to(json!(5), "string").unwrap(), json!("5"));
        assert!(cast_to(json!("x"), "number").is_err());
    }
}
