//! Service offerings as declared in a brokerpak's definition YAML files.
//!
//! A [`ServiceDefinition`] carries the offering metadata, its plans, and one
//! [`ActionDefinition`] each for provision and bind. The action holds the HCL
//! template rendered for that verb and the variables that feed it; the
//! `*_variables` methods resolve those variables for one request in the fixed
//! layering order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::validation::{self as check, FieldErrors};
use super::variables::{
    validate_variables, BrokerVariable, DefaultVariable, ImportVariable, VarContextBuilder,
};
use crate::workspace::{parse, ModuleDefinition, ParameterMapping, TfTransformer};

/// Input that marks a provision as adopting existing resources.
pub const SUBSUME: &str = "subsume";

fn default_version() -> i32 {
    1
}

// ─── Offering ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default = "default_version")]
    pub version: i32,
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub documentation_url: String,
    #[serde(default)]
    pub support_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub plans: Vec<ServicePlan>,
    #[serde(rename = "provision", default)]
    pub provision: ActionDefinition,
    #[serde(rename = "bind", default)]
    pub bind: ActionDefinition,
    #[serde(default)]
    pub examples: Vec<ServiceExample>,
    /// Names of other offerings this one depends on; informational.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// A plan, either from the definition YAML or from a user plan override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub free: bool,
    /// Plan-level values fed to `plan_inputs`.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provision_overrides: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub bind_overrides: Map<String, Value>,
    /// Set at registration from the pak's default tool version.
    #[serde(skip)]
    pub maintenance_info: Option<MaintenanceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// The variables and template for one OSBAPI verb.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(default)]
    pub plan_inputs: Vec<BrokerVariable>,
    #[serde(default)]
    pub user_inputs: Vec<BrokerVariable>,
    #[serde(rename = "computed_inputs", default)]
    pub computed: Vec<DefaultVariable>,
    #[serde(default)]
    pub template: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_ref: String,
    #[serde(default)]
    pub outputs: Vec<BrokerVariable>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_refs: BTreeMap<String, String>,
    #[serde(rename = "import_inputs", default, skip_serializing_if = "Vec::is_empty")]
    pub import_inputs: Vec<ImportVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_parameter_mappings: Vec<ParameterMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_parameters_to_delete: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_parameters_to_add: Vec<ParameterMapping>,
}

/// Canned parameters used for smoke tests and the `/examples` listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceExample {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub plan_id: String,
    #[serde(default)]
    pub provision_params: Map<String, Value>,
    #[serde(default)]
    pub bind_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
}

// ─── Validation ─────────────────────────────────────────────────────────────

impl ServiceDefinition {
    /// Parse one definition file's YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid service definition YAML")
    }

    pub fn validate(&self) -> FieldErrors {
        let mut errs = FieldErrors::new();
        if self.version != 1 {
            errs.invalid(self.version, "version");
        }
        if self.name.trim().is_empty() {
            errs.missing("name");
        } else if !check::is_osb_name(&self.name) {
            errs.invalid(&self.name, "name");
        }
        if !check::is_uuid(&self.id) {
            errs.invalid(&self.id, "id");
        }
        if self.description.trim().is_empty() {
            errs.missing("description");
        }
        if self.display_name.trim().is_empty() {
            errs.missing("display_name");
        }
        for (value, path) in [
            (&self.image_url, "image_url"),
            (&self.documentation_url, "documentation_url"),
            (&self.support_url, "support_url"),
        ] {
            if !value.is_empty() && !check::is_url(value) {
                errs.invalid(value, path);
            }
        }

        let mut names = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for (i, plan) in self.plans.iter().enumerate() {
            let mut plan_errs = plan.validate();
            if !names.insert(plan.name.as_str()) {
                plan_errs.duplicate(&plan.name, "Name");
            }
            if !ids.insert(plan.id.as_str()) {
                plan_errs.duplicate(&plan.id, "ID");
            }
            errs.extend_under(&format!("plans[{i}]"), plan_errs);
        }

        errs.extend_under("provision", self.provision.validate());
        errs.extend_under("bind", self.bind.validate());

        for (i, example) in self.examples.iter().enumerate() {
            let mut ex = FieldErrors::new();
            if example.name.trim().is_empty() {
                ex.missing("name");
            }
            if !check::is_uuid(&example.plan_id) {
                ex.invalid(&example.plan_id, "plan_id");
            }
            errs.extend_under(&format!("examples[{i}]"), ex);
        }
        errs
    }

    /// Inline every `template_ref`/`template_refs` file, relative to `dir`.
    pub fn load_templates(&mut self, dir: &Path) -> Result<()> {
        self.provision.load_templates(dir)?;
        self.bind.load_templates(dir)
    }

    pub fn plan_variables(&self) -> Vec<BrokerVariable> {
        self.provision
            .plan_inputs
            .iter()
            .chain(&self.bind.plan_inputs)
            .cloned()
            .collect()
    }

    /// Outputs returned as binding credentials: instance outputs then bind outputs.
    pub fn bind_output_variables(&self) -> Vec<BrokerVariable> {
        self.provision.outputs.iter().chain(&self.bind.outputs).cloned().collect()
    }

    /// Whether a plan adopts existing resources rather than creating them.
    pub fn is_subsume_plan(plan: &ServicePlan) -> bool {
        plan.properties.get(SUBSUME).and_then(Value::as_bool).unwrap_or(false)
    }
}

impl ServicePlan {
    fn validate(&self) -> FieldErrors {
        let mut errs = FieldErrors::new();
        if self.name.trim().is_empty() {
            errs.missing("name");
        }
        if !check::is_uuid(&self.id) {
            errs.invalid(&self.id, "id");
        }
        if self.description.trim().is_empty() {
            errs.missing("description");
        }
        if self.display_name.trim().is_empty() {
            errs.missing("display_name");
        }
        errs
    }

    /// Build a plan from one user override object. `id` and `name` are
    /// required; every other non-standard key becomes a plan property.
    pub fn from_user_json(obj: &Map<String, Value>) -> Result<Self> {
        let text = |k: &str| obj.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let mut properties = Map::new();
        for (k, v) in obj {
            if !matches!(k.as_str(), "id" | "name" | "description" | "display_name" | "bullets" | "free") {
                properties.insert(k.clone(), v.clone());
            }
        }
        let mut id = text("id");
        if id.is_empty() {
            id = text("guid");
        }
        let plan = ServicePlan {
            name: text("name"),
            id,
            description: text("description"),
            display_name: text("display_name"),
            bullets: obj
                .get("bullets")
                .and_then(|b| serde_json::from_value(b.clone()).ok())
                .unwrap_or_default(),
            free: obj.get("free").and_then(Value::as_bool).unwrap_or(false),
            properties,
            ..Default::default()
        };
        Ok(plan)
    }
}

impl ActionDefinition {
    pub fn validate(&self) -> FieldErrors {
        let mut errs = FieldErrors::new();
        validate_list(&mut errs, "plan_inputs", &self.plan_inputs);
        validate_list(&mut errs, "user_inputs", &self.user_inputs);
        validate_list(&mut errs, "outputs", &self.outputs);
        for (i, c) in self.computed.iter().enumerate() {
            if c.name.trim().is_empty() {
                errs.missing(format!("computed_inputs[{i}].name"));
            }
        }

        if !self.template_ref.is_empty() && self.template.trim().is_empty() {
            errs.missing("template not loaded from template ref");
        }
        if let Err(e) = parse::validate_hcl(&self.template) {
            errs.push(format!("invalid HCL: {e:#}"), "template");
            return errs;
        }
        for (name, body) in &self.templates {
            if let Err(e) = parse::validate_hcl(body) {
                errs.push(format!("invalid HCL: {e:#}"), format!("templates[{name}]"));
                return errs;
            }
        }

        self.validate_template_io(&mut errs);
        errs
    }

    fn validate_template_io(&self, errs: &mut FieldErrors) {
        let module = self.module();
        match module.inputs() {
            Ok(tf_inputs) => {
                let declared = self.declared_inputs();
                let missing: Vec<&str> = tf_inputs
                    .iter()
                    .map(String::as_str)
                    .filter(|i| !declared.contains(*i))
                    .collect();
                if !missing.is_empty() {
                    errs.push("fields used but not declared", format!("template.{}", missing.join(", template.")));
                }
            }
            Err(e) => errs.push(format!("{e:#}"), "template"),
        }

        match module.outputs() {
            Ok(tf_outputs) => {
                let declared: BTreeSet<&str> = self.outputs.iter().map(|o| o.field_name.as_str()).collect();
                let actual: BTreeSet<&str> = tf_outputs
                    .iter()
                    .map(String::as_str)
                    .filter(|o| *o != "status")
                    .collect();
                if declared != actual {
                    errs.push(
                        format!("template outputs {tf_outputs:?} must match declared outputs {declared:?}"),
                        "template",
                    );
                }
            }
            Err(e) => errs.push(format!("{e:#}"), "template"),
        }
    }

    /// Every variable name the action can supply to its template.
    pub fn declared_inputs(&self) -> BTreeSet<&str> {
        self.plan_inputs
            .iter()
            .chain(&self.user_inputs)
            .map(|v| v.field_name.as_str())
            .chain(self.computed.iter().map(|c| c.name.as_str()))
            .collect()
    }

    pub fn module(&self) -> ModuleDefinition {
        ModuleDefinition {
            name: crate::workspace::DEFAULT_MODULE_NAME.to_string(),
            definition: self.template.clone(),
            definitions: self.templates.clone(),
        }
    }

    pub fn load_templates(&mut self, dir: &Path) -> Result<()> {
        if !self.template_ref.is_empty() {
            let path = dir.join(&self.template_ref);
            tracing::debug!(template = %path.display(), "loading template");
            self.template = fs::read_to_string(&path)
                .with_context(|| format!("failed to read template {}", path.display()))?;
        }
        for (name, reference) in &self.template_refs {
            if reference.is_empty() {
                continue;
            }
            let path = dir.join(reference);
            let body = fs::read_to_string(&path)
                .with_context(|| format!("failed to read template {}", path.display()))?;
            self.templates.insert(name.clone(), body);
        }
        Ok(())
    }

    /// Drop the file references once their content has been inlined.
    pub fn clear_template_refs(&mut self) {
        self.template_ref.clear();
        self.template_refs.clear();
    }

    /// Whether resolved provision variables request adopting existing resources.
    pub fn is_tf_import(&self, vars: &Map<String, Value>) -> bool {
        self.plan_inputs.iter().any(|p| p.field_name == SUBSUME)
            && vars.get(SUBSUME).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn transformer(&self) -> TfTransformer {
        TfTransformer {
            parameter_mappings: self.import_parameter_mappings.clone(),
            parameters_to_remove: self.import_parameters_to_delete.clone(),
            parameters_to_add: self.import_parameters_to_add.clone(),
        }
    }

    fn input_defaults(&self) -> Vec<DefaultVariable> {
        self.user_inputs
            .iter()
            .map(|v| DefaultVariable {
                name: v.field_name.clone(),
                default: v.default.clone().unwrap_or(Value::Null),
                overwrite: false,
                var_type: v.var_type.clone(),
            })
            .collect()
    }
}

fn validate_list(errs: &mut FieldErrors, field: &str, vars: &[BrokerVariable]) {
    for (i, v) in vars.iter().enumerate() {
        if let Err(e) = v.validate() {
            let msg = e.to_string();
            match msg.rsplit_once(": ") {
                Some((m, p)) => errs.push(m, format!("{field}[{i}].{p}")),
                None => errs.push(msg, format!("{field}[{i}]")),
            }
        }
    }
}

// ─── Variable resolution ────────────────────────────────────────────────────

/// Inputs to provision and update variable resolution.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest<'a> {
    pub instance_id: &'a str,
    pub service_id: &'a str,
    pub plan: Option<&'a ServicePlan>,
    pub context: Value,
    pub originating_identity: Value,
    pub default_labels: BTreeMap<String, String>,
    /// Operator defaults, lowest precedence first (global then offering).
    pub operator_defaults: Vec<Map<String, Value>>,
    pub provision_params: Map<String, Value>,
    pub update_params: Map<String, Value>,
}

/// Inputs to bind variable resolution.
#[derive(Debug, Clone, Default)]
pub struct BindRequest<'a> {
    pub instance_id: &'a str,
    pub binding_id: &'a str,
    pub service_id: &'a str,
    pub plan: Option<&'a ServicePlan>,
    pub app_guid: String,
    pub context: Value,
    pub originating_identity: Value,
    pub instance_name: String,
    pub instance_outputs: Map<String, Value>,
    pub params: Map<String, Value>,
}

/// Name of the template variable that carries resource labels.
pub const LABELS: &str = "labels";

impl ServiceDefinition {
    pub fn provision_computed(&self) -> Vec<DefaultVariable> {
        let mut computed = self.provision.computed.clone();
        computed.push(DefaultVariable::computed("tf_id", "tf:${request.instance_id}:"));
        computed
    }

    /// Plan inputs are surfaced to bind templates through `request.plan_properties`.
    pub fn bind_computed(&self) -> Vec<DefaultVariable> {
        let mut computed: Vec<DefaultVariable> = self
            .bind
            .plan_inputs
            .iter()
            .map(|p| DefaultVariable {
                name: p.field_name.clone(),
                default: Value::String(format!("${{request.plan_properties[{:?}]}}", p.field_name)),
                overwrite: true,
                var_type: p.var_type.clone(),
            })
            .collect();
        computed.extend(self.bind.computed.iter().cloned());
        computed.push(DefaultVariable::computed(
            "tf_id",
            "tf:${request.instance_id}:${request.binding_id}",
        ));
        computed
    }

    /// Resolve the variables for a provision or update.
    ///
    /// Layers, lowest first: operator defaults, provision params, update
    /// params, plan provision overrides, input defaults, plan properties,
    /// computed inputs.
    pub fn provision_variables(
        &self,
        req: &ProvisionRequest<'_>,
        env: &BTreeMap<String, String>,
        config: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let labels: Map<String, Value> = req
            .default_labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let mut constants = Map::new();
        constants.insert("request.plan_id".into(), plan_id(req.plan));
        constants.insert("request.service_id".into(), Value::String(req.service_id.to_string()));
        constants.insert("request.instance_id".into(), Value::String(req.instance_id.to_string()));
        constants.insert("request.default_labels".into(), Value::Object(labels));
        constants.insert("request.context".into(), req.context.clone());
        constants.insert(
            "request.x_broker_api_originating_identity".into(),
            req.originating_identity.clone(),
        );

        let empty = Map::new();
        let plan = req.plan;
        let mut builder = VarContextBuilder::new(env, config).constants(constants);
        for defaults in &req.operator_defaults {
            builder = builder.merge_map(defaults);
        }
        let mut vars = builder
            .merge_map(&req.provision_params)
            .merge_map(&req.update_params)
            .merge_map(plan.map_or(&empty, |p| &p.provision_overrides))
            .merge_defaults(&self.provision.input_defaults())
            .merge_map(plan.map_or(&empty, |p| &p.properties))
            .merge_defaults(&self.provision_computed())
            .build()?;

        if self.provision.declared_inputs().contains(LABELS) {
            vars.insert(LABELS.into(), overlay_labels(&req.default_labels, vars.get(LABELS)));
        }

        validate_variables(&vars, &self.provision.user_inputs)?;
        Ok(vars)
    }

    /// Resolve the variables for a bind or unbind.
    ///
    /// Layers, lowest first: bind params, plan bind overrides, input defaults,
    /// computed inputs.
    pub fn bind_variables(
        &self,
        req: &BindRequest<'_>,
        env: &BTreeMap<String, String>,
        config: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut constants = Map::new();
        constants.insert(
            "request.x_broker_api_originating_identity".into(),
            req.originating_identity.clone(),
        );
        constants.insert("request.binding_id".into(), Value::String(req.binding_id.to_string()));
        constants.insert("request.instance_id".into(), Value::String(req.instance_id.to_string()));
        constants.insert("request.service_id".into(), Value::String(req.service_id.to_string()));
        constants.insert("request.plan_id".into(), plan_id(req.plan));
        constants.insert("request.app_guid".into(), Value::String(req.app_guid.clone()));
        constants.insert("request.context".into(), req.context.clone());
        constants.insert(
            "request.plan_properties".into(),
            Value::Object(req.plan.map(|p| p.properties.clone()).unwrap_or_default()),
        );
        constants.insert("instance.name".into(), Value::String(req.instance_name.clone()));
        constants.insert("instance.details".into(), Value::Object(req.instance_outputs.clone()));

        let empty = Map::new();
        let vars = VarContextBuilder::new(env, config)
            .constants(constants)
            .merge_map(&req.params)
            .merge_map(req.plan.map_or(&empty, |p| &p.bind_overrides))
            .merge_defaults(&self.bind.input_defaults())
            .merge_defaults(&self.bind_computed())
            .build()?;

        validate_variables(&vars, &self.bind.user_inputs)?;
        Ok(vars)
    }
}

fn plan_id(plan: Option<&ServicePlan>) -> Value {
    Value::String(plan.map(|p| p.id.clone()).unwrap_or_default())
}

/// Default labels are always present; user labels overlay them.
fn overlay_labels(defaults: &BTreeMap<String, String>, user: Option<&Value>) -> Value {
    let mut merged: Map<String, Value> = defaults
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if let Some(Value::Object(user)) = user {
        for (k, v) in user {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
version: 1
name: csb-test
id: 5c2c7c3e-3a53-4e47-9b6a-1a1f4a8b0c11
description: a test offering
display_name: Test
plans:
  - name: small
    id: 8b52a460-b246-11eb-a8f5-d349948e2480
    description: small plan
    display_name: Small
    properties:
      size: 1
provision:
  plan_inputs:
    - field_name: size
      type: integer
  user_inputs:
    - field_name: name
      type: string
      default: "inst-${request.instance_id}"
    - field_name: labels
      type: object
  computed_inputs:
    - name: region
      default: us-east-1
  template: |
    variable "size" { type = number }
    variable "name" { type = string }
    variable "region" { type = string }
    variable "labels" { type = map(string) }
    output "id" { value = "x" }
    output "status" { value = "ok" }
  outputs:
    - field_name: id
      type: string
bind:
  computed_inputs:
    - name: instance_id
      default: "${instance.details[\"id\"]}"
  template: |
    variable "instance_id" { type = string }
    variable "size" { type = number }
    output "username" { value = "u" }
  outputs:
    - field_name: username
      type: string
"#;

    fn definition() -> ServiceDefinition {
        ServiceDefinition::from_yaml(DEFINITION).unwrap()
    }

    #[test]
    fn valid_definition_passes() {
        let mut def = definition();
        def.bind.plan_inputs.push(BrokerVariable {
            field_name: "size".into(),
            var_type: "integer".into(),
            ..Default::default()
        });
        let errs = def.validate();
        assert!(errs.is_empty(), "{errs}");
    }

    #[test]
    fn undeclared_template_input_is_reported() {
        let errs = definition().validate();
        assert_eq!(
            errs.to_string(),
            "fields used but not declared: bind.template.size"
        );
    }

    #[test]
    fn output_mismatch_is_reported() {
        let mut def = definition();
        def.provision.outputs.clear();
        let msg = def.validate().to_string();
        assert!(msg.contains("template outputs [\"id\", \"status\"] must match declared outputs {}"), "{msg}");
    }

    #[test]
    fn duplicate_plan_ids_within_offering() {
        let mut def = definition();
        let mut copy = def.plans[0].clone();
        copy.name = "other".into();
        def.plans.push(copy);
        let msg = def.validate().to_string();
        assert!(msg.contains(
            "duplicated value, must be unique: 8b52a460-b246-11eb-a8f5-d349948e2480: plans[1].ID"
        ));
    }

    #[test]
    fn provision_layering() {
        let def = definition();
        let plan = def.plans[0].clone();
        let labels = BTreeMap::from([("pcf-instance-id".to_string(), "abc".to_string())]);
        let req = ProvisionRequest {
            instance_id: "abc",
            service_id: &def.id,
            plan: Some(&plan),
            default_labels: labels,
            provision_params: serde_json::json!({"size": 99, "labels": {"team": "x"}})
                .as_object()
                .cloned()
                .unwrap(),
            ..Default::default()
        };
        let vars = def
            .provision_variables(&req, &BTreeMap::new(), &Map::new())
            .unwrap();

        assert_eq!(vars["size"], 1, "plan properties win over user params");
        assert_eq!(vars["name"], "inst-abc");
        assert_eq!(vars["region"], "us-east-1");
        assert_eq!(vars["tf_id"], "tf:abc:");
        assert_eq!(vars["labels"], serde_json::json!({"pcf-instance-id": "abc", "team": "x"}));
    }

    #[test]
    fn bind_reads_instance_outputs() {
        let mut def = definition();
        def.bind.plan_inputs.push(BrokerVariable {
            field_name: "size".into(),
            var_type: "integer".into(),
            ..Default::default()
        });
        let plan = def.plans[0].clone();
        let req = BindRequest {
            instance_id: "abc",
            binding_id: "b1",
            service_id: &def.id,
            plan: Some(&plan),
            instance_outputs: serde_json::json!({"id": "res-1"}).as_object().cloned().unwrap(),
            ..Default::default()
        };
        let vars = def.bind_variables(&req, &BTreeMap::new(), &Map::new()).unwrap();
        assert_eq!(vars["instance_id"], "res-1");
        assert_eq!(vars["size"], 1);
        assert_eq!(vars["tf_id"], "tf:abc:b1");
    }

    #[test]
    fn subsume_detection() {
        let mut def = definition();
        let vars = serde_json::json!({"subsume": true}).as_object().cloned().unwrap();
        assert!(!def.provision.is_tf_import(&vars));
        def.provision.plan_inputs.push(BrokerVariable {
            field_name: SUBSUME.into(),
            var_type: "boolean".into(),
            ..Default::default()
        });
        assert!(def.provision.is_tf_import(&vars));

        let mut plan = def.plans[0].clone();
        assert!(!ServiceDefinition::is_subsume_plan(&plan));
        plan.properties.insert(SUBSUME.into(), Value::Bool(true));
        assert!(ServiceDefinition::is_subsume_plan(&plan));
    }

    #[test]
    fn user_plan_extras_become_properties() {
        let obj = serde_json::json!({"id": "p1", "name": "custom", "size": 4}).as_object().cloned().unwrap();
        let plan = ServicePlan::from_user_json(&obj).unwrap();
        assert_eq!(plan.id, "p1");
        assert_eq!(plan.properties["size"], 4);
        assert!(!plan.properties.contains_key("name"));
    }
}
