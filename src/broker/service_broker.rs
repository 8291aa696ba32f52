use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::catalog::Catalog;
use super::decider::{decide_operation, Operation, UpdateRequest};
use super::models::{
    parse_parameters, BindDetails, BindingResponse, DeleteDetails, LastOperationResponse, MaintenanceInfoRef,
    OperationResponse, ProvisionDetails, UpdateDetails,
};
use crate::brokerpak::definition::{BindRequest, ProvisionRequest};
use crate::brokerpak::variables::{check_plan_defined, prohibited_updates, validate_request_parameters};
use crate::brokerpak::{ActionDefinition, RegisteredService, ServicePlan};
use crate::config::FeatureFlags;
use crate::deployment::{instance_deployment_id, DeploymentManager, Invoker, TofuProvider};
use crate::error::BrokerError;
use crate::executor::{CommandRunner, TfVersion};
use crate::storage::{
    operation_state, operation_type, BindRequestDetails, JsonObject, ServiceBindingCredentials,
    ServiceInstanceDetails, Storage,
};
use crate::workspace::tfstate::TfState;

/// Provision parameter that creates an instance without running the tool.
pub const VACANT: &str = "vacant";

const PROHIBITED_UPDATE: &str = "attempt to update parameter that may result in service instance re-creation and data loss";

/// OSBAPI operations over the catalog, the store and one provider per offering.
pub struct ServiceBroker {
    catalog: Catalog,
    providers: HashMap<String, TofuProvider>,
    manager: Arc<DeploymentManager>,
    global_labels: BTreeMap<String, String>,
}

impl ServiceBroker {
    pub fn new(
        catalog: Catalog,
        manager: Arc<DeploymentManager>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
        tasks: TaskTracker,
        global_labels: BTreeMap<String, String>,
    ) -> Self {
        let providers = catalog
            .services()
            .iter()
            .map(|svc| {
                let invoker = Invoker::new(runner.clone(), svc.binaries.clone(), cancel.clone(), None);
                let provider = TofuProvider::new(svc.clone(), manager.clone(), invoker, tasks.clone());
                (svc.definition.id.clone(), provider)
            })
            .collect();
        Self {
            catalog,
            providers,
            manager,
            global_labels,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn storage(&self) -> &Storage {
        self.manager.storage()
    }

    fn flags(&self) -> FeatureFlags {
        self.manager.flags()
    }

    fn lookup(&self, service_id: &str) -> Result<(&RegisteredService, &TofuProvider), BrokerError> {
        let svc = self.catalog.service(service_id)?;
        let provider = self
            .providers
            .get(service_id)
            .ok_or_else(|| BrokerError::Internal(format!("no provider registered for service {service_id}")))?;
        Ok((svc, provider))
    }

    fn instance(&self, instance_id: &str) -> Result<ServiceInstanceDetails> {
        if !self
            .storage()
            .exists_service_instance_details(instance_id)
            .context("database error checking for existing instance")?
        {
            return Err(instance_gone().into());
        }
        self.storage().get_service_instance_details(instance_id)
    }

    // ─── Provision ──────────────────────────────────────────────────────────

    pub async fn provision(
        &self,
        instance_id: &str,
        details: ProvisionDetails,
        accepts_incomplete: bool,
        originating_identity: Value,
    ) -> Result<OperationResponse> {
        tracing::info!(instance = %instance_id, service = %details.service_id, plan = %details.plan_id, "provisioning");

        if self
            .storage()
            .exists_service_instance_details(instance_id)
            .context("database error checking for existing instance")?
        {
            return Err(BrokerError::Conflict("instance already exists".to_string()).into());
        }

        let (svc, provider) = self.lookup(&details.service_id)?;
        let plan = self.catalog.plan(svc, &details.plan_id)?;
        if !accepts_incomplete {
            return Err(BrokerError::async_required().into());
        }

        let mut params = parse_parameters(details.parameters.as_ref())?;
        let vacant = take_vacant(&mut params);
        self.validate_params(&params, &svc.definition.provision, plan, true)?;

        let labels = self.default_labels(instance_id, &details.organization_guid, &details.space_guid);
        let req = ProvisionRequest {
            instance_id,
            service_id: &details.service_id,
            plan: Some(plan),
            context: details.context.clone(),
            originating_identity,
            default_labels: labels,
            operator_defaults: operator_defaults(svc)?,
            provision_params: params.clone(),
            update_params: Map::new(),
        };
        let vars = svc
            .definition
            .provision_variables(&req, &svc.binaries.env, &svc.pak_config)?;

        let operation_id = provider.provision(vars, vacant)?;

        let instance = ServiceInstanceDetails {
            id: instance_id.to_string(),
            name: details
                .context
                .get("instance_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            service_id: details.service_id.clone(),
            plan_id: details.plan_id.clone(),
            space_id: details.space_guid.clone(),
            organization_id: details.organization_guid.clone(),
            outputs: JsonObject::new(),
            operation_type: operation_type::PROVISION.to_string(),
            operation_id: operation_id.clone(),
        };
        self.storage()
            .store_service_instance_details(&instance)
            .context("error saving instance details to database")?;
        self.storage()
            .store_provision_request_details(instance_id, &params)
            .context("error saving provision request details to database")?;

        Ok(OperationResponse {
            operation: operation_id,
        })
    }

    // ─── Update ─────────────────────────────────────────────────────────────

    pub async fn update(
        &self,
        instance_id: &str,
        details: UpdateDetails,
        accepts_incomplete: bool,
        originating_identity: Value,
    ) -> Result<OperationResponse> {
        tracing::info!(instance = %instance_id, service = %details.service_id, "updating");

        let mut instance = self.instance(instance_id)?;
        let (svc, provider) = self.lookup(&instance.service_id)?;
        let params = parse_parameters(details.parameters.as_ref())?;

        let plan_id = match details.plan_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => instance.plan_id.clone(),
        };
        let plan = self.catalog.plan(svc, &plan_id)?;
        if !accepts_incomplete {
            return Err(BrokerError::async_required().into());
        }

        let decision = UpdateRequest {
            has_params: !params.is_empty(),
            plan_id: plan_id.clone(),
            previous_plan_id: if details.previous_values.plan_id.is_empty() {
                instance.plan_id.clone()
            } else {
                details.previous_values.plan_id.clone()
            },
            maintenance_info: version_of(details.maintenance_info.as_ref()),
            previous_maintenance_info: version_of(details.previous_values.maintenance_info.as_ref()),
        };
        let service_mi = plan
            .maintenance_info
            .as_ref()
            .and_then(|mi| TfVersion::parse(&mi.version).ok());
        if decide_operation(service_mi.as_ref(), &decision)? == Operation::Upgrade {
            return self.upgrade(&mut instance, svc, provider, plan, originating_identity);
        }

        self.validate_params(&params, &svc.definition.provision, plan, false)?;
        let prohibited = prohibited_updates(&params, &svc.definition.provision.user_inputs);
        if !prohibited.is_empty() {
            tracing::warn!(instance = %instance_id, fields = ?prohibited, "refusing prohibited update");
            return Err(BrokerError::Validation(PROHIBITED_UPDATE.to_string()).into());
        }

        let previous = self
            .storage()
            .get_provision_request_details(instance_id)
            .with_context(|| format!("error retrieving provision request details for {instance_id:?}"))?;
        let instance_plan = self.catalog.plan(svc, &instance.plan_id)?;
        let skip_context = merge_json(&previous, &Map::new(), &params);
        let imported = provider
            .get_imported_properties(instance_plan, instance_id, &skip_context)
            .await
            .with_context(|| format!("error retrieving expected parameters for {instance_id:?}"))?;
        let merged = merge_json(&previous, &imported, &params);

        let labels = self.default_labels(instance_id, &instance.organization_id, &instance.space_id);
        let req = ProvisionRequest {
            instance_id,
            service_id: &instance.service_id,
            plan: Some(plan),
            context: details.context.clone(),
            originating_identity,
            default_labels: labels,
            operator_defaults: operator_defaults(svc)?,
            provision_params: merged.clone(),
            update_params: Map::new(),
        };
        let vars = svc
            .definition
            .provision_variables(&req, &svc.binaries.env, &svc.pak_config)?;

        let operation_id = provider.update(vars)?;

        instance.plan_id = plan_id;
        instance.operation_type = operation_type::UPDATE.to_string();
        instance.operation_id = operation_id.clone();
        self.storage().store_service_instance_details(&instance).context(
            "error saving instance details to database. WARNING: this instance cannot be deprovisioned through the platform",
        )?;
        self.storage()
            .store_provision_request_details(instance_id, &merged)
            .context("error saving provision request details to database")?;

        Ok(OperationResponse {
            operation: operation_id,
        })
    }

    fn upgrade(
        &self,
        instance: &mut ServiceInstanceDetails,
        svc: &RegisteredService,
        provider: &TofuProvider,
        plan: &ServicePlan,
        originating_identity: Value,
    ) -> Result<OperationResponse> {
        tracing::info!(instance = %instance.id, "upgrading");

        let params = self
            .storage()
            .get_provision_request_details(&instance.id)
            .with_context(|| format!("error retrieving provision request details for {:?}", instance.id))?;
        let req = ProvisionRequest {
            instance_id: &instance.id,
            service_id: &instance.service_id,
            plan: Some(plan),
            context: Value::Null,
            originating_identity: originating_identity.clone(),
            default_labels: self.default_labels(&instance.id, &instance.organization_id, &instance.space_id),
            operator_defaults: operator_defaults(svc)?,
            provision_params: params,
            update_params: Map::new(),
        };
        let instance_vars = svc
            .definition
            .provision_variables(&req, &svc.binaries.env, &svc.pak_config)?;

        let mut binding_vars = Vec::new();
        for binding_id in self.storage().get_service_binding_ids_for_service_instance(&instance.id)? {
            let bind_params = self.storage().get_bind_request_details(&binding_id, &instance.id)?;
            let extras = BindExtras {
                originating_identity: originating_identity.clone(),
                ..Default::default()
            };
            binding_vars.push(self.bind_vars(svc, instance, &binding_id, plan, extras, bind_params)?);
        }

        let operation_id = provider.upgrade(&instance.id, instance_vars, binding_vars)?;
        instance.operation_type = operation_type::UPGRADE.to_string();
        instance.operation_id = operation_id.clone();
        self.storage().store_service_instance_details(instance)?;
        Ok(OperationResponse {
            operation: operation_id,
        })
    }

    // ─── Deprovision ────────────────────────────────────────────────────────

    pub async fn deprovision(
        &self,
        instance_id: &str,
        details: DeleteDetails,
        accepts_incomplete: bool,
    ) -> Result<OperationResponse> {
        tracing::info!(instance = %instance_id, service = %details.service_id, "deprovisioning");

        if !accepts_incomplete {
            return Err(BrokerError::async_required().into());
        }
        let mut instance = self.instance(instance_id)?;
        let (svc, provider) = self.lookup(&instance.service_id)?;
        let plan = self.catalog.plan(svc, &instance.plan_id)?;

        let params = self
            .storage()
            .get_provision_request_details(instance_id)
            .with_context(|| format!("error retrieving provision request details for {instance_id:?}"))?;
        let req = ProvisionRequest {
            instance_id,
            service_id: &instance.service_id,
            plan: Some(plan),
            context: Value::Null,
            originating_identity: Value::Null,
            default_labels: self.default_labels(instance_id, &instance.organization_id, &instance.space_id),
            operator_defaults: operator_defaults(svc)?,
            provision_params: params,
            update_params: Map::new(),
        };
        let vars = svc
            .definition
            .provision_variables(&req, &svc.binaries.env, &svc.pak_config)?;

        let operation_id = provider.deprovision(instance_id, vars)?;

        instance.operation_type = operation_type::DEPROVISION.to_string();
        instance.operation_id = operation_id.clone();
        self.storage()
            .store_service_instance_details(&instance)
            .context("error saving instance details to database")?;
        Ok(OperationResponse {
            operation: operation_id,
        })
    }

    // ─── Last operation ─────────────────────────────────────────────────────

    /// Poll an instance operation; on success of a deprovision the instance
    /// records are removed, otherwise its outputs are refreshed.
    pub fn last_operation(&self, instance_id: &str) -> Result<LastOperationResponse> {
        let mut instance = self.instance(instance_id)?;
        let (_, provider) = self.lookup(&instance.service_id)?;

        let status = match provider.poll_instance(instance_id) {
            Ok(s) => s,
            Err(err) => {
                return Ok(LastOperationResponse {
                    state: operation_state::FAILED.to_string(),
                    description: format!("{err:#}"),
                })
            }
        };
        if !status.is_done() {
            return Ok(LastOperationResponse {
                state: operation_state::IN_PROGRESS.to_string(),
                description: status.description,
            });
        }
        if status.is_failed() {
            return Ok(LastOperationResponse {
                state: operation_state::FAILED.to_string(),
                description: status.description,
            });
        }

        if instance.operation_type == operation_type::DEPROVISION {
            tracing::info!(instance = %instance_id, "deprovision complete, removing instance records");
            self.storage().delete_service_instance_details(instance_id)?;
            self.storage().delete_provision_request_details(instance_id)?;
        } else {
            instance.outputs = provider.outputs(instance_id)?;
            instance.operation_type.clear();
            self.storage().store_service_instance_details(&instance)?;
        }

        Ok(LastOperationResponse {
            state: operation_state::SUCCEEDED.to_string(),
            description: status.description,
        })
    }

    // ─── Bind / Unbind ──────────────────────────────────────────────────────

    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: BindDetails,
        originating_identity: Value,
    ) -> Result<BindingResponse> {
        tracing::info!(instance = %instance_id, binding = %binding_id, "binding");

        if self
            .storage()
            .exists_service_binding_id(binding_id)
            .context("error checking for existing binding")?
        {
            return Err(BrokerError::Conflict("binding already exists".to_string()).into());
        }
        let instance = self.instance(instance_id)?;
        let (svc, provider) = self.lookup(&instance.service_id)?;
        let plan_id = if details.plan_id.is_empty() {
            instance.plan_id.clone()
        } else {
            details.plan_id.clone()
        };
        let plan = self.catalog.plan(svc, &plan_id)?;

        let params = parse_parameters(details.parameters.as_ref())?;
        if !self.flags().disable_request_property_validation {
            validate_request_parameters(&params, &svc.definition.bind.user_inputs, &[], &plan.bind_overrides)?;
        } else {
            check_plan_defined(&params, &plan.bind_overrides)?;
        }

        let vars = self.bind_vars(
            svc,
            &instance,
            binding_id,
            plan,
            BindExtras {
                app_guid: details.app_guid(),
                context: details.context.clone(),
                originating_identity,
            },
            params.clone(),
        )?;

        let binding_outputs = provider.bind(vars).await?;

        self.storage()
            .create_service_binding_credentials(&ServiceBindingCredentials {
                service_id: instance.service_id.clone(),
                service_instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
                credentials: binding_outputs.clone(),
            })
            .context("error saving credentials to database")?;
        self.storage()
            .store_bind_request_details(&BindRequestDetails {
                service_instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
                request_details: params,
            })
            .context("error saving bind request details to database")?;

        let mut credentials = instance.outputs.clone();
        credentials.extend(binding_outputs);
        Ok(BindingResponse { credentials })
    }

    pub async fn unbind(&self, instance_id: &str, binding_id: &str, details: DeleteDetails) -> Result<()> {
        tracing::info!(instance = %instance_id, binding = %binding_id, service = %details.service_id, "unbinding");

        if !self
            .storage()
            .exists_service_binding_credentials(binding_id, instance_id)
            .context("error checking for existing binding")?
        {
            return Err(BrokerError::Gone("binding does not exist".to_string()).into());
        }
        let instance = self.instance(instance_id)?;
        let (svc, provider) = self.lookup(&instance.service_id)?;
        let plan = self.catalog.plan(svc, &instance.plan_id)?;

        let params = self
            .storage()
            .get_bind_request_details(binding_id, instance_id)
            .context("error retrieving bind request details")?;
        let vars = self.bind_vars(svc, &instance, binding_id, plan, BindExtras::default(), params)?;

        provider.unbind(instance_id, binding_id, vars).await?;

        self.storage()
            .delete_service_binding_credentials(binding_id, instance_id)
            .context("error deleting binding credentials")?;
        self.storage()
            .delete_bind_request_details(binding_id, instance_id)
            .context("error deleting binding request details")?;
        Ok(())
    }

    pub fn last_binding_operation(&self, _instance_id: &str, _binding_id: &str) -> Result<LastOperationResponse> {
        Err(BrokerError::async_required().into())
    }

    pub fn get_instance(&self, _instance_id: &str) -> Result<Value> {
        Err(BrokerError::Validation("the service_instances endpoint is unsupported".to_string()).into())
    }

    pub fn get_binding(&self, _instance_id: &str, _binding_id: &str) -> Result<Value> {
        Err(BrokerError::Validation("the service_bindings endpoint is unsupported".to_string()).into())
    }

    // ─── State import ───────────────────────────────────────────────────────

    /// Write raw tfstate into an instance's workspace, typically a vacant one.
    /// The next update applies it.
    pub fn import_state(&self, instance_id: &str, state: &[u8]) -> Result<()> {
        let tf_id = instance_deployment_id(instance_id);
        if !self.storage().exists_terraform_deployment(&tf_id)? {
            return Err(BrokerError::NotFound(format!("could not find TF ID: {tf_id}")).into());
        }
        TfState::parse(state).map_err(|e| BrokerError::Validation(format!("{e:#}")))?;

        let _guard = self.manager.try_lock(&tf_id)?;
        let mut deployment = self.manager.get(&tf_id)?;
        deployment.workspace.state = Some(state.to_vec());
        self.manager.store(&deployment)?;
        tracing::info!(deployment = %tf_id, bytes = state.len(), "imported state");
        Ok(())
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn bind_vars(
        &self,
        svc: &RegisteredService,
        instance: &ServiceInstanceDetails,
        binding_id: &str,
        plan: &ServicePlan,
        extras: BindExtras,
        params: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let req = BindRequest {
            instance_id: &instance.id,
            binding_id,
            service_id: &instance.service_id,
            plan: Some(plan),
            app_guid: extras.app_guid,
            context: extras.context,
            originating_identity: extras.originating_identity,
            instance_name: instance.name.clone(),
            instance_outputs: instance.outputs.clone(),
            params,
        };
        svc.definition.bind_variables(&req, &svc.binaries.env, &svc.pak_config)
    }

    /// Plan-fixed parameters are always refused; the rest are checked against
    /// the declared inputs unless request validation is disabled.
    fn validate_params(
        &self,
        params: &Map<String, Value>,
        action: &ActionDefinition,
        plan: &ServicePlan,
        with_imports: bool,
    ) -> Result<()> {
        let mut fixed = plan.provision_overrides.clone();
        fixed.extend(plan.properties.clone());
        if self.flags().disable_request_property_validation {
            return check_plan_defined(params, &fixed);
        }
        let imports = if with_imports { action.import_inputs.as_slice() } else { &[] };
        validate_request_parameters(params, &action.user_inputs, imports, &fixed)
    }

    /// Global labels plus the platform identifiers of the instance.
    fn default_labels(&self, instance_id: &str, org: &str, space: &str) -> BTreeMap<String, String> {
        let mut labels = self.global_labels.clone();
        labels.insert("pcf-organization-guid".into(), sanitize_label(org));
        labels.insert("pcf-space-guid".into(), sanitize_label(space));
        labels.insert("pcf-instance-id".into(), sanitize_label(instance_id));
        labels
    }
}

/// Request values only a live bind request carries.
#[derive(Debug, Default)]
struct BindExtras {
    app_guid: String,
    context: Value,
    originating_identity: Value,
}

fn instance_gone() -> BrokerError {
    BrokerError::Gone("instance does not exist".to_string())
}

fn version_of(mi: Option<&MaintenanceInfoRef>) -> Option<TfVersion> {
    mi.filter(|m| !m.version.is_empty())
        .and_then(|m| TfVersion::parse(&m.version).ok())
}

/// Remove the `vacant` flag from request parameters.
fn take_vacant(params: &mut Map<String, Value>) -> bool {
    match params.remove(VACANT) {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Label values: lower-case, with anything outside `[a-z0-9_-]` replaced by `_`.
fn sanitize_label(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Layer previous, imported and new parameters; a `null` removes the key.
pub fn merge_json(previous: &JsonObject, imported: &JsonObject, new: &JsonObject) -> JsonObject {
    let mut merged = JsonObject::new();
    for layer in [previous, imported, new] {
        for (k, v) in layer {
            if v.is_null() {
                merged.remove(k);
            } else {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    merged
}

/// Operator provision defaults: the global `provision.defaults` object, then
/// `service.<name>.provision.defaults`. Either may be an object or a JSON string.
fn operator_defaults(svc: &RegisteredService) -> Result<Vec<Map<String, Value>>> {
    let keys = [
        "provision.defaults".to_string(),
        format!("service.{}.provision.defaults", svc.definition.name),
    ];
    let mut out = Vec::new();
    for key in keys {
        match svc.pak_config.get(&key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(obj)) => out.push(obj.clone()),
            Some(Value::String(s)) if s.trim().is_empty() => {}
            Some(Value::String(s)) => {
                out.push(serde_json::from_str(s).with_context(|| format!("failed unmarshaling config value {key}"))?)
            }
            Some(_) => anyhow::bail!("config value {key} must be a JSON object"),
        }
    }
    Ok(out)
}
