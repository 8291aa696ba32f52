//! Lifecycle operations for one offering, run through the tofu invoker.
//!
//! Provision, update, deprovision and upgrade return as soon as the operation
//! has been recorded as started; the tool runs on a tracked background task
//! that holds the deployment lock and writes the terminal status. Bind and
//! unbind run the same way but the caller waits for the result.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tokio_util::task::TaskTracker;

use super::ids::{binding_deployment_id, instance_deployment_id};
use super::invoker::Invoker;
use super::manager::{DeploymentManager, LastOperation};
use crate::brokerpak::interpolation::{self, EvalContext};
use crate::brokerpak::{RegisteredService, ServiceDefinition, ServicePlan};
use crate::error::BrokerError;
use crate::executor::TfVersion;
use crate::storage::{operation_type, TerraformDeployment};
use crate::workspace::{parse, TfTransformer, Workspace};

/// Message for any version mismatch the request may not resolve by itself.
pub const VERSION_MISMATCH: &str =
    "operation attempted with newer version of Terraform than current state, upgrade the service before retrying operation";

/// Outcome of comparing a deployment's state version with the pak's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Current,
    NeedsUpgrade,
}

/// Runs the lifecycle of one registered offering.
#[derive(Clone)]
pub struct TofuProvider {
    service: RegisteredService,
    manager: Arc<DeploymentManager>,
    invoker: Invoker,
    tasks: TaskTracker,
}

impl TofuProvider {
    pub fn new(service: RegisteredService, manager: Arc<DeploymentManager>, invoker: Invoker, tasks: TaskTracker) -> Self {
        Self {
            service,
            manager,
            invoker,
            tasks,
        }
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.service.definition
    }

    fn default_version(&self) -> TfVersion {
        self.invoker.binaries().default_version.clone()
    }

    // ─── Provision ──────────────────────────────────────────────────────────

    /// Start provisioning. Returns the operation id.
    ///
    /// A vacant instance records success without running the tool, leaving an
    /// empty workspace for state to be imported into.
    pub fn provision(&self, vars: Map<String, Value>, vacant: bool) -> Result<String> {
        let tf_id = tf_id_of(&vars)?;
        let guard = self.manager.acquire(&tf_id)?;

        if self.definition().provision.is_tf_import(&vars) {
            return self.import_create(tf_id, vars, guard);
        }

        let action = &self.definition().provision;
        let workspace = Workspace::new(&vars, &action.template, &action.templates, TfTransformer::default())
            .context("error creating workspace")?;
        let mut deployment = self
            .manager
            .create_and_save_deployment(&tf_id, workspace)
            .context("tofu provider create failed")?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::PROVISION)
            .context("error marking job started")?;

        if vacant {
            tracing::info!(deployment = %tf_id, "vacant instance, skipping apply");
            self.manager.mark_operation_finished(&mut deployment, &Ok(()))?;
            return Ok(tf_id);
        }

        let this = self.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let version = this.default_version();
            let outcome = this.invoker.apply(&version, &mut deployment.workspace).await;
            this.finish(&mut deployment, outcome);
        });
        Ok(tf_id)
    }

    /// Adopt existing resources: import them, render HCL from the imported
    /// state, and apply only if the plan destroys nothing.
    fn import_create(&self, tf_id: String, vars: Map<String, Value>, guard: OwnedMutexGuard<()>) -> Result<String> {
        let action = &self.definition().provision;

        let resources: Vec<(String, String)> = action
            .import_inputs
            .iter()
            .filter_map(|input| match vars.get(&input.name) {
                None | Some(Value::Null) => None,
                Some(v) => Some((input.tf_resource.clone(), interpolation::to_display(v))),
            })
            .collect();
        if resources.len() != action.import_inputs.len() {
            let names: Vec<&str> = action.import_inputs.iter().map(|i| i.name.as_str()).collect();
            return Err(BrokerError::Validation(format!(
                "must provide values for all import parameters: {}",
                names.join(", ")
            ))
            .into());
        }

        let workspace = Workspace::new(&vars, "", &action.templates, action.transformer())?;
        let mut deployment = self.manager.create_and_save_deployment(&tf_id, workspace)?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::PROVISION)?;

        let this = self.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let outcome = this.run_import(&mut deployment.workspace, &resources).await;
            this.finish(&mut deployment, outcome);
        });
        Ok(tf_id)
    }

    async fn run_import(&self, ws: &mut Workspace, resources: &[(String, String)]) -> Result<()> {
        let version = self.default_version();
        self.invoker.import(&version, ws, resources).await?;
        let shown = self.invoker.show(&version, ws).await?;

        let t = &ws.transformer;
        let (main_tf, captured) = t.replace_parameters_in_tf(&t.add_parameters_in_tf(&t.clean_tf(&shown)));
        let Some(instance) = ws.instances.first_mut() else {
            bail!("workspace has no instances");
        };
        for (name, value) in captured {
            instance.configuration.insert(name, Value::String(value));
        }
        let Some(module) = ws.modules.first_mut() else {
            bail!("workspace has no modules");
        };
        module.definitions.insert("main".to_string(), main_tf);
        tracing::debug!(workspace = %ws.describe(), "rendered imported workspace");

        self.plan_without_destroy(&version, ws, "subsume").await?;
        self.invoker.apply(&version, ws).await
    }

    // ─── Update ─────────────────────────────────────────────────────────────

    pub fn update(&self, vars: Map<String, Value>) -> Result<String> {
        if self.definition().provision.is_tf_import(&vars) {
            return Err(BrokerError::Validation("cannot update to subsume plan".to_string()).into());
        }
        let tf_id = tf_id_of(&vars)?;
        let guard = self.manager.acquire(&tf_id)?;

        self.check_version(&self.manager.get(&tf_id)?.workspace, false)?;
        self.manager
            .update_workspace_hcl(&tf_id, &self.definition().provision, &vars)?;
        let mut deployment = self.manager.get(&tf_id)?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::UPDATE)?;

        let this = self.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let version = this.default_version();
            let ws = &mut deployment.workspace;
            let outcome = async {
                ws.update_instance_configuration(&vars)?;
                this.plan_without_destroy(&version, ws, "update").await?;
                this.invoker.apply(&version, ws).await
            }
            .await;
            this.finish(&mut deployment, outcome);
        });
        Ok(tf_id)
    }

    // ─── Deprovision ────────────────────────────────────────────────────────

    /// Start destroying an instance. The deployment row is kept afterwards.
    pub fn deprovision(&self, instance_id: &str, vars: Map<String, Value>) -> Result<String> {
        let tf_id = instance_deployment_id(instance_id);
        let guard = self.manager.acquire(&tf_id)?;

        let mut deployment = self.manager.get(&tf_id)?;
        let check = self.check_version(&deployment.workspace, self.manager.flags().tf_upgrades)?;
        restrict_to_inputs(&mut deployment.workspace, &vars)?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::DEPROVISION)?;

        let this = self.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let outcome = this.upgrade_then_destroy(&mut deployment, check).await;
            this.finish(&mut deployment, outcome);
        });
        Ok(tf_id)
    }

    async fn upgrade_then_destroy(&self, deployment: &mut TerraformDeployment, check: VersionCheck) -> Result<()> {
        if check == VersionCheck::NeedsUpgrade {
            self.upgrade_chain(deployment).await?;
        }
        let version = self.default_version();
        self.invoker.destroy(&version, &mut deployment.workspace).await
    }

    // ─── Bind / Unbind ──────────────────────────────────────────────────────

    /// Create a binding and return its outputs.
    pub async fn bind(&self, vars: Map<String, Value>) -> Result<Map<String, Value>> {
        let tf_id = tf_id_of(&vars)?;
        let guard = self.manager.acquire(&tf_id)?;

        let action = &self.definition().bind;
        let workspace = Workspace::new(&vars, &action.template, &action.templates, TfTransformer::default())
            .context("error creating workspace")?;
        let mut deployment = self.manager.create_and_save_deployment(&tf_id, workspace)?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::BIND)?;

        let this = self.clone();
        let deployment = self
            .tasks
            .spawn(async move {
                let _guard = guard;
                let version = this.default_version();
                let outcome = this.invoker.apply(&version, &mut deployment.workspace).await;
                let failure = outcome.as_ref().err().map(|e| format!("{e:#}"));
                this.finish(&mut deployment, outcome);
                (deployment, failure)
            })
            .await
            .context("bind task panicked")?;

        match deployment {
            (_, Some(err)) => Err(BrokerError::ExternalTool(err).into()),
            (d, None) => d.workspace.outputs(),
        }
    }

    /// Destroy a binding and remove its deployment.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str, vars: Map<String, Value>) -> Result<()> {
        let tf_id = binding_deployment_id(instance_id, binding_id);
        let guard = self.manager.acquire(&tf_id)?;

        let check = self.check_version(&self.manager.get(&tf_id)?.workspace, self.manager.flags().tf_upgrades)?;
        self.manager
            .update_workspace_hcl(&tf_id, &self.definition().bind, &vars)?;
        let mut deployment = self.manager.get(&tf_id)?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::UNBIND)?;

        let this = self.clone();
        let failure = self
            .tasks
            .spawn(async move {
                let _guard = guard;
                let outcome = this.upgrade_then_destroy(&mut deployment, check).await;
                let failure = outcome.as_ref().err().map(|e| format!("{e:#}"));
                this.finish(&mut deployment, outcome);
                failure
            })
            .await
            .context("unbind task panicked")?;

        if let Some(err) = failure {
            return Err(BrokerError::ExternalTool(err).into());
        }
        self.manager.delete(&tf_id)
    }

    // ─── Upgrade ────────────────────────────────────────────────────────────

    /// Walk an instance and then each of its bindings up the upgrade path.
    ///
    /// `binding_vars` holds the resolved bind variables of every binding, used
    /// to re-render their HCL when HCL refresh is enabled.
    pub fn upgrade(
        &self,
        instance_id: &str,
        instance_vars: Map<String, Value>,
        binding_vars: Vec<Map<String, Value>>,
    ) -> Result<String> {
        if !self.manager.flags().tf_upgrades {
            return Err(BrokerError::Validation("tofu upgrades are not enabled".to_string()).into());
        }
        let tf_id = instance_deployment_id(instance_id);
        let mut guards = vec![self.manager.acquire(&tf_id)?];
        let binding_ids = self.manager.binding_deployment_ids(instance_id)?;
        for id in &binding_ids {
            guards.push(self.manager.acquire(id)?);
        }
        self.check_version(&self.manager.get(&tf_id)?.workspace, true)?;

        // Rows are only rewritten once every lock is held.
        self.manager
            .update_workspace_hcl(&tf_id, &self.definition().provision, &instance_vars)?;
        for vars in &binding_vars {
            self.manager
                .update_workspace_hcl(&tf_id_of(vars)?, &self.definition().bind, vars)?;
        }

        let mut deployment = self.manager.get(&tf_id)?;
        let bindings = binding_ids
            .iter()
            .map(|id| self.manager.get(id))
            .collect::<Result<Vec<_>>>()?;
        self.manager
            .mark_operation_started(&mut deployment, operation_type::UPGRADE)?;

        let this = self.clone();
        self.tasks.spawn(async move {
            let _guards = guards;
            let outcome = this.upgrade_instance_and_bindings(&mut deployment, bindings).await;
            this.finish(&mut deployment, outcome);
        });
        Ok(tf_id)
    }

    async fn upgrade_instance_and_bindings(
        &self,
        instance: &mut TerraformDeployment,
        bindings: Vec<TerraformDeployment>,
    ) -> Result<()> {
        self.upgrade_chain(instance).await?;
        for mut binding in bindings {
            self.manager
                .mark_operation_started(&mut binding, operation_type::UPGRADE)?;
            let outcome = self.upgrade_chain(&mut binding).await;
            let failure = outcome.as_ref().err().map(|e| format!("{e:#}"));
            self.finish(&mut binding, outcome);
            if let Some(err) = failure {
                bail!("binding {} upgrade failed: {err}", binding.id);
            }
        }
        Ok(())
    }

    /// Re-apply the deployment at each upgrade path version from its current
    /// state version up to the default, saving state after every step.
    async fn upgrade_chain(&self, deployment: &mut TerraformDeployment) -> Result<()> {
        let binaries = self.invoker.binaries();
        let Some(current) = deployment.workspace.state_version()? else {
            return Ok(());
        };
        if current > binaries.default_version {
            return Err(BrokerError::VersionGate(VERSION_MISMATCH.to_string()).into());
        }
        if current == binaries.default_version {
            return Ok(());
        }
        if binaries.upgrade_path.is_empty() {
            bail!("tofu version mismatch and no upgrade path specified");
        }

        for target in binaries.upgrade_path.iter().filter(|v| **v >= current) {
            tracing::info!(deployment = %deployment.id, from = %current, to = %target, "upgrading state");
            let outcome = self.invoker.apply(target, &mut deployment.workspace).await;
            self.manager.store(deployment)?;
            outcome.with_context(|| format!("upgrade to {target} failed"))?;
        }
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn poll_instance(&self, instance_id: &str) -> Result<LastOperation> {
        self.manager.operation_status(&instance_deployment_id(instance_id))
    }

    pub fn outputs(&self, instance_id: &str) -> Result<Map<String, Value>> {
        self.manager.instance_outputs(instance_id)
    }

    /// Compare a workspace's state version with the pak's default.
    ///
    /// Older state is accepted only when `allow_upgrade` is set; the caller
    /// then runs the upgrade chain before its terminal command.
    pub fn check_version(&self, ws: &Workspace, allow_upgrade: bool) -> Result<VersionCheck> {
        let Some(current) = ws.state_version()? else {
            return Ok(VersionCheck::Current);
        };
        let default = &self.invoker.binaries().default_version;
        match current.cmp(default) {
            std::cmp::Ordering::Equal => Ok(VersionCheck::Current),
            std::cmp::Ordering::Less if allow_upgrade => Ok(VersionCheck::NeedsUpgrade),
            _ => Err(BrokerError::VersionGate(VERSION_MISMATCH.to_string()).into()),
        }
    }

    /// Current values of inputs declared with `tf_attribute`, read from the
    /// instance's state. `context` is used to evaluate `tf_attribute_skip`.
    pub async fn get_imported_properties(
        &self,
        plan: &ServicePlan,
        instance_id: &str,
        context: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        if ServiceDefinition::is_subsume_plan(plan) {
            return Ok(Map::new());
        }

        let eval = EvalContext::new(context, &self.service.binaries.env, &self.service.pak_config);
        let mut fields = Vec::new();
        for input in &self.definition().provision.user_inputs {
            if input.tf_attribute.is_empty() {
                continue;
            }
            if !input.tf_attribute_skip.is_empty() && is_true(&interpolation::eval(&input.tf_attribute_skip, &eval)?) {
                continue;
            }
            fields.push((input.tf_attribute.clone(), input.field_name.clone()));
        }
        if fields.is_empty() {
            return Ok(Map::new());
        }

        let deployment = self.manager.get(&instance_deployment_id(instance_id))?;
        let mut ws = deployment.workspace;
        let shown = self.invoker.show(&self.default_version(), &mut ws).await?;
        parse::resource_attributes(&shown, &fields)
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    async fn plan_without_destroy(&self, version: &TfVersion, ws: &mut Workspace, what: &str) -> Result<()> {
        let plan = self.invoker.plan(version, ws).await?;
        if plan.to_destroy > 0 {
            tracing::warn!(to_destroy = plan.to_destroy, operation = what, "plan would destroy resources");
            bail!("tofu plan shows that resources would be destroyed - cancelling {what}");
        }
        Ok(())
    }

    fn finish(&self, deployment: &mut TerraformDeployment, outcome: Result<()>) {
        if let Err(err) = self.manager.mark_operation_finished(deployment, &outcome) {
            tracing::error!(deployment = %deployment.id, error = %err, "failed to record operation result");
        }
    }
}

fn tf_id_of(vars: &Map<String, Value>) -> Result<String> {
    match vars.get("tf_id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(BrokerError::Internal("missing tf_id variable".to_string()).into()),
    }
}

fn is_true(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Limit the instance configuration to the module's inputs, nulling missing ones.
fn restrict_to_inputs(ws: &mut Workspace, vars: &Map<String, Value>) -> Result<()> {
    let Some(module) = ws.modules.first() else {
        return Ok(());
    };
    let limited: Map<String, Value> = module
        .inputs()?
        .into_iter()
        .map(|name| {
            let v = vars.get(&name).cloned().unwrap_or(Value::Null);
            (name, v)
        })
        .collect();
    if let Some(instance) = ws.instances.first_mut() {
        instance.configuration = limited;
    }
    Ok(())
}
