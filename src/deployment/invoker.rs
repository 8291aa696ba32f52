use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::executor::output_parser::parse_plan_output;
use crate::executor::{CommandRunner, ExecutionOutput, Invocation, PlanSummary, TfBinariesContext, TfVersion, TofuCommand};
use crate::workspace::Workspace;

/// Runs command sequences against a workspace at a chosen tool version.
///
/// Each call materialises the workspace into a fresh scratch directory, runs
/// the commands in order, and reads the state back whether or not they
/// succeeded.
#[derive(Clone)]
pub struct Invoker {
    runner: Arc<dyn CommandRunner>,
    binaries: Arc<TfBinariesContext>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binaries: Arc<TfBinariesContext>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            binaries,
            cancel,
            timeout,
        }
    }

    pub fn binaries(&self) -> &TfBinariesContext {
        &self.binaries
    }

    pub async fn apply(&self, version: &TfVersion, ws: &mut Workspace) -> Result<()> {
        let mut cmds = self.prelude(ws);
        cmds.push(TofuCommand::Validate);
        cmds.push(TofuCommand::Apply);
        self.execute(version, ws, cmds).await.map(drop)
    }

    pub async fn destroy(&self, version: &TfVersion, ws: &mut Workspace) -> Result<()> {
        let mut cmds = self.prelude(ws);
        cmds.push(TofuCommand::Destroy);
        self.execute(version, ws, cmds).await.map(drop)
    }

    pub async fn plan(&self, version: &TfVersion, ws: &mut Workspace) -> Result<PlanSummary> {
        let mut cmds = self.prelude(ws);
        cmds.push(TofuCommand::Plan);
        let out = self.execute(version, ws, cmds).await?;
        Ok(parse_plan_output(&out.stdout_lines))
    }

    pub async fn show(&self, version: &TfVersion, ws: &mut Workspace) -> Result<String> {
        let mut cmds = self.prelude(ws);
        cmds.push(TofuCommand::Show);
        let out = self.execute(version, ws, cmds).await?;
        Ok(out.stdout())
    }

    /// Import each `(address, id)` pair into state.
    pub async fn import(&self, version: &TfVersion, ws: &mut Workspace, resources: &[(String, String)]) -> Result<()> {
        let mut cmds = vec![self.init()];
        cmds.extend(resources.iter().map(|(address, id)| TofuCommand::Import {
            address: address.clone(),
            id: id.clone(),
        }));
        self.execute(version, ws, cmds).await.map(drop)
    }

    fn init(&self) -> TofuCommand {
        let plugin_dir = self.binaries.plugin_dir();
        TofuCommand::Init {
            plugin_dir: plugin_dir.is_dir().then_some(plugin_dir),
        }
    }

    /// Provider rewrites (only meaningful once state exists), then init.
    fn prelude(&self, ws: &Workspace) -> Vec<TofuCommand> {
        let mut cmds = Vec::new();
        if ws.has_state() {
            cmds.extend(
                self.binaries
                    .provider_replacements
                    .iter()
                    .map(|(from, to)| TofuCommand::ReplaceProvider {
                        from: from.clone(),
                        to: to.clone(),
                    }),
            );
        }
        cmds.push(self.init());
        cmds
    }

    async fn execute(&self, version: &TfVersion, ws: &mut Workspace, cmds: Vec<TofuCommand>) -> Result<ExecutionOutput> {
        let scratch = tempfile::Builder::new()
            .prefix("tofu-workspace")
            .tempdir()
            .context("failed to create scratch directory")?;
        ws.materialise(scratch.path())?;

        let result = self.run_all(version, scratch.path(), cmds).await;
        ws.ingest(scratch.path())?;
        if result.is_ok() {
            ws.pinned_version = Some(version.clone());
        }
        result
    }

    async fn run_all(&self, version: &TfVersion, dir: &std::path::Path, cmds: Vec<TofuCommand>) -> Result<ExecutionOutput> {
        let mut last = ExecutionOutput::default();
        for command in cmds {
            let invocation = Invocation {
                binary: self.binaries.binary_path(version),
                dir: dir.to_path_buf(),
                command,
                env: self.binaries.env.clone(),
                timeout: self.timeout,
            };
            let out = self.runner.run(&invocation, &self.cancel).await?;
            if !out.success() {
                tracing::warn!(
                    command = invocation.command.name(),
                    exit_code = out.exit_code,
                    version = %version,
                    "tofu command failed"
                );
                return Err(BrokerError::ExternalTool(out.error_message()).into());
            }
            last = out;
        }
        Ok(last)
    }
}
