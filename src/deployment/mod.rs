//! Deployment orchestration: per-deployment locking, status bookkeeping,
//! version gating and the tofu command sequences behind each operation.

pub mod ids;
pub mod invoker;
pub mod manager;
pub mod provider;

pub use ids::{binding_deployment_id, instance_deployment_id};
pub use invoker::Invoker;
pub use manager::{DeploymentManager, LastOperation};
pub use provider::{TofuProvider, VersionCheck, VERSION_MISMATCH};
