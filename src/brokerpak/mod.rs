//! Brokerpak packaging, loading and service definitions.
//!
//! A brokerpak is a zip archive holding `manifest.yml`, one YAML file per
//! offering under `definitions/`, and the pinned tool and provider binaries
//! under `bin/<os>/<arch>/`.

pub mod definition;
pub mod docs;
pub mod fetch;
pub mod interpolation;
pub mod manifest;
pub mod packer;
pub mod reader;
pub mod registrar;
pub mod validation;
pub mod variables;

pub use definition::{ActionDefinition, MaintenanceInfo, ServiceDefinition, ServiceExample, ServicePlan};
pub use manifest::Manifest;
pub use reader::BrokerpakReader;
pub use registrar::{RegisteredService, Registry};
pub use variables::BrokerVariable;
