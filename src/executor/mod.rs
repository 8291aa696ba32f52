//! Supervision of the external tofu binary.

pub mod binaries;
pub mod command;
pub mod output_parser;
pub mod runner;
pub mod version;

pub use binaries::TfBinariesContext;
pub use command::TofuCommand;
pub use output_parser::PlanSummary;
pub use runner::{CommandRunner, ExecutionOutput, Invocation, ProcessRunner};
pub use version::TfVersion;
