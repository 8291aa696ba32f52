//! OSBAPI semantics: catalog assembly, update/upgrade classification and the
//! broker operations that tie requests to stored records and providers.

pub mod catalog;
pub mod decider;
pub mod models;
pub mod purge;
pub mod service_broker;

pub use catalog::Catalog;
pub use decider::{decide_operation, Operation};
pub use service_broker::ServiceBroker;
