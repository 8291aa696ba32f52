pub mod database;
pub mod migration;
pub mod models;
pub mod password_metadata;
pub mod records;
pub mod recovery;
pub mod schema;
pub mod store;

pub use database::Database;
pub use models::*;
pub use store::Storage;
