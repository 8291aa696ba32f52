pub mod broker;
pub mod brokerpak;
pub mod config;
pub mod deployment;
pub mod encryption;
pub mod error;
pub mod executor;
pub mod output;
pub mod server;
pub mod startup;
pub mod storage;
pub mod workspace;
