pub mod config;
pub mod tickets;

pub use config::{AppConfig, SyncConfig};
