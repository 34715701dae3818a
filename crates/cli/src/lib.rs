// Library interface for fairdraw-cli
// Exposes the modules behind the `fairdraw` binary for testing and reuse

pub mod cli;
pub mod config;
pub mod store;

pub use config::AppConfig;
pub use store::SnapshotStore;
