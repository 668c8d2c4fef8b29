pub mod anthropic;
pub mod config;
pub mod cors;
pub mod error;
pub mod generation;
pub mod job;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod templates;
