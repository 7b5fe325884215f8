pub mod config;
pub mod orchestrator;
pub mod sandbox;
