pub mod config;
pub mod database_ops;
pub mod normalization;
pub mod orchestrator;
pub mod tracing;

pub mod util {
    pub mod env;
}
