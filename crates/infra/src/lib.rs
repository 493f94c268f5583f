//! Infrastructure layer: job store adapters, queue engine, config.

pub mod config;
pub mod jobs;

mod integration_tests;
