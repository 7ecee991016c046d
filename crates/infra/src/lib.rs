//! Infrastructure layer: job queue, storage adapters, config.

pub mod config;
pub mod jobs;
