//! Infrastructure layer: job engine, SQLite persistence, engine configuration.

pub mod config;
pub mod jobs;
