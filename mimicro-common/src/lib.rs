//! Mimicro Common - Configuration model and statistics records shared by the Mimicro server

pub mod config;
pub mod statistics;

pub use config::*;
pub use statistics::*;
