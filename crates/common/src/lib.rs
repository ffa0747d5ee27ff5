//! Shared types, configuration and infrastructure for the Beacon workspace.

pub mod config;
pub mod db;
pub mod error;
pub mod types;
