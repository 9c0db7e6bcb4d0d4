//! CoralFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! structures shared by the CoralFS metadata server components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{JournalConfig, JournalLayout};
pub use error::{Error, Result};
pub use types::*;
