//! ADDB Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures and the
//! record identifier vocabulary used by every ADDB component.

pub mod config;
pub mod error;
pub mod types;

pub use config::AddbConfig;
pub use error::{Error, Result};
pub use types::*;
