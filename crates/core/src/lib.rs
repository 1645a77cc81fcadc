//! Shared data model for flowpilot: workflows and their steps, incidents,
//! recovery procedures and health metrics.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
