//! Fault detection and recovery.
//!
//! - [`HealthMonitor`] samples named metrics on an interval and raises
//!   incidents for metrics that turn critical
//! - [`IncidentHandler`] classifies incidents, picks matching
//!   [`RecoveryProcedure`](flowpilot_core::RecoveryProcedure)s by historical
//!   success rate and records the full audit trail
//! - [`ProcedureRegistry`] holds the procedures and their running success rates

pub mod actions;
pub mod classifier;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod monitor;
pub mod procedures;
pub mod state_machine;

pub use actions::{CommandRecoveryActions, RecoveryActions, RecoveryCommands};
pub use classifier::{classify, infer_root_cause};
pub use config::{MetricThresholds, MonitorConfig};
pub use error::{IncidentError, Result};
pub use handler::IncidentHandler;
pub use metrics::MetricSource;
pub use monitor::{HealthMonitor, HealthSnapshot};
pub use procedures::{seed_procedures, ProcedureRegistry};
pub use state_machine::IncidentStateMachine;
