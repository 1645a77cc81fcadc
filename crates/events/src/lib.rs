//! Event system for flowpilot
//!
//! Every workflow, step and incident transition is published here as a
//! structured event. Publishing is fire-and-forget: it never blocks and never
//! fails the operation that produced the event.

mod bus;
mod types;

pub use bus::{EventBus, EventSink};
pub use types::*;
