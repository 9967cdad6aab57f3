//! Live run notifications.
//!
//! [`RunEventBus`] fans stage-update and run-complete events out to every
//! viewer subscribed to a given run.

pub mod bus;

pub use bus::{RunCompleteEvent, RunEvent, RunEventBus, RunSubscription, StageUpdateEvent};
