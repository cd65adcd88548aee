//! # Vehicle interface
//! Coordination engine for a vehicle test rig: captures driving episodes for a
//! learner and flashes bounded torque-map updates to the vehicle controller.
//!
//! ## Layout
//! - **component_a:** capture and coordination side (pipelines, event register,
//!   HMI state machine, countdown, watchdog).
//! - **component_b:** actuation side (torque tables, capability traits, flash worker).
//! - **utils:** configuration and registries, counters and session recorder, table persistence.
//! - **advanced:** simulated vehicle backend.
//! - **session:** the orchestrator, `VehicleInterface`.

pub mod advanced;
pub mod component_a;
pub mod component_b;
pub mod error;
pub mod session;
pub mod utils;

pub use error::SessionError;
pub use session::VehicleInterface;
