//! capability.rs
//! What a concrete vehicle backend has to provide.
//!
//! The orchestrator never sees a concrete backend type. It holds the session
//! behind these traits:
//! - `Producer`: owns the raw-sample and HMI pipelines and fills them.
//! - `Filter`: turns raw samples into observation frames.
//! - `Actuator`: commits a full torque table to the controller.

use crate::component_a::{
    events::EventFlag,
    pipeline::{DequePipeline, Pipeline},
};
use crate::component_b::torque_table::TorqueTable;
use crate::error::{FlashError, SessionError};
use crate::utils::metrics::SessionCounters;

pub trait Producer: Send + Sync {
    type Raw: Send;

    /// Raw-sample and HMI pipelines; their kind and capacity are the backend's choice.
    fn init_internal_pipelines(&self) -> (DequePipeline<Self::Raw>, Pipeline<String>);

    /// Runs until `exit` is observed. Pushes raw samples and HMI signal strings.
    fn produce(
        &self,
        raw: &DequePipeline<Self::Raw>,
        hmi: &Pipeline<String>,
        exit: &EventFlag,
    ) -> Result<(), SessionError>;
}

/// Flags and counters handed to the filter worker.
pub struct FilterContext<'a> {
    pub start: EventFlag,
    pub stop: EventFlag,
    pub interrupt: EventFlag,
    pub flash: EventFlag,
    pub exit: EventFlag,
    /// The filter is the only writer of `capture_failures`.
    pub counters: &'a SessionCounters,
}

pub trait Filter: Producer {
    type Observation: Send;

    /// Runs until `ctx.exit` is observed.
    fn filter(
        &self,
        raw: &DequePipeline<Self::Raw>,
        observe: &Pipeline<Self::Observation>,
        ctx: FilterContext<'_>,
    ) -> Result<(), SessionError>;
}

/// Handed to every flash. The actuator is the only writer of `flash_failures`
/// for faults the controller reports.
#[derive(Clone, Copy)]
pub struct ActuatorContext<'a> {
    pub counters: &'a SessionCounters,
}

pub trait Actuator: Send + Sync {
    /// Commit `table` to the vehicle controller.
    fn flash_vehicle(&self, table: &TorqueTable, ctx: ActuatorContext<'_>) -> Result<(), FlashError>;
}

/// A complete backend: producer, filter and actuator in one.
pub trait VehicleBackend: Filter + Actuator {}

impl<T: Filter + Actuator> VehicleBackend for T {}
