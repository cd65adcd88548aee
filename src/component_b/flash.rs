//! flash.rs
//! Flash (consume) worker: bounded torque-table updates committed to the VCU.
//!
//! The worker owns the live table by value, so it is the only writer for the
//! whole session. Each delta is clipped into the safety envelope around the
//! default table before the actuator ever sees it. On the way out the live
//! table is persisted unconditionally, fatal fault or not.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::component_a::{
    events::{EventKind, SessionEvents},
    pipeline::Pipeline,
};
use crate::component_b::{
    capability::{Actuator, ActuatorContext},
    torque_table::{apply_delta, TableDelta, TorqueTable},
};
use crate::error::{FlashError, SessionError};
use crate::utils::{
    config::{Driver, Vehicle},
    export::persist_live_table,
    metrics::{SessionCounters, SessionEvent, SessionRecorder},
};

/// Who the session runs for and where its last table goes.
#[derive(Debug, Clone)]
pub struct FlashTarget {
    pub vehicle: Vehicle,
    pub driver: Driver,
    pub data_dir: PathBuf,
}

/// What the worker hands back after a clean exit.
#[derive(Debug, Clone)]
pub struct FlashReport {
    pub live: TorqueTable,
    pub saved: PathBuf,
    pub flashes: u64,
}

pub struct FlashLoop<'a, A: ?Sized> {
    actuator: &'a A,
    default: &'a TorqueTable,
    live: TorqueTable,
    target: FlashTarget,
    events: SessionEvents,
    counters: Arc<SessionCounters>,
    recorder: Option<SessionRecorder>,
    timeout: Duration,
    flashes: u64,
}

impl<'a, A: Actuator + ?Sized> FlashLoop<'a, A> {
    pub fn new(
        actuator: &'a A,
        default: &'a TorqueTable,
        live: TorqueTable,
        target: FlashTarget,
        events: SessionEvents,
        counters: Arc<SessionCounters>,
        timeout: Duration,
    ) -> Self {
        Self {
            actuator,
            default,
            live,
            target,
            events,
            counters,
            recorder: None,
            timeout,
            flashes: 0,
        }
    }

    pub fn with_recorder(mut self, recorder: Option<SessionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn live(&self) -> &TorqueTable {
        &self.live
    }

    pub fn run(mut self, flash: &Pipeline<TableDelta>) -> Result<FlashReport, SessionError> {
        info!("[Flash] flash worker start");
        let exit = self.events.exit();
        let mut fatal: Option<FlashError> = None;

        while !exit.is_set() {
            let snap = self
                .events
                .wait_until(|s| s.flash_ready() || s.is_set(EventKind::Exit), self.timeout);
            if snap.is_set(EventKind::Exit) {
                break;
            }
            if !snap.flash_ready() {
                continue;
            }

            let delta = match flash.get(self.timeout) {
                Ok(delta) => delta,
                Err(e) => {
                    debug!("[Flash] no delta: {}", e);
                    continue;
                }
            };
            if exit.is_set() {
                break;
            }

            if let Err(e) = self.step(&delta) {
                fatal = Some(e);
                break;
            }
        }

        let flash_flag = self.events.flash();
        if !flash_flag.is_set() {
            flash_flag.set();
        }
        let saved = persist_live_table(
            &self.live,
            &self.target.data_dir,
            &self.target.vehicle,
            &self.target.driver,
        );
        if saved.is_ok() {
            self.record(SessionEvent::TableSaved);
        }
        info!("[Flash] flash worker dies after {} flashes", self.flashes);

        match (fatal, saved) {
            (Some(fault), Ok(_)) => Err(SessionError::FatalFlash(fault)),
            (Some(fault), Err(e)) => {
                error!("[Flash] saving last table failed after fatal fault: {}", e);
                Err(SessionError::FatalFlash(fault))
            }
            (None, Ok(saved)) => Ok(FlashReport {
                live: self.live,
                saved,
                flashes: self.flashes,
            }),
            (None, Err(e)) => Err(e),
        }
    }

    /// Applies one delta and commits the result. `Err` only for faults that end the session.
    pub fn step(&mut self, delta: &TableDelta) -> Result<(), FlashError> {
        let vehicle = &self.target.vehicle;
        if let Err(e) = apply_delta(
            self.default,
            &mut self.live,
            delta,
            vehicle.torque_budget,
            vehicle.torque_upper_bound,
        ) {
            let n = self.counters.record_flash_failure();
            error!("[Flash] rejected delta ({} flash failures): {}", n, e);
            return Ok(());
        }

        match self.commit() {
            Ok(()) => {
                self.events.flash().set();
                self.flashes += 1;
                info!("[Flash] flash count:{}", self.flashes);
                self.record(SessionEvent::FlashOk { count: self.flashes });
                Ok(())
            }
            Err(FlashError::Hardware(fault)) if fault.is_recoverable() => {
                self.events.flash().set();
                warn!("[Flash] {}, episode interrupted", fault);
                self.events.interrupt().set();
                self.record(SessionEvent::FlashFault {
                    code: Some(fault.code),
                    recoverable: true,
                });
                Ok(())
            }
            Err(e) => {
                self.events.flash().set();
                self.events.exit().set();
                self.events.countdown().set();
                error!("[Flash] {}, session exits", e);
                let code = match &e {
                    FlashError::Hardware(fault) => Some(fault.code),
                    FlashError::Other(_) => None,
                };
                self.record(SessionEvent::FlashFault { code, recoverable: false });
                Err(e)
            }
        }
    }

    /// One actuator call. A panicking actuator is an unclassified fault, so the
    /// worker still takes the fatal path and saves the live table.
    fn commit(&self) -> Result<(), FlashError> {
        let ctx = ActuatorContext { counters: &*self.counters };
        catch_unwind(AssertUnwindSafe(|| self.actuator.flash_vehicle(&self.live, ctx)))
            .unwrap_or_else(|payload| Err(FlashError::Other(panic_message(payload))))
    }

    fn record(&self, event: SessionEvent) {
        if let Some(rec) = &self.recorder {
            rec.record(event);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("actuator panicked: {}", msg)
}
