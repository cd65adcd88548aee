//! session.rs
//! Orchestrator: one vehicle session from init to the last persisted table.
//!
//! `VehicleInterface::new` resolves the default table, copies it into the live
//! table and flashes the default once. `ignite` then runs six workers on
//! crossbeam scoped threads (producer, HMI, countdown, filter, flash, watchdog)
//! and only returns after every one of them has been joined.
//!
//! Every worker is wrapped in an exit guard: if it returns an error or panics,
//! the guard sets `exit`, `countdown` and `flash` so the remaining workers
//! unwind instead of blocking forever.

use std::sync::Arc;

use crossbeam::thread::{Scope, ScopedJoinHandle};
use log::{debug, error, info, warn};
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::component_a::{
    countdown::Countdown,
    events::SessionEvents,
    hmi::HmiControl,
    pipeline::Pipeline,
    watchdog::{Watchdog, WatchdogBounds},
};
use crate::component_b::{
    capability::{ActuatorContext, FilterContext, VehicleBackend},
    flash::{FlashLoop, FlashReport, FlashTarget},
    torque_table::{TableDelta, TorqueTable},
};
use crate::error::SessionError;
use crate::utils::{
    config::{BusEndpoint, Driver, SessionConfig, Vehicle},
    export::{load_default_table, TableSource},
    metrics::{SessionCounters, SessionRecorder},
};

pub const SESSION_EVENTS_FILE: &str = "session_events.csv";

pub struct VehicleInterface<B: VehicleBackend> {
    backend: B,
    target: FlashTarget,
    bus: BusEndpoint,
    config: SessionConfig,
    default: TorqueTable,
    live: TorqueTable,
    source: TableSource,
    counters: Arc<SessionCounters>,
    recorder: Option<SessionRecorder>,
}

impl<B: VehicleBackend> VehicleInterface<B> {
    /// Loads the default table and flashes it once. A failing first flash is
    /// returned as `SessionError::InitialFlash`.
    pub fn new(
        backend: B,
        vehicle: Vehicle,
        driver: Driver,
        bus: BusEndpoint,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (default, source) = load_default_table(&config)?;
        let live = default.clone();

        info!(
            "[Session] init vehicle {} ({}) for driver {} on {} {}:{}",
            vehicle.vid, vehicle.vin, driver.pid, bus.name, bus.host, bus.port
        );
        let counters = Arc::new(SessionCounters::new());
        backend
            .flash_vehicle(&default, ActuatorContext { counters: &*counters })
            .map_err(SessionError::InitialFlash)?;
        info!("[Session] default table flashed ({:?})", source);

        let recorder = config.recorder.then(SessionRecorder::new);
        let target = FlashTarget {
            vehicle,
            driver,
            data_dir: config.data_dir.clone(),
        };
        Ok(Self {
            backend,
            target,
            bus,
            config,
            default,
            live,
            source,
            counters,
            recorder,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn vehicle(&self) -> &Vehicle {
        &self.target.vehicle
    }

    pub fn driver(&self) -> &Driver {
        &self.target.driver
    }

    pub fn bus(&self) -> &BusEndpoint {
        &self.bus
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn default_table(&self) -> &TorqueTable {
        &self.default
    }

    /// Live table as of the last clean session end (a copy of the default before that).
    pub fn live_table(&self) -> &TorqueTable {
        &self.live
    }

    pub fn table_source(&self) -> &TableSource {
        &self.source
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    pub fn recorder(&self) -> Option<&SessionRecorder> {
        self.recorder.as_ref()
    }

    /// Runs a full session and blocks until every worker has returned.
    ///
    /// `observe` receives observation frames from the filter, `flash` carries
    /// table deltas into the flash worker, `events` is shared with whoever
    /// drives the session from outside (the learner).
    pub fn ignite(
        &mut self,
        observe: &Pipeline<B::Observation>,
        flash: &Pipeline<TableDelta>,
        events: &SessionEvents,
    ) -> Result<FlashReport, SessionError> {
        if events.exit().is_set() {
            warn!("[Session] exit already set, the session will end immediately");
        }
        self.counters.reset_failures();
        // left set by the previous session's shutdown
        events.countdown().clear();

        let (raw, hmi) = self.backend.init_internal_pipelines();
        let (raw, hmi) = (&raw, &hmi);
        let backend = &self.backend;
        let cfg = &self.config;
        let counters = &self.counters;
        let recorder = self.recorder.clone();
        let export_done = SessionEvents::new();

        let flash_loop = FlashLoop::new(
            backend,
            &self.default,
            self.live.clone(),
            self.target.clone(),
            events.clone(),
            counters.clone(),
            cfg.pipeline_timeout,
        )
        .with_recorder(recorder.clone());

        info!("[Session] ignite");
        let outcome = crossbeam::thread::scope(|s| -> Result<FlashReport, SessionError> {
            let mut workers = Vec::with_capacity(5);

            workers.push((
                "producer",
                spawn_worker(s, "producer", events, move || backend.produce(raw, hmi, &events.exit()))?,
            ));

            let mut control = HmiControl::new(
                hmi.clone(),
                observe.clone(),
                events.clone(),
                counters.clone(),
                recorder.clone(),
                cfg.pipeline_timeout,
            );
            workers.push((
                "hmi",
                spawn_worker(s, "hmi", events, move || {
                    control.run();
                    Ok(())
                })?,
            ));

            let mut countdown = Countdown::new(
                observe.clone(),
                events.clone(),
                counters.clone(),
                recorder.clone(),
                cfg.episode_countdown,
            );
            workers.push((
                "countdown",
                spawn_worker(s, "countdown", events, move || {
                    countdown.run();
                    Ok(())
                })?,
            ));

            workers.push((
                "filter",
                spawn_worker(s, "filter", events, move || {
                    let ctx = FilterContext {
                        start: events.start(),
                        stop: events.stop(),
                        interrupt: events.interrupt(),
                        flash: events.flash(),
                        exit: events.exit(),
                        counters: &**counters,
                    };
                    backend.filter(raw, observe, ctx)
                })?,
            ));

            let flash_handle = spawn_worker(s, "flash", events, move || {
                if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
                    debug!("[Session] flash worker keeps default priority: {:?}", e);
                }
                flash_loop.run(flash)
            })?;

            let mut dog = Watchdog::new(
                events.clone(),
                counters.clone(),
                recorder.clone(),
                cfg.watchdog_nap,
                WatchdogBounds {
                    capture_failures: cfg.capture_error_upper_bound,
                    flash_failures: cfg.flash_error_upper_bound,
                },
            );
            workers.push((
                "watchdog",
                spawn_worker(s, "watchdog", events, move || {
                    dog.run();
                    Ok(())
                })?,
            ));

            // spawned last: nothing releases it if an earlier spawn fails
            let exporter = match &recorder {
                Some(rec) => {
                    let path = cfg.data_dir.join(SESSION_EVENTS_FILE);
                    let done = export_done.exit();
                    let spawned = s
                        .builder()
                        .name("vehicle-recorder".into())
                        .spawn(move |_| rec.export_logged(path, &done));
                    match spawned {
                        Ok(h) => Some(h),
                        Err(e) => {
                            warn!("[Session] session events will not be exported: {}", e);
                            None
                        }
                    }
                }
                None => None,
            };

            let flashed = join_worker("flash", flash_handle);
            // exit is set once the flash worker is back; wake a countdown still parked on its flag
            events.countdown().set();
            let mut first_err = None;
            for (name, handle) in workers {
                if let Err(e) = join_worker(name, handle) {
                    error!("[Session] {}", e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }

            export_done.exit().set();
            if let Some(h) = exporter {
                if h.join().is_err() {
                    error!("[Session] recorder exporter panicked");
                }
            }

            let report = flashed?;
            match first_err {
                Some(e) => Err(e),
                None => Ok(report),
            }
        })
        .map_err(|_| SessionError::WorkerPanic("session"))?;

        match outcome {
            Ok(report) => {
                info!(
                    "[Session] session over: {} flashes, last table {:?}",
                    report.flashes, report.saved
                );
                self.live = report.live.clone();
                Ok(report)
            }
            Err(e) => {
                error!("[Session] session aborted: {}", e);
                Err(e)
            }
        }
    }
}

/// Sets `exit`, `countdown` and `flash` when dropped without a clean finish.
struct ExitGuard {
    worker: &'static str,
    events: SessionEvents,
    clean: bool,
}

impl ExitGuard {
    fn new(worker: &'static str, events: SessionEvents) -> Self {
        Self { worker, events, clean: false }
    }

    fn finish<T>(mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        self.clean = result.is_ok();
        result
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.clean {
            return;
        }
        warn!("[Session] {} worker ended abnormally, releasing the session", self.worker);
        self.events.exit().set();
        self.events.countdown().set();
        self.events.flash().set();
    }
}

fn release(events: &SessionEvents) {
    events.exit().set();
    events.countdown().set();
    events.flash().set();
}

fn spawn_worker<'scope, 'env, T, F>(
    s: &'scope Scope<'env>,
    name: &'static str,
    events: &SessionEvents,
    f: F,
) -> Result<ScopedJoinHandle<'scope, Result<T, SessionError>>, SessionError>
where
    T: Send + 'env,
    F: FnOnce() -> Result<T, SessionError> + Send + 'env,
{
    let guard_events = events.clone();
    s.builder()
        .name(format!("vehicle-{}", name))
        .spawn(move |_| {
            let guard = ExitGuard::new(name, guard_events);
            guard.finish(f())
        })
        .map_err(|e| {
            error!("[Session] cannot spawn {} worker: {}", name, e);
            release(events);
            SessionError::from(e)
        })
}

fn join_worker<T>(
    name: &'static str,
    handle: ScopedJoinHandle<'_, Result<T, SessionError>>,
) -> Result<T, SessionError> {
    handle.join().map_err(|_| SessionError::WorkerPanic(name))?
}
