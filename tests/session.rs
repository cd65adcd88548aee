use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use vehicle_interface::{
    advanced::simulated::{FlashScript, ObservationFrame, SimulatedConfig, SimulatedVehicle, VehicleSample},
    component_a::{
        events::{EventFlag, SessionEvents},
        pipeline::{DequePipeline, Pipeline},
    },
    component_b::{
        capability::{Actuator, ActuatorContext, Filter, FilterContext, Producer},
        torque_table::{TableDelta, TorqueTable},
    },
    error::{FlashError, HardwareFault, SessionError},
    session::SESSION_EVENTS_FILE,
    utils::{
        config::{str_to_bus_endpoint, str_to_driver, str_to_vehicle, SessionConfig},
        export::TableSource,
    },
    VehicleInterface,
};

fn config(dir: &Path) -> SessionConfig {
    SessionConfig {
        watchdog_nap: Duration::from_millis(50),
        episode_countdown: Duration::from_millis(50),
        pipeline_timeout: Duration::from_millis(20),
        data_dir: dir.to_path_buf(),
        ..SessionConfig::default()
    }
}

fn script(entries: &[(u64, &str)]) -> Vec<(Duration, String)> {
    entries
        .iter()
        .map(|(ms, s)| (Duration::from_millis(*ms), s.to_string()))
        .collect()
}

fn backend(hmi: &[(u64, &str)], flashes: Vec<FlashScript>) -> SimulatedVehicle {
    // first entry answers the initial flash
    let mut flash_script = vec![FlashScript::Ok];
    flash_script.extend(flashes);
    SimulatedVehicle::new(SimulatedConfig {
        sample_period: Duration::from_millis(5),
        frame_len: 5,
        hmi_script: script(hmi),
        flash_script,
        flash_latency: Duration::from_millis(1),
    })
}

fn interface<B>(backend: B, cfg: SessionConfig) -> VehicleInterface<B>
where
    B: Producer + Filter + Actuator,
{
    VehicleInterface::new(
        backend,
        str_to_vehicle("VB7").unwrap(),
        str_to_driver("li-wei").unwrap(),
        str_to_bus_endpoint("can_local").unwrap(),
        cfg,
    )
    .unwrap()
}

/// Pushes one-row deltas until exit; optionally plays the external controller
/// that clears `interrupt` after a recoverable fault.
fn feed(flash: &Pipeline<TableDelta>, events: &SessionEvents, cols: usize, clear_interrupt: bool) {
    let exit = events.exit();
    let mut row = 0usize;
    while !exit.is_set() {
        if clear_interrupt && events.interrupt().is_set() {
            events.interrupt().clear();
        }
        let delta = TableDelta::new(vec![row % 14], vec![vec![if row % 2 == 0 { 0.5 } else { -3.0 }; cols]]);
        let _ = flash.put(delta, Duration::from_millis(10));
        row += 1;
    }
}

fn drain(observe: &Pipeline<ObservationFrame>, exit: &EventFlag) -> usize {
    let mut frames = 0;
    while !exit.is_set() {
        if observe.get(Duration::from_millis(10)).is_ok() {
            frames += 1;
        }
    }
    frames
}

fn last_tables(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("last_table"))
                .unwrap_or(false)
        })
        .collect()
}

fn assert_in_envelope(default: &TorqueTable, table: &TorqueTable, budget: f64, upper: f64) {
    let (rows, cols) = default.shape();
    for r in 0..rows {
        for c in 0..cols {
            let d = default.get(r, c).unwrap();
            let v = table.get(r, c).unwrap();
            assert!(v >= d - budget - 1e-9 && v <= d * upper + 1e-9, "({r},{c}) = {v}, default {d}");
        }
    }
}

#[test]
fn scripted_session_runs_to_exit_and_saves_one_table() {
    let dir = tempfile::tempdir().unwrap();
    let sim = backend(
        &[(0, "begin"), (150, "end_valid"), (400, "begin"), (550, "end_invalid"), (700, "exit")],
        Vec::new(),
    );
    let mut vi = interface(sim, config(dir.path()));
    let observe = Pipeline::new(64);
    let flash = Pipeline::new(2);
    let events = SessionEvents::new();
    let cols = vi.default_table().shape().1;

    let (report, frames) = thread::scope(|s| {
        let feeder = s.spawn(|| feed(&flash, &events, cols, false));
        let consumer = s.spawn(|| drain(&observe, &events.exit()));
        let report = vi.ignite(&observe, &flash, &events).unwrap();
        feeder.join().unwrap();
        (report, consumer.join().unwrap())
    });

    assert!(frames > 0);
    assert!(report.flashes > 0);
    assert_eq!(vi.counters().episodes(), 3);
    assert_eq!(vi.counters().flash_failures(), 0);
    assert_eq!(last_tables(dir.path()), vec![report.saved.clone()]);
    assert_eq!(&TorqueTable::from_csv_path(&report.saved).unwrap(), vi.live_table());

    let vehicle = vi.vehicle().clone();
    for table in vi.backend().flashed_tables() {
        assert_in_envelope(vi.default_table(), &table, vehicle.torque_budget, vehicle.torque_upper_bound);
    }

    let events_csv = fs::read_to_string(dir.path().join(SESSION_EVENTS_FILE)).unwrap();
    assert!(events_csv.starts_with("seq,ts_ms,event,detail"));
    assert!(events_csv.contains("episode_end"));
    assert!(events_csv.contains("table_saved"));
}

#[test]
fn watchdog_escalates_on_repeated_flash_timeouts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SessionConfig {
        flash_error_upper_bound: 2,
        ..config(dir.path())
    };
    let sim = backend(&[(0, "begin")], vec![FlashScript::Fault(HardwareFault::XCP_TIMEOUT); 50]);
    let mut vi = interface(sim, cfg);
    let observe = Pipeline::new(64);
    let flash = Pipeline::new(2);
    let events = SessionEvents::new();
    let cols = vi.default_table().shape().1;

    let report = thread::scope(|s| {
        s.spawn(|| feed(&flash, &events, cols, true));
        s.spawn(|| drain(&observe, &events.exit()));
        vi.ignite(&observe, &flash, &events)
    })
    .unwrap();

    // escalation is a shutdown, not an error
    assert!(events.exit().is_set());
    // counted by the simulated actuator, one per reported timeout
    assert!(vi.counters().flash_failures() >= 2);
    assert_eq!(report.flashes, 0);
    assert_eq!(last_tables(dir.path()).len(), 1);

    // nothing reaches the actuator once the session is over
    let after = vi.backend().flash_count();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(vi.backend().flash_count(), after);
}

#[test]
fn fatal_fault_surfaces_after_table_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let sim = backend(
        &[(0, "begin")],
        vec![FlashScript::Ok, FlashScript::Ok, FlashScript::Fault(3)],
    );
    let mut vi = interface(sim, config(dir.path()));
    let observe = Pipeline::new(64);
    let flash = Pipeline::new(2);
    let events = SessionEvents::new();
    let cols = vi.default_table().shape().1;

    let out = thread::scope(|s| {
        s.spawn(|| feed(&flash, &events, cols, false));
        s.spawn(|| drain(&observe, &events.exit()));
        vi.ignite(&observe, &flash, &events)
    });

    assert!(matches!(
        out,
        Err(SessionError::FatalFlash(FlashError::Hardware(HardwareFault { code: 3 })))
    ));
    assert_eq!(vi.counters().flash_failures(), 1);
    let saved = last_tables(dir.path());
    assert_eq!(saved.len(), 1);
    let flashed = vi.backend().flashed_tables();
    // initial flash + two good ones + the faulted one
    assert_eq!(flashed.len(), 4);
    assert_eq!(&TorqueTable::from_csv_path(&saved[0]).unwrap(), flashed.last().unwrap());
}

#[test]
fn resume_picks_up_last_saved_table() {
    let dir = tempfile::tempdir().unwrap();
    let sim = backend(&[(0, "begin"), (200, "exit")], Vec::new());
    let mut vi = interface(sim, config(dir.path()));
    let observe = Pipeline::new(64);
    let flash = Pipeline::new(2);
    let events = SessionEvents::new();
    let cols = vi.default_table().shape().1;

    let report = thread::scope(|s| {
        s.spawn(|| feed(&flash, &events, cols, false));
        s.spawn(|| drain(&observe, &events.exit()));
        vi.ignite(&observe, &flash, &events)
    })
    .unwrap();
    assert_ne!(&report.live, vi.default_table());

    let resumed = interface(
        backend(&[], Vec::new()),
        SessionConfig {
            resume: true,
            ..config(dir.path())
        },
    );
    assert_eq!(resumed.table_source(), &TableSource::Resumed(report.saved.clone()));
    assert_eq!(resumed.default_table(), &report.live);
    // the resumed table is flashed once at init
    assert_eq!(resumed.backend().flashed_tables(), vec![report.live]);
}

/// Simulated vehicle whose actuator records which thread flashed and how many
/// flashes overlapped.
struct Instrumented {
    inner: SimulatedVehicle,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    threads: Mutex<Vec<Option<String>>>,
}

impl Producer for Instrumented {
    type Raw = VehicleSample;

    fn init_internal_pipelines(&self) -> (DequePipeline<VehicleSample>, Pipeline<String>) {
        self.inner.init_internal_pipelines()
    }

    fn produce(
        &self,
        raw: &DequePipeline<VehicleSample>,
        hmi: &Pipeline<String>,
        exit: &EventFlag,
    ) -> Result<(), SessionError> {
        self.inner.produce(raw, hmi, exit)
    }
}

impl Filter for Instrumented {
    type Observation = ObservationFrame;

    fn filter(
        &self,
        raw: &DequePipeline<VehicleSample>,
        observe: &Pipeline<ObservationFrame>,
        ctx: FilterContext<'_>,
    ) -> Result<(), SessionError> {
        self.inner.filter(raw, observe, ctx)
    }
}

impl Actuator for Instrumented {
    fn flash_vehicle(&self, table: &TorqueTable, ctx: ActuatorContext<'_>) -> Result<(), FlashError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.threads
            .lock()
            .push(thread::current().name().map(str::to_string));
        let out = self.inner.flash_vehicle(table, ctx);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[test]
fn live_table_has_a_single_writer() {
    let dir = tempfile::tempdir().unwrap();
    let inst = Instrumented {
        inner: backend(&[(0, "begin"), (300, "exit")], Vec::new()),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        threads: Mutex::new(Vec::new()),
    };
    let mut vi = interface(inst, config(dir.path()));
    let observe = Pipeline::new(64);
    let flash = Pipeline::new(2);
    let events = SessionEvents::new();
    let cols = vi.default_table().shape().1;

    thread::scope(|s| {
        // two competing feeders
        s.spawn(|| feed(&flash, &events, cols, false));
        s.spawn(|| feed(&flash, &events, cols, false));
        s.spawn(|| drain(&observe, &events.exit()));
        vi.ignite(&observe, &flash, &events)
    })
    .unwrap();

    let inst = vi.backend();
    assert_eq!(inst.max_in_flight.load(Ordering::SeqCst), 1);
    let threads = inst.threads.lock();
    assert!(threads.len() > 1);
    // the first entry is the initial flash from the test thread
    assert!(threads[1..].iter().all(|t| t.as_deref() == Some("vehicle-flash")));
}
