//! # Vehicle Interface Entry Point
//! Drives one bench session against the simulated vehicle: a scripted driver
//! on the HMI, a stand-in learner that turns observation frames into torque
//! deltas, and the full worker set behind `VehicleInterface`.
//!
//! ## Modes
//! - **Clean run:** two valid episodes and one invalid one, then exit.
//! - **Recoverable faults:** the controller times out on some flashes.
//! - **Fatal fault:** the controller rejects a flash; the session ends after the
//!   live table is saved.
//!
//! ## Configuration
//! - `VEHICLE_INTERFACE_CONFIG`: optional JSON `SessionConfig`.
//! - `RUST_LOG`: log filter (`info` recommended).
//!
//! ## Outputs
//! - `<data_dir>/last_table_-<vid>-<pid>-<timestamp>.csv`: final live table.
//! - `<data_dir>/session_events.csv`: HMI, episode, flash and watchdog events.

use std::{
    env,
    io::{stdin, stdout, Write},
    path::PathBuf,
    thread,
    time::Duration,
};

use log::{error, info, warn};
use rand::random_range;

use vehicle_interface::{
    advanced::simulated::{FlashScript, ObservationFrame, SimulatedConfig, SimulatedVehicle},
    component_a::{events::SessionEvents, pipeline::Pipeline},
    component_b::torque_table::TableDelta,
    error::SessionError,
    utils::config::{str_to_bus_endpoint, str_to_driver, str_to_vehicle, SessionConfig},
    VehicleInterface,
};

const CONFIG_ENV: &str = "VEHICLE_INTERFACE_CONFIG";
const DEFAULT_VEHICLE: &str = "VB7";
const DEFAULT_DRIVER: &str = "wang-kai";
const DEFAULT_BUS: &str = "can_local";
const OBSERVE_CAPACITY: usize = 64;
const FLASH_CAPACITY: usize = 4;
/// Rows touched by one learner action.
const ACTION_ROWS: usize = 4;

fn main() {
    env_logger::init();
    info!("=== VEHICLE INTERFACE START ===");

    loop {
        let choice = prompt_menu();
        let flash_script = match choice.as_str() {
            "1" | "" => Vec::new(),
            "2" => vec![
                FlashScript::Ok,
                FlashScript::Fault(4),
                FlashScript::Ok,
                FlashScript::Fault(4),
            ],
            "3" => vec![FlashScript::Ok, FlashScript::Ok, FlashScript::Fault(3)],
            "4" => {
                println!("Exiting. Goodbye!");
                info!("=== VEHICLE INTERFACE FINISHED ===");
                return;
            }
            other => {
                println!("Unrecognized option '{}', please try again.", other);
                continue;
            }
        };

        let vehicle = prompt_with_default("Vehicle (id or VIN)", DEFAULT_VEHICLE);
        let driver = prompt_with_default("Driver (first-last)", DEFAULT_DRIVER);
        match run_session(&vehicle, &driver, flash_script) {
            Ok(saved) => println!("\n Session completed, last table saved to {:?}\n", saved),
            Err(e) => {
                error!("[Main] session failed: {}", e);
                println!("\n Session failed: {}\n", e);
            }
        }
        thread::sleep(Duration::from_secs(1));
    }
}

fn prompt_menu() -> String {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     SELECT SESSION                          │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) Clean run                               │");
    println!("│  2) Recoverable controller timeouts         │");
    println!("│  3) Fatal controller fault                  │");
    println!("│  4) Exit                                    │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select [1/2/3/4] (default: 1): ");
    let _ = stdout().flush();

    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input.trim().to_string()
}

fn prompt_with_default(label: &str, default: &str) -> String {
    print!("{} [default: {}]: ", label, default);
    let _ = stdout().flush();
    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    match input.trim() {
        "" => default.to_string(),
        s => s.to_string(),
    }
}

fn load_config() -> Result<SessionConfig, SessionError> {
    match env::var(CONFIG_ENV) {
        Ok(path) => {
            info!("[Main] config from {}", path);
            SessionConfig::from_json_file(&PathBuf::from(path))
        }
        Err(_) => Ok(SessionConfig {
            watchdog_nap: Duration::from_secs(5),
            episode_countdown: Duration::from_millis(500),
            pipeline_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }),
    }
}

/// Scripted driver: two valid episodes, one aborted, then exit.
fn driver_script() -> Vec<(Duration, String)> {
    [
        (500, "begin"),
        (3_000, "end_valid"),
        (4_000, "begin"),
        (6_500, "end_valid"),
        (7_500, "begin"),
        (8_500, "end_invalid"),
        (9_500, "exit"),
    ]
    .into_iter()
    .map(|(ms, s)| (Duration::from_millis(ms), s.to_string()))
    .collect()
}

fn run_session(vehicle: &str, driver: &str, flash_script: Vec<FlashScript>) -> Result<PathBuf, SessionError> {
    let config = load_config()?;
    let vehicle = str_to_vehicle(vehicle)?;
    let driver = str_to_driver(driver)?;
    let bus = str_to_bus_endpoint(DEFAULT_BUS)?;

    // the first script entry is consumed by the initial flash
    let mut script = vec![FlashScript::Ok];
    script.extend(flash_script);
    let backend = SimulatedVehicle::new(SimulatedConfig {
        hmi_script: driver_script(),
        flash_script: script,
        ..SimulatedConfig::default()
    });

    let mut vi = VehicleInterface::new(backend, vehicle, driver, bus, config)?;
    let observe: Pipeline<ObservationFrame> = Pipeline::new(OBSERVE_CAPACITY);
    let flash: Pipeline<TableDelta> = Pipeline::new(FLASH_CAPACITY);
    let events = SessionEvents::new();
    let (rows, cols) = vi.default_table().shape();

    let report = thread::scope(|s| {
        s.spawn(|| learner(&observe, &flash, &events, rows, cols));
        vi.ignite(&observe, &flash, &events)
    })?;

    let counters = vi.counters();
    info!(
        "[Main] episodes={} flashes={} capture failures={} flash failures={}",
        counters.episodes(),
        report.flashes,
        counters.capture_failures(),
        counters.flash_failures()
    );
    Ok(report.saved)
}

/// Stand-in learner: one random delta over a contiguous block of rows per
/// observation frame, then waits for the flash acknowledgement.
fn learner(
    observe: &Pipeline<ObservationFrame>,
    flash: &Pipeline<TableDelta>,
    events: &SessionEvents,
    rows: usize,
    cols: usize,
) {
    let exit = events.exit();
    let ack = events.flash();
    let block = ACTION_ROWS.min(rows);

    while !exit.is_set() {
        let frame = match observe.get(Duration::from_millis(100)) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let start_row = random_range(0..=rows - block);
        let line: Vec<f64> = (0..block * cols).map(|_| random_range(-0.05..0.05)).collect();
        let delta = match TableDelta::from_flat(&line, start_row, block, cols) {
            Ok(d) => d,
            Err(e) => {
                warn!("[Learner] bad action: {}", e);
                continue;
            }
        };

        ack.clear();
        if flash.put(delta, Duration::from_millis(100)).is_err() {
            continue;
        }
        if !ack.wait_timeout(Duration::from_secs(2)) {
            warn!("[Learner] no flash acknowledgement for frame {}", frame.seq);
        }
        info!(
            "[Learner] frame {} (mean velocity {:.1} km/h) -> rows {}..{}",
            frame.seq,
            frame.mean_velocity(),
            start_row,
            start_row + block
        );
    }
}
