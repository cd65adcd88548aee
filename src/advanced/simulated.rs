//! simulated.rs
//! Simulated vehicle backend used by the binary and the integration tests.
//!
//! - Producer: releases one kinematic sample per period on a SpinSleeper
//!   schedule and replays a scripted list of HMI signals.
//! - Filter: groups samples into fixed-length observation frames while an
//!   episode is active. A frame that cannot be handed on counts as a capture
//!   failure.
//! - Actuator: replays a fault script (one entry per flash), counts every fault
//!   it reports as a flash failure and keeps a log of every table it was asked
//!   to commit.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::random_range;
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::component_a::{
    events::EventFlag,
    pipeline::{DequePipeline, Pipeline},
};
use crate::component_b::{
    capability::{Actuator, ActuatorContext, Filter, FilterContext, Producer},
    torque_table::TorqueTable,
};
use crate::error::{FlashError, HardwareFault, SessionError};

const RAW_CAPACITY: usize = 256;
const HMI_CAPACITY: usize = 16;
const PUT_TIMEOUT: Duration = Duration::from_millis(1);
const FILTER_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleSample {
    pub timestamp: Instant,
    /// km/h
    pub velocity: f64,
    /// pedal position, 0..1
    pub thrust: f64,
    pub brake: f64,
}

/// Fixed-length window of consecutive samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationFrame {
    pub seq: u64,
    pub samples: Vec<VehicleSample>,
}

impl ObservationFrame {
    pub fn mean_velocity(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.velocity).sum::<f64>() / self.samples.len() as f64
    }
}

/// What the actuator does on one flash.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashScript {
    Ok,
    Fault(u8),
    Unclassified(String),
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub sample_period: Duration,
    pub frame_len: usize,
    /// (offset from produce start, signal)
    pub hmi_script: Vec<(Duration, String)>,
    pub flash_script: Vec<FlashScript>,
    pub flash_latency: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(20),
            frame_len: 10,
            hmi_script: Vec::new(),
            flash_script: Vec::new(),
            flash_latency: Duration::from_millis(2),
        }
    }
}

pub struct SimulatedVehicle {
    config: SimulatedConfig,
    flash_script: Mutex<VecDeque<FlashScript>>,
    flashed: Mutex<Vec<TorqueTable>>,
}

impl SimulatedVehicle {
    pub fn new(config: SimulatedConfig) -> Self {
        let flash_script = Mutex::new(config.flash_script.iter().cloned().collect());
        Self {
            config,
            flash_script,
            flashed: Mutex::new(Vec::new()),
        }
    }

    /// Every table committed so far, oldest first. Includes the initial flash.
    pub fn flashed_tables(&self) -> Vec<TorqueTable> {
        self.flashed.lock().clone()
    }

    pub fn flash_count(&self) -> usize {
        self.flashed.lock().len()
    }
}

impl Producer for SimulatedVehicle {
    type Raw = VehicleSample;

    fn init_internal_pipelines(&self) -> (DequePipeline<VehicleSample>, Pipeline<String>) {
        (DequePipeline::new(RAW_CAPACITY), Pipeline::new(HMI_CAPACITY))
    }

    fn produce(
        &self,
        raw: &DequePipeline<VehicleSample>,
        hmi: &Pipeline<String>,
        exit: &EventFlag,
    ) -> Result<(), SessionError> {
        info!("[Producer] simulated vehicle start");
        let period = self.config.sample_period;
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);

        let started = Instant::now();
        let mut script = self.config.hmi_script.clone();
        script.sort_by_key(|(at, _)| *at);
        let mut script: VecDeque<_> = script.into();

        let mut next_release = started + period;
        let mut velocity = 0.0f64;
        let mut dropped = 0u64;

        while !exit.is_set() {
            let now = Instant::now();
            if now < next_release {
                sleeper.sleep(next_release - now);
            }
            next_release += period;

            while let Some((at, _)) = script.front() {
                if started.elapsed() < *at {
                    break;
                }
                if let Some((_, signal)) = script.pop_front() {
                    debug!("[Producer] hmi signal {}", signal);
                    if let Err(e) = hmi.put(signal, PUT_TIMEOUT) {
                        warn!("[Producer] hmi signal lost: {}", e);
                    }
                }
            }

            let thrust = random_range(0.0..1.0);
            let brake = if thrust < 0.1 { random_range(0.0..0.5) } else { 0.0 };
            velocity = (velocity + thrust * 2.0 - brake * 4.0 - 0.5).clamp(0.0, 120.0);
            let sample = VehicleSample {
                timestamp: Instant::now(),
                velocity,
                thrust,
                brake,
            };

            if raw.put_back_evicting(sample).is_some() {
                dropped += 1;
                debug!("[Producer] raw deque full, dropped oldest sample");
            }
        }
        info!("[Producer] simulated vehicle dies, dropped {} samples", dropped);
        Ok(())
    }
}

impl Filter for SimulatedVehicle {
    type Observation = ObservationFrame;

    fn filter(
        &self,
        raw: &DequePipeline<VehicleSample>,
        observe: &Pipeline<ObservationFrame>,
        ctx: FilterContext<'_>,
    ) -> Result<(), SessionError> {
        info!("[Filter] simulated filter start");
        let frame_len = self.config.frame_len.max(1);
        let mut window: Vec<VehicleSample> = Vec::with_capacity(frame_len);
        let mut seq = 0u64;

        while !ctx.exit.is_set() {
            let sample = match raw.get_front(FILTER_POLL) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let capturing = ctx.start.is_set() && !ctx.stop.is_set() && !ctx.interrupt.is_set();
            if !capturing {
                window.clear();
                continue;
            }

            window.push(sample);
            if window.len() < frame_len {
                continue;
            }
            seq += 1;
            let frame = ObservationFrame {
                seq,
                samples: std::mem::replace(&mut window, Vec::with_capacity(frame_len)),
            };
            if let Err(e) = observe.try_put(frame) {
                let n = ctx.counters.record_capture_failure();
                warn!("[Filter] frame {} not delivered ({}), capture failures={}", seq, e, n);
            }
        }
        // release any consumer waiting on the flash acknowledgement
        ctx.flash.set();
        info!("[Filter] simulated filter dies after {} frames", seq);
        Ok(())
    }
}

impl Actuator for SimulatedVehicle {
    fn flash_vehicle(&self, table: &TorqueTable, ctx: ActuatorContext<'_>) -> Result<(), FlashError> {
        if !self.config.flash_latency.is_zero() {
            spin_sleep::sleep(self.config.flash_latency);
        }
        self.flashed.lock().push(table.clone());
        let step = self.flash_script.lock().pop_front().unwrap_or(FlashScript::Ok);
        let err = match step {
            FlashScript::Ok => return Ok(()),
            FlashScript::Fault(code) => FlashError::from(HardwareFault::new(code)),
            FlashScript::Unclassified(msg) => FlashError::Other(msg),
        };
        let n = ctx.counters.record_flash_failure();
        debug!("[Actuator] {} ({} flash failures)", err, n);
        Err(err)
    }
}
