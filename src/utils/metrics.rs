//! Session counters and event recording.
//!
//! Two independent paths, as in the rig's real-time loop:
//! - **SessionCounters:** atomics read by the watchdog (failures) and kept for telemetry (episodes).
//! - **SessionRecorder:** lock-free queue → background CSV export of session events.
//!
//! Counter ownership: `capture_failures` is written only by the filter capability,
//! `flash_failures` by the actuator capability for controller faults and by the
//! flash worker for rejected deltas. The watchdog only reads.

use std::{
    fs::{create_dir_all, File},
    io::BufWriter,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use log::{debug, error};
use serde::Serialize;

use crate::component_a::events::EventFlag;

#[derive(Debug, Default)]
pub struct SessionCounters {
    capture_failures: AtomicU64,
    flash_failures: AtomicU64,
    episodes: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_capture_failure(&self) -> u64 {
        self.capture_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn record_flash_failure(&self) -> u64 {
        self.flash_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn record_episode(&self) -> u64 {
        self.episodes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn capture_failures(&self) -> u64 {
        self.capture_failures.load(Ordering::Relaxed)
    }

    pub fn flash_failures(&self) -> u64 {
        self.flash_failures.load(Ordering::Relaxed)
    }

    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    /// New-session boundary only; never called while workers are running.
    pub fn reset_failures(&self) {
        self.capture_failures.store(0, Ordering::Relaxed);
        self.flash_failures.store(0, Ordering::Relaxed);
    }
}

/// Session lifecycle events worth keeping after the run.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Hmi { signal: &'static str },
    EpisodeEnd { episode: u64, valid: bool },
    FlashOk { count: u64 },
    FlashFault { code: Option<u8>, recoverable: bool },
    Watchdog { capture_failures: u64, flash_failures: u64, escalated: bool },
    TableSaved,
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Hmi { .. } => "hmi",
            SessionEvent::EpisodeEnd { .. } => "episode_end",
            SessionEvent::FlashOk { .. } => "flash_ok",
            SessionEvent::FlashFault { .. } => "flash_fault",
            SessionEvent::Watchdog { .. } => "watchdog",
            SessionEvent::TableSaved => "table_saved",
        }
    }

    fn detail(&self) -> String {
        match self {
            SessionEvent::Hmi { signal } => signal.to_string(),
            SessionEvent::EpisodeEnd { episode, valid } => format!("episode={} valid={}", episode, valid),
            SessionEvent::FlashOk { count } => format!("count={}", count),
            SessionEvent::FlashFault { code, recoverable } => match code {
                Some(c) => format!("code={} recoverable={}", c, recoverable),
                None => format!("unclassified recoverable={}", recoverable),
            },
            SessionEvent::Watchdog { capture_failures, flash_failures, escalated } => format!(
                "capture={} flash={} escalated={}",
                capture_failures, flash_failures, escalated
            ),
            SessionEvent::TableSaved => String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EventRow {
    seq: u64,
    ts_ms: u64,
    event: &'static str,
    detail: String,
}

struct Stamped {
    seq: u64,
    ts_ms: u64,
    event: SessionEvent,
}

const EVENT_QUEUE_CAPACITY: usize = 4_096;
const EXPORT_POLL_MS: u64 = 20;

/// Non-blocking session event recorder with background CSV export.
///
/// `record()` pushes onto a bounded lock-free queue and returns immediately;
/// events are dropped (and counted) when the queue is full.
#[derive(Clone)]
pub struct SessionRecorder {
    queue: Arc<ArrayQueue<Stamped>>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    run_start: Instant,
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(EVENT_QUEUE_CAPACITY)),
            seq: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
            run_start: Instant::now(),
        }
    }

    #[inline]
    pub fn record(&self, event: SessionEvent) {
        let stamped = Stamped {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts_ms: self.run_start.elapsed().as_millis() as u64,
            event,
        };
        if self.queue.push(stamped).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drains the queue into `output_csv` until `exit` is set, then flushes the rest.
    /// Runs on the calling thread.
    pub fn export_until(&self, output_csv: PathBuf, exit: &EventFlag) -> Result<usize, csv::Error> {
        if let Some(parent) = output_csv.parent() {
            create_dir_all(parent)?;
        }
        let file = File::create(&output_csv)?;
        let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
        let mut written = 0usize;

        loop {
            let stop = exit.is_set();
            let mut any = false;
            while let Some(item) = self.queue.pop() {
                any = true;
                wtr.serialize(EventRow {
                    seq: item.seq,
                    ts_ms: item.ts_ms,
                    event: item.event.kind(),
                    detail: item.event.detail(),
                })?;
                written += 1;
            }
            if any {
                wtr.flush()?;
            }
            // exit observed before the final drain, so nothing recorded before exit is lost
            if stop {
                break;
            }
            thread::sleep(Duration::from_millis(EXPORT_POLL_MS));
        }

        wtr.flush()?;
        debug!(
            "[SessionRecorder] exported {} events to {:?}, dropped={}",
            written,
            output_csv,
            self.dropped()
        );
        Ok(written)
    }

    /// Convenience wrapper that logs export failures instead of returning them.
    pub fn export_logged(&self, output_csv: PathBuf, exit: &EventFlag) {
        if let Err(e) = self.export_until(output_csv.clone(), exit) {
            error!("[SessionRecorder] export to {:?} failed: {}", output_csv, e);
        }
    }
}
