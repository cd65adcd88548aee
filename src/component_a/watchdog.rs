//! watchdog.rs
//! Failure-count monitor with one-way escalation.
//!
//! Wakes every nap interval and compares the cumulative capture and flash
//! failure counters with their upper bounds. On a breach it sets `exit` and
//! `countdown` (so the countdown worker wakes, sees exit and returns). It never
//! resets the counters.

use std::{sync::Arc, time::Duration};

use log::{info, warn};

use crate::component_a::events::SessionEvents;
use crate::utils::metrics::{SessionCounters, SessionEvent, SessionRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogBounds {
    pub capture_failures: u64,
    pub flash_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    Escalate,
}

impl WatchdogBounds {
    #[inline]
    pub fn judge(&self, capture_failures: u64, flash_failures: u64) -> WatchdogVerdict {
        if capture_failures >= self.capture_failures || flash_failures >= self.flash_failures {
            WatchdogVerdict::Escalate
        } else {
            WatchdogVerdict::Healthy
        }
    }
}

pub struct Watchdog {
    events: SessionEvents,
    counters: Arc<SessionCounters>,
    recorder: Option<SessionRecorder>,
    nap: Duration,
    bounds: WatchdogBounds,
}

impl Watchdog {
    pub fn new(
        events: SessionEvents,
        counters: Arc<SessionCounters>,
        recorder: Option<SessionRecorder>,
        nap: Duration,
        bounds: WatchdogBounds,
    ) -> Self {
        Self { events, counters, recorder, nap, bounds }
    }

    pub fn run(&mut self) {
        info!("[Watchdog] watch dog worker start");
        let exit = self.events.exit();

        while !exit.is_set() {
            // exit cuts the nap short; otherwise wake after a full interval
            if exit.wait_timeout(self.nap) {
                break;
            }
            self.check();
        }
        info!("[Watchdog] watch dog worker dies");
    }

    /// One wake cycle. Returns the verdict it acted on.
    pub fn check(&self) -> WatchdogVerdict {
        let capture = self.counters.capture_failures();
        let flash = self.counters.flash_failures();
        let verdict = self.bounds.judge(capture, flash);

        match verdict {
            WatchdogVerdict::Escalate => {
                self.events.exit().set();
                self.events.countdown().set();
                warn!(
                    "[Watchdog] kicks in: capture failures={} flash failures={}, system exit",
                    capture, flash
                );
            }
            WatchdogVerdict::Healthy => {
                info!(
                    "[Watchdog] capture failures={} flash failures={}, system ok",
                    capture, flash
                );
            }
        }
        if let Some(rec) = &self.recorder {
            rec.record(SessionEvent::Watchdog {
                capture_failures: capture,
                flash_failures: flash,
                escalated: verdict == WatchdogVerdict::Escalate,
            });
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_a::events::EventKind;
    use std::{thread, time::Instant};

    const BOUNDS: WatchdogBounds = WatchdogBounds { capture_failures: 3, flash_failures: 2 };

    #[test]
    fn bounds_are_inclusive() {
        assert_eq!(BOUNDS.judge(2, 1), WatchdogVerdict::Healthy);
        assert_eq!(BOUNDS.judge(3, 0), WatchdogVerdict::Escalate);
        assert_eq!(BOUNDS.judge(0, 2), WatchdogVerdict::Escalate);
    }

    #[test]
    fn healthy_check_leaves_flags_alone() {
        let events = SessionEvents::new();
        let counters = Arc::new(SessionCounters::new());
        counters.record_capture_failure();
        let dog = Watchdog::new(events.clone(), counters, None, Duration::from_millis(5), BOUNDS);
        assert_eq!(dog.check(), WatchdogVerdict::Healthy);
        assert!(!events.exit().is_set());
        assert!(!events.countdown().is_set());
    }

    #[test]
    fn breach_sets_exit_and_countdown_on_next_wake() {
        let events = SessionEvents::new();
        let counters = Arc::new(SessionCounters::new());
        let mut dog = Watchdog::new(events.clone(), counters.clone(), None, Duration::from_millis(10), BOUNDS);
        let h = thread::spawn(move || dog.run());

        thread::sleep(Duration::from_millis(25));
        assert!(!events.exit().is_set());
        counters.record_flash_failure();
        counters.record_flash_failure();

        let snap = events.wait_until(|s| s.is_set(EventKind::Exit), Duration::from_secs(5));
        assert!(snap.is_set(EventKind::Exit));
        assert!(snap.is_set(EventKind::Countdown));
        h.join().unwrap();
        // observer only
        assert_eq!(counters.flash_failures(), 2);
    }

    #[test]
    fn exit_ends_nap_early() {
        let events = SessionEvents::new();
        let counters = Arc::new(SessionCounters::new());
        let mut dog = Watchdog::new(events.clone(), counters, None, Duration::from_secs(60), BOUNDS);
        let h = thread::spawn(move || dog.run());
        thread::sleep(Duration::from_millis(10));
        let t = Instant::now();
        events.exit().set();
        h.join().unwrap();
        assert!(t.elapsed() < Duration::from_secs(5));
    }
}
