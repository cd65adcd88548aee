//! hmi.rs
//! HMI control worker: the session state machine.
//!
//! Reads driver signals from the HMI pipeline with a bounded wait and drives
//! the event register. A timeout is not an error, the loop re-checks `exit`
//! and waits again. It returns only after handling `exit`.
//!
//! | signal        | effect                                                          |
//! |---------------|-----------------------------------------------------------------|
//! | `begin`       | clear observations, set start, clear stop + interrupt           |
//! | `end_valid`   | set countdown (the countdown worker performs the stop)          |
//! | `end_invalid` | clear start, set interrupt, clear observations, count episode   |
//! | `exit`        | clear start, release countdown + flash waiters, set exit        |

use std::{str::FromStr, sync::Arc, time::Duration};

use log::{debug, info};

use crate::component_a::{
    events::SessionEvents,
    pipeline::Pipeline,
};
use crate::error::PipelineError;
use crate::utils::metrics::{SessionCounters, SessionEvent, SessionRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmiSignal {
    Begin,
    EndValid,
    EndInvalid,
    Exit,
}

impl HmiSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            HmiSignal::Begin => "begin",
            HmiSignal::EndValid => "end_valid",
            HmiSignal::EndInvalid => "end_invalid",
            HmiSignal::Exit => "exit",
        }
    }
}

impl FromStr for HmiSignal {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "begin" => Ok(HmiSignal::Begin),
            "end_valid" => Ok(HmiSignal::EndValid),
            "end_invalid" => Ok(HmiSignal::EndInvalid),
            "exit" => Ok(HmiSignal::Exit),
            _ => Err(()),
        }
    }
}

pub struct HmiControl<O> {
    hmi: Pipeline<String>,
    observe: Pipeline<O>,
    events: SessionEvents,
    counters: Arc<SessionCounters>,
    recorder: Option<SessionRecorder>,
    timeout: Duration,
}

impl<O> HmiControl<O> {
    pub fn new(
        hmi: Pipeline<String>,
        observe: Pipeline<O>,
        events: SessionEvents,
        counters: Arc<SessionCounters>,
        recorder: Option<SessionRecorder>,
        timeout: Duration,
    ) -> Self {
        Self { hmi, observe, events, counters, recorder, timeout }
    }

    pub fn run(&mut self) {
        info!("[HMI] hmi_control worker start");
        let exit = self.events.exit();

        while !exit.is_set() {
            let raw = match self.hmi.get(self.timeout) {
                Ok(raw) => raw,
                Err(PipelineError::Timeout) | Err(PipelineError::Empty) => {
                    debug!("[HMI] hmi pipeline timeout");
                    continue;
                }
                Err(e) => {
                    debug!("[HMI] hmi pipeline: {}", e);
                    continue;
                }
            };

            match raw.parse::<HmiSignal>() {
                Ok(signal) => {
                    if self.handle(signal) {
                        break;
                    }
                }
                Err(()) => debug!("[HMI] ignoring unrecognised signal {:?}", raw),
            }
        }
        info!("[HMI] hmi_control worker dies");
    }

    /// Applies one signal to the register. Returns true when the worker must return.
    pub fn handle(&mut self, signal: HmiSignal) -> bool {
        if let Some(rec) = &self.recorder {
            rec.record(SessionEvent::Hmi { signal: signal.as_str() });
        }
        let ev = &self.events;
        match signal {
            HmiSignal::Begin => {
                self.observe.clear();
                ev.start().set();
                ev.stop().clear();
                ev.interrupt().clear();
                info!("[HMI] episode will start");
                false
            }
            HmiSignal::EndValid => {
                ev.countdown().set();
                info!("[HMI] episode end, countdown starts");
                false
            }
            HmiSignal::EndInvalid => {
                ev.start().clear();
                ev.interrupt().set();
                self.observe.clear();
                let episode = self.counters.record_episode();
                self.record_episode_end(episode, false);
                info!("[HMI] episode {} interrupted", episode);
                false
            }
            HmiSignal::Exit => {
                ev.start().clear();
                // releases the countdown worker so it can observe exit
                ev.countdown().set();
                self.observe.clear();
                let episode = self.counters.record_episode();
                self.record_episode_end(episode, false);
                ev.interrupt().set();
                ev.flash().set();
                ev.exit().set();
                info!("[HMI] exit requested");
                true
            }
        }
    }

    fn record_episode_end(&self, episode: u64, valid: bool) {
        if let Some(rec) = &self.recorder {
            rec.record(SessionEvent::EpisodeEnd { episode, valid });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_a::events::{EventKind, SessionState};
    use std::thread;

    fn control() -> (HmiControl<u32>, Pipeline<String>, Pipeline<u32>, SessionEvents, Arc<SessionCounters>) {
        let hmi = Pipeline::new(8);
        let observe = Pipeline::new(8);
        let events = SessionEvents::new();
        let counters = Arc::new(SessionCounters::new());
        let c = HmiControl::new(
            hmi.clone(),
            observe.clone(),
            events.clone(),
            counters.clone(),
            None,
            Duration::from_millis(10),
        );
        (c, hmi, observe, events, counters)
    }

    #[test]
    fn parses_vocabulary_and_rejects_others() {
        assert_eq!("begin".parse::<HmiSignal>(), Ok(HmiSignal::Begin));
        assert_eq!("end_valid\n".parse::<HmiSignal>(), Ok(HmiSignal::EndValid));
        assert_eq!("end_invalid".parse::<HmiSignal>(), Ok(HmiSignal::EndInvalid));
        assert_eq!("exit".parse::<HmiSignal>(), Ok(HmiSignal::Exit));
        assert!("pause".parse::<HmiSignal>().is_err());
    }

    #[test]
    fn begin_clears_observations_and_starts() {
        let (mut c, _, observe, events, _) = control();
        events.stop().set();
        events.interrupt().set();
        observe.try_put(1).unwrap();
        assert!(!c.handle(HmiSignal::Begin));
        assert!(observe.is_empty());
        assert_eq!(events.state(), SessionState::EpisodeActive);
    }

    #[test]
    fn repeated_end_valid_only_sets_countdown() {
        let (mut c, _, _, events, counters) = control();
        c.handle(HmiSignal::Begin);
        c.handle(HmiSignal::EndValid);
        c.handle(HmiSignal::EndValid);
        let snap = events.snapshot();
        assert!(snap.is_set(EventKind::Countdown));
        assert!(snap.is_set(EventKind::Start));
        assert!(!snap.is_set(EventKind::Stop));
        assert_eq!(counters.episodes(), 0);
    }

    #[test]
    fn end_invalid_interrupts_and_counts() {
        let (mut c, _, observe, events, counters) = control();
        c.handle(HmiSignal::Begin);
        observe.try_put(7).unwrap();
        c.handle(HmiSignal::EndInvalid);
        assert!(!events.start().is_set());
        assert!(events.interrupt().is_set());
        assert!(observe.is_empty());
        assert_eq!(counters.episodes(), 1);
    }

    #[test]
    fn begin_then_exit_terminates_worker() {
        let (mut c, hmi, _, events, counters) = control();
        hmi.try_put("begin".into()).unwrap();
        hmi.try_put("bogus".into()).unwrap();
        hmi.try_put("exit".into()).unwrap();
        let h = thread::spawn(move || c.run());
        h.join().unwrap();

        let snap = events.snapshot();
        assert!(!snap.is_set(EventKind::Start));
        assert!(snap.is_set(EventKind::Interrupt));
        assert!(snap.is_set(EventKind::Flash));
        assert!(snap.is_set(EventKind::Exit));
        assert!(snap.is_set(EventKind::Countdown));
        assert_eq!(counters.episodes(), 1);
    }
}
