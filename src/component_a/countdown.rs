//! countdown.rs
//! Episode-end grace period.
//!
//! `end_valid` only arms the countdown; this worker waits for it, lets in-flight
//! samples drain for the configured grace time, then performs the actual stop
//! and re-arms. `exit` is checked first on every wake, so setting `countdown`
//! after `exit` releases the worker without touching start/stop.

use std::{sync::Arc, thread, time::Duration};

use log::info;

use crate::component_a::{events::SessionEvents, pipeline::Pipeline};
use crate::utils::metrics::{SessionCounters, SessionEvent, SessionRecorder};

pub struct Countdown<O> {
    observe: Pipeline<O>,
    events: SessionEvents,
    counters: Arc<SessionCounters>,
    recorder: Option<SessionRecorder>,
    grace: Duration,
}

impl<O> Countdown<O> {
    pub fn new(
        observe: Pipeline<O>,
        events: SessionEvents,
        counters: Arc<SessionCounters>,
        recorder: Option<SessionRecorder>,
        grace: Duration,
    ) -> Self {
        Self { observe, events, counters, recorder, grace }
    }

    pub fn run(&mut self) {
        info!("[Countdown] countdown worker start");
        let exit = self.events.exit();
        let countdown = self.events.countdown();

        while !exit.is_set() {
            info!("[Countdown] wait for countdown");
            countdown.wait();
            if exit.is_set() {
                continue;
            }

            thread::sleep(self.grace);
            info!("[Countdown] finish countdown");

            self.events.start().clear();
            self.events.stop().set();
            self.observe.clear();
            let episode = self.counters.record_episode();
            if let Some(rec) = &self.recorder {
                rec.record(SessionEvent::EpisodeEnd { episode, valid: true });
            }
            info!("[Countdown] episode {} done", episode);
            countdown.clear();
        }
        info!("[Countdown] countdown worker dies");
    }
}
