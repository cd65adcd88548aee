//! events.rs
//! Session event register: six level-triggered flags behind one lock.
//!
//! Every worker still talks in terms of individual flags (`set`, `clear`,
//! `is_set`, `wait`), but all six bits live in a single register guarded by one
//! mutex, and every mutation wakes one condition variable. A snapshot therefore
//! sees all flags at the same instant, and `SessionState` derived from it is the
//! one authoritative view of the session. Loops that used to spin on the flags
//! block in `wait_until` instead.

use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use crate::component_a::pipeline::{deadline_after, wait_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Stop,
    Interrupt,
    Countdown,
    Exit,
    Flash,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Start,
        EventKind::Stop,
        EventKind::Interrupt,
        EventKind::Countdown,
        EventKind::Exit,
        EventKind::Flash,
    ];

    #[inline]
    fn bit(self) -> u8 {
        match self {
            EventKind::Start => 1 << 0,
            EventKind::Stop => 1 << 1,
            EventKind::Interrupt => 1 << 2,
            EventKind::Countdown => 1 << 3,
            EventKind::Exit => 1 << 4,
            EventKind::Flash => 1 << 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Interrupt => "interrupt",
            EventKind::Countdown => "countdown",
            EventKind::Exit => "exit",
            EventKind::Flash => "flash",
        }
    }
}

/// Session phase derived from one consistent snapshot of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    EpisodeActive,
    CountingDown,
    Interrupted,
    Terminated,
}

/// All six flags read at one instant.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSnapshot(u8);

impl EventSnapshot {
    #[inline]
    pub fn is_set(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Flash worker may pull a table delta: episode running, not interrupted, not stopped.
    #[inline]
    pub fn flash_ready(self) -> bool {
        self.is_set(EventKind::Start)
            && !self.is_set(EventKind::Interrupt)
            && !self.is_set(EventKind::Stop)
    }

    pub fn state(self) -> SessionState {
        if self.is_set(EventKind::Exit) {
            SessionState::Terminated
        } else if self.is_set(EventKind::Interrupt) {
            SessionState::Interrupted
        } else if self.is_set(EventKind::Start) && self.is_set(EventKind::Countdown) {
            SessionState::CountingDown
        } else if self.is_set(EventKind::Start) && !self.is_set(EventKind::Stop) {
            SessionState::EpisodeActive
        } else {
            SessionState::Idle
        }
    }
}

impl fmt::Debug for EventSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<&str> = EventKind::ALL
            .iter()
            .filter(|k| self.is_set(**k))
            .map(|k| k.name())
            .collect();
        write!(f, "EventSnapshot{:?}", set)
    }
}

struct Register {
    bits: Mutex<u8>,
    changed: Condvar,
}

impl Register {
    fn update(&self, kind: EventKind, on: bool) {
        let mut bits = self.bits.lock();
        let before = *bits;
        if on {
            *bits |= kind.bit();
        } else {
            *bits &= !kind.bit();
        }
        if *bits != before {
            self.changed.notify_all();
        }
    }
}

/// Shared handle to the session's event register. Cheap to clone.
#[derive(Clone)]
pub struct SessionEvents {
    register: Arc<Register>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvents {
    pub fn new() -> Self {
        Self {
            register: Arc::new(Register {
                bits: Mutex::new(0),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn flag(&self, kind: EventKind) -> EventFlag {
        EventFlag {
            register: self.register.clone(),
            kind,
        }
    }

    pub fn start(&self) -> EventFlag {
        self.flag(EventKind::Start)
    }

    pub fn stop(&self) -> EventFlag {
        self.flag(EventKind::Stop)
    }

    pub fn interrupt(&self) -> EventFlag {
        self.flag(EventKind::Interrupt)
    }

    pub fn countdown(&self) -> EventFlag {
        self.flag(EventKind::Countdown)
    }

    pub fn exit(&self) -> EventFlag {
        self.flag(EventKind::Exit)
    }

    pub fn flash(&self) -> EventFlag {
        self.flag(EventKind::Flash)
    }

    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot(*self.register.bits.lock())
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state()
    }

    /// Blocks until `pred` holds for a snapshot or `timeout` passes.
    /// Returns the last snapshot seen either way.
    pub fn wait_until<F>(&self, mut pred: F, timeout: Duration) -> EventSnapshot
    where
        F: FnMut(EventSnapshot) -> bool,
    {
        let deadline = deadline_after(timeout);
        let mut bits = self.register.bits.lock();
        while !pred(EventSnapshot(*bits)) {
            if wait_deadline(&self.register.changed, &mut bits, deadline) {
                break;
            }
        }
        EventSnapshot(*bits)
    }

    /// Clears every flag, for a fresh session.
    pub fn reset(&self) {
        let mut bits = self.register.bits.lock();
        if *bits != 0 {
            *bits = 0;
            self.register.changed.notify_all();
        }
    }
}

/// One flag of the register.
#[derive(Clone)]
pub struct EventFlag {
    register: Arc<Register>,
    kind: EventKind,
}

impl EventFlag {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn set(&self) {
        self.register.update(self.kind, true);
    }

    pub fn clear(&self) {
        self.register.update(self.kind, false);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.register.bits.lock() & self.kind.bit() != 0
    }

    /// Blocks until the flag is set.
    pub fn wait(&self) {
        let mut bits = self.register.bits.lock();
        while *bits & self.kind.bit() == 0 {
            self.register.changed.wait(&mut bits);
        }
    }

    /// Blocks until the flag is set or `timeout` passes; true if set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut bits = self.register.bits.lock();
        while *bits & self.kind.bit() == 0 {
            if wait_deadline(&self.register.changed, &mut bits, deadline) {
                return *bits & self.kind.bit() != 0;
            }
        }
        true
    }
}

impl fmt::Debug for EventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFlag")
            .field("kind", &self.kind)
            .field("set", &self.is_set())
            .finish()
    }
}
