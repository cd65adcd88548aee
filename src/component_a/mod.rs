// Component A: capture and coordination
// Bounded pipelines between the workers, the event register every loop watches,
// and the three control loops that drive it (HMI, countdown, watchdog).

pub mod pipeline;
pub mod events;
pub mod hmi;
pub mod countdown;
pub mod watchdog;
