//! error.rs
//! Error types for the vehicle interface.
//!
//! Each concern owns a small enum; `SessionError` folds them together for the
//! orchestrator and the binary. Pipeline timeouts are *not* session errors,
//! loops treat them as "nothing arrived yet" and re-check `exit`.

use thiserror::Error;

/// Bounded pipeline outcomes that are not a delivered item.
#[derive(Error, Debug)]
pub enum PipelineError<T> {
    #[error("pipeline get timed out")]
    Timeout,

    #[error("pipeline is empty")]
    Empty,

    /// Put timed out; the rejected item is handed back to the caller.
    #[error("pipeline is full")]
    Full(T),

    #[error("pipeline disconnected")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("row index {row} out of range (table has {rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("row width mismatch: expected {expected} columns, got {got}")]
    WidthMismatch { expected: usize, got: usize },

    #[error("flat table length {got} does not match {rows}x{cols}")]
    FlatLength { got: usize, rows: usize, cols: usize },

    #[error("table has no rows or no columns")]
    EmptyTable,

    #[error("bad table csv: {0}")]
    Format(String),
}

/// Hardware-fault signal raised by the actuator, carrying the controller's error code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("hardware fault {code}: {}", describe_code(.code))]
pub struct HardwareFault {
    pub code: u8,
}

impl HardwareFault {
    /// Communication timeout on the calibration protocol. The only recoverable code.
    pub const XCP_TIMEOUT: u8 = 4;

    pub fn new(code: u8) -> Self {
        Self { code }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code == Self::XCP_TIMEOUT
    }

    pub fn describe(&self) -> &'static str {
        describe_code(&self.code)
    }
}

fn describe_code(code: &u8) -> &'static str {
    match *code {
        0 => "success",
        1 => "bus send failure",
        2 => "invalid controller response",
        3 => "calibration download failure",
        HardwareFault::XCP_TIMEOUT => "xcp timeout",
        5 => "controller not ready",
        _ => "unknown fault",
    }
}

#[derive(Error, Debug, Clone)]
pub enum FlashError {
    #[error(transparent)]
    Hardware(#[from] HardwareFault),

    /// Anything the actuator raises that is not a classified hardware fault.
    #[error("unexpected actuator failure: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no vehicle with VIN {0}")]
    UnknownVin(String),

    #[error("no vehicle with id {0}")]
    UnknownVehicle(String),

    #[error("invalid driver string: {0}")]
    InvalidDriver(String),

    #[error("no driver with id {0}")]
    UnknownDriver(String),

    #[error("bus endpoint not found: {0}")]
    UnknownBusEndpoint(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("fatal flash fault: {0}")]
    FatalFlash(FlashError),

    #[error("initial flash failed: {0}")]
    InitialFlash(FlashError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{worker} worker failed: {reason}")]
    Worker { worker: &'static str, reason: String },

    #[error("{0} worker panicked")]
    WorkerPanic(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn worker(worker: &'static str, reason: impl Into<String>) -> Self {
        SessionError::Worker { worker, reason: reason.into() }
    }
}
