//! Session identity and tunables.
//!
//! `Vehicle`, `Driver` and `BusEndpoint` are fixed for a session. `SessionConfig`
//! carries the watchdog bounds, countdown, timeouts and storage paths; every
//! field has a default so a partial JSON file is enough.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SessionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub vid: String,
    pub vin: String,
    /// Controller address on the field bus.
    pub bus_address: u32,
    /// Absolute change budget applied to a normalised delta.
    pub torque_budget: f64,
    /// Upper clip as a multiple of the default table.
    pub torque_upper_bound: f64,
    pub utc_offset_secs: i32,
}

impl Vehicle {
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub pid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
}

const CST_OFFSET_SECS: i32 = 8 * 3600;

pub fn vehicle_registry() -> Vec<Vehicle> {
    vec![
        Vehicle {
            vid: "VB7".into(),
            vin: "HMZABAAH7MF011058".into(),
            bus_address: 0x630,
            torque_budget: 250.0,
            torque_upper_bound: 1.5,
            utc_offset_secs: CST_OFFSET_SECS,
        },
        Vehicle {
            vid: "VB6".into(),
            vin: "HMZABAAH6MF011057".into(),
            bus_address: 0x631,
            torque_budget: 200.0,
            torque_upper_bound: 1.2,
            utc_offset_secs: CST_OFFSET_SECS,
        },
        Vehicle {
            vid: "MP2".into(),
            vin: "HMZABAAH1NF014925".into(),
            bus_address: 0x632,
            torque_budget: 300.0,
            torque_upper_bound: 1.3,
            utc_offset_secs: 0,
        },
    ]
}

pub fn driver_registry() -> Vec<Driver> {
    vec![
        Driver { pid: "wang-kai".into(), name: "Wang Kai".into() },
        Driver { pid: "li-wei".into(), name: "Li Wei".into() },
        Driver { pid: "test-driver".into(), name: "Rig Operator".into() },
    ]
}

pub fn bus_registry() -> Vec<BusEndpoint> {
    vec![
        BusEndpoint { name: "can_intra".into(), host: "10.0.64.78".into(), port: 5000 },
        BusEndpoint { name: "can_cloud".into(), host: "10.10.0.6".into(), port: 30865 },
        BusEndpoint { name: "can_local".into(), host: "127.0.0.1".into(), port: 5000 },
    ]
}

/// 17 characters, ASCII alphanumeric, none of I/O/Q.
pub fn is_vin(s: &str) -> bool {
    s.len() == 17
        && s.chars()
            .all(|c| c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, 'I' | 'O' | 'Q')))
}

/// Resolve a vehicle by VIN or by short id (e.g. "VB7").
pub fn str_to_vehicle(key: &str) -> Result<Vehicle, ConfigError> {
    let registry = vehicle_registry();
    if is_vin(key) {
        registry
            .into_iter()
            .find(|v| v.vin == key)
            .ok_or_else(|| ConfigError::UnknownVin(key.to_string()))
    } else {
        registry
            .into_iter()
            .find(|v| v.vid == key)
            .ok_or_else(|| ConfigError::UnknownVehicle(key.to_string()))
    }
}

/// Drivers are keyed `first-last`, lowercase.
pub fn str_to_driver(key: &str) -> Result<Driver, ConfigError> {
    let well_formed = key
        .split_once('-')
        .map(|(a, b)| {
            let part = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase());
            part(a) && part(b)
        })
        .unwrap_or(false);
    if !well_formed {
        return Err(ConfigError::InvalidDriver(key.to_string()));
    }
    driver_registry()
        .into_iter()
        .find(|d| d.pid == key)
        .ok_or_else(|| ConfigError::UnknownDriver(key.to_string()))
}

/// Resolve a bus endpoint by name, or by `host[:port]`.
pub fn str_to_bus_endpoint(key: &str) -> Result<BusEndpoint, ConfigError> {
    let registry = bus_registry();
    if let Some(ep) = registry.iter().find(|e| e.name == key) {
        return Ok(ep.clone());
    }
    let host = key.split(':').next().unwrap_or(key);
    registry
        .into_iter()
        .find(|e| e.host == host)
        .ok_or_else(|| ConfigError::UnknownBusEndpoint(key.to_string()))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "secs")]
    pub watchdog_nap: Duration,
    pub capture_error_upper_bound: u64,
    pub flash_error_upper_bound: u64,
    /// Grace period between `end_valid` and the actual stop.
    #[serde(with = "secs")]
    pub episode_countdown: Duration,
    /// Bounded wait for HMI and flash pipeline gets.
    #[serde(with = "secs")]
    pub pipeline_timeout: Duration,
    pub resume: bool,
    pub data_dir: PathBuf,
    pub default_table: Option<PathBuf>,
    pub recorder: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watchdog_nap: Duration::from_secs(60),
            capture_error_upper_bound: 100,
            flash_error_upper_bound: 20,
            episode_countdown: Duration::from_secs(3),
            pipeline_timeout: Duration::from_secs(3),
            resume: false,
            data_dir: PathBuf::from("data"),
            default_table: None,
            recorder: true,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(text: &str) -> Result<Self, SessionError> {
        let cfg: SessionConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SessionError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_nap.is_zero() {
            return Err(ConfigError::Invalid("watchdog_nap must be positive".into()));
        }
        if self.pipeline_timeout.is_zero() {
            return Err(ConfigError::Invalid("pipeline_timeout must be positive".into()));
        }
        Ok(())
    }
}
