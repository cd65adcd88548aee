//! Table persistence: the final live table at session end, and the resume /
//! default table at session start.
//!
//! Output: `<data_dir>/last_table_-<vid>-<pid>-<ISO8601>.csv`, timestamp in the
//! vehicle's UTC offset with microsecond precision.

use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::component_b::torque_table::TorqueTable;
use crate::error::SessionError;
use crate::utils::config::{Driver, SessionConfig, Vehicle};

pub const LAST_TABLE_PREFIX: &str = "last_table";

pub fn last_table_path(data_dir: &Path, vehicle: &Vehicle, driver: &Driver, now: DateTime<Utc>) -> PathBuf {
    let stamp = now
        .with_timezone(&vehicle.timezone())
        .format("%Y-%m-%dT%H:%M:%S%.6f%:z");
    data_dir.join(format!(
        "{}_-{}-{}-{}.csv",
        LAST_TABLE_PREFIX, vehicle.vid, driver.pid, stamp
    ))
}

/// Writes the live table; creates `data_dir` if needed. Returns the file written.
pub fn persist_live_table(
    table: &TorqueTable,
    data_dir: &Path,
    vehicle: &Vehicle,
    driver: &Driver,
) -> Result<PathBuf, SessionError> {
    create_dir_all(data_dir)?;
    let path = last_table_path(data_dir, vehicle, driver, Utc::now());
    table.write_csv_path(&path)?;
    info!("[Export] last table saved to {:?}", path);
    Ok(path)
}

/// Newest `last_table*.csv` in `data_dir` by modification time.
pub fn find_resume_table(data_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(data_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LAST_TABLE_PREFIX) && name.ends_with(".csv")
        })
        .map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        // ties broken by name; the timestamp in the name sorts chronologically
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, p)| p)
}

/// Where the session's default table came from.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Resumed(PathBuf),
    File(PathBuf),
    Builtin,
}

/// Resume table if `resume` is set and one exists, else the configured
/// default file, else the built-in calibration.
pub fn load_default_table(config: &SessionConfig) -> Result<(TorqueTable, TableSource), SessionError> {
    if config.resume {
        match find_resume_table(&config.data_dir) {
            Some(path) => {
                info!("[Export] resume last table {:?}", path);
                let table = TorqueTable::from_csv_path(&path)?;
                return Ok((table, TableSource::Resumed(path)));
            }
            None => warn!("[Export] no last table found, start from default calibration table"),
        }
    }
    match &config.default_table {
        Some(path) => {
            info!("[Export] use default calibration table {:?}", path);
            Ok((TorqueTable::from_csv_path(path)?, TableSource::File(path.clone())))
        }
        None => {
            info!("[Export] use built-in calibration table");
            Ok((TorqueTable::builtin_default(), TableSource::Builtin))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::{str_to_driver, str_to_vehicle};
    use chrono::TimeZone;

    #[test]
    fn filename_encodes_identity_and_local_time() {
        let vehicle = str_to_vehicle("VB7").unwrap();
        let driver = str_to_driver("li-wei").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 4, 5, 6).unwrap();
        let p = last_table_path(Path::new("/tmp/x"), &vehicle, &driver, now);
        assert_eq!(
            p.file_name().unwrap().to_string_lossy(),
            "last_table_-VB7-li-wei-2024-03-01T12:05:06.000000+08:00.csv"
        );
    }

    #[test]
    fn resume_picks_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("last_table_-VB7-li-wei-2024-01-01T00:00:00.000000+08:00.csv");
        let newer = dir.path().join("last_table_-VB7-li-wei-2024-02-01T00:00:00.000000+08:00.csv");
        let mut table = TorqueTable::builtin_default();
        table.write_csv_path(&older).unwrap();
        table.overwrite_rows(&[0], &[vec![1.0; 17]]).unwrap();
        table.write_csv_path(&newer).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let cfg = SessionConfig {
            resume: true,
            data_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let (loaded, source) = load_default_table(&cfg).unwrap();
        assert_eq!(source, TableSource::Resumed(newer));
        assert_eq!(loaded, table);
    }

    #[test]
    fn resume_without_files_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            resume: true,
            data_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let (loaded, source) = load_default_table(&cfg).unwrap();
        assert_eq!(source, TableSource::Builtin);
        assert_eq!(loaded, TorqueTable::builtin_default());
    }

    #[test]
    fn persist_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("runs").join("today");
        let vehicle = str_to_vehicle("MP2").unwrap();
        let driver = str_to_driver("wang-kai").unwrap();
        let path = persist_live_table(&TorqueTable::builtin_default(), &nested, &vehicle, &driver).unwrap();
        assert!(path.starts_with(&nested));
        assert!(path.to_string_lossy().contains("+00:00"));
        assert_eq!(TorqueTable::from_csv_path(&path).unwrap(), TorqueTable::builtin_default());
    }
}
