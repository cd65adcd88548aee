//! torque_table.rs
//! Torque map grid and the bounded update applied before every flash.
//!
//! Rows are operating-point (speed) buckets, columns are pedal positions.
//! Values are stored row-major. A `TableDelta` carries normalised changes for a
//! subset of rows; `apply_delta` turns it into absolute torque, clips it to the
//! safety envelope around the default table and overwrites only those rows.

use std::{fs::File, io::BufWriter, path::Path};

use crate::error::TableError;

/// Index name written in the first header cell.
pub const ROW_INDEX_NAME: &str = "speed";

/// Speed buckets (km/h) of the built-in map.
const DEFAULT_SPEED_BUCKETS: [f64; 14] = [
    0.0, 7.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 50.0, 60.0, 70.0, 80.0, 100.0,
];
/// Pedal positions (0..1) of the built-in map.
const DEFAULT_PEDAL_STEPS: [f64; 17] = [
    0.0, 0.02, 0.04, 0.08, 0.12, 0.16, 0.2, 0.24, 0.28, 0.32, 0.38, 0.44, 0.5, 0.62, 0.74, 0.86, 1.0,
];
const DEFAULT_PEAK_TORQUE: f64 = 1800.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TorqueTable {
    speeds: Vec<f64>,
    pedals: Vec<f64>,
    values: Vec<f64>,
}

impl TorqueTable {
    pub fn new(speeds: Vec<f64>, pedals: Vec<f64>, values: Vec<f64>) -> Result<Self, TableError> {
        if speeds.is_empty() || pedals.is_empty() {
            return Err(TableError::EmptyTable);
        }
        if values.len() != speeds.len() * pedals.len() {
            return Err(TableError::FlatLength {
                got: values.len(),
                rows: speeds.len(),
                cols: pedals.len(),
            });
        }
        Ok(Self { speeds, pedals, values })
    }

    /// Factory calibration used when there is no table file: torque grows with
    /// pedal and tapers slightly with speed.
    pub fn builtin_default() -> Self {
        let rows = DEFAULT_SPEED_BUCKETS.len();
        let mut values = Vec::with_capacity(rows * DEFAULT_PEDAL_STEPS.len());
        for (r, _) in DEFAULT_SPEED_BUCKETS.iter().enumerate() {
            let taper = 1.0 - 0.03 * r as f64;
            for pedal in DEFAULT_PEDAL_STEPS {
                values.push((DEFAULT_PEAK_TORQUE * pedal * taper).round());
            }
        }
        Self {
            speeds: DEFAULT_SPEED_BUCKETS.to_vec(),
            pedals: DEFAULT_PEDAL_STEPS.to_vec(),
            values,
        }
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.speeds.len(), self.pedals.len())
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }

    pub fn pedals(&self) -> &[f64] {
        &self.pedals
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let (rows, cols) = self.shape();
        (row < rows && col < cols).then(|| self.values[row * cols + col])
    }

    pub fn row(&self, row: usize) -> Option<&[f64]> {
        let cols = self.pedals.len();
        (row < self.speeds.len()).then(|| &self.values[row * cols..(row + 1) * cols])
    }

    fn check_row(&self, row: usize) -> Result<(), TableError> {
        if row >= self.speeds.len() {
            return Err(TableError::RowOutOfRange { row, rows: self.speeds.len() });
        }
        Ok(())
    }

    /// Copies of the requested rows, in request order.
    pub fn rows_subset(&self, rows: &[usize]) -> Result<Vec<Vec<f64>>, TableError> {
        rows.iter()
            .map(|&r| {
                self.check_row(r)?;
                Ok(self.row(r).map(<[f64]>::to_vec).unwrap_or_default())
            })
            .collect()
    }

    /// Overwrites the given rows; validates everything before touching the table.
    pub fn overwrite_rows(&mut self, rows: &[usize], values: &[Vec<f64>]) -> Result<(), TableError> {
        let cols = self.pedals.len();
        if rows.len() != values.len() {
            return Err(TableError::FlatLength {
                got: values.len(),
                rows: rows.len(),
                cols,
            });
        }
        for (&r, v) in rows.iter().zip(values) {
            self.check_row(r)?;
            if v.len() != cols {
                return Err(TableError::WidthMismatch { expected: cols, got: v.len() });
            }
        }
        for (&r, v) in rows.iter().zip(values) {
            self.values[r * cols..(r + 1) * cols].copy_from_slice(v);
        }
        Ok(())
    }

    /// Reads a table written by `write_csv_path`: first column is the speed index,
    /// header cells after the first are pedal positions.
    pub fn from_csv_path(path: &Path) -> Result<Self, TableError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| TableError::Format(e.to_string()))?;

        let headers = rdr.headers().map_err(|e| TableError::Format(e.to_string()))?.clone();
        let pedals = headers
            .iter()
            .skip(1)
            .map(|h| parse_cell(h, "pedal header"))
            .collect::<Result<Vec<f64>, _>>()?;

        let mut speeds = Vec::new();
        let mut values = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| TableError::Format(e.to_string()))?;
            let mut cells = record.iter();
            let speed = cells
                .next()
                .ok_or_else(|| TableError::Format("empty row".into()))?;
            speeds.push(parse_cell(speed, "speed index")?);
            let before = values.len();
            for cell in cells {
                values.push(parse_cell(cell, "torque value")?);
            }
            if values.len() - before != pedals.len() {
                return Err(TableError::WidthMismatch {
                    expected: pedals.len(),
                    got: values.len() - before,
                });
            }
        }
        Self::new(speeds, pedals, values)
    }

    pub fn write_csv_path(&self, path: &Path) -> Result<(), csv::Error> {
        let file = File::create(path)?;
        let mut wtr = csv::Writer::from_writer(BufWriter::new(file));

        let mut header = Vec::with_capacity(self.pedals.len() + 1);
        header.push(ROW_INDEX_NAME.to_string());
        header.extend(self.pedals.iter().map(|p| p.to_string()));
        wtr.write_record(&header)?;

        let cols = self.pedals.len();
        for (r, speed) in self.speeds.iter().enumerate() {
            let mut rec = Vec::with_capacity(cols + 1);
            rec.push(speed.to_string());
            rec.extend(self.values[r * cols..(r + 1) * cols].iter().map(|v| v.to_string()));
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn parse_cell(cell: &str, what: &str) -> Result<f64, TableError> {
    cell.trim()
        .parse::<f64>()
        .map_err(|_| TableError::Format(format!("bad {}: {:?}", what, cell)))
}

/// Normalised change for a subset of table rows, as produced by the learner.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDelta {
    pub rows: Vec<usize>,
    pub values: Vec<Vec<f64>>,
}

impl TableDelta {
    pub fn new(rows: Vec<usize>, values: Vec<Vec<f64>>) -> Self {
        Self { rows, values }
    }

    /// Assembles a delta from a flat action vector covering `row_count`
    /// contiguous rows starting at `start_row`, row-major.
    pub fn from_flat(line: &[f64], start_row: usize, row_count: usize, col_count: usize) -> Result<Self, TableError> {
        if line.len() != row_count * col_count {
            return Err(TableError::FlatLength {
                got: line.len(),
                rows: row_count,
                cols: col_count,
            });
        }
        let values = if col_count == 0 {
            vec![Vec::new(); row_count]
        } else {
            line.chunks(col_count).map(<[f64]>::to_vec).collect()
        };
        Ok(Self {
            rows: (start_row..start_row + row_count).collect(),
            values,
        })
    }
}

/// `reduced = delta * budget + default_rows`, clipped element-wise to
/// `[default - budget, default * upper_bound]`, written into `live` for the
/// delta's rows only. Nothing is written if the delta does not fit the table.
pub fn apply_delta(
    default: &TorqueTable,
    live: &mut TorqueTable,
    delta: &TableDelta,
    budget: f64,
    upper_bound: f64,
) -> Result<(), TableError> {
    let default_rows = default.rows_subset(&delta.rows)?;
    if delta.values.len() != default_rows.len() {
        return Err(TableError::FlatLength {
            got: delta.values.len(),
            rows: delta.rows.len(),
            cols: default.pedals.len(),
        });
    }

    let mut reduced = Vec::with_capacity(default_rows.len());
    for (d_row, def_row) in delta.values.iter().zip(&default_rows) {
        if d_row.len() != def_row.len() {
            return Err(TableError::WidthMismatch { expected: def_row.len(), got: d_row.len() });
        }
        let row: Vec<f64> = d_row
            .iter()
            .zip(def_row)
            .map(|(&d, &def)| clip(d * budget + def, def - budget, def * upper_bound))
            .collect();
        reduced.push(row);
    }

    live.overwrite_rows(&delta.rows, &reduced)
}

/// Lower bound first, then upper: with an inverted envelope the upper bound wins.
#[inline]
fn clip(v: f64, lower: f64, upper: f64) -> f64 {
    let v = if v.is_nan() || v < lower { lower } else { v };
    if v > upper { upper } else { v }
}
