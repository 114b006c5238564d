//! The sparse remapping matrix: `(src_gidx, dst_gidx, weight)` triples
//! loaded from a weight file.
//!
//! Reading the actual ESMF-produced NetCDF file is out of this crate's
//! scope; [`WeightFileReader`] is the seam a caller plugs a real
//! NetCDF binding into. [`CsvWeightReader`] is the shipped default, reading
//! a 3-column `col,row,S` CSV sidecar, grounded on `nhubbard-ironbeam`'s
//! optional `io-csv` backend.

use std::path::{Path, PathBuf};

use crate::error::{CouplerError, ErrorContext, Result};

/// One entry of the sparse remapping matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightEntry {
    pub src_gidx: u64,
    pub dst_gidx: u64,
    pub weight: f64,
}

/// Reads the three equal-length `col`/`row`/`S` arrays from a weight file.
/// Implementations should fail with [`CouplerError::Io`] if the file is
/// missing or unreadable, and [`CouplerError::Format`] if the expected
/// variables are missing or of mismatched length.
pub trait WeightFileReader {
    fn read(&self, path: &Path) -> Result<(Vec<u64>, Vec<u64>, Vec<f64>)>;
}

/// Reads a weight file as 3-column CSV: `col,row,S` (no header).
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvWeightReader;

impl WeightFileReader for CsvWeightReader {
    fn read(&self, path: &Path) -> Result<(Vec<u64>, Vec<u64>, Vec<f64>)> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(|e| {
                CouplerError::io(format!("cannot open weight file '{}': {e}", path.display()))
            })?;

        let mut col = Vec::new();
        let mut row = Vec::new();
        let mut s = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() != 3 {
                return Err(CouplerError::format(format!(
                    "weight file '{}': expected 3 columns (col,row,S), found {}",
                    path.display(),
                    record.len()
                )));
            }
            let parse_u64 = |field: &str| {
                field.parse::<u64>().map_err(|e| {
                    CouplerError::format(format!(
                        "weight file '{}': invalid index '{field}': {e}",
                        path.display()
                    ))
                })
            };
            let parse_f64 = |field: &str| {
                field.parse::<f64>().map_err(|e| {
                    CouplerError::format(format!(
                        "weight file '{}': invalid weight '{field}': {e}",
                        path.display()
                    ))
                })
            };
            col.push(parse_u64(&record[0])?);
            row.push(parse_u64(&record[1])?);
            s.push(parse_f64(&record[2])?);
        }
        Ok((col, row, s))
    }
}

/// A loaded `(src -> dst)` weight table, scoped to a single `RouteBuilder`
/// pass.
pub struct WeightTable {
    entries: Vec<WeightEntry>,
}

impl WeightTable {
    /// Builds the conventional path `<cfg_dir>/<src>_to_<dst>_rmp.<ext>`
    ///.
    pub fn path_for(cfg_dir: &Path, src_grid: &str, dst_grid: &str, ext: &str) -> PathBuf {
        cfg_dir.join(format!("{src_grid}_to_{dst_grid}_rmp.{ext}"))
    }

    /// Loads a weight table with the given reader. `IOError` if the file
    /// cannot be opened; `FormatError` if the arrays are missing or of
    /// mismatched length.
    pub fn load(path: &Path, reader: &dyn WeightFileReader) -> Result<Self> {
        let (col, row, s) = reader.read(path)?;
        if col.len() != row.len() || col.len() != s.len() {
            return Err(CouplerError::format(format!(
                "weight file '{}': col/row/S arrays have mismatched lengths ({}, {}, {})",
                path.display(),
                col.len(),
                row.len(),
                s.len()
            ))
            .with_context(ErrorContext::default()));
        }
        let entries = col
            .into_iter()
            .zip(row)
            .zip(s)
            .map(|((src_gidx, dst_gidx), weight)| WeightEntry {
                src_gidx,
                dst_gidx,
                weight,
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightEntry> {
        self.entries.iter()
    }
}
