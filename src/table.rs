//! Named matrices and their CSV form.
//!
//! The CSV layout matches a pandas `DataFrame.to_csv()` with a named index: the header
//! is an empty cell followed by the column names, every following line is a row name
//! followed by its values.
//!
//! ```text
//! ,sample_0,sample_1
//! sample_0,0.0,1.25
//! ```

use std::fmt;
use std::fs::File;
use std::path::Path;

use ndarray::{Array2, ArrayView2};
use tracing::{debug, instrument};

use crate::{Error, Result};

/// An `N × M` matrix with row and column names.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    row_names: Vec<String>,
    col_names: Vec<String>,
    values: Array2<f64>,
}

impl LabeledMatrix {
    /// Pair `values` with names.
    ///
    /// Returns [`Error::ShapeMismatch`] when the name counts disagree with the shape.
    pub fn new(
        row_names: Vec<String>,
        col_names: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self> {
        let (n, m) = values.dim();
        if row_names.len() != n || col_names.len() != m {
            return Err(Error::ShapeMismatch(row_names.len(), col_names.len(), n, m));
        }
        Ok(Self {
            row_names,
            col_names,
            values,
        })
    }

    pub(crate) fn from_f32(
        row_names: &[String],
        col_names: &[String],
        values: ArrayView2<'_, f32>,
    ) -> Self {
        Self {
            row_names: row_names.to_vec(),
            col_names: col_names.to_vec(),
            values: values.mapv(f64::from),
        }
    }

    pub(crate) fn from_f64(
        row_names: &[String],
        col_names: &[String],
        values: ArrayView2<'_, f64>,
    ) -> Self {
        Self {
            row_names: row_names.to_vec(),
            col_names: col_names.to_vec(),
            values: values.to_owned(),
        }
    }

    /// Row names (sources).
    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    /// Column names (targets).
    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }

    /// The values.
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Value at `(row, col)`. Panics when out of range.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[[row, col]]
    }

    /// Value addressed by names.
    pub fn get_by_name(&self, row: &str, col: &str) -> Option<f64> {
        let i = self.row_names.iter().position(|r| r == row)?;
        let j = self.col_names.iter().position(|c| c == col)?;
        Some(self.values[[i, j]])
    }

    /// Serialize as CSV into any writer.
    pub fn write_csv_to<W: std::io::Write>(
        &self,
        writer: W,
    ) -> std::result::Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = Vec::with_capacity(self.col_names.len() + 1);
        header.push(String::new());
        header.extend(self.col_names.iter().cloned());
        wtr.write_record(&header)?;
        for (name, row) in self.row_names.iter().zip(self.values.rows()) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(name.clone());
            record.extend(row.iter().map(|v| format_value(*v)));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the CSV to `path`, replacing any existing file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.write_csv_to(file).map_err(|e| Error::Csv {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(rows = self.row_names.len(), cols = self.col_names.len(), "table written");
        Ok(())
    }

    /// The CSV text, as [`write_csv_to`](Self::write_csv_to) would write it.
    pub fn to_csv_string(&self) -> std::result::Result<String, csv::Error> {
        let mut buf = Vec::new();
        self.write_csv_to(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Shortest representation that round-trips, always with a decimal point.
fn format_value(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

impl fmt::Display for LabeledMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .row_names
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0);
        write!(f, "{:width$}", "", width = width)?;
        for c in &self.col_names {
            write!(f, "  {:>12}", c)?;
        }
        writeln!(f)?;
        for (name, row) in self.row_names.iter().zip(self.values.rows()) {
            write!(f, "{:width$}", name, width = width)?;
            for v in row {
                write!(f, "  {:>12.6}", v)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn csv_matches_pandas_layout() {
        let values = array![[0.0, 1.25], [2.0, 0.5]];
        let t = LabeledMatrix::new(names("s", 2), names("t", 2), values).unwrap();
        assert_eq!(t.to_csv_string().unwrap(), ",t0,t1\ns0,0.0,1.25\ns1,2.0,0.5\n");
    }

    #[test]
    fn new_rejects_wrong_name_count() {
        let err =
            LabeledMatrix::new(names("s", 1), names("t", 2), Array2::zeros((2, 2))).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(1, 2, 2, 2)));
    }

    #[test]
    fn lookup_by_name() {
        let values = Array2::from_elem((2, 3), 4.0);
        let t = LabeledMatrix::new(names("s", 2), names("t", 3), values).unwrap();
        assert_eq!(t.get_by_name("s1", "t2"), Some(4.0));
        assert_eq!(t.get_by_name("s9", "t2"), None);
    }

    #[test]
    fn write_csv_overwrites_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("otd.csv");
        let a = LabeledMatrix::new(names("s", 1), names("t", 1), array![[1.0]]).unwrap();
        let b = LabeledMatrix::new(names("s", 1), names("t", 1), array![[3.5]]).unwrap();
        a.write_csv(&path).unwrap();
        b.write_csv(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), ",t0\ns0,3.5\n");
    }

    #[test]
    fn write_csv_into_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("otd.csv");
        let t = LabeledMatrix::new(names("s", 1), names("t", 1), array![[1.0]]).unwrap();
        assert!(matches!(t.write_csv(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn display_lists_every_name() {
        let values = Array2::zeros((2, 1));
        let t = LabeledMatrix::new(names("src", 2), names("tgt", 1), values).unwrap();
        let s = t.to_string();
        assert!(s.contains("src0") && s.contains("src1") && s.contains("tgt0"));
    }
}
