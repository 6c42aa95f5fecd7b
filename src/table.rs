// src/table.rs
//
// =============================================================================
// RUNSCRIBE: TABULAR DATA
// =============================================================================
//
// A small labelled table (index + named columns) whose canonical text form is
// CSV: header = [index name or "", columns...], then one record per row with
// the index label first. `Table::to_csv` is the single source of truth for
// that form; the artifact helpers write exactly its bytes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::TableError;

/// One table value.
///
/// Text form of `Float` is Rust's shortest round-trip rendering: integral
/// values keep `.0` (`3.0`), very large or small magnitudes use exponent
/// notation (`1e20`, `1e-7`), infinities are `inf` / `-inf` and NaN is an
/// empty (missing) field. Every one of these parses back to the same `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Int(i) => write!(f, "{}", i),
            // NaN renders as a missing value.
            Cell::Float(x) if x.is_nan() => Ok(()),
            Cell::Float(x) => write!(f, "{:?}", x),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Int(v.into())
    }
}

impl From<usize> for Cell {
    fn from(v: usize) -> Self {
        Cell::Int(v as i64)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Cell::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub index_name: Option<String>,
    columns: Vec<String>,
    index: Vec<Cell>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Result<Self, TableError> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.as_str()) {
                return Err(TableError::DuplicateColumn(c.clone()));
            }
        }
        Ok(Self {
            index_name: None,
            columns,
            index: Vec::new(),
            rows: Vec::new(),
        })
    }

    /// Builds a table with a positional index `0..n`.
    pub fn from_rows<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Cell>>,
    ) -> Result<Self, TableError> {
        let mut table = Self::new(columns)?;
        for (i, row) in rows.into_iter().enumerate() {
            table.push_row(i, row)?;
        }
        Ok(table)
    }

    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    pub fn push_row(&mut self, label: impl Into<Cell>, cells: Vec<Cell>) -> Result<(), TableError> {
        if cells.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                row: self.rows.len(),
                got: cells.len(),
                expected: self.columns.len(),
            });
        }
        self.index.push(label.into());
        self.rows.push(cells);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    /// The canonical comma-separated serialization.
    pub fn to_csv(&self) -> Result<Vec<u8>, TableError> {
        let mut wtr = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        let header = std::iter::once(self.index_name.clone().unwrap_or_default())
            .chain(self.columns.iter().cloned());
        wtr.write_record(header)
            .map_err(|e| TableError::Csv(e.to_string()))?;

        for (label, row) in self.index.iter().zip(&self.rows) {
            let record = std::iter::once(label)
                .chain(row.iter())
                .map(|c| c.to_string());
            wtr.write_record(record)
                .map_err(|e| TableError::Csv(e.to_string()))?;
        }

        wtr.into_inner()
            .map_err(|e| TableError::Csv(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_index_and_quoting() {
        let mut t = Table::new(["num1", "num2", "char"]).unwrap();
        t.push_row(1, vec![1.into(), 2.into(), "a".into()]).unwrap();
        t.push_row(2, vec![2.into(), 4.5.into(), "b,c".into()]).unwrap();

        let csv = String::from_utf8(t.to_csv().unwrap()).unwrap();
        assert_eq!(csv, ",num1,num2,char\n1,1,2,a\n2,2,4.5,\"b,c\"\n");
    }

    #[test]
    fn missing_values_render_empty() {
        let t = Table::from_rows(
            ["x", "y"],
            vec![vec![Cell::Null, f64::NAN.into()], vec![Option::<i64>::None.into(), 3.0.into()]],
        )
        .unwrap()
        .with_index_name("step");

        let csv = String::from_utf8(t.to_csv().unwrap()).unwrap();
        assert_eq!(csv, "step,x,y\n0,,\n1,,3.0\n");
    }

    #[test]
    fn float_text_form_parses_back() {
        let cases = [
            (3.0, "3.0"),
            (0.25, "0.25"),
            (1e20, "1e20"),
            (1e-7, "1e-7"),
            (f64::INFINITY, "inf"),
            (f64::NEG_INFINITY, "-inf"),
        ];
        for (x, text) in cases {
            assert_eq!(Cell::Float(x).to_string(), text);
            assert_eq!(text.parse::<f64>().unwrap(), x);
        }
        assert_eq!(Cell::Float(f64::NAN).to_string(), "");
    }

    #[test]
    fn rejects_ragged_rows_and_duplicate_columns() {
        assert_eq!(
            Table::new(["a", "a"]).unwrap_err(),
            TableError::DuplicateColumn("a".into())
        );
        let mut t = Table::new(["a", "b"]).unwrap();
        assert!(matches!(
            t.push_row(0, vec![1.into()]),
            Err(TableError::RowWidth { got: 1, expected: 2, .. })
        ));
        assert_eq!(t.shape(), (0, 2));
    }
}
