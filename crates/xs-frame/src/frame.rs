//! In-memory columnar event table.

use std::collections::HashMap;

use crate::error::{FrameError, Result};

/// Variable-length per-event vectors stored flat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JaggedColumn {
    /// All values across all events.
    values: Vec<f64>,
    /// Event boundaries: `offsets.len() == n_rows + 1`.
    offsets: Vec<usize>,
}

impl JaggedColumn {
    /// Build from flat values and event boundaries.
    pub fn new(values: Vec<f64>, offsets: Vec<usize>) -> Result<Self> {
        if offsets.first() != Some(&0) {
            return Err(FrameError::Shape("jagged offsets must start at 0".into()));
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(FrameError::Shape("jagged offsets must be non-decreasing".into()));
        }
        if offsets.last() != Some(&values.len()) {
            return Err(FrameError::Shape(format!(
                "jagged offsets end at {:?} but there are {} values",
                offsets.last(),
                values.len()
            )));
        }
        Ok(Self { values, offsets })
    }

    /// Build from one vector per event.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Self {
        let mut values = Vec::new();
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        offsets.push(0);
        for r in rows {
            values.extend_from_slice(r.as_ref());
            offsets.push(values.len());
        }
        Self { values, offsets }
    }

    /// Number of events.
    pub fn n_rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Vector of event `row`.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[self.offsets[row]..self.offsets[row + 1]]
    }

    /// Element `index` of event `row`, `None` when the vector is too short.
    pub fn get(&self, row: usize, index: usize) -> Option<f64> {
        self.row(row).get(index).copied()
    }
}

/// Named scalar and jagged columns sharing one event count.
#[derive(Debug, Clone, Default)]
pub struct EventFrame {
    n_rows: Option<usize>,
    scalars: HashMap<String, Vec<f64>>,
    jagged: HashMap<String, JaggedColumn>,
}

impl EventFrame {
    /// Empty frame; the first inserted column fixes the event count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`EventFrame::insert_column`].
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.insert_column(name, values)?;
        Ok(self)
    }

    /// Builder form of [`EventFrame::insert_jagged`].
    pub fn with_jagged(mut self, name: impl Into<String>, column: JaggedColumn) -> Result<Self> {
        self.insert_jagged(name, column)?;
        Ok(self)
    }

    /// Insert or replace a scalar column.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        self.check_rows(&name, values.len())?;
        self.jagged.remove(&name);
        self.scalars.insert(name, values);
        Ok(())
    }

    /// Insert or replace a jagged column.
    pub fn insert_jagged(&mut self, name: impl Into<String>, column: JaggedColumn) -> Result<()> {
        let name = name.into();
        self.check_rows(&name, column.n_rows())?;
        self.scalars.remove(&name);
        self.jagged.insert(name, column);
        Ok(())
    }

    fn check_rows(&mut self, name: &str, n: usize) -> Result<()> {
        match self.n_rows {
            Some(expected) if expected != n => Err(FrameError::Shape(format!(
                "column '{name}' has {n} rows, frame has {expected}"
            ))),
            _ => {
                self.n_rows = Some(n);
                Ok(())
            }
        }
    }

    /// Number of events.
    pub fn n_rows(&self) -> usize {
        self.n_rows.unwrap_or(0)
    }

    /// Scalar column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.scalars.get(name).map(Vec::as_slice)
    }

    /// Scalar column by name, or [`FrameError::MissingColumn`].
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.column(name).ok_or_else(|| FrameError::MissingColumn(name.to_string()))
    }

    /// Jagged column by name.
    pub fn jagged(&self, name: &str) -> Option<&JaggedColumn> {
        self.jagged.get(name)
    }

    /// Whether a scalar or jagged column called `name` exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.scalars.contains_key(name) || self.jagged.contains_key(name)
    }

    /// All column names, sorted.
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.scalars.keys().chain(self.jagged.keys()).map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
