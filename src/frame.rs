use std::collections::HashMap;

use crate::error::PipelineError;

/// In-memory tabular block. Every cell is an optional string; typed
/// interpretation is left to downstream consumers. Column order is
/// insertion order and is preserved by every operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Option<String>>>,
}

impl Frame {
    pub fn new<S: Into<String>>(columns: Vec<S>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            columns,
            index,
            rows: Vec::new(),
        }
    }

    /// Build a frame from loose records, taking the column set as the union
    /// of all record keys in first-seen order.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a [(String, String)]>,
    {
        let mut frame = Frame::default();
        for record in records {
            frame.push_record(record);
        }
        frame
    }

    pub fn push_record(&mut self, record: &[(String, String)]) {
        for (key, _) in record {
            self.ensure_column(key);
        }
        let mut row = vec![None; self.columns.len()];
        for (key, value) in record {
            let pos = self.index[key];
            row[pos] = Some(value.clone());
        }
        // Rows pushed before a later column widening are padded lazily on read.
        self.rows.push(row);
    }

    fn ensure_column(&mut self, name: &str) {
        if !self.index.contains_key(name) {
            self.index.insert(name.to_string(), self.columns.len());
            self.columns.push(name.to_string());
        }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<(), PipelineError> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::IncompatibleUnion(format!(
                "row width {} does not match {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let pos = *self.index.get(column)?;
        self.rows.get(row)?.get(pos)?.as_deref()
    }

    /// Cells of one row in column order, padded with nulls if the row was
    /// pushed before later columns appeared.
    pub fn row(&self, row: usize) -> Vec<Option<&str>> {
        let mut out = vec![None; self.columns.len()];
        if let Some(cells) = self.rows.get(row) {
            for (i, cell) in cells.iter().enumerate() {
                out[i] = cell.as_deref();
            }
        }
        out
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = Vec<Option<&str>>> {
        (0..self.rows.len()).map(|i| self.row(i))
    }

    /// New frame with exactly `columns`, null-filled where this frame has no
    /// such column. Used to align shards onto a unioned schema.
    pub fn reindex(&self, columns: &[String]) -> Frame {
        let mut out = Frame::new(columns.to_vec());
        for row_idx in 0..self.rows.len() {
            let row = columns
                .iter()
                .map(|name| self.get(row_idx, name).map(str::to_string))
                .collect();
            out.rows.push(row);
        }
        out
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), PipelineError> {
        let Some(pos) = self.index.remove(from) else {
            return Err(PipelineError::IncompatibleUnion(format!(
                "cannot rename missing column '{from}'"
            )));
        };
        self.columns[pos] = to.to_string();
        self.index.insert(to.to_string(), pos);
        Ok(())
    }

    /// Append `other`'s rows, widening the column set to the union.
    pub fn vstack(&mut self, other: &Frame) {
        for name in &other.columns {
            self.ensure_column(name);
        }
        for row_idx in 0..other.rows.len() {
            let row = self
                .columns
                .iter()
                .map(|name| other.get(row_idx, name).map(str::to_string))
                .collect();
            self.rows.push(row);
        }
    }

    /// Overwrite or insert a column with one value per existing row.
    pub fn set_column(&mut self, name: &str, values: Vec<Option<String>>) {
        self.ensure_column(name);
        let pos = self.index[name];
        for (row, value) in self.rows.iter_mut().zip(values) {
            if row.len() <= pos {
                row.resize(pos + 1, None);
            }
            row[pos] = value;
        }
    }

    /// Replace nulls in one column with a constant.
    pub fn fill_null_column(&mut self, name: &str, value: &str) {
        let Some(&pos) = self.index.get(name) else {
            return;
        };
        for row in &mut self.rows {
            if row.len() <= pos {
                row.resize(pos + 1, None);
            }
            if row[pos].is_none() {
                row[pos] = Some(value.to_string());
            }
        }
    }

    /// Replace nulls in every column with a constant.
    pub fn fill_null(&mut self, value: &str) {
        let width = self.columns.len();
        for row in &mut self.rows {
            row.resize(width, None);
            for cell in row.iter_mut() {
                if cell.is_none() {
                    *cell = Some(value.to_string());
                }
            }
        }
    }

    /// Turn every cell matching one of the sentinel strings into a null.
    pub fn null_sentinels(&mut self, sentinels: &[String]) {
        if sentinels.is_empty() {
            return;
        }
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                if let Some(value) = cell {
                    if sentinels.iter().any(|sentinel| sentinel == value) {
                        *cell = None;
                    }
                }
            }
        }
    }

    /// Fill nulls positionally from `other`'s same-named columns. Rows past
    /// the end of `other` stay null.
    pub fn fill_null_from(&mut self, other: &Frame) {
        for (pos, name) in self.columns.clone().iter().enumerate() {
            if !other.has_column(name) {
                continue;
            }
            for (row_idx, row) in self.rows.iter_mut().enumerate() {
                if row.len() <= pos {
                    row.resize(pos + 1, None);
                }
                if row[pos].is_none() {
                    row[pos] = other.get(row_idx, name).map(str::to_string);
                }
            }
        }
    }

    pub fn column_values(&self, name: &str) -> Vec<Option<&str>> {
        (0..self.rows.len())
            .map(|row| self.get(row, name))
            .collect()
    }
}
