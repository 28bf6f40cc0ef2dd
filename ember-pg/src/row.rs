//! Owned row abstraction for query results.

use crate::codec::ColumnDesc;
use crate::error::{PgError, PgResult};

/// A row returned from a query: column descriptions plus raw text values.
#[derive(Debug)]
pub struct Row {
    columns: Vec<ColumnDesc>,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(columns: Vec<ColumnDesc>, values: Vec<Option<Vec<u8>>>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get a column as a string slice (text representation).
    pub fn get_str(&self, index: usize) -> PgResult<Option<&str>> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| PgError::Protocol(format!("column index {} out of range", index)))?;
        match value {
            None => Ok(None),
            Some(data) => std::str::from_utf8(data)
                .map(Some)
                .map_err(|_| PgError::Protocol("invalid UTF-8 in column value".into())),
        }
    }

    /// Get a column value by name.
    pub fn get_by_name(&self, name: &str) -> PgResult<Option<&str>> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PgError::Protocol(format!("column '{}' not found", name)))?;
        self.get_str(index)
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }
}
