//! Name-based row access helpers.
//!
//! Enabled with the `row-map` feature.

/// Lightweight view of one table row.
#[derive(Debug)]
pub struct RowRef<'a> {
    /// Table columns aligned with `values`.
    pub columns: &'a [String],
    /// Row cells aligned with `columns`.
    pub values: &'a [String],
}

impl<'a> RowRef<'a> {
    /// Returns a cell by case-insensitive column name.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        let idx = self
            .columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))?;
        self.values.get(idx).map(String::as_str)
    }

    /// Returns a cell parsed as an integer.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name)?.trim().parse().ok()
    }

    /// Returns a cell parsed as a float.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name)?.trim().parse().ok()
    }
}
