//! Historical residual table used by the fitting phase.
//!
//! Residuals are observed minus predicted indicator values, one row per
//! species. Missing entries are stored as NaN and dropped pairwise or
//! district-wise when a fit selects its rows.

use std::collections::BTreeMap;

use crate::axis::Axis;
use crate::error::{EcoaxisError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResidualTable {
    ids: Vec<String>,
    columns: BTreeMap<Axis, Vec<f64>>,
    groups: Vec<Option<String>>,
}

impl ResidualTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one row. Axes absent from `values` are recorded as missing.
    pub fn push(&mut self, id: impl Into<String>, values: &BTreeMap<Axis, f64>, group: Option<String>) {
        let row = self.ids.len();
        for axis in values.keys() {
            self.columns
                .entry(*axis)
                .or_insert_with(|| vec![f64::NAN; row]);
        }
        for (axis, col) in self.columns.iter_mut() {
            col.push(values.get(axis).copied().unwrap_or(f64::NAN));
        }
        self.ids.push(id.into());
        self.groups.push(group);
    }

    /// Attach group labels by species id; unmatched rows stay ungrouped.
    pub fn set_groups(&mut self, labels: &BTreeMap<String, String>) {
        for (i, id) in self.ids.iter().enumerate() {
            self.groups[i] = labels.get(id).cloned();
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Axes that have at least one column entry.
    pub fn axes(&self) -> Vec<Axis> {
        self.columns.keys().copied().collect()
    }

    pub fn column(&self, axis: Axis) -> Result<&[f64]> {
        self.columns
            .get(&axis)
            .map(Vec::as_slice)
            .ok_or_else(|| EcoaxisError::MissingAxis {
                axis,
                context: "residual table".to_string(),
            })
    }

    pub fn group(&self, row: usize) -> Option<&str> {
        self.groups.get(row).and_then(|g| g.as_deref())
    }

    /// Row indices per group label, in label order.
    pub fn group_rows(&self) -> BTreeMap<String, Vec<usize>> {
        let mut out: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, g) in self.groups.iter().enumerate() {
            if let Some(label) = g {
                out.entry(label.clone()).or_default().push(i);
            }
        }
        out
    }

    /// Rows (restricted to `rows` when given) where every axis is finite.
    pub fn complete_rows(&self, axes: &[Axis], rows: Option<&[usize]>) -> Result<Vec<usize>> {
        let cols = axes
            .iter()
            .map(|&a| self.column(a))
            .collect::<Result<Vec<_>>>()?;
        let candidates: Vec<usize> = match rows {
            Some(r) => r.to_vec(),
            None => (0..self.len()).collect(),
        };
        Ok(candidates
            .into_iter()
            .filter(|&i| cols.iter().all(|c| c[i].is_finite()))
            .collect())
    }

    /// Columns for `axes` restricted to `rows`, one `Vec` per axis.
    pub fn select(&self, axes: &[Axis], rows: &[usize]) -> Result<Vec<Vec<f64>>> {
        axes.iter()
            .map(|&a| {
                let col = self.column(a)?;
                Ok(rows.iter().map(|&i| col[i]).collect())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(Axis, f64)]) -> BTreeMap<Axis, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_push_backfills_new_columns() {
        let mut t = ResidualTable::new();
        t.push("a", &row(&[(Axis::L, 0.1)]), None);
        t.push("b", &row(&[(Axis::L, 0.2), (Axis::M, -0.3)]), Some("AM".into()));
        assert_eq!(t.len(), 2);
        let m = t.column(Axis::M).unwrap();
        assert!(m[0].is_nan());
        assert_eq!(m[1], -0.3);
        assert_eq!(t.group(1), Some("AM"));
        assert!(t.column(Axis::N).is_err());
    }

    #[test]
    fn test_complete_rows_and_groups() {
        let mut t = ResidualTable::new();
        t.push("a", &row(&[(Axis::L, 0.1), (Axis::M, 0.0)]), Some("x".into()));
        t.push("b", &row(&[(Axis::L, 0.2)]), Some("y".into()));
        t.push("c", &row(&[(Axis::L, 0.3), (Axis::M, 1.0)]), Some("x".into()));
        let rows = t.complete_rows(&[Axis::L, Axis::M], None).unwrap();
        assert_eq!(rows, vec![0, 2]);
        let groups = t.group_rows();
        assert_eq!(groups["x"], vec![0, 2]);
        let sel = t.select(&[Axis::M], &rows).unwrap();
        assert_eq!(sel, vec![vec![0.0, 1.0]]);
    }

    #[test]
    fn test_set_groups_by_id() {
        let mut t = ResidualTable::new();
        t.push("a", &row(&[(Axis::L, 0.1)]), None);
        t.push("b", &row(&[(Axis::L, 0.2)]), None);
        let labels: BTreeMap<String, String> = [("b".to_string(), "EM".to_string())].into();
        t.set_groups(&labels);
        assert_eq!(t.group(0), None);
        assert_eq!(t.group(1), Some("EM"));
    }
}
