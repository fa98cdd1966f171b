pub mod blend;
pub mod fit;
pub mod msep;
pub mod recommend;
pub mod simulate;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use ecoaxis_core::{Axis, EcoaxisError, EngineConfig, Result, SpeciesRecord, load_config_from_path};

/// Cells treated as missing values.
const MISSING: &[&str] = &["", "NA", "NaN", "nan", "null"];

// -----------------------------------------------------------------------
// CSV input
// -----------------------------------------------------------------------

/// A header plus rows of equal width.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub source: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// `(column index, axis)` for every header cell after the id column that
    /// names an axis. Two columns naming the same axis are rejected.
    pub fn axis_columns(&self) -> Result<Vec<(usize, Axis)>> {
        let mut seen: BTreeMap<Axis, usize> = BTreeMap::new();
        let mut columns = Vec::new();
        for (i, h) in self.header.iter().enumerate().skip(1) {
            let Ok(axis) = Axis::from_str(h) else {
                continue;
            };
            if let Some(&first) = seen.get(&axis) {
                return Err(EcoaxisError::MalformedArtifact(format!(
                    "{}: columns '{}' and '{h}' both map to axis {axis}",
                    self.source, self.header[first]
                )));
            }
            seen.insert(axis, i);
            columns.push((i, axis));
        }
        Ok(columns)
    }
}

fn csv_error(source: &str, e: csv::Error) -> EcoaxisError {
    let location = match e.position() {
        Some(pos) => format!("{source}:{}", pos.line()),
        None => source.to_string(),
    };
    EcoaxisError::parse(location, e.to_string())
}

pub fn parse_csv(raw: &str, source: &str) -> Result<CsvTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw.trim_start_matches('\u{feff}').as_bytes());
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(source, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if header.iter().all(String::is_empty) {
        return Err(EcoaxisError::parse(source, "empty file"));
    }
    let rows = reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(|e| csv_error(source, e))
        })
        .collect::<Result<Vec<Vec<String>>>>()?;
    Ok(CsvTable {
        source: source.to_string(),
        header,
        rows,
    })
}

pub fn read_csv(path: &Path) -> Result<CsvTable> {
    let raw = std::fs::read_to_string(path)?;
    parse_csv(&raw, &path.display().to_string())
}

/// Parse a numeric cell; missing markers become NaN.
pub fn parse_value(cell: &str, location: impl FnOnce() -> String) -> Result<f64> {
    let cell = cell.trim();
    if MISSING.contains(&cell) {
        return Ok(f64::NAN);
    }
    cell.parse::<f64>()
        .map_err(|_| EcoaxisError::parse(location(), format!("not a number: '{cell}'")))
}

/// Rows of `id` plus axis values (NaN where missing).
pub fn read_axis_rows(path: &Path) -> Result<Vec<(String, BTreeMap<Axis, f64>)>> {
    let table = read_csv(path)?;
    let axes = table.axis_columns()?;
    if axes.is_empty() {
        return Err(EcoaxisError::parse(
            path.display().to_string(),
            "no axis columns (expected L, T, M, R or N)",
        ));
    }
    table
        .rows
        .iter()
        .enumerate()
        .map(|(n, row)| {
            let mut values = BTreeMap::new();
            for &(i, axis) in &axes {
                let v = parse_value(&row[i], || format!("{}:{} {axis}", path.display(), n + 2))?;
                values.insert(axis, v);
            }
            Ok((row[0].trim().to_string(), values))
        })
        .collect()
}

/// Two-column label file: returns the label column name and id → label.
pub fn read_labels(path: &Path) -> Result<(String, BTreeMap<String, String>)> {
    let table = read_csv(path)?;
    if table.header.len() < 2 {
        return Err(EcoaxisError::parse(
            path.display().to_string(),
            "expected an id column and a label column",
        ));
    }
    let labels = table
        .rows
        .iter()
        .filter(|r| !MISSING.contains(&r[1].trim()))
        .map(|r| (r[0].trim().to_string(), r[1].trim().to_string()))
        .collect();
    Ok((table.header[1].clone(), labels))
}

/// Species predictions. Missing axis cells are left out of `means`; when
/// `group_column` is a header column its values become the species' group.
pub fn read_predictions(path: &Path, group_column: Option<&str>) -> Result<Vec<SpeciesRecord>> {
    let table = read_csv(path)?;
    let axes = table.axis_columns()?;
    let group_idx = group_column.and_then(|c| table.column_index(c).map(|i| (c, i)));
    table
        .rows
        .iter()
        .enumerate()
        .map(|(n, row)| {
            let mut means = Vec::new();
            for &(i, axis) in &axes {
                let v = parse_value(&row[i], || format!("{}:{} {axis}", path.display(), n + 2))?;
                if v.is_finite() {
                    means.push((axis, v));
                }
            }
            let mut record = SpeciesRecord::new(row[0].trim(), means);
            if let Some((col, i)) = group_idx {
                let label = row[i].trim();
                if !MISSING.contains(&label) {
                    record = record.with_group(col, label);
                }
            }
            Ok(record)
        })
        .collect()
}

pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => load_config_from_path(p),
        None => Ok(EngineConfig::default()),
    }
}

// -----------------------------------------------------------------------
// CSV output
// -----------------------------------------------------------------------

/// Write `header` and `rows` to `path`, quoting fields as needed.
pub fn write_csv(
    path: &Path,
    header: &[&str],
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(header)?;
    for row in rows {
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

pub fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_default()
}
