//! Multi-axis requirements, named presets and species records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::axis::{Axis, Bin};
use crate::error::{EcoaxisError, Result};

/// Default acceptance threshold for a preset.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Conjunction of (axis, target bin) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub targets: BTreeMap<Axis, Bin>,
}

impl Requirement {
    pub fn new(name: impl Into<String>, targets: impl IntoIterator<Item = (Axis, Bin)>) -> Self {
        Self {
            name: name.into(),
            targets: targets.into_iter().collect(),
        }
    }

    /// Parse `"L:high,M:med"` style conjunctions.
    pub fn parse(name: impl Into<String>, spec: &str) -> Result<Self> {
        let mut targets = BTreeMap::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (axis, bin) = part.split_once(':').ok_or_else(|| {
                EcoaxisError::parse("requirement", format!("expected AXIS:BIN, got '{part}'"))
            })?;
            let axis: Axis = axis.parse()?;
            let bin: Bin = bin.parse()?;
            if targets.insert(axis, bin).is_some() {
                return Err(EcoaxisError::parse(
                    "requirement",
                    format!("axis {axis} listed twice"),
                ));
            }
        }
        if targets.is_empty() {
            return Err(EcoaxisError::parse("requirement", "no targets"));
        }
        Ok(Self {
            name: name.into(),
            targets,
        })
    }

    /// Axes named by the requirement, in canonical order.
    pub fn axes(&self) -> Vec<Axis> {
        self.targets.keys().copied().collect()
    }
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

/// A named requirement plus its acceptance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub targets: BTreeMap<Axis, Bin>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Preset {
    pub fn new(
        name: impl Into<String>,
        targets: impl IntoIterator<Item = (Axis, Bin)>,
        threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            targets: targets.into_iter().collect(),
            threshold,
        }
    }

    pub fn requirement(&self) -> Requirement {
        Requirement {
            name: self.name.clone(),
            targets: self.targets.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(EcoaxisError::InvalidConfig(format!(
                "preset '{}' has no targets",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(EcoaxisError::InvalidConfig(format!(
                "preset '{}' threshold {} outside [0, 1]",
                self.name, self.threshold
            )));
        }
        Ok(())
    }
}

/// Built-in gardening scenarios, with and without the weakly predicted R axis.
pub fn default_presets() -> Vec<Preset> {
    use Axis::*;
    use Bin::*;
    vec![
        Preset::new("full_sun_fertile", [(L, High), (N, High)], DEFAULT_THRESHOLD),
        Preset::new("moist_fertile", [(M, High), (N, High)], DEFAULT_THRESHOLD),
        Preset::new("shade_moist", [(L, Low), (M, Med)], DEFAULT_THRESHOLD),
        Preset::new("dry_poor", [(M, Low), (N, Low)], DEFAULT_THRESHOLD),
        Preset::new("warm_calcareous", [(T, High), (R, High)], DEFAULT_THRESHOLD),
    ]
}

/// Load a JSON array of presets and validate each.
pub fn load_presets_from_path(path: &Path) -> Result<Vec<Preset>> {
    let raw = std::fs::read_to_string(path)?;
    let presets: Vec<Preset> = serde_json::from_str(&raw).map_err(|e| {
        EcoaxisError::MalformedArtifact(format!("presets {}: {e}", path.display()))
    })?;
    for p in &presets {
        p.validate()?;
    }
    Ok(presets)
}

/// Trait-predicted state of one species. Observed indicator values are never
/// stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    pub id: String,
    pub means: BTreeMap<Axis, f64>,
    /// Group labels keyed by column name (e.g. `"myco" -> "AM"`).
    #[serde(default)]
    pub groups: BTreeMap<String, String>,
}

impl SpeciesRecord {
    pub fn new(id: impl Into<String>, means: impl IntoIterator<Item = (Axis, f64)>) -> Self {
        Self {
            id: id.into(),
            means: means.into_iter().collect(),
            groups: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, column: impl Into<String>, label: impl Into<String>) -> Self {
        self.groups.insert(column.into(), label.into());
        self
    }

    pub fn mean(&self, axis: Axis) -> Result<f64> {
        match self.means.get(&axis) {
            Some(v) if v.is_finite() => Ok(*v),
            Some(v) => Err(EcoaxisError::MalformedArtifact(format!(
                "species {} has non-finite mean {v} on {axis}",
                self.id
            ))),
            None => Err(EcoaxisError::MissingAxis {
                axis,
                context: format!("predictions for {}", self.id),
            }),
        }
    }

    pub fn group(&self, column: &str) -> Option<&str> {
        self.groups.get(column).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirement() {
        let r = Requirement::parse("x", "L:high, M:med").unwrap();
        assert_eq!(r.targets.len(), 2);
        assert_eq!(r.targets[&Axis::L], Bin::High);
        assert_eq!(r.axes(), vec![Axis::L, Axis::M]);
    }

    #[test]
    fn test_parse_requirement_rejects_duplicates_and_garbage() {
        assert!(Requirement::parse("x", "L:high,L:low").is_err());
        assert!(Requirement::parse("x", "L=high").is_err());
        assert!(Requirement::parse("x", "").is_err());
    }

    #[test]
    fn test_preset_json_threshold_default() {
        let json = r#"[{"name":"p","targets":{"M":"high","N":"high"}}]"#;
        let presets: Vec<Preset> = serde_json::from_str(json).unwrap();
        assert_eq!(presets[0].threshold, DEFAULT_THRESHOLD);
        assert_eq!(presets[0].requirement().axes(), vec![Axis::M, Axis::N]);
    }

    #[test]
    fn test_preset_validate() {
        let p = Preset::new("bad", [(Axis::L, Bin::High)], 1.5);
        assert!(p.validate().is_err());
        for p in default_presets() {
            p.validate().unwrap();
        }
    }

    #[test]
    fn test_load_presets_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("presets.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_presets_from_path(&path).unwrap_err();
        assert!(matches!(err, EcoaxisError::MalformedArtifact(_)));
    }

    #[test]
    fn test_species_mean_missing_axis() {
        let s = SpeciesRecord::new("sp1", [(Axis::L, 5.0)]);
        assert_eq!(s.mean(Axis::L).unwrap(), 5.0);
        assert!(matches!(
            s.mean(Axis::M),
            Err(EcoaxisError::MissingAxis { axis: Axis::M, .. })
        ));
    }

    #[test]
    fn test_species_group_lookup() {
        let s = SpeciesRecord::new("sp1", [(Axis::L, 5.0)]).with_group("myco", "AM");
        assert_eq!(s.group("myco"), Some("AM"));
        assert_eq!(s.group("woody"), None);
    }
}
