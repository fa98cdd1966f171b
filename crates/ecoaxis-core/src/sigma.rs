//! Residual standard deviation per axis, globally and per group.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::axis::Axis;
use crate::config::FitConfig;
use crate::error::{EcoaxisError, Result};
use crate::residuals::ResidualTable;
use crate::stats;

/// Current on-disk format of [`SigmaArtifact`].
pub const SIGMA_ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSigma {
    pub sigma: f64,
    pub n: usize,
}

/// Residual σ of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaSpec {
    pub global: f64,
    pub n: usize,
    #[serde(default)]
    pub by_group: BTreeMap<String, GroupSigma>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmaLookup {
    pub sigma: f64,
    pub from_group: bool,
    /// A group was requested but the global σ was used.
    pub group_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaArtifact {
    pub version: u32,
    #[serde(default)]
    pub group_column: Option<String>,
    pub axes: BTreeMap<Axis, SigmaSpec>,
    /// Axes whose stored entry failed to parse or validate, with the reason.
    #[serde(skip)]
    pub rejected: BTreeMap<Axis, String>,
}

/// On-disk layout read axis by axis.
#[derive(Deserialize)]
struct StoredSigma {
    version: u32,
    #[serde(default)]
    group_column: Option<String>,
    axes: BTreeMap<Axis, serde_json::Value>,
}

impl SigmaSpec {
    fn validate(&self, axis: Axis) -> Result<()> {
        let values = std::iter::once(self.global).chain(self.by_group.values().map(|g| g.sigma));
        for s in values {
            if !s.is_finite() || s < 0.0 {
                return Err(EcoaxisError::MalformedArtifact(format!(
                    "sigma for {axis} is {s}"
                )));
            }
        }
        Ok(())
    }
}

impl SigmaArtifact {
    pub fn new(group_column: Option<String>, axes: BTreeMap<Axis, SigmaSpec>) -> Self {
        Self {
            version: SIGMA_ARTIFACT_VERSION,
            group_column,
            axes,
            rejected: BTreeMap::new(),
        }
    }

    /// Same σ on every listed axis, no groups.
    pub fn uniform(axes: &[Axis], sigma: f64) -> Self {
        Self::new(
            None,
            axes.iter()
                .map(|&a| {
                    (
                        a,
                        SigmaSpec {
                            global: sigma,
                            n: 0,
                            by_group: BTreeMap::new(),
                        },
                    )
                })
                .collect(),
        )
    }

    /// σ for `axis`, using the group value when it exists. Each axis falls
    /// back independently.
    pub fn sigma_for(&self, axis: Axis, group: Option<&str>) -> Result<SigmaLookup> {
        if let Some(reason) = self.rejected.get(&axis) {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "sigma for {axis} is unusable: {reason}"
            )));
        }
        let spec = self.axes.get(&axis).ok_or_else(|| EcoaxisError::MissingAxis {
            axis,
            context: "sigma table".to_string(),
        })?;
        if let Some(g) = group.and_then(|g| spec.by_group.get(g)) {
            return Ok(SigmaLookup {
                sigma: g.sigma,
                from_group: true,
                group_fallback: false,
            });
        }
        Ok(SigmaLookup {
            sigma: spec.global,
            from_group: false,
            group_fallback: group.is_some(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read an artifact. An unreadable file or unknown version is an error;
    /// a bad axis entry only fails the requirements that use that axis.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let stored: StoredSigma = serde_json::from_str(&raw).map_err(|e| {
            EcoaxisError::MalformedArtifact(format!("sigma {}: {e}", path.display()))
        })?;
        if stored.version != SIGMA_ARTIFACT_VERSION {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "sigma {}: unsupported version {}",
                path.display(),
                stored.version
            )));
        }

        let mut artifact = Self::new(stored.group_column, BTreeMap::new());
        for (axis, value) in stored.axes {
            let parsed = serde_json::from_value::<SigmaSpec>(value)
                .map_err(EcoaxisError::from)
                .and_then(|spec| spec.validate(axis).map(|()| spec));
            match parsed {
                Ok(spec) => {
                    artifact.axes.insert(axis, spec);
                }
                Err(e) => {
                    log::warn!("sigma {}: axis {axis} unusable: {e}", path.display());
                    artifact.rejected.insert(axis, e.to_string());
                }
            }
        }
        Ok(artifact)
    }
}

/// Sample σ of every residual column; group σ only where
/// `n_g >= cfg.min_group_samples`.
pub fn fit_sigma(
    table: &ResidualTable,
    cfg: &FitConfig,
    group_column: Option<String>,
) -> Result<SigmaArtifact> {
    let groups = table.group_rows();
    let mut axes = BTreeMap::new();
    for axis in table.axes() {
        let col = table.column(axis)?;
        let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.len() < 2 {
            log::warn!("sigma {axis}: only {} residuals; skipping axis", finite.len());
            continue;
        }

        let mut by_group = BTreeMap::new();
        for (label, rows) in &groups {
            let vals: Vec<f64> = rows
                .iter()
                .map(|&i| col[i])
                .filter(|v| v.is_finite())
                .collect();
            if vals.len() >= cfg.min_group_samples.max(2) {
                by_group.insert(
                    label.clone(),
                    GroupSigma {
                        sigma: stats::sample_std(&vals),
                        n: vals.len(),
                    },
                );
            }
        }

        let global = stats::sample_std(&finite);
        log::info!(
            "sigma {axis}: {global:.3} (n={}, {} groups)",
            finite.len(),
            by_group.len()
        );
        axes.insert(
            axis,
            SigmaSpec {
                global,
                n: finite.len(),
                by_group,
            },
        );
    }
    Ok(SigmaArtifact::new(group_column, axes))
}
