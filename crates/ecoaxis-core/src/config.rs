//! Engine configuration.
//!
//! Every knob of the prediction-time and fitting-time pipeline lives here and
//! is passed explicitly into the components that need it. Missing JSON fields
//! take their defaults.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::axis::{Axis, BinEdges, Reliability};
use crate::error::{EcoaxisError, Result};
use crate::linalg::DEFAULT_PSD_FLOOR;

/// Default Monte Carlo draws per (species, requirement).
pub const DEFAULT_DRAWS: usize = 20_000;
/// Default global seed.
pub const DEFAULT_SEED: u64 = 20_250_913;

/// Thresholds for districting and copula/σ fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Minimum complete rows for a district fit.
    pub min_samples: usize,
    /// Minimum rows for a group-specific estimate to be stored.
    pub min_group_samples: usize,
    /// Shrinkage constant `K` in `w = n / (n + K)`.
    pub shrinkage_k: f64,
    /// Benjamini–Hochberg q-value cutoff for candidate edges.
    pub q_cutoff: f64,
    /// Minimum |ρ| for a candidate edge.
    pub min_abs_rho: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_samples: 30,
            min_group_samples: 20,
            shrinkage_k: 50.0,
            q_cutoff: 0.05,
            min_abs_rho: 0.10,
        }
    }
}

/// Phylogenetic neighbour blending parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// Distance-decay exponent `x` in `1 / (d + ε)^x`.
    pub exponent: f64,
    /// Keep only the `k` nearest references.
    pub k: Option<usize>,
    /// Per-axis blend weight; axes not listed use `default_alpha`.
    pub alpha: BTreeMap<Axis, f64>,
    pub default_alpha: f64,
    pub epsilon: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            exponent: 2.0,
            k: None,
            alpha: BTreeMap::new(),
            default_alpha: 0.5,
            epsilon: 1e-9,
        }
    }
}

impl BlendConfig {
    pub fn alpha_for(&self, axis: Axis) -> f64 {
        self.alpha.get(&axis).copied().unwrap_or(self.default_alpha)
    }

    pub fn validate(&self) -> Result<()> {
        let alphas = self.alpha.values().chain(std::iter::once(&self.default_alpha));
        for &a in alphas {
            if !(0.0..=1.0).contains(&a) {
                return Err(EcoaxisError::InvalidConfig(format!(
                    "blend alpha {a} outside [0, 1]"
                )));
            }
        }
        if !self.exponent.is_finite() || self.exponent < 0.0 {
            return Err(EcoaxisError::InvalidConfig(format!(
                "blend exponent {} must be non-negative",
                self.exponent
            )));
        }
        if self.epsilon <= 0.0 || !self.epsilon.is_finite() {
            return Err(EcoaxisError::InvalidConfig(
                "blend epsilon must be positive".to_string(),
            ));
        }
        if self.k == Some(0) {
            return Err(EcoaxisError::InvalidConfig(
                "blend k must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full configuration surface of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub draws: usize,
    pub seed: u64,
    pub bins: BinEdges,
    pub borderline_width: f64,
    /// Species attribute used to pick group-specific ρ and σ.
    pub group_column: Option<String>,
    pub blend: BlendConfig,
    pub fit: FitConfig,
    /// Species per checkpoint chunk.
    pub chunk_size: usize,
    /// Worker threads; 0 uses available parallelism.
    pub threads: usize,
    /// Eigenvalue floor for PSD correction.
    pub psd_floor: f64,
    pub axis_reliability: BTreeMap<Axis, Reliability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            draws: DEFAULT_DRAWS,
            seed: DEFAULT_SEED,
            bins: BinEdges::default(),
            borderline_width: 0.5,
            group_column: None,
            blend: BlendConfig::default(),
            fit: FitConfig::default(),
            chunk_size: 64,
            threads: 0,
            psd_floor: DEFAULT_PSD_FLOOR,
            axis_reliability: Axis::ALL
                .iter()
                .map(|&a| (a, Reliability::default_for(a)))
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.draws == 0 {
            return Err(EcoaxisError::InvalidConfig("draws must be positive".into()));
        }
        if !self.bins.is_valid() {
            return Err(EcoaxisError::InvalidConfig(format!(
                "bin edges {} / {} are not increasing",
                self.bins.low_upper, self.bins.high_lower
            )));
        }
        if !self.borderline_width.is_finite() || self.borderline_width < 0.0 {
            return Err(EcoaxisError::InvalidConfig(
                "borderline_width must be non-negative".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(EcoaxisError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.psd_floor <= 0.0 || self.psd_floor >= 1.0 || self.psd_floor.is_nan() {
            return Err(EcoaxisError::InvalidConfig(format!(
                "psd_floor {} outside (0, 1)",
                self.psd_floor
            )));
        }
        if self.fit.shrinkage_k < 0.0 || !(0.0..=1.0).contains(&self.fit.q_cutoff) {
            return Err(EcoaxisError::InvalidConfig("invalid fit thresholds".into()));
        }
        self.blend.validate()
    }

    pub fn reliability(&self, axis: Axis) -> Reliability {
        self.axis_reliability
            .get(&axis)
            .copied()
            .unwrap_or_else(|| Reliability::default_for(axis))
    }

    /// Worker count after resolving `threads == 0`.
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Hex digest of the settings that influence simulated rows.
    ///
    /// Thread count and chunk size are excluded: they change scheduling only.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.draws as u64).to_le_bytes());
        hasher.update(self.seed.to_le_bytes());
        hasher.update(self.bins.low_upper.to_le_bytes());
        hasher.update(self.bins.high_lower.to_le_bytes());
        hasher.update(self.psd_floor.to_le_bytes());
        hasher.update(self.group_column.as_deref().unwrap_or("").as_bytes());
        hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Load and validate an [`EngineConfig`] from JSON.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)?;
    let cfg: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
        EcoaxisError::InvalidConfig(format!("failed to parse config {}: {e}", path.display()))
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.draws, 20_000);
        assert_eq!(cfg.reliability(Axis::M), Reliability::High);
        assert_eq!(cfg.reliability(Axis::R), Reliability::Low);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"draws": 5000, "blend": {"k": 3}}"#).unwrap();
        assert_eq!(cfg.draws, 5000);
        assert_eq!(cfg.seed, DEFAULT_SEED);
        assert_eq!(cfg.blend.k, Some(3));
        assert_eq!(cfg.blend.exponent, 2.0);
        assert_eq!(cfg.fit.min_samples, 30);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.draws = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.bins = BinEdges {
            low_upper: 6.5,
            high_lower: 3.5,
        };
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.blend.alpha.insert(Axis::L, 1.5);
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.blend.exponent = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_alpha_lookup() {
        let mut b = BlendConfig::default();
        b.alpha.insert(Axis::R, 0.9);
        assert_eq!(b.alpha_for(Axis::R), 0.9);
        assert_eq!(b.alpha_for(Axis::L), b.default_alpha);
    }

    #[test]
    fn test_fingerprint_tracks_result_settings_only() {
        let a = EngineConfig::default();
        let mut b = a.clone();
        b.threads = 8;
        b.chunk_size = 3;
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.seed += 1;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn test_load_config_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, r#"{"draws": 0}"#).unwrap();
        assert!(matches!(
            load_config_from_path(&path),
            Err(EcoaxisError::InvalidConfig(_))
        ));
        std::fs::write(&path, "[").unwrap();
        assert!(load_config_from_path(&path).is_err());
        assert!(load_config_from_path(&tmp.path().join("missing.json")).is_err());
    }
}
