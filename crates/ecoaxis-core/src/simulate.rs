//! Joint-suitability Monte Carlo engine.
//!
//! [`estimate_joint`] is a pure function of means, sigmas, a correlation
//! matrix, bin ranges, a seed and a draw count. [`simulate_requirement`]
//! assembles those inputs for one species from the fitted artifacts. Only
//! predicted means enter; observed indicator values are never an input.

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::axis::{Axis, BinEdges};
use crate::config::EngineConfig;
use crate::copula::{CopulaArtifact, CorrelationSource};
use crate::error::{EcoaxisError, Result};
use crate::linalg::SymMatrix;
use crate::requirement::{Preset, Requirement, SpeciesRecord};
use crate::seed::derive_seed;
use crate::sigma::SigmaArtifact;

// ---------------------------------------------------------------------------
// Pure estimator
// ---------------------------------------------------------------------------

/// Fully assembled inputs for one (species, requirement) estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct JointProblem {
    pub means: Vec<f64>,
    pub sigmas: Vec<f64>,
    pub correlation: SymMatrix,
    /// Target interval `[lower, upper)` per axis.
    pub ranges: Vec<(f64, f64)>,
}

impl JointProblem {
    fn validate(&self) -> Result<()> {
        let d = self.means.len();
        if d == 0 {
            return Err(EcoaxisError::InvalidConfig("requirement has no axes".into()));
        }
        if self.sigmas.len() != d || self.ranges.len() != d || self.correlation.dim() != d {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "dimension mismatch: {d} means, {} sigmas, {} ranges, {}x{} correlation",
                self.sigmas.len(),
                self.ranges.len(),
                self.correlation.dim(),
                self.correlation.dim()
            )));
        }
        if let Some(s) = self.sigmas.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(EcoaxisError::MalformedArtifact(format!("invalid sigma {s}")));
        }
        if let Some(m) = self.means.iter().find(|m| !m.is_finite()) {
            return Err(EcoaxisError::MalformedArtifact(format!("invalid mean {m}")));
        }
        if !self.correlation.is_symmetric(1e-9) {
            return Err(EcoaxisError::MalformedArtifact(
                "correlation matrix is not symmetric".into(),
            ));
        }
        Ok(())
    }
}

/// Monte Carlo estimate of a joint bin probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointEstimate {
    pub probability: f64,
    pub successes: usize,
    pub draws: usize,
    /// Binomial standard error `sqrt(p (1 − p) / N)`.
    pub std_error: f64,
    /// The correlation matrix needed eigenvalue clipping.
    pub psd_corrected: bool,
}

/// Fraction of `draws` correlated normal draws whose every axis lands in
/// its target range.
pub fn estimate_joint(
    problem: &JointProblem,
    draws: usize,
    seed: u64,
    psd_floor: f64,
) -> Result<JointEstimate> {
    if draws == 0 {
        return Err(EcoaxisError::InvalidConfig("draws must be positive".into()));
    }
    problem.validate()?;

    let (corr, psd_corrected) = problem.correlation.clip_to_correlation(psd_floor);
    if psd_corrected {
        log::debug!(
            "correlation min eigenvalue {:.3e} clipped to {psd_floor:.1e}",
            problem.correlation.min_eigenvalue()
        );
    }
    let chol = corr.cholesky()?;

    let d = problem.means.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut z = DVector::zeros(d);
    let mut noise = DVector::zeros(d);
    let mut successes = 0usize;
    for _ in 0..draws {
        for v in z.iter_mut() {
            *v = rng.sample(StandardNormal);
        }
        chol.mul_into(&z, &mut noise);
        let hit = (0..d).all(|a| {
            let x = problem.means[a] + problem.sigmas[a] * noise[a];
            let (lo, hi) = problem.ranges[a];
            x >= lo && x < hi
        });
        if hit {
            successes += 1;
        }
    }

    let p = successes as f64 / draws as f64;
    Ok(JointEstimate {
        probability: p,
        successes,
        draws,
        std_error: (p * (1.0 - p) / draws as f64).sqrt(),
        psd_corrected,
    })
}

// ---------------------------------------------------------------------------
// Assembly from artifacts
// ---------------------------------------------------------------------------

/// Fitted inputs shared read-only by every simulation.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub copulas: CopulaArtifact,
    pub sigma: SigmaArtifact,
}

/// How the inputs of one estimate were sourced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Group label looked up, if the species had one.
    pub group: Option<String>,
    /// Axes whose σ fell back from the group to the global table.
    pub sigma_fallback: Vec<Axis>,
    /// Pairs whose ρ fell back from the group to the global value.
    pub rho_fallback: Vec<(Axis, Axis)>,
    /// Pairs inside a district that had too little data to fit.
    pub unfitted_pairs: Vec<(Axis, Axis)>,
}

impl Diagnostics {
    pub fn any_fallback(&self) -> bool {
        !self.sigma_fallback.is_empty() || !self.rho_fallback.is_empty()
    }

    /// Compact `sigma:L;rho:L-M;unfitted:T-R` summary for CSV output.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for a in &self.sigma_fallback {
            parts.push(format!("sigma:{a}"));
        }
        for (a, b) in &self.rho_fallback {
            parts.push(format!("rho:{a}-{b}"));
        }
        for (a, b) in &self.unfitted_pairs {
            parts.push(format!("unfitted:{a}-{b}"));
        }
        parts.join(";")
    }
}

/// Build the [`JointProblem`] for `species` and `requirement`.
pub fn assemble(
    species: &SpeciesRecord,
    requirement: &Requirement,
    artifacts: &Artifacts,
    group: Option<&str>,
    bins: &BinEdges,
) -> Result<(JointProblem, Diagnostics)> {
    let axes = requirement.axes();
    let mut diag = Diagnostics {
        group: group.map(str::to_string),
        ..Diagnostics::default()
    };

    let mut means = Vec::with_capacity(axes.len());
    let mut sigmas = Vec::with_capacity(axes.len());
    let mut ranges = Vec::with_capacity(axes.len());
    for (&axis, &bin) in &requirement.targets {
        means.push(species.mean(axis)?);
        let s = artifacts.sigma.sigma_for(axis, group)?;
        if s.group_fallback {
            diag.sigma_fallback.push(axis);
        }
        sigmas.push(s.sigma);
        ranges.push(bins.range(bin));
    }

    let mut correlation = SymMatrix::identity(axes.len());
    for i in 0..axes.len() {
        for j in (i + 1)..axes.len() {
            let pc = artifacts.copulas.correlation_between(axes[i], axes[j], group)?;
            if pc.group_fallback && pc.source != CorrelationSource::Unfitted {
                diag.rho_fallback.push((axes[i], axes[j]));
            }
            if pc.source == CorrelationSource::Unfitted {
                diag.unfitted_pairs.push((axes[i], axes[j]));
            }
            correlation.set_sym(i, j, pc.rho);
        }
    }

    if diag.any_fallback() {
        log::debug!(
            "{} / {}: group {:?} fallback [{}]",
            species.id,
            requirement.name,
            group,
            diag.summary()
        );
    }

    Ok((
        JointProblem {
            means,
            sigmas,
            correlation,
            ranges,
        },
        diag,
    ))
}

/// Outcome of one (species, preset) estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub species_id: String,
    pub preset: String,
    pub estimate: JointEstimate,
    pub threshold: f64,
    pub passed: bool,
    pub diagnostics: Diagnostics,
}

/// Estimate the joint probability that `species` meets `preset`.
pub fn simulate_requirement(
    species: &SpeciesRecord,
    preset: &Preset,
    artifacts: &Artifacts,
    cfg: &EngineConfig,
) -> Result<SimulationResult> {
    let group = cfg.group_column.as_deref().and_then(|c| species.group(c));
    let requirement = preset.requirement();
    let (problem, diagnostics) = assemble(species, &requirement, artifacts, group, &cfg.bins)?;
    let seed = derive_seed(cfg.seed, &species.id, &preset.name);
    let estimate = estimate_joint(&problem, cfg.draws, seed, cfg.psd_floor)?;
    if estimate.psd_corrected {
        log::warn!(
            "{} / {}: correlation matrix corrected to PSD",
            species.id,
            preset.name
        );
    }
    Ok(SimulationResult {
        species_id: species.id.clone(),
        preset: preset.name.clone(),
        passed: estimate.probability >= preset.threshold,
        threshold: preset.threshold,
        estimate,
        diagnostics,
    })
}
