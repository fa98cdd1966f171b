//! Copula fitting per district, with optional group-specific shrinkage.
//!
//! Residuals of every non-trivial district are mapped to normal scores through
//! their empirical ranks, then each registered [`CopulaFamily`] is fitted and
//! the lowest-AIC family wins. Gaussian is the only family shipped.
//!
//! Fitted models are persisted in a [`CopulaArtifact`] and read back as an
//! immutable input to simulation.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::axis::Axis;
use crate::config::FitConfig;
use crate::district::District;
use crate::error::{EcoaxisError, Result};
use crate::linalg::SymMatrix;
use crate::residuals::ResidualTable;
use crate::stats;

/// Current on-disk format of [`CopulaArtifact`].
pub const COPULA_ARTIFACT_VERSION: u32 = 1;

/// Search interval for the bivariate correlation MLE.
const RHO_BOUND: f64 = 0.999;
const GOLDEN_TOL: f64 = 1e-9;

/// Quantile level for the tail-dependence check.
pub const TAIL_QUANTILE: f64 = 0.9;
/// Largest gap between empirical and Gaussian-implied tail dependence
/// accepted without a warning.
pub const TAIL_TOLERANCE: f64 = 0.2;

// ---------------------------------------------------------------------------
// Families
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyTag {
    Gaussian,
}

/// Result of fitting one family to one set of normal scores.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyFit {
    pub family: FamilyTag,
    pub correlation: SymMatrix,
    pub loglik: f64,
    /// Free parameters counted by AIC.
    pub n_params: usize,
    pub psd_corrected: bool,
}

impl FamilyFit {
    pub fn aic(&self) -> f64 {
        2.0 * self.n_params as f64 - 2.0 * self.loglik
    }
}

/// A copula family that can be fitted to normal scores.
///
/// `scores[a][i]` is the normal score of axis `a` in row `i`.
pub trait CopulaFamily: Send + Sync {
    fn tag(&self) -> FamilyTag;
    fn fit(&self, scores: &[Vec<f64>], psd_floor: f64) -> Result<FamilyFit>;
}

/// Gaussian copula: exact MLE for two axes, normal-score correlation matrix
/// for three or more.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianFamily;

impl CopulaFamily for GaussianFamily {
    fn tag(&self) -> FamilyTag {
        FamilyTag::Gaussian
    }

    fn fit(&self, scores: &[Vec<f64>], psd_floor: f64) -> Result<FamilyFit> {
        let d = scores.len();
        if d < 2 {
            return Err(EcoaxisError::InsufficientData {
                needed: 2,
                got: d,
                context: "gaussian copula axes".to_string(),
            });
        }

        let (correlation, psd_corrected) = if d == 2 {
            let rho = bivariate_mle(&scores[0], &scores[1]);
            let mut m = SymMatrix::identity(2);
            m.set_sym(0, 1, rho);
            (m, false)
        } else {
            let mut m = SymMatrix::identity(d);
            for i in 0..d {
                for j in (i + 1)..d {
                    m.set_sym(i, j, stats::pearson(&scores[i], &scores[j]));
                }
            }
            m.clip_to_correlation(psd_floor)
        };

        let loglik = gaussian_loglik(scores, &correlation)?;
        Ok(FamilyFit {
            family: FamilyTag::Gaussian,
            correlation,
            loglik,
            n_params: d * (d - 1) / 2,
            psd_corrected,
        })
    }
}

/// Gaussian copula log-likelihood of normal scores under `corr`.
pub fn gaussian_loglik(scores: &[Vec<f64>], corr: &SymMatrix) -> Result<f64> {
    let d = scores.len();
    let n = scores.first().map_or(0, Vec::len);
    let chol = corr.cholesky()?;
    let log_det = chol.log_det();
    let mut z = DVector::zeros(d);
    let mut total = 0.0;
    for i in 0..n {
        for (a, col) in scores.iter().enumerate() {
            z[a] = col[i];
        }
        let zz = z.norm_squared();
        total += -0.5 * log_det - 0.5 * (chol.quad_form_inv(&z) - zz);
    }
    Ok(total)
}

fn bivariate_loglik(rho: f64, n: f64, sum_sq: f64, sum_xy: f64) -> f64 {
    let one_m = 1.0 - rho * rho;
    -0.5 * n * one_m.ln() - (rho * rho * sum_sq - 2.0 * rho * sum_xy) / (2.0 * one_m)
}

/// Golden-section maximisation of the bivariate Gaussian copula likelihood.
fn bivariate_mle(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len()) as f64;
    let sum_sq: f64 = x.iter().zip(y).map(|(a, b)| a * a + b * b).sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let f = |r: f64| bivariate_loglik(r, n, sum_sq, sum_xy);

    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (-RHO_BOUND, RHO_BOUND);
    let mut c = hi - phi * (hi - lo);
    let mut d = lo + phi * (hi - lo);
    let (mut fc, mut fd) = (f(c), f(d));
    while hi - lo > GOLDEN_TOL {
        if fc > fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - phi * (hi - lo);
            fc = f(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + phi * (hi - lo);
            fd = f(d);
        }
    }
    (lo + hi) / 2.0
}

/// Fit every family and keep the one with the lowest AIC. Ties keep the
/// earlier family.
pub fn select_family(
    families: &[&dyn CopulaFamily],
    scores: &[Vec<f64>],
    psd_floor: f64,
) -> Result<FamilyFit> {
    let mut best: Option<FamilyFit> = None;
    let mut last_err = None;
    for family in families {
        match family.fit(scores, psd_floor) {
            Ok(fit) => {
                log::debug!("family {:?}: loglik={:.3} aic={:.3}", fit.family, fit.loglik, fit.aic());
                if best.as_ref().is_none_or(|b| fit.aic() < b.aic()) {
                    best = Some(fit);
                }
            }
            Err(e) => {
                log::warn!("family {:?} failed: {e}", family.tag());
                last_err = Some(e);
            }
        }
    }
    best.ok_or_else(|| {
        last_err.unwrap_or_else(|| EcoaxisError::InvalidConfig("no copula families".to_string()))
    })
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Fitted,
    InsufficientData,
}

/// Kendall τ of the raw residuals for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTau {
    pub a: Axis,
    pub b: Axis,
    pub tau: f64,
}

/// Empirical tail dependence of one pair at [`TAIL_QUANTILE`], next to the
/// value the fitted Gaussian copula implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTail {
    pub a: Axis,
    pub b: Axis,
    pub lower: f64,
    pub upper: f64,
    pub gaussian: f64,
}

impl PairTail {
    /// Larger of the two tail gaps to the Gaussian value.
    pub fn max_gap(&self) -> f64 {
        (self.lower - self.gaussian)
            .abs()
            .max((self.upper - self.gaussian).abs())
    }
}

/// Group-specific correlation after shrinkage toward the global fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCorrelation {
    pub n: usize,
    /// Weight on the group estimate, `n / (n + K)`.
    pub weight: f64,
    pub raw: SymMatrix,
    pub correlation: SymMatrix,
}

/// Fitted dependency for one district.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopulaModel {
    pub axes: Vec<Axis>,
    pub family: FamilyTag,
    pub status: FitStatus,
    pub n: usize,
    pub correlation: Option<SymMatrix>,
    pub loglik: Option<f64>,
    pub aic: Option<f64>,
    #[serde(default)]
    pub psd_corrected: bool,
    #[serde(default)]
    pub kendall: Vec<PairTau>,
    #[serde(default)]
    pub tails: Vec<PairTail>,
    #[serde(default)]
    pub by_group: BTreeMap<String, GroupCorrelation>,
}

impl CopulaModel {
    fn position(&self, axis: Axis) -> Option<usize> {
        self.axes.iter().position(|&a| a == axis)
    }

    pub fn covers(&self, a: Axis, b: Axis) -> bool {
        self.position(a).is_some() && self.position(b).is_some()
    }

    /// Global correlation of a pair inside this district.
    pub fn rho(&self, a: Axis, b: Axis) -> Option<f64> {
        let (i, j) = (self.position(a)?, self.position(b)?);
        self.correlation.as_ref().map(|m| m.get(i, j))
    }

    /// Shrunk group correlation of a pair, if the group was fitted.
    pub fn group_rho(&self, group: &str, a: Axis, b: Axis) -> Option<f64> {
        let (i, j) = (self.position(a)?, self.position(b)?);
        self.by_group.get(group).map(|g| g.correlation.get(i, j))
    }

    fn validate(&self) -> Result<()> {
        let d = self.axes.len();
        let check = |m: &SymMatrix, what: &str| {
            if m.dim() != d || !m.is_symmetric(1e-9) {
                Err(EcoaxisError::MalformedArtifact(format!(
                    "copula {what} for {:?} has wrong shape",
                    self.axes
                )))
            } else {
                Ok(())
            }
        };
        if let Some(m) = &self.correlation {
            check(m, "correlation")?;
        }
        for (label, g) in &self.by_group {
            check(&g.correlation, label)?;
        }
        if self.status == FitStatus::Fitted && self.correlation.is_none() {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "fitted copula for {:?} has no correlation",
                self.axes
            )));
        }
        Ok(())
    }
}

/// Where a pairwise correlation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationSource {
    /// Shrunk group-specific estimate.
    Group,
    /// Global district estimate.
    Global,
    /// Axes in different districts.
    Independent,
    /// Same district but the district had too little data to fit.
    Unfitted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCorrelation {
    pub rho: f64,
    pub source: CorrelationSource,
    /// A group was requested but this pair used a non-group value.
    pub group_fallback: bool,
}

/// A stored model that failed to parse or validate. Pairs inside it cannot
/// be scored; every other pair is unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedModel {
    pub axes: Vec<Axis>,
    pub reason: String,
}

/// Persisted set of district copulas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopulaArtifact {
    pub version: u32,
    #[serde(default)]
    pub group_column: Option<String>,
    pub models: Vec<CopulaModel>,
    #[serde(skip)]
    pub rejected: Vec<RejectedModel>,
}

/// On-disk layout read model by model.
#[derive(Deserialize)]
struct StoredCopulas {
    version: u32,
    #[serde(default)]
    group_column: Option<String>,
    models: Vec<serde_json::Value>,
}

impl CopulaArtifact {
    pub fn new(group_column: Option<String>, models: Vec<CopulaModel>) -> Self {
        Self {
            version: COPULA_ARTIFACT_VERSION,
            group_column,
            models,
            rejected: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read an artifact. An unreadable file or unknown version is an error;
    /// a single bad model is kept as a [`RejectedModel`] so that only the
    /// pairs it covers fail.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let stored: StoredCopulas = serde_json::from_str(&raw).map_err(|e| {
            EcoaxisError::MalformedArtifact(format!("copulas {}: {e}", path.display()))
        })?;
        if stored.version != COPULA_ARTIFACT_VERSION {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "copulas {}: unsupported version {}",
                path.display(),
                stored.version
            )));
        }

        let mut artifact = Self::new(stored.group_column, Vec::new());
        for (i, value) in stored.models.into_iter().enumerate() {
            let axes: Option<Vec<Axis>> = value
                .get("axes")
                .and_then(|a| serde_json::from_value(a.clone()).ok());
            let parsed = serde_json::from_value::<CopulaModel>(value)
                .map_err(EcoaxisError::from)
                .and_then(|m| m.validate().map(|()| m));
            match (parsed, axes) {
                (Ok(model), _) => artifact.models.push(model),
                (Err(e), Some(axes)) => {
                    log::warn!("copulas {}: model {axes:?} unusable: {e}", path.display());
                    artifact.rejected.push(RejectedModel {
                        axes,
                        reason: e.to_string(),
                    });
                }
                (Err(e), None) => {
                    return Err(EcoaxisError::MalformedArtifact(format!(
                        "copulas {}: model {i} has no readable axes: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(artifact)
    }

    /// Districts the fitted models describe. Unfitted districts are left
    /// out: their pairs are simulated as independent and must be tested as
    /// such.
    pub fn fitted_districts(&self) -> Vec<District> {
        self.models
            .iter()
            .filter(|m| m.status == FitStatus::Fitted)
            .map(|m| District::new(m.axes.clone()))
            .collect()
    }

    pub fn model_for(&self, a: Axis, b: Axis) -> Option<&CopulaModel> {
        self.models.iter().find(|m| m.covers(a, b))
    }

    /// Correlation of `a` and `b`, preferring `group` and falling back pair
    /// by pair to the global value, then to independence. Fails only when
    /// the pair sits inside a rejected model.
    pub fn correlation_between(
        &self,
        a: Axis,
        b: Axis,
        group: Option<&str>,
    ) -> Result<PairCorrelation> {
        if a == b {
            return Ok(PairCorrelation {
                rho: 1.0,
                source: CorrelationSource::Global,
                group_fallback: false,
            });
        }
        if let Some(bad) = self
            .rejected
            .iter()
            .find(|r| r.axes.contains(&a) && r.axes.contains(&b))
        {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "copula for {:?} is unusable: {}",
                bad.axes, bad.reason
            )));
        }
        let Some(model) = self.model_for(a, b) else {
            return Ok(PairCorrelation {
                rho: 0.0,
                source: CorrelationSource::Independent,
                group_fallback: false,
            });
        };

        if let Some(rho) = group.and_then(|g| model.group_rho(g, a, b)) {
            return Ok(PairCorrelation {
                rho,
                source: CorrelationSource::Group,
                group_fallback: false,
            });
        }

        let group_fallback = group.is_some();
        Ok(match model.rho(a, b) {
            Some(rho) if model.status == FitStatus::Fitted => PairCorrelation {
                rho,
                source: CorrelationSource::Global,
                group_fallback,
            },
            _ => PairCorrelation {
                rho: 0.0,
                source: CorrelationSource::Unfitted,
                group_fallback,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

fn scores_for(table: &ResidualTable, axes: &[Axis], rows: &[usize]) -> Result<Vec<Vec<f64>>> {
    Ok(table
        .select(axes, rows)?
        .iter()
        .map(|col| stats::normal_scores(col))
        .collect())
}

/// Fit one district. Trivial districts and districts short of
/// `cfg.min_samples` complete rows come back as `InsufficientData`.
pub fn fit_district(
    table: &ResidualTable,
    district: &District,
    cfg: &FitConfig,
    psd_floor: f64,
    families: &[&dyn CopulaFamily],
) -> Result<CopulaModel> {
    let axes = district.axes.clone();
    let rows = table.complete_rows(&axes, None)?;
    let mut model = CopulaModel {
        axes: axes.clone(),
        family: FamilyTag::Gaussian,
        status: FitStatus::InsufficientData,
        n: rows.len(),
        correlation: None,
        loglik: None,
        aic: None,
        psd_corrected: false,
        kendall: Vec::new(),
        tails: Vec::new(),
        by_group: BTreeMap::new(),
    };

    if rows.len() < cfg.min_samples || district.is_trivial() {
        log::warn!(
            "district {}: {} complete rows < {}; treating as independent",
            district.label(),
            rows.len(),
            cfg.min_samples
        );
        return Ok(model);
    }

    let raw = table.select(&axes, &rows)?;
    let pairs: Vec<(usize, usize)> = (0..axes.len())
        .flat_map(|i| ((i + 1)..axes.len()).map(move |j| (i, j)))
        .collect();
    for &(i, j) in &pairs {
        model.kendall.push(PairTau {
            a: axes[i],
            b: axes[j],
            tau: stats::kendall_tau(&raw[i], &raw[j]).tau,
        });
    }

    let fit = select_family(families, &scores_for(table, &axes, &rows)?, psd_floor)?;
    if fit.psd_corrected {
        log::warn!("district {}: score correlation clipped to PSD", district.label());
    }
    log::info!(
        "district {}: n={} family={:?} loglik={:.2} aic={:.2}",
        district.label(),
        rows.len(),
        fit.family,
        fit.loglik,
        fit.aic()
    );
    model.status = FitStatus::Fitted;
    model.family = fit.family;
    model.loglik = Some(fit.loglik);
    model.aic = Some(fit.aic());
    model.psd_corrected = fit.psd_corrected;
    let global = fit.correlation;

    for &(i, j) in &pairs {
        let (lower, upper) = stats::empirical_tail_dependence(&raw[i], &raw[j], TAIL_QUANTILE);
        let tail = PairTail {
            a: axes[i],
            b: axes[j],
            lower,
            upper,
            gaussian: stats::gaussian_tail_dependence(global.get(i, j), TAIL_QUANTILE),
        };
        if tail.max_gap() > TAIL_TOLERANCE {
            log::warn!(
                "district {}: {}-{} tail dependence lower={:.2} upper={:.2} vs gaussian {:.2}",
                district.label(),
                tail.a,
                tail.b,
                tail.lower,
                tail.upper,
                tail.gaussian
            );
        }
        model.tails.push(tail);
    }

    for (label, group_rows) in table.group_rows() {
        let rows_g = table.complete_rows(&axes, Some(&group_rows))?;
        let n_g = rows_g.len();
        if n_g < cfg.min_group_samples {
            log::debug!(
                "district {} group {label}: n={n_g} below {}; using global",
                district.label(),
                cfg.min_group_samples
            );
            continue;
        }
        let group_fit = match select_family(families, &scores_for(table, &axes, &rows_g)?, psd_floor)
        {
            Ok(f) => f,
            Err(e) => {
                log::warn!("district {} group {label}: {e}; using global", district.label());
                continue;
            }
        };
        let weight = n_g as f64 / (n_g as f64 + cfg.shrinkage_k);
        model.by_group.insert(
            label,
            GroupCorrelation {
                n: n_g,
                weight,
                correlation: shrink(&group_fit.correlation, &global, weight),
                raw: group_fit.correlation,
            },
        );
    }

    model.correlation = Some(global);
    Ok(model)
}

/// `w·group + (1 − w)·global`, element-wise with a unit diagonal.
fn shrink(group: &SymMatrix, global: &SymMatrix, weight: f64) -> SymMatrix {
    let d = global.dim();
    let mut out = SymMatrix::identity(d);
    for i in 0..d {
        for j in (i + 1)..d {
            out.set_sym(i, j, weight * group.get(i, j) + (1.0 - weight) * global.get(i, j));
        }
    }
    out
}

/// Fit every non-trivial district with the Gaussian family.
pub fn fit_copulas(
    table: &ResidualTable,
    districts: &[District],
    cfg: &FitConfig,
    psd_floor: f64,
    group_column: Option<String>,
) -> Result<CopulaArtifact> {
    let gaussian = GaussianFamily;
    let families: [&dyn CopulaFamily; 1] = [&gaussian];
    let models = districts
        .iter()
        .filter(|d| !d.is_trivial())
        .map(|d| fit_district(table, d, cfg, psd_floor, &families))
        .collect::<Result<Vec<_>>>()?;
    Ok(CopulaArtifact::new(group_column, models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn correlated_table(n: usize, rho: f64, seed: u64, group: Option<&str>) -> ResidualTable {
        let mut t = ResidualTable::new();
        append_correlated(&mut t, n, rho, seed, group, "sp");
        t
    }

    fn append_correlated(
        t: &mut ResidualTable,
        n: usize,
        rho: f64,
        seed: u64,
        group: Option<&str>,
        prefix: &str,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..n {
            let a: f64 = rng.sample(StandardNormal);
            let b: f64 = rng.sample(StandardNormal);
            let c: f64 = rng.sample(StandardNormal);
            let l = a;
            let m = rho * a + (1.0 - rho * rho).sqrt() * b;
            let row: BTreeMap<Axis, f64> = [(Axis::L, l), (Axis::M, m), (Axis::N, c)].into();
            t.push(format!("{prefix}{i}"), &row, group.map(str::to_string));
        }
    }

    fn lm() -> District {
        District::new(vec![Axis::L, Axis::M])
    }

    #[test]
    fn test_bivariate_mle_recovers_rho() {
        for &rho in &[0.6, -0.3] {
            let t = correlated_table(2000, rho, 11, None);
            let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
            let m = &art.models[0];
            assert_eq!(m.status, FitStatus::Fitted);
            let est = m.rho(Axis::L, Axis::M).unwrap();
            assert!((est - rho).abs() < 0.06, "rho={rho} est={est}");
            assert_eq!(m.kendall.len(), 1);
            assert!(m.kendall[0].tau.signum() == rho.signum());
        }
    }

    #[test]
    fn test_aic_matches_loglik() {
        let t = correlated_table(300, 0.5, 3, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
        let m = &art.models[0];
        let ll = m.loglik.unwrap();
        assert!(ll > 0.0);
        assert!((m.aic.unwrap() - (2.0 - 2.0 * ll)).abs() < 1e-9);
    }

    #[test]
    fn test_mle_matches_general_loglik() {
        let t = correlated_table(500, 0.4, 5, None);
        let rows = t.complete_rows(&[Axis::L, Axis::M], None).unwrap();
        let scores = scores_for(&t, &[Axis::L, Axis::M], &rows).unwrap();
        let fit = GaussianFamily.fit(&scores, 1e-6).unwrap();
        let rho = fit.correlation.get(0, 1);
        for delta in [-0.05, 0.05] {
            let mut other = SymMatrix::identity(2);
            other.set_sym(0, 1, rho + delta);
            assert!(gaussian_loglik(&scores, &other).unwrap() < fit.loglik);
        }
    }

    #[test]
    fn test_insufficient_data_falls_back_to_independence() {
        let t = correlated_table(10, 0.9, 1, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
        let m = &art.models[0];
        assert_eq!(m.status, FitStatus::InsufficientData);
        assert!(m.correlation.is_none());
        let pc = art.correlation_between(Axis::L, Axis::M, None).unwrap();
        assert_eq!(pc.rho, 0.0);
        assert_eq!(pc.source, CorrelationSource::Unfitted);
        assert!(art.fitted_districts().is_empty());
    }

    #[test]
    fn test_three_axis_district_is_psd() {
        let t = correlated_table(400, 0.7, 9, None);
        let d = District::new(vec![Axis::L, Axis::M, Axis::N]);
        let art = fit_copulas(&t, &[d], &FitConfig::default(), 1e-6, None).unwrap();
        let m = &art.models[0];
        let corr = m.correlation.as_ref().unwrap();
        assert_eq!(corr.dim(), 3);
        assert!(corr.min_eigenvalue() > 0.0);
        assert_eq!(m.kendall.len(), 3);
        assert_eq!(m.aic.map(|a| a.is_finite()), Some(true));
    }

    #[test]
    fn test_group_shrinkage_and_small_group_skipped() {
        let mut t = ResidualTable::new();
        append_correlated(&mut t, 400, 0.1, 21, Some("AM"), "am");
        append_correlated(&mut t, 100, 0.8, 22, Some("EM"), "em");
        append_correlated(&mut t, 5, -0.9, 23, Some("NM"), "nm");
        let cfg = FitConfig::default();
        let art = fit_copulas(&t, &[lm()], &cfg, 1e-6, Some("myco".into())).unwrap();
        let m = &art.models[0];

        assert!(m.by_group.contains_key("AM"));
        assert!(!m.by_group.contains_key("NM"));
        let em = &m.by_group["EM"];
        assert_eq!(em.n, 100);
        assert!((em.weight - 100.0 / 150.0).abs() < 1e-12);

        let global = m.rho(Axis::L, Axis::M).unwrap();
        let raw = em.raw.get(0, 1);
        let shrunk = em.correlation.get(0, 1);
        assert!((shrunk - (em.weight * raw + (1.0 - em.weight) * global)).abs() < 1e-12);
        assert!(shrunk > global && shrunk < raw);

        let pc = art.correlation_between(Axis::L, Axis::M, Some("EM")).unwrap();
        assert_eq!(pc.source, CorrelationSource::Group);
        let pc = art.correlation_between(Axis::L, Axis::M, Some("NM")).unwrap();
        assert_eq!(pc.source, CorrelationSource::Global);
        assert!(pc.group_fallback);
        assert_eq!(pc.rho, global);
    }

    #[test]
    fn test_pairs_outside_districts_are_independent() {
        let t = correlated_table(100, 0.5, 2, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
        let pc = art.correlation_between(Axis::L, Axis::N, Some("AM")).unwrap();
        assert_eq!(pc.rho, 0.0);
        assert_eq!(pc.source, CorrelationSource::Independent);
        assert!(!pc.group_fallback);
    }

    struct FixedFamily(f64);

    impl CopulaFamily for FixedFamily {
        fn tag(&self) -> FamilyTag {
            FamilyTag::Gaussian
        }

        fn fit(&self, _scores: &[Vec<f64>], _psd_floor: f64) -> Result<FamilyFit> {
            Ok(FamilyFit {
                family: FamilyTag::Gaussian,
                correlation: SymMatrix::identity(2),
                loglik: self.0,
                n_params: 1,
                psd_corrected: false,
            })
        }
    }

    #[test]
    fn test_select_family_lowest_aic() {
        let low = FixedFamily(1.0);
        let high = FixedFamily(10.0);
        let scores = vec![vec![0.0; 3], vec![0.0; 3]];
        let fit = select_family(&[&low, &high], &scores, 1e-6).unwrap();
        assert_eq!(fit.loglik, 10.0);
        assert!(select_family(&[], &scores, 1e-6).is_err());
    }

    #[test]
    fn test_tail_dependence_recorded_per_pair() {
        let t = correlated_table(2000, 0.6, 11, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
        let m = &art.models[0];
        assert_eq!(m.tails.len(), 1);
        let tail = &m.tails[0];
        assert_eq!((tail.a, tail.b), (Axis::L, Axis::M));
        let rho = m.rho(Axis::L, Axis::M).unwrap();
        assert!((tail.gaussian - stats::gaussian_tail_dependence(rho, TAIL_QUANTILE)).abs() < 1e-12);
        assert!(tail.gaussian > 0.3);
        assert!(tail.max_gap() < TAIL_TOLERANCE, "{tail:?}");
    }

    #[test]
    fn test_artifact_load_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("copulas.json");
        let t = correlated_table(200, 0.5, 4, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();
        art.save(&path).unwrap();
        let loaded = CopulaArtifact::load(&path).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert!(loaded.rejected.is_empty());
        assert_eq!(loaded.fitted_districts(), vec![lm()]);

        std::fs::write(&path, "{\"version\":1,\"models\":[{\"family\":\"gaussian\"}]}").unwrap();
        assert!(matches!(
            CopulaArtifact::load(&path),
            Err(EcoaxisError::MalformedArtifact(_))
        ));
        std::fs::write(&path, "{\"version\":9,\"models\":[]}").unwrap();
        assert!(CopulaArtifact::load(&path).is_err());
        std::fs::write(&path, "not json").unwrap();
        assert!(CopulaArtifact::load(&path).is_err());
    }

    #[test]
    fn test_bad_model_fails_only_its_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("copulas.json");
        let t = correlated_table(200, 0.5, 4, None);
        let art = fit_copulas(&t, &[lm()], &FitConfig::default(), 1e-6, None).unwrap();

        let mut bad = art.models[0].clone();
        bad.axes = vec![Axis::T, Axis::R];
        bad.correlation = Some(SymMatrix::identity(3));
        let mut json = serde_json::to_value(&art).unwrap();
        json["models"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::to_value(&bad).unwrap());
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

        let loaded = CopulaArtifact::load(&path).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.rejected.len(), 1);
        assert_eq!(loaded.rejected[0].axes, vec![Axis::T, Axis::R]);

        let lm_pair = loaded.correlation_between(Axis::L, Axis::M, None).unwrap();
        assert_eq!(lm_pair.source, CorrelationSource::Global);
        assert!(matches!(
            loaded.correlation_between(Axis::R, Axis::T, None),
            Err(EcoaxisError::MalformedArtifact(_))
        ));
        let cross = loaded.correlation_between(Axis::T, Axis::L, None).unwrap();
        assert_eq!(cross.source, CorrelationSource::Independent);
    }
}
