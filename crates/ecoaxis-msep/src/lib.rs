//! m-separation omnibus test for residual independence.
//!
//! Axis pairs that do not share a fitted district are assumed independent once
//! the mean predictions are accounted for. This crate checks that assumption:
//! every such pair gets a Kendall τ-b test on its residuals (optionally on
//! cluster-centred ranks), and the p-values are combined with Fisher's method
//! into one χ² statistic with `2·k` degrees of freedom.
//!
//! The outcome is a [`Verdict`]. A rejection whose unexplained effects are all
//! below a practical cutoff keeps the current district set.

use std::collections::BTreeMap;

use ecoaxis_core::stats::{average_ranks, kendall_tau, normal_two_sided_p};
use ecoaxis_core::{Axis, District, EcoaxisError, ResidualTable, Result, same_district};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Smallest p-value fed into `ln`; keeps the statistic finite.
const MIN_P: f64 = 1e-300;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration and result types
// ═══════════════════════════════════════════════════════════════════════════════

/// How ranks are prepared before the concordance test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankAdjustment {
    /// Plain Kendall τ-b on the residuals.
    #[default]
    None,
    /// Ranks centred within each cluster; the test uses `n − clusters` as its
    /// sample size.
    ClusterCentered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsepConfig {
    /// Significance level for the omnibus p-value.
    pub alpha: f64,
    /// Largest |τ| still treated as a negligible residual dependency.
    pub practical_cutoff: f64,
    pub adjustment: RankAdjustment,
    /// Pairs with fewer complete rows are skipped.
    pub min_samples: usize,
}

impl Default for MsepConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            practical_cutoff: 0.1,
            adjustment: RankAdjustment::None,
            min_samples: 30,
        }
    }
}

impl MsepConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(EcoaxisError::InvalidConfig(format!(
                "alpha must lie in (0, 1), got {}",
                self.alpha
            )));
        }
        if !(self.practical_cutoff >= 0.0 && self.practical_cutoff <= 1.0) {
            return Err(EcoaxisError::InvalidConfig(format!(
                "practical_cutoff must lie in [0, 1], got {}",
                self.practical_cutoff
            )));
        }
        if self.min_samples < 3 {
            return Err(EcoaxisError::InvalidConfig(
                "min_samples must be at least 3".into(),
            ));
        }
        Ok(())
    }
}

/// Concordance test for one axis pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairTest {
    pub a: Axis,
    pub b: Axis,
    /// Complete rows used.
    pub n: usize,
    /// Sample size behind the p-value (`n` unless ranks were cluster-centred).
    pub effective_n: usize,
    pub tau: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Fisher's combined statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FisherResult {
    /// `C = −2·Σ ln pᵢ`.
    pub statistic: f64,
    /// `2·k` for `k` combined p-values.
    pub df: usize,
    pub p_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No evidence of dependency outside the districts.
    Adequate,
    /// Omnibus rejection, but every unexplained |τ| is below the practical
    /// cutoff; the district set is kept.
    RejectedSmallEffects,
    /// Omnibus rejection with at least one practically relevant pair.
    Rejected,
}

impl Verdict {
    pub fn keeps_districts(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Adequate => "adequate",
            Self::RejectedSmallEffects => "rejected (small effects, districts kept)",
            Self::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MsepReport {
    pub adjustment: RankAdjustment,
    pub pairs: Vec<PairTest>,
    /// Pairs outside a common district with too few complete rows.
    pub skipped: Vec<(Axis, Axis)>,
    /// `None` when no pair could be tested.
    pub fisher: Option<FisherResult>,
    pub max_abs_tau: f64,
    pub verdict: Verdict,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Building blocks
// ═══════════════════════════════════════════════════════════════════════════════

/// Average ranks with each cluster's mean rank subtracted.
///
/// `clusters[i]` is the cluster index of row `i`.
pub fn cluster_centered_ranks(values: &[f64], clusters: &[usize]) -> Vec<f64> {
    let ranks = average_ranks(values);
    let mut sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for (r, &c) in ranks.iter().zip(clusters) {
        let e = sums.entry(c).or_insert((0.0, 0));
        e.0 += r;
        e.1 += 1;
    }
    ranks
        .iter()
        .zip(clusters)
        .map(|(r, c)| {
            let (sum, count) = sums[c];
            r - sum / count as f64
        })
        .collect()
}

/// Normal-approximation z of τ under independence at sample size `n`.
fn z_from_tau(tau: f64, n: usize) -> f64 {
    let nf = n as f64;
    let sd = (2.0 * (2.0 * nf + 5.0) / (9.0 * nf * (nf - 1.0))).sqrt();
    tau / sd
}

/// Kendall test on one pair of residual columns.
///
/// With [`RankAdjustment::ClusterCentered`] the columns are replaced by
/// cluster-centred ranks and the p-value is recomputed from τ at
/// `n − distinct clusters`.
pub fn pair_test(
    a: Axis,
    b: Axis,
    x: &[f64],
    y: &[f64],
    clusters: &[usize],
    adjustment: RankAdjustment,
) -> PairTest {
    let n = x.len().min(y.len());
    match adjustment {
        RankAdjustment::None => {
            let k = kendall_tau(x, y);
            PairTest {
                a,
                b,
                n,
                effective_n: n,
                tau: k.tau,
                z: k.z,
                p_value: k.p_value,
            }
        }
        RankAdjustment::ClusterCentered => {
            let n = n.min(clusters.len());
            let cx = cluster_centered_ranks(&x[..n], &clusters[..n]);
            let cy = cluster_centered_ranks(&y[..n], &clusters[..n]);
            let k = kendall_tau(&cx, &cy);
            let mut distinct = clusters[..n].to_vec();
            distinct.sort_unstable();
            distinct.dedup();
            let effective_n = n.saturating_sub(distinct.len());
            let (z, p_value) = if effective_n >= 3 {
                let z = z_from_tau(k.tau, effective_n);
                (z, normal_two_sided_p(z))
            } else {
                (0.0, 1.0)
            };
            PairTest {
                a,
                b,
                n,
                effective_n,
                tau: k.tau,
                z,
                p_value,
            }
        }
    }
}

/// Fisher's method: `C = −2·Σ ln pᵢ` against χ² with `2k` degrees of freedom.
///
/// Returns `None` for an empty input.
pub fn fisher_combine(p_values: &[f64]) -> Option<FisherResult> {
    if p_values.is_empty() {
        return None;
    }
    let statistic: f64 = p_values
        .iter()
        .map(|&p| -2.0 * p.clamp(MIN_P, 1.0).ln())
        .sum();
    let df = 2 * p_values.len();
    let p_value = ChiSquared::new(df as f64)
        .map(|d| d.sf(statistic))
        .unwrap_or(0.0);
    Some(FisherResult {
        statistic,
        df,
        p_value,
    })
}

/// Axis pairs among `axes` that share no district.
pub fn untested_pairs(axes: &[Axis], districts: &[District]) -> Vec<(Axis, Axis)> {
    let mut out = Vec::new();
    for (i, &a) in axes.iter().enumerate() {
        for &b in &axes[i + 1..] {
            if !same_district(districts, a, b) {
                out.push((a, b));
            }
        }
    }
    out
}

/// Applies the acceptance policy to a combined result.
pub fn verdict(fisher: Option<&FisherResult>, max_abs_tau: f64, cfg: &MsepConfig) -> Verdict {
    match fisher {
        Some(f) if f.p_value < cfg.alpha => {
            if max_abs_tau < cfg.practical_cutoff {
                Verdict::RejectedSmallEffects
            } else {
                Verdict::Rejected
            }
        }
        _ => Verdict::Adequate,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Omnibus test
// ═══════════════════════════════════════════════════════════════════════════════

/// Row cluster indices from an id → label map. Unlabelled rows share one
/// extra cluster.
fn cluster_indices(table: &ResidualTable, labels: Option<&BTreeMap<String, String>>) -> Vec<usize> {
    let Some(labels) = labels else {
        return vec![0; table.len()];
    };
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for label in labels.values() {
        let next = index.len();
        index.entry(label.as_str()).or_insert(next);
    }
    let unassigned = index.len();
    table
        .ids()
        .iter()
        .map(|id| {
            labels
                .get(id)
                .and_then(|l| index.get(l.as_str()).copied())
                .unwrap_or(unassigned)
        })
        .collect()
}

/// Runs the omnibus test over every pair of table axes outside a common
/// district.
///
/// `clusters` maps species id to cluster label and is only consulted for
/// [`RankAdjustment::ClusterCentered`].
pub fn msep_test(
    table: &ResidualTable,
    districts: &[District],
    cfg: &MsepConfig,
    clusters: Option<&BTreeMap<String, String>>,
) -> Result<MsepReport> {
    cfg.validate()?;
    if cfg.adjustment == RankAdjustment::ClusterCentered && clusters.is_none() {
        return Err(EcoaxisError::InvalidConfig(
            "cluster-centred ranks need cluster labels".into(),
        ));
    }
    let row_clusters = cluster_indices(table, clusters);

    let mut pairs = Vec::new();
    let mut skipped = Vec::new();
    for (a, b) in untested_pairs(&table.axes(), districts) {
        let rows = table.complete_rows(&[a, b], None)?;
        if rows.len() < cfg.min_samples {
            log::warn!(
                "m-separation: skipping {a}-{b}, {} complete rows (need {})",
                rows.len(),
                cfg.min_samples
            );
            skipped.push((a, b));
            continue;
        }
        let cols = table.select(&[a, b], &rows)?;
        let cl: Vec<usize> = rows.iter().map(|&i| row_clusters[i]).collect();
        let t = pair_test(a, b, &cols[0], &cols[1], &cl, cfg.adjustment);
        log::debug!(
            "m-separation {a}-{b}: tau={:.3} p={:.3e} n={}",
            t.tau,
            t.p_value,
            t.effective_n
        );
        pairs.push(t);
    }

    let p_values: Vec<f64> = pairs.iter().map(|t| t.p_value).collect();
    let fisher = fisher_combine(&p_values);
    let max_abs_tau = pairs.iter().map(|t| t.tau.abs()).fold(0.0, f64::max);
    let verdict = verdict(fisher.as_ref(), max_abs_tau, cfg);

    match &fisher {
        Some(f) => log::info!(
            "m-separation: C={:.2} df={} p={:.3e} max|tau|={:.3} -> {verdict}",
            f.statistic,
            f.df,
            f.p_value,
            max_abs_tau
        ),
        None => log::info!("m-separation: no pairs outside districts to test"),
    }
    if verdict == Verdict::Rejected {
        log::warn!("m-separation rejected: residual dependency outside districts");
    }

    Ok(MsepReport {
        adjustment: cfg.adjustment,
        pairs,
        skipped,
        fisher,
        max_abs_tau,
        verdict,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
