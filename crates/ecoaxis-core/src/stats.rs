//! Rank and correlation statistics shared by fitting and validation.

use statrs::distribution::{Continuous, ContinuousCDF, Normal, StudentsT};
use std::cmp::Ordering;

/// Pseudo-observations are clamped away from 0 and 1 by at least this much
/// before the normal quantile is taken.
const UNIFORM_GUARD: f64 = 1e-10;

/// Correlations are clamped to this magnitude in the tail integral.
const TAIL_RHO_BOUND: f64 = 0.9999;
/// Simpson intervals for the bivariate normal tail integral (even).
const TAIL_STEPS: usize = 2000;
/// Width of the integration window above the threshold, in standard units.
const TAIL_WINDOW: f64 = 10.0;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation (n − 1 denominator).
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// 1-based ranks with ties replaced by their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        values[i]
            .partial_cmp(&values[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end share ranks start+1..=end.
        let avg = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg;
        }
        start = end;
    }
    ranks
}

/// Empirical-rank uniform margins `rank / (n + 1)`.
pub fn pseudo_observations(values: &[f64]) -> Vec<f64> {
    let denom = values.len() as f64 + 1.0;
    average_ranks(values).into_iter().map(|r| r / denom).collect()
}

/// Standard-normal scores of the pseudo-observations.
pub fn normal_scores(values: &[f64]) -> Vec<f64> {
    let norm = Normal::standard();
    pseudo_observations(values)
        .into_iter()
        .map(|u| norm.inverse_cdf(u.clamp(UNIFORM_GUARD, 1.0 - UNIFORM_GUARD)))
        .collect()
}

/// Pearson correlation; 0 when either input is constant.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    }
}

/// Two-sided p-value for a Pearson correlation via the t distribution.
pub fn pearson_p_value(r: f64, n: usize) -> f64 {
    if n < 3 {
        return 1.0;
    }
    let df = (n - 2) as f64;
    let denom = 1.0 - r * r;
    if denom <= 1e-15 {
        return 0.0;
    }
    let t = r.abs() * (df / denom).sqrt();
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// Two-sided standard-normal tail probability of `|z|`.
pub fn normal_two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return if z.is_nan() { 1.0 } else { 0.0 };
    }
    (2.0 * Normal::standard().sf(z.abs())).clamp(0.0, 1.0)
}

/// Empirical lower and upper tail dependence at level `q` (e.g. 0.9):
/// `P(U ≤ 1 − q, V ≤ 1 − q) / (1 − q)` and `P(U > q, V > q) / (1 − q)` on the
/// pseudo-observations of `x` and `y`.
pub fn empirical_tail_dependence(x: &[f64], y: &[f64], q: f64) -> (f64, f64) {
    let n = x.len().min(y.len());
    if n == 0 || !(0.5..1.0).contains(&q) {
        return (0.0, 0.0);
    }
    let u = pseudo_observations(&x[..n]);
    let v = pseudo_observations(&y[..n]);
    let lo = 1.0 - q;
    let lower = u.iter().zip(&v).filter(|&(&a, &b)| a <= lo && b <= lo).count();
    let upper = u.iter().zip(&v).filter(|&(&a, &b)| a > q && b > q).count();
    let scale = n as f64 * (1.0 - q);
    (lower as f64 / scale, upper as f64 / scale)
}

/// Tail dependence at level `q` implied by a Gaussian copula with
/// correlation `rho`. Equal in both tails by symmetry.
pub fn gaussian_tail_dependence(rho: f64, q: f64) -> f64 {
    if !(0.5..1.0).contains(&q) || !rho.is_finite() {
        return 0.0;
    }
    let norm = Normal::standard();
    let rho = rho.clamp(-TAIL_RHO_BOUND, TAIL_RHO_BOUND);
    let s = (1.0 - rho * rho).sqrt();
    let h = norm.inverse_cdf(q);
    // P(X > h, Y > h) = ∫_h^∞ φ(x) · P(Y > h | X = x) dx
    let f = |x: f64| norm.pdf(x) * norm.sf((h - rho * x) / s);

    let step = TAIL_WINDOW / TAIL_STEPS as f64;
    let mut sum = f(h) + f(h + TAIL_WINDOW);
    for k in 1..TAIL_STEPS {
        let w = if k % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(h + k as f64 * step);
    }
    (sum * step / 3.0 / (1.0 - q)).clamp(0.0, 1.0)
}

/// Benjamini–Hochberg adjusted p-values (q-values), in input order.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    if pvalues.is_empty() {
        return Vec::new();
    }
    let m = pvalues.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| {
        pvalues[i]
            .partial_cmp(&pvalues[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });

    let mut q = vec![1.0; m];
    let mut prev = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let rank = rank0 + 1;
        let adj = (pvalues[idx] * m as f64 / rank as f64).min(1.0);
        prev = prev.min(adj);
        q[idx] = prev;
    }
    q
}

/// Kendall rank correlation with its null test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KendallResult {
    /// Tie-adjusted τ-b.
    pub tau: f64,
    /// Concordant minus discordant pairs.
    pub s: f64,
    /// Normal-approximation z score of `s`.
    pub z: f64,
    /// Two-sided p-value.
    pub p_value: f64,
    pub n: usize,
}

fn tie_sums(values: &[f64]) -> (f64, f64, f64, f64) {
    // Returns Σt(t−1)/2, Σt(t−1)(2t+5), Σt(t−1), Σt(t−1)(t−2) over tie groups.
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mut pairs = 0.0;
    let mut v = 0.0;
    let mut t1 = 0.0;
    let mut t2 = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        let t = (j - i) as f64;
        if t > 1.0 {
            pairs += t * (t - 1.0) / 2.0;
            v += t * (t - 1.0) * (2.0 * t + 5.0);
            t1 += t * (t - 1.0);
            t2 += t * (t - 1.0) * (t - 2.0);
        }
        i = j;
    }
    (pairs, v, t1, t2)
}

/// Kendall τ-b with tie-corrected null variance (O(n²)).
pub fn kendall_tau(x: &[f64], y: &[f64]) -> KendallResult {
    let n = x.len().min(y.len());
    if n < 3 {
        return KendallResult {
            tau: 0.0,
            s: 0.0,
            z: 0.0,
            p_value: 1.0,
            n,
        };
    }
    let (x, y) = (&x[..n], &y[..n]);

    let mut s = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = (x[i] - x[j]).partial_cmp(&0.0).unwrap_or(Ordering::Equal);
            let dy = (y[i] - y[j]).partial_cmp(&0.0).unwrap_or(Ordering::Equal);
            s += match (dx, dy) {
                (Ordering::Equal, _) | (_, Ordering::Equal) => 0.0,
                (a, b) if a == b => 1.0,
                _ => -1.0,
            };
        }
    }

    let nf = n as f64;
    let n0 = nf * (nf - 1.0) / 2.0;
    let (n1, vx, x1, x2) = tie_sums(x);
    let (n2, vy, y1, y2) = tie_sums(y);

    let denom = ((n0 - n1) * (n0 - n2)).sqrt();
    let tau = if denom > 0.0 { s / denom } else { 0.0 };

    let var_s = (nf * (nf - 1.0) * (2.0 * nf + 5.0) - vx - vy) / 18.0
        + x1 * y1 / (2.0 * nf * (nf - 1.0))
        + x2 * y2 / (9.0 * nf * (nf - 1.0) * (nf - 2.0));
    let z = if var_s > 0.0 { s / var_s.sqrt() } else { 0.0 };

    KendallResult {
        tau,
        s,
        z,
        p_value: if var_s > 0.0 { normal_two_sided_p(z) } else { 1.0 },
        n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_ranks_ties() {
        let r = average_ranks(&[10.0, 20.0, 10.0, 30.0]);
        assert_eq!(r, vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn test_pseudo_observations_in_unit_interval() {
        let u = pseudo_observations(&[3.0, 1.0, 2.0]);
        assert_eq!(u, vec![0.75, 0.25, 0.5]);
    }

    #[test]
    fn test_normal_scores_symmetric() {
        let z = normal_scores(&[1.0, 2.0, 3.0]);
        assert!((z[0] + z[2]).abs() < 1e-12);
        assert!(z[1].abs() < 1e-12);
    }

    #[test]
    fn test_pearson_perfect_and_constant() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson(&a, &[2.0, 4.0, 6.0, 8.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&a, &[4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&a, &[5.0; 4]), 0.0);
    }

    #[test]
    fn test_pearson_p_value_monotone_in_r() {
        let p_small = pearson_p_value(0.1, 100);
        let p_large = pearson_p_value(0.5, 100);
        assert!(p_large < p_small);
        assert!(p_small > 0.05);
        assert!(p_large < 1e-4);
        assert_eq!(pearson_p_value(0.9, 2), 1.0);
    }

    #[test]
    fn test_benjamini_hochberg() {
        let q = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.5]);
        // Sorted: 0.01 (1), 0.03 (2), 0.04 (3), 0.5 (4)
        assert!((q[0] - 0.04).abs() < 1e-12);
        assert!((q[2] - 0.0533333333).abs() < 1e-6);
        assert!((q[1] - 0.0533333333).abs() < 1e-6);
        assert!((q[3] - 0.5).abs() < 1e-12);
        assert!(benjamini_hochberg(&[]).is_empty());
    }

    #[test]
    fn test_kendall_perfect_agreement() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let r = kendall_tau(&x, &x);
        assert!((r.tau - 1.0).abs() < 1e-12);
        assert!(r.p_value < 1e-6);

        let rev: Vec<f64> = x.iter().rev().copied().collect();
        let r = kendall_tau(&x, &rev);
        assert!((r.tau + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kendall_with_ties_bounded() {
        let x = [1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let y = [1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        let r = kendall_tau(&x, &y);
        assert!(r.tau.abs() < 1e-12);
        assert!((r.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kendall_short_input() {
        let r = kendall_tau(&[1.0, 2.0], &[2.0, 1.0]);
        assert_eq!(r.p_value, 1.0);
        assert_eq!(r.n, 2);
    }

    #[test]
    fn test_gaussian_tail_dependence() {
        // Independence: P(U > q)² / (1 − q) = 1 − q.
        assert!((gaussian_tail_dependence(0.0, 0.9) - 0.1).abs() < 1e-6);
        let weak = gaussian_tail_dependence(0.3, 0.9);
        let strong = gaussian_tail_dependence(0.6, 0.9);
        assert!(0.1 < weak && weak < strong);
        assert!(gaussian_tail_dependence(-0.6, 0.9) < 0.1);
        assert!(gaussian_tail_dependence(1.0, 0.9) > 0.9);
    }

    #[test]
    fn test_empirical_tail_dependence_extremes() {
        let x: Vec<f64> = (1..=1000).map(f64::from).collect();
        let (lower, upper) = empirical_tail_dependence(&x, &x, 0.9);
        assert!((lower - 1.0).abs() < 1e-9);
        assert!((upper - 1.0).abs() < 1e-9);

        let rev: Vec<f64> = x.iter().rev().copied().collect();
        assert_eq!(empirical_tail_dependence(&x, &rev, 0.9), (0.0, 0.0));
        assert_eq!(empirical_tail_dependence(&[], &[], 0.9), (0.0, 0.0));
    }
}
