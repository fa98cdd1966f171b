//! `ecoaxis msep`: omnibus residual independence check over the fitted districts.

use std::path::Path;

use ecoaxis_core::{CopulaArtifact, Result};
use ecoaxis_msep::{MsepConfig, RankAdjustment, msep_test};

use super::fit::load_residuals;
use super::read_labels;

pub struct MsepCommandConfig<'a> {
    pub residuals: &'a Path,
    pub copulas: &'a Path,
    pub clusters: Option<&'a Path>,
    pub adjustment: RankAdjustment,
    pub alpha: f64,
    pub practical_cutoff: f64,
    pub output: Option<&'a Path>,
}

pub fn run(cfg: MsepCommandConfig<'_>) -> Result<()> {
    let copulas = CopulaArtifact::load(cfg.copulas)?;
    let (table, _) = load_residuals(cfg.residuals, None)?;
    let clusters = cfg.clusters.map(read_labels).transpose()?.map(|(_, l)| l);

    let msep_cfg = MsepConfig {
        alpha: cfg.alpha,
        practical_cutoff: cfg.practical_cutoff,
        adjustment: cfg.adjustment,
        ..MsepConfig::default()
    };
    let report = msep_test(&table, &copulas.fitted_districts(), &msep_cfg, clusters.as_ref())?;

    println!("{:<6} {:>6} {:>6} {:>8} {:>12}", "Pair", "n", "n_eff", "tau", "p");
    println!("{}", "-".repeat(42));
    for p in &report.pairs {
        println!(
            "{:<6} {:>6} {:>6} {:>8.3} {:>12.3e}",
            format!("{}-{}", p.a, p.b),
            p.n,
            p.effective_n,
            p.tau,
            p.p_value
        );
    }
    for (a, b) in &report.skipped {
        println!("{:<6} skipped (too few complete rows)", format!("{a}-{b}"));
    }
    println!();
    match &report.fisher {
        Some(f) => println!(
            "Fisher C = {:.2} on {} df, p = {:.3e}; max |tau| = {:.3}",
            f.statistic, f.df, f.p_value, report.max_abs_tau
        ),
        None => println!("No pairs outside the fitted districts."),
    }
    println!("Verdict: {}", report.verdict);

    if let Some(path) = cfg.output {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}
