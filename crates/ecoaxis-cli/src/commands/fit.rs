//! `ecoaxis fit`: districts, copulas and residual σ from historical residuals.

use std::path::Path;

use ecoaxis_core::{
    CandidateEdge, DistrictArtifact, FitStatus, ResidualTable, Result, candidate_edges,
    curated_edges, decompose, fit_copulas, fit_sigma, parse_edge_list,
};

use super::{load_engine_config, read_axis_rows, read_labels};

pub struct FitCommandConfig<'a> {
    pub residuals: &'a Path,
    pub groups: Option<&'a Path>,
    pub edges: Option<&'a str>,
    pub config: Option<&'a Path>,
    pub out: &'a Path,
}

/// Residual table with optional group labels; returns the group column name.
pub fn load_residuals(path: &Path, groups: Option<&Path>) -> Result<(ResidualTable, Option<String>)> {
    let mut table = ResidualTable::new();
    for (id, values) in read_axis_rows(path)? {
        table.push(id, &values, None);
    }
    let column = match groups {
        Some(g) => {
            let (name, labels) = read_labels(g)?;
            table.set_groups(&labels);
            Some(name)
        }
        None => None,
    };
    Ok((table, column))
}

pub fn run(cfg: FitCommandConfig<'_>) -> Result<()> {
    let engine = load_engine_config(cfg.config)?;
    let (table, label_column) = load_residuals(cfg.residuals, cfg.groups)?;
    let group_column = engine.group_column.clone().or(label_column);
    let axes = table.axes();
    println!(
        "Fitting {} residual rows over axes {}",
        table.len(),
        axes.iter().map(|a| a.name()).collect::<Vec<_>>().join(",")
    );

    let (edges, candidates): (Vec<_>, Vec<CandidateEdge>) = match cfg.edges {
        Some("curated") => (curated_edges(), Vec::new()),
        Some(list) => (parse_edge_list(list)?, Vec::new()),
        None => {
            let candidates = candidate_edges(&table, &engine.fit)?;
            let selected = candidates
                .iter()
                .filter(|e| e.selected)
                .map(|e| (e.a, e.b))
                .collect();
            (selected, candidates)
        }
    };
    let edges: Vec<_> = edges
        .into_iter()
        .filter(|(a, b)| axes.contains(a) && axes.contains(b))
        .collect();

    let districts = decompose(&axes, &edges);
    let copulas = fit_copulas(&table, &districts, &engine.fit, engine.psd_floor, group_column.clone())?;
    let sigma = fit_sigma(&table, &engine.fit, group_column)?;

    std::fs::create_dir_all(cfg.out)?;
    DistrictArtifact::new(districts.clone(), candidates).save(&cfg.out.join("districts.json"))?;
    copulas.save(&cfg.out.join("copulas.json"))?;
    sigma.save(&cfg.out.join("sigma.json"))?;

    println!();
    println!("{:<12} {:>6} {:>10} {:>10}  {:<8} {}", "District", "n", "logL", "AIC", "Status", "Groups");
    println!("{}", "-".repeat(64));
    for d in &districts {
        match copulas.models.iter().find(|m| m.axes == d.axes) {
            Some(m) => {
                let status = match m.status {
                    FitStatus::Fitted => "fitted",
                    FitStatus::InsufficientData => "thin",
                };
                let num = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{x:.2}"));
                println!(
                    "{:<12} {:>6} {:>10} {:>10}  {:<8} {}",
                    d.label(),
                    m.n,
                    num(m.loglik),
                    num(m.aic),
                    status,
                    m.by_group.len()
                );
            }
            None => println!("{:<12} {:>6} {:>10} {:>10}  {:<8}", d.label(), "-", "-", "-", "single"),
        }
    }
    println!();
    println!("Artifacts written to {}", cfg.out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoaxis_core::{Axis, CopulaArtifact, SigmaArtifact};

    /// Deterministic residuals: L and M strongly coupled, others spread by an LCG.
    fn write_residuals(path: &Path, n: usize) {
        let mut state: u64 = 42;
        let mut next = move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) - 0.5
        };
        let mut csv = String::from("id,L,M,T,R,N\n");
        for i in 0..n {
            let l = next();
            let m = 0.9 * l + 0.1 * next();
            csv.push_str(&format!("sp{i},{l},{m},{},{},{}\n", next(), next(), next()));
        }
        std::fs::write(path, csv).unwrap();
    }

    #[test]
    fn test_fit_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let residuals = dir.path().join("res.csv");
        write_residuals(&residuals, 120);
        let out = dir.path().join("fit");
        run(FitCommandConfig {
            residuals: &residuals,
            groups: None,
            edges: Some("L-M"),
            config: None,
            out: &out,
        })
        .unwrap();

        let copulas = CopulaArtifact::load(&out.join("copulas.json")).unwrap();
        assert_eq!(copulas.models.len(), 1);
        assert!(copulas.model_for(Axis::L, Axis::M).unwrap().rho(Axis::L, Axis::M).unwrap() > 0.8);
        let sigma = SigmaArtifact::load(&out.join("sigma.json")).unwrap();
        assert!(sigma.sigma_for(Axis::N, None).unwrap().sigma > 0.0);
        assert!(DistrictArtifact::load(&out.join("districts.json")).is_ok());
    }

    #[test]
    fn test_groups_file_names_group_column() {
        let dir = tempfile::tempdir().unwrap();
        let residuals = dir.path().join("res.csv");
        write_residuals(&residuals, 60);
        let groups = dir.path().join("groups.csv");
        let mut g = String::from("id,myco\n");
        for i in 0..60 {
            g.push_str(&format!("sp{i},{}\n", if i % 2 == 0 { "AM" } else { "EM" }));
        }
        std::fs::write(&groups, g).unwrap();

        let (table, column) = load_residuals(&residuals, Some(&groups)).unwrap();
        assert_eq!(column.as_deref(), Some("myco"));
        assert_eq!(table.group(0), Some("AM"));
        assert_eq!(table.group_rows()["EM"].len(), 30);
    }
}
