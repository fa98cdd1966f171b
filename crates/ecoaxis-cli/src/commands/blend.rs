//! `ecoaxis blend`: pull trait predictions toward phylogenetic neighbours.

use std::path::Path;

use ecoaxis_core::{Axis, BlendOutcome, PhyloTree, ReferenceValues, Result, SpeciesRecord, blend_all};

use super::{fmt_opt, load_engine_config, read_axis_rows, read_predictions, write_csv};

const BLEND_HEADER: [&str; 8] = [
    "species_id",
    "axis",
    "trait_value",
    "neighbour_estimate",
    "alpha",
    "value",
    "neighbours",
    "flag",
];

pub struct BlendCommandConfig<'a> {
    pub predictions: &'a Path,
    pub tree: &'a Path,
    pub references: &'a Path,
    pub config: Option<&'a Path>,
    pub out: &'a Path,
    pub blended: Option<&'a Path>,
}

/// Reference values with missing cells dropped.
fn load_references(path: &Path) -> Result<ReferenceValues> {
    Ok(read_axis_rows(path)?
        .into_iter()
        .map(|(id, values)| {
            let finite = values.into_iter().filter(|(_, v)| v.is_finite()).collect();
            (id, finite)
        })
        .collect())
}

fn outcome_rows(outcome: &BlendOutcome) -> impl Iterator<Item = Vec<String>> + '_ {
    outcome.axes.iter().map(|(axis, b)| {
        let flag = match b.skipped {
            Some(skip) => serde_json::to_value(skip)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            None => String::new(),
        };
        vec![
            outcome.species_id.clone(),
            axis.to_string(),
            format!("{:.6}", b.trait_value),
            fmt_opt(b.neighbour_estimate),
            format!("{:.3}", b.alpha),
            format!("{:.6}", b.value),
            b.neighbours.to_string(),
            flag,
        ]
    })
}

fn prediction_row(species: &SpeciesRecord) -> Vec<String> {
    std::iter::once(species.id.clone())
        .chain(
            Axis::ALL
                .iter()
                .map(|axis| fmt_opt(species.means.get(axis).copied())),
        )
        .collect()
}

pub fn run(cfg: BlendCommandConfig<'_>) -> Result<()> {
    let engine = load_engine_config(cfg.config)?;
    let tree = PhyloTree::load(cfg.tree)?;
    let references = load_references(cfg.references)?;
    let species = read_predictions(cfg.predictions, None)?;
    log::info!(
        "tree with {} tips, {} references, {} species",
        tree.tip_count(),
        references.len(),
        species.len()
    );

    let outcomes = blend_all(&species, &tree, &references, &engine.blend);
    let mut rows = Vec::new();
    let mut blended = Vec::with_capacity(species.len());
    let mut failed = 0usize;
    for (s, outcome) in species.iter().zip(&outcomes) {
        match outcome {
            Ok(o) => {
                rows.extend(outcome_rows(o));
                blended.push(o.apply(s));
            }
            Err(e) => {
                log::warn!("blend {}: {e}", s.id);
                failed += 1;
                blended.push(s.clone());
            }
        }
    }
    write_csv(cfg.out, &BLEND_HEADER, rows)?;

    if let Some(path) = cfg.blended {
        let header: Vec<&str> = std::iter::once("id")
            .chain(Axis::ALL.iter().map(|a| a.name()))
            .collect();
        write_csv(path, &header, blended.iter().map(prediction_row))?;
    }

    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(b) if b.skipped()))
        .count();
    println!(
        "Blended {} species ({skipped} with trait-only axes, {failed} failed) -> {}",
        species.len(),
        cfg.out.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_command_writes_rows_and_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let p = |name: &str| dir.path().join(name);
        std::fs::write(p("tree.nwk"), "((spA:1,spB:1):1,(spC:1,spD:1):1);").unwrap();
        std::fs::write(p("refs.csv"), "id,M,N\nspB,8.0,2.0\nspC,2.0,\n").unwrap();
        std::fs::write(p("pred.csv"), "id,M,N\nspA,5.0,5.0\nspX,4.0,4.0\n").unwrap();
        std::fs::write(p("cfg.json"), r#"{"blend": {"default_alpha": 1.0, "k": 1}}"#).unwrap();

        let cfg_path = p("cfg.json");
        run(BlendCommandConfig {
            predictions: &p("pred.csv"),
            tree: &p("tree.nwk"),
            references: &p("refs.csv"),
            config: Some(&cfg_path),
            out: &p("blend.csv"),
            blended: Some(&p("blended.csv")),
        })
        .unwrap();

        let rows = std::fs::read_to_string(p("blend.csv")).unwrap();
        assert_eq!(rows.lines().count(), 1 + 4);
        assert!(rows.lines().any(|l| l.starts_with("spX,M,") && l.ends_with("not_in_tree")));

        let blended = std::fs::read_to_string(p("blended.csv")).unwrap();
        let a = blended.lines().find(|l| l.starts_with("spA,")).unwrap();
        assert_eq!(a, "spA,,,8.000000,,2.000000");
    }
}
