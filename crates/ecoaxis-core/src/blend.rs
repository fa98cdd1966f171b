//! Phylogenetic neighbour blending.
//!
//! Pulls a trait-based prediction toward the inverse-distance-weighted mean
//! of reference species on the same tree:
//! `final = (1 − α)·μ + α·Σ wᵢ vᵢ` with `wᵢ ∝ 1 / (dᵢ + ε)^x`.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::axis::Axis;
use crate::config::BlendConfig;
use crate::error::{EcoaxisError, Result};
use crate::phylo::PhyloTree;
use crate::requirement::SpeciesRecord;

/// Known axis values of reference species, keyed by species id.
pub type ReferenceValues = BTreeMap<String, BTreeMap<Axis, f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendSkip {
    /// Target species is not a tip of the tree.
    NotInTree,
    /// No reference with a value on this axis shares the tree.
    NoReferences,
}

/// Per-axis blending record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisBlend {
    pub trait_value: f64,
    pub neighbour_estimate: Option<f64>,
    pub alpha: f64,
    pub value: f64,
    pub neighbours: usize,
    pub skipped: Option<BlendSkip>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlendOutcome {
    pub species_id: String,
    pub axes: BTreeMap<Axis, AxisBlend>,
}

impl BlendOutcome {
    /// True when any axis kept its trait-only value.
    pub fn skipped(&self) -> bool {
        self.axes.values().any(|a| a.skipped.is_some())
    }

    /// Copy of `species` with blended means.
    pub fn apply(&self, species: &SpeciesRecord) -> SpeciesRecord {
        let mut out = species.clone();
        for (axis, b) in &self.axes {
            out.means.insert(*axis, b.value);
        }
        out
    }
}

fn trait_only(mu: f64, alpha: f64, skip: BlendSkip) -> AxisBlend {
    AxisBlend {
        trait_value: mu,
        neighbour_estimate: None,
        alpha,
        value: mu,
        neighbours: 0,
        skipped: Some(skip),
    }
}

/// Blend every predicted axis of `species`.
///
/// The target is never its own reference. Neighbours are ordered by
/// distance, ties by species id, before `k` truncation.
pub fn blend_species(
    species: &SpeciesRecord,
    tree: &PhyloTree,
    references: &ReferenceValues,
    cfg: &BlendConfig,
) -> Result<BlendOutcome> {
    let mut axes = BTreeMap::new();

    let distances = match tree.distances_from(&species.id) {
        Ok(d) => Some(d),
        Err(EcoaxisError::MissingReference(msg)) => {
            log::warn!("blend {}: {msg}; using trait-only values", species.id);
            None
        }
        Err(e) => return Err(e),
    };

    let mut neighbours: Vec<(&str, f64)> = distances
        .iter()
        .flatten()
        .filter(|(id, d)| id.as_str() != species.id && d.is_finite() && references.contains_key(*id))
        .map(|(id, &d)| (id.as_str(), d))
        .collect();
    neighbours.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    for (&axis, &mu) in &species.means {
        if !mu.is_finite() {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "species {} has non-finite mean on {axis}",
                species.id
            )));
        }
        let alpha = cfg.alpha_for(axis);
        if distances.is_none() {
            axes.insert(axis, trait_only(mu, alpha, BlendSkip::NotInTree));
            continue;
        }

        let with_value = neighbours.iter().filter_map(|&(id, d)| {
            references
                .get(id)
                .and_then(|vals| vals.get(&axis))
                .filter(|v| v.is_finite())
                .map(|&v| (d, v))
        });
        let retained: Vec<(f64, f64)> = match cfg.k {
            Some(k) => with_value.take(k).collect(),
            None => with_value.collect(),
        };
        if retained.is_empty() {
            log::debug!("blend {} {axis}: no references on tree", species.id);
            axes.insert(axis, trait_only(mu, alpha, BlendSkip::NoReferences));
            continue;
        }

        let weights: Vec<f64> = retained
            .iter()
            .map(|&(d, _)| 1.0 / (d + cfg.epsilon).powf(cfg.exponent))
            .collect();
        let total: f64 = weights.iter().sum();
        let estimate: f64 = weights
            .iter()
            .zip(&retained)
            .map(|(w, &(_, v))| (w / total) * v)
            .sum();

        axes.insert(
            axis,
            AxisBlend {
                trait_value: mu,
                neighbour_estimate: Some(estimate),
                alpha,
                value: (1.0 - alpha) * mu + alpha * estimate,
                neighbours: retained.len(),
                skipped: None,
            },
        );
    }

    Ok(BlendOutcome {
        species_id: species.id.clone(),
        axes,
    })
}

/// Blend a list of species; per-species errors are returned in place.
pub fn blend_all(
    species: &[SpeciesRecord],
    tree: &PhyloTree,
    references: &ReferenceValues,
    cfg: &BlendConfig,
) -> Vec<Result<BlendOutcome>> {
    let out: Vec<Result<BlendOutcome>> = species
        .iter()
        .map(|s| blend_species(s, tree, references, cfg))
        .collect();
    let skipped = out
        .iter()
        .filter(|r| matches!(r, Ok(b) if b.skipped()))
        .count();
    log::info!("blended {} species ({skipped} with trait-only axes)", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = "(((target:1,near:1):1,mid:3):1,(far:4,other:1):1);";

    fn refs() -> ReferenceValues {
        let mut r = ReferenceValues::new();
        r.insert("near".into(), [(Axis::L, 8.0), (Axis::M, 2.0)].into());
        r.insert("mid".into(), [(Axis::L, 4.0), (Axis::M, 6.0)].into());
        r.insert("far".into(), [(Axis::L, 1.0)].into());
        // Own observed value must never be used.
        r.insert("target".into(), [(Axis::L, 100.0), (Axis::M, 100.0)].into());
        r
    }

    fn target() -> SpeciesRecord {
        SpeciesRecord::new("target", [(Axis::L, 5.0), (Axis::M, 5.0)])
    }

    fn cfg(alpha: f64, k: Option<usize>) -> BlendConfig {
        BlendConfig {
            default_alpha: alpha,
            k,
            ..BlendConfig::default()
        }
    }

    #[test]
    fn test_alpha_zero_is_trait_value() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let out = blend_species(&target(), &tree, &refs(), &cfg(0.0, None)).unwrap();
        assert_eq!(out.axes[&Axis::L].value, 5.0);
        assert_eq!(out.axes[&Axis::M].value, 5.0);
    }

    #[test]
    fn test_alpha_one_k_one_is_nearest_value() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let out = blend_species(&target(), &tree, &refs(), &cfg(1.0, Some(1))).unwrap();
        assert_eq!(out.axes[&Axis::L].value, 8.0);
        assert_eq!(out.axes[&Axis::M].value, 2.0);
        assert_eq!(out.axes[&Axis::L].neighbours, 1);
    }

    #[test]
    fn test_inverse_distance_weights() {
        let tree = PhyloTree::parse(TREE).unwrap();
        // near d=2, mid d=5 on M (far has no M value)
        let out = blend_species(&target(), &tree, &refs(), &cfg(1.0, None)).unwrap();
        let m = &out.axes[&Axis::M];
        let (w1, w2) = (1.0 / 4.0, 1.0 / 25.0);
        let expected = (w1 * 2.0 + w2 * 6.0) / (w1 + w2);
        assert!((m.value - expected).abs() < 1e-9);
        assert_eq!(m.neighbours, 2);
        assert_eq!(out.axes[&Axis::L].neighbours, 3);
    }

    #[test]
    fn test_per_axis_alpha() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let mut c = cfg(0.0, Some(1));
        c.alpha.insert(Axis::M, 0.5);
        let out = blend_species(&target(), &tree, &refs(), &c).unwrap();
        assert_eq!(out.axes[&Axis::L].value, 5.0);
        assert_eq!(out.axes[&Axis::M].value, 3.5);
    }

    #[test]
    fn test_absent_target_is_flagged() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let s = SpeciesRecord::new("unknown", [(Axis::L, 5.0)]);
        let out = blend_species(&s, &tree, &refs(), &cfg(1.0, None)).unwrap();
        assert_eq!(out.axes[&Axis::L].value, 5.0);
        assert_eq!(out.axes[&Axis::L].skipped, Some(BlendSkip::NotInTree));
        assert!(out.skipped());
    }

    #[test]
    fn test_empty_reference_set_is_flagged() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let out = blend_species(&target(), &tree, &ReferenceValues::new(), &cfg(1.0, None)).unwrap();
        assert_eq!(out.axes[&Axis::M].skipped, Some(BlendSkip::NoReferences));
        assert_eq!(out.axes[&Axis::M].value, 5.0);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let tree = PhyloTree::parse("(t:1,b:1,a:1);").unwrap();
        let mut r = ReferenceValues::new();
        r.insert("b".into(), [(Axis::N, 2.0)].into());
        r.insert("a".into(), [(Axis::N, 9.0)].into());
        let s = SpeciesRecord::new("t", [(Axis::N, 5.0)]);
        let out = blend_species(&s, &tree, &r, &cfg(1.0, Some(1))).unwrap();
        assert_eq!(out.axes[&Axis::N].value, 9.0);
    }

    #[test]
    fn test_apply_updates_means() {
        let tree = PhyloTree::parse(TREE).unwrap();
        let out = blend_species(&target(), &tree, &refs(), &cfg(1.0, Some(1))).unwrap();
        let rec = out.apply(&target());
        assert_eq!(rec.means[&Axis::L], 8.0);
        assert_eq!(blend_all(&[target()], &tree, &refs(), &cfg(0.0, None)).len(), 1);
    }
}
