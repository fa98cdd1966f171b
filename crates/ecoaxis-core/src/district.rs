//! District decomposition: partition axes into connected components of the
//! residual dependency graph.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::axis::Axis;
use crate::config::FitConfig;
use crate::error::{EcoaxisError, Result};
use crate::residuals::ResidualTable;
use crate::stats;

/// Current on-disk format of [`DistrictArtifact`].
pub const DISTRICT_ARTIFACT_VERSION: u32 = 1;

/// Set of axes whose residuals are modelled jointly. Axes are kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct District {
    pub axes: Vec<Axis>,
}

impl District {
    pub fn new(mut axes: Vec<Axis>) -> Self {
        axes.sort();
        axes.dedup();
        Self { axes }
    }

    /// Singleton districts carry no dependency parameter.
    pub fn is_trivial(&self) -> bool {
        self.axes.len() < 2
    }

    pub fn contains(&self, axis: Axis) -> bool {
        self.axes.contains(&axis)
    }

    pub fn label(&self) -> String {
        self.axes
            .iter()
            .map(|a| a.name())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// All unordered axis pairs inside the district.
    pub fn pairs(&self) -> Vec<(Axis, Axis)> {
        let mut out = Vec::new();
        for (i, &a) in self.axes.iter().enumerate() {
            for &b in &self.axes[i + 1..] {
                out.push((a, b));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Candidate edges
// ---------------------------------------------------------------------------

/// Pairwise residual association tested for inclusion in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEdge {
    pub a: Axis,
    pub b: Axis,
    pub rho: f64,
    pub n: usize,
    pub p_value: f64,
    pub q_value: f64,
    pub selected: bool,
}

/// Test every axis pair of `table` and mark edges passing both the
/// multiple-testing and effect-size cutoffs.
pub fn candidate_edges(table: &ResidualTable, cfg: &FitConfig) -> Result<Vec<CandidateEdge>> {
    let axes = table.axes();
    let mut edges = Vec::new();
    for (i, &a) in axes.iter().enumerate() {
        for &b in &axes[i + 1..] {
            let rows = table.complete_rows(&[a, b], None)?;
            let cols = table.select(&[a, b], &rows)?;
            let rho = stats::pearson(&cols[0], &cols[1]);
            edges.push(CandidateEdge {
                a,
                b,
                rho,
                n: rows.len(),
                p_value: stats::pearson_p_value(rho, rows.len()),
                q_value: 1.0,
                selected: false,
            });
        }
    }

    let pvals: Vec<f64> = edges.iter().map(|e| e.p_value).collect();
    for (edge, q) in edges.iter_mut().zip(stats::benjamini_hochberg(&pvals)) {
        edge.q_value = q;
        edge.selected = q < cfg.q_cutoff && edge.rho.abs() >= cfg.min_abs_rho;
        log::debug!(
            "edge {}-{}: rho={:.3} n={} q={:.3e} selected={}",
            edge.a,
            edge.b,
            edge.rho,
            edge.n,
            q,
            edge.selected
        );
    }
    Ok(edges)
}

/// Dependency structure adopted in the original analysis.
pub fn curated_edges() -> Vec<(Axis, Axis)> {
    use Axis::*;
    vec![(T, R), (T, M), (M, R), (L, M), (M, N)]
}

/// Parse `"L-M,T-M"` edge lists.
pub fn parse_edge_list(spec: &str) -> Result<Vec<(Axis, Axis)>> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (a, b) = part
            .split_once('-')
            .ok_or_else(|| EcoaxisError::parse("edge list", format!("expected A-B, got '{part}'")))?;
        let a: Axis = a.parse()?;
        let b: Axis = b.parse()?;
        if a == b {
            return Err(EcoaxisError::parse("edge list", format!("self edge '{part}'")));
        }
        out.push((a, b));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Connected components
// ---------------------------------------------------------------------------

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Smaller index becomes root so output order is stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Partition `axes` into connected components under `edges`.
///
/// Every axis lands in exactly one district; edges touching axes outside
/// `axes` are ignored. Districts are ordered by their first axis.
pub fn decompose(axes: &[Axis], edges: &[(Axis, Axis)]) -> Vec<District> {
    let mut uf = UnionFind::new(Axis::ALL.len());
    for &(a, b) in edges {
        if axes.contains(&a) && axes.contains(&b) {
            uf.union(a.index(), b.index());
        }
    }

    let mut sorted: Vec<Axis> = axes.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut roots: Vec<usize> = Vec::new();
    let mut members: Vec<Vec<Axis>> = Vec::new();
    for axis in sorted {
        let root = uf.find(axis.index());
        match roots.iter().position(|&r| r == root) {
            Some(pos) => members[pos].push(axis),
            None => {
                roots.push(root);
                members.push(vec![axis]);
            }
        }
    }
    members.into_iter().map(District::new).collect()
}

/// Index of the district containing `axis`.
pub fn district_of(districts: &[District], axis: Axis) -> Option<usize> {
    districts.iter().position(|d| d.contains(axis))
}

/// Whether `a` and `b` share a district.
pub fn same_district(districts: &[District], a: Axis, b: Axis) -> bool {
    match (district_of(districts, a), district_of(districts, b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Persisted decomposition plus the edges that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictArtifact {
    pub version: u32,
    pub districts: Vec<District>,
    #[serde(default)]
    pub edges: Vec<CandidateEdge>,
}

impl DistrictArtifact {
    pub fn new(districts: Vec<District>, edges: Vec<CandidateEdge>) -> Self {
        Self {
            version: DISTRICT_ARTIFACT_VERSION,
            districts,
            edges,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&raw).map_err(|e| {
            EcoaxisError::MalformedArtifact(format!("districts {}: {e}", path.display()))
        })?;
        if artifact.version != DISTRICT_ARTIFACT_VERSION {
            return Err(EcoaxisError::MalformedArtifact(format!(
                "districts {}: unsupported version {}",
                path.display(),
                artifact.version
            )));
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_chain_forms_one_district_with_singleton() {
        use Axis::*;
        let d = decompose(&Axis::ALL, &[(L, M), (T, R), (T, M)]);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].axes, vec![L, T, M, R]);
        assert_eq!(d[1].axes, vec![N]);
        assert!(d[1].is_trivial());
        assert!(same_district(&d, L, R));
        assert!(!same_district(&d, L, N));
    }

    #[test]
    fn test_no_edges_all_singletons() {
        let d = decompose(&Axis::ALL, &[]);
        assert_eq!(d.len(), 5);
        assert!(d.iter().all(District::is_trivial));
    }

    #[test]
    fn test_every_axis_exactly_once() {
        let d = decompose(&Axis::ALL, &curated_edges());
        let mut seen: Vec<Axis> = d.iter().flat_map(|x| x.axes.clone()).collect();
        seen.sort();
        assert_eq!(seen, Axis::ALL.to_vec());
    }

    #[test]
    fn test_edges_outside_axis_subset_ignored() {
        use Axis::*;
        let d = decompose(&[L, N], &[(L, M), (M, N)]);
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_district_pairs_and_label() {
        use Axis::*;
        let d = District::new(vec![M, L, T]);
        assert_eq!(d.label(), "L-T-M");
        assert_eq!(d.pairs(), vec![(L, T), (L, M), (T, M)]);
    }

    #[test]
    fn test_parse_edge_list() {
        use Axis::*;
        assert_eq!(parse_edge_list("L-M, T-R").unwrap(), vec![(L, M), (T, R)]);
        assert!(parse_edge_list("L-L").is_err());
        assert!(parse_edge_list("LM").is_err());
    }

    #[test]
    fn test_candidate_edges_select_strong_pair() {
        use Axis::*;
        let mut t = ResidualTable::new();
        let mut state: u64 = 7;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
        };
        for i in 0..200 {
            let l = next();
            let m = 0.8 * l + 0.2 * next();
            let n = next();
            let row: BTreeMap<Axis, f64> = [(L, l), (M, m), (N, n)].into();
            t.push(format!("sp{i}"), &row, None);
        }
        let edges = candidate_edges(&t, &FitConfig::default()).unwrap();
        assert_eq!(edges.len(), 3);
        let lm = edges.iter().find(|e| e.a == L && e.b == M).unwrap();
        assert!(lm.selected);
        assert!(lm.rho > 0.9);
        let ln = edges.iter().find(|e| e.a == L && e.b == N).unwrap();
        assert!(ln.rho.abs() < 0.25);
        assert!(ln.q_value >= ln.p_value);
    }

    #[test]
    fn test_artifact_roundtrip_and_version_check() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("districts.json");
        let art = DistrictArtifact::new(decompose(&Axis::ALL, &curated_edges()), Vec::new());
        art.save(&path).unwrap();
        assert_eq!(DistrictArtifact::load(&path).unwrap(), art);

        std::fs::write(&path, r#"{"version":9,"districts":[]}"#).unwrap();
        assert!(matches!(
            DistrictArtifact::load(&path),
            Err(EcoaxisError::MalformedArtifact(_))
        ));
    }
}
