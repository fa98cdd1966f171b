//! # ecoaxis-core
//!
//! **From trait-predicted indicator values to confidence-aware, multi-axis
//! suitability calls.**
//!
//! `ecoaxis-core` holds the statistical layer that sits between per-axis mean
//! predictions (light, temperature, moisture, reaction, nutrients) and the
//! recommendations built on them:
//!
//! - residual **districts**: connected components of the residual dependency
//!   graph ([`district`])
//! - **copula** fitting per district with group shrinkage ([`copula`]) and
//!   residual σ tables ([`sigma`])
//! - **phylogenetic blending** of predictions toward close relatives
//!   ([`phylo`], [`blend`])
//! - the **joint-suitability Monte Carlo engine** ([`simulate`]) and its
//!   chunked, checkpointed batch runner ([`batch`], [`checkpoint`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use ecoaxis_core::{
//!     Artifacts, Axis, CopulaArtifact, EngineConfig, SigmaArtifact, SpeciesRecord,
//!     default_presets, simulate_requirement,
//! };
//!
//! let artifacts = Artifacts {
//!     copulas: CopulaArtifact::load("copulas.json".as_ref()).unwrap(),
//!     sigma: SigmaArtifact::load("sigma.json".as_ref()).unwrap(),
//! };
//! let species = SpeciesRecord::new("Urtica dioica", [(Axis::M, 6.8), (Axis::N, 8.1)]);
//! let cfg = EngineConfig::default();
//! for preset in default_presets() {
//!     if let Ok(r) = simulate_requirement(&species, &preset, &artifacts, &cfg) {
//!         println!("{}: p={:.3} pass={}", r.preset, r.estimate.probability, r.passed);
//!     }
//! }
//! ```
//!
//! ## Pipeline
//!
//! Residuals → Districts → Copulas + σ (persisted) → m-separation check
//! (`ecoaxis-msep`). At prediction time: μ (+ optional blending) → Monte Carlo
//! → probability, pass/fail, best preset.
//!
//! Fitted artifacts are loaded once, passed by reference and never mutated
//! during simulation. Observed indicator values of a scored species never
//! enter the engine.

pub mod axis;
pub mod batch;
pub mod blend;
pub mod checkpoint;
pub mod config;
pub mod copula;
pub mod district;
pub mod error;
pub mod linalg;
pub mod phylo;
pub mod recommend;
pub mod requirement;
pub mod residuals;
pub mod seed;
pub mod sigma;
pub mod simulate;
pub mod stats;

pub use axis::{Axis, Bin, BinEdges, Reliability};
pub use batch::{BatchOutcome, BestRow, ResultRow, best_preset, run_batch, run_chunk};
pub use blend::{AxisBlend, BlendOutcome, BlendSkip, ReferenceValues, blend_all, blend_species};
pub use checkpoint::{CheckpointWriter, Progress, RunSpec, digest_files};
pub use config::{BlendConfig, EngineConfig, FitConfig, load_config_from_path};
pub use copula::{
    CopulaArtifact, CopulaFamily, CopulaModel, CorrelationSource, FamilyFit, FamilyTag,
    FitStatus, GaussianFamily, PairCorrelation, PairTail, RejectedModel, fit_copulas, fit_district,
    select_family,
};
pub use district::{
    CandidateEdge, District, DistrictArtifact, candidate_edges, curated_edges, decompose,
    parse_edge_list, same_district,
};
pub use error::{EcoaxisError, Result};
pub use linalg::{Cholesky, SymMatrix};
pub use phylo::PhyloTree;
pub use recommend::{AxisRecommendation, recommend_axes};
pub use requirement::{
    DEFAULT_THRESHOLD, Preset, Requirement, SpeciesRecord, default_presets,
    load_presets_from_path,
};
pub use residuals::ResidualTable;
pub use seed::derive_seed;
pub use sigma::{SigmaArtifact, SigmaSpec, fit_sigma};
pub use simulate::{
    Artifacts, Diagnostics, JointEstimate, JointProblem, SimulationResult, assemble,
    estimate_joint, simulate_requirement,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
