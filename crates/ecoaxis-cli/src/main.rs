//! CLI for ecoaxis: residual copulas, m-separation checks, phylogenetic
//! blending and Monte Carlo joint suitability.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ecoaxis_msep::RankAdjustment;

#[derive(Parser)]
#[command(name = "ecoaxis")]
#[command(about = "ecoaxis: confidence-aware multi-axis suitability from indicator predictions")]
#[command(version = ecoaxis_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Adjustment {
    None,
    ClusterCentered,
}

impl From<Adjustment> for RankAdjustment {
    fn from(a: Adjustment) -> Self {
        match a {
            Adjustment::None => RankAdjustment::None,
            Adjustment::ClusterCentered => RankAdjustment::ClusterCentered,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit districts, copulas and residual σ from historical residuals
    Fit {
        /// Residual CSV: id column followed by axis columns (L, T, M, R, N)
        #[arg(long)]
        residuals: PathBuf,

        /// Group labels CSV: id column and one label column
        #[arg(long)]
        groups: Option<PathBuf>,

        /// Explicit edge list ("L-M,T-R") or "curated"; default selects edges from the data
        #[arg(long)]
        edges: Option<String>,

        /// Engine configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output directory for districts.json, copulas.json and sigma.json
        #[arg(long)]
        out: PathBuf,
    },

    /// Test residual independence of axis pairs outside fitted districts
    Msep {
        /// Residual CSV used for fitting
        #[arg(long)]
        residuals: PathBuf,

        /// Fitted copula artifact; its districts define the tested pairs
        #[arg(long)]
        copulas: PathBuf,

        /// Cluster labels CSV (e.g. family), id column and one label column
        #[arg(long)]
        clusters: Option<PathBuf>,

        /// Rank adjustment before the concordance test
        #[arg(long, value_enum, default_value = "none")]
        adjustment: Adjustment,

        /// Omnibus significance level
        #[arg(long, default_value = "0.05")]
        alpha: f64,

        /// Largest |tau| treated as a negligible dependency
        #[arg(long, default_value = "0.1")]
        practical_cutoff: f64,

        /// Write the full report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Blend trait predictions toward phylogenetic neighbours
    Blend {
        /// Prediction CSV: id column followed by axis columns
        #[arg(long)]
        predictions: PathBuf,

        /// Newick tree with branch lengths
        #[arg(long)]
        tree: PathBuf,

        /// Reference CSV with known axis values
        #[arg(long)]
        references: PathBuf,

        /// Engine configuration JSON (its `blend` section is used)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Per-axis blend record CSV
        #[arg(long)]
        out: PathBuf,

        /// Also write the blended predictions in prediction CSV layout
        #[arg(long)]
        blended: Option<PathBuf>,
    },

    /// Per-axis bins, borderline flags and confidence tags
    Recommend {
        /// Prediction CSV: id column followed by axis columns
        #[arg(long)]
        predictions: PathBuf,

        /// Engine configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output CSV
        #[arg(long)]
        out: PathBuf,
    },

    /// Score every species against every preset with Monte Carlo draws
    Simulate {
        /// Prediction CSV: id column followed by axis columns
        #[arg(long)]
        predictions: PathBuf,

        /// Fitted copula artifact
        #[arg(long)]
        copulas: PathBuf,

        /// Fitted residual σ artifact
        #[arg(long)]
        sigma: PathBuf,

        /// Preset JSON array; default uses the built-in presets
        #[arg(long)]
        presets: Option<PathBuf>,

        /// Checkpoint directory (rows.csv, best.csv, progress.json); resumed when present
        #[arg(long)]
        checkpoint: PathBuf,

        /// Group labels CSV: id column and one label column
        #[arg(long)]
        groups: Option<PathBuf>,

        /// Engine configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the number of Monte Carlo draws
        #[arg(long)]
        draws: Option<usize>,

        /// Override the global seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the worker thread count (0 = all cores)
        #[arg(long)]
        threads: Option<usize>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            residuals,
            groups,
            edges,
            config,
            out,
        } => commands::fit::run(commands::fit::FitCommandConfig {
            residuals: &residuals,
            groups: groups.as_deref(),
            edges: edges.as_deref(),
            config: config.as_deref(),
            out: &out,
        }),
        Commands::Msep {
            residuals,
            copulas,
            clusters,
            adjustment,
            alpha,
            practical_cutoff,
            output,
        } => commands::msep::run(commands::msep::MsepCommandConfig {
            residuals: &residuals,
            copulas: &copulas,
            clusters: clusters.as_deref(),
            adjustment: adjustment.into(),
            alpha,
            practical_cutoff,
            output: output.as_deref(),
        }),
        Commands::Blend {
            predictions,
            tree,
            references,
            config,
            out,
            blended,
        } => commands::blend::run(commands::blend::BlendCommandConfig {
            predictions: &predictions,
            tree: &tree,
            references: &references,
            config: config.as_deref(),
            out: &out,
            blended: blended.as_deref(),
        }),
        Commands::Recommend {
            predictions,
            config,
            out,
        } => commands::recommend::run(&predictions, config.as_deref(), &out),
        Commands::Simulate {
            predictions,
            copulas,
            sigma,
            presets,
            checkpoint,
            groups,
            config,
            draws,
            seed,
            threads,
        } => commands::simulate::run(commands::simulate::SimulateCommandConfig {
            predictions: &predictions,
            copulas: &copulas,
            sigma: &sigma,
            presets: presets.as_deref(),
            checkpoint: &checkpoint,
            groups: groups.as_deref(),
            config: config.as_deref(),
            draws,
            seed,
            threads,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
