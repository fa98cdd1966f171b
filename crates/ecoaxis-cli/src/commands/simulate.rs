//! `ecoaxis simulate`: chunked, resumable joint-suitability scoring.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ecoaxis_core::{
    Artifacts, CheckpointWriter, CopulaArtifact, Result, RunSpec, SigmaArtifact, default_presets,
    digest_files, load_presets_from_path, run_batch,
};

use super::{load_engine_config, read_labels, read_predictions};

/// Best-preset lines echoed to the terminal.
const PREVIEW_ROWS: usize = 20;

pub struct SimulateCommandConfig<'a> {
    pub predictions: &'a Path,
    pub copulas: &'a Path,
    pub sigma: &'a Path,
    pub presets: Option<&'a Path>,
    pub checkpoint: &'a Path,
    pub groups: Option<&'a Path>,
    pub config: Option<&'a Path>,
    pub draws: Option<usize>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
}

pub fn run(cfg: SimulateCommandConfig<'_>) -> Result<()> {
    let mut engine = load_engine_config(cfg.config)?;
    if let Some(d) = cfg.draws {
        engine.draws = d;
    }
    if let Some(s) = cfg.seed {
        engine.seed = s;
    }
    if let Some(t) = cfg.threads {
        engine.threads = t;
    }

    // Unreadable core artifacts are fatal before any row is scored.
    let artifacts = Artifacts {
        copulas: CopulaArtifact::load(cfg.copulas)?,
        sigma: SigmaArtifact::load(cfg.sigma)?,
    };
    let presets = match cfg.presets {
        Some(p) => load_presets_from_path(p)?,
        None => default_presets(),
    };

    let labels = cfg.groups.map(read_labels).transpose()?;
    if engine.group_column.is_none() {
        engine.group_column = labels
            .as_ref()
            .map(|(name, _)| name.clone())
            .or_else(|| artifacts.copulas.group_column.clone());
    }
    engine.validate()?;

    let mut species = read_predictions(cfg.predictions, engine.group_column.as_deref())?;
    if let (Some((_, labels)), Some(column)) = (&labels, &engine.group_column) {
        species = species
            .into_iter()
            .map(|s| match labels.get(&s.id) {
                Some(label) => {
                    let label = label.clone();
                    s.with_group(column.as_str(), label)
                }
                None => s,
            })
            .collect();
    }

    let artifact_digest = digest_files(&[cfg.copulas, cfg.sigma])?;
    let spec = RunSpec::new(&engine, &artifact_digest, &species, &presets)?;
    let mut checkpoint = CheckpointWriter::open(cfg.checkpoint, &spec)?;
    if checkpoint.resumed() {
        println!(
            "Resuming run {} ({} of {} chunks done)",
            checkpoint.run_id(),
            checkpoint.progress().completed_chunks.len(),
            spec.total_chunks
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        log::warn!("could not install Ctrl+C handler: {e}");
    }

    println!(
        "Scoring {} species x {} presets ({} draws, seed {}, group column {})",
        species.len(),
        presets.len(),
        engine.draws,
        engine.seed,
        engine.group_column.as_deref().unwrap_or("-")
    );
    let t0 = Instant::now();
    let outcome = run_batch(species, &presets, &artifacts, &engine, Some(&mut checkpoint), &stop)?;
    let dir = checkpoint.finish()?;

    println!();
    println!("{:<32} {:<20} {:>8}  {}", "Species", "Best preset", "p", "Pass");
    println!("{}", "-".repeat(70));
    for b in outcome.best.iter().take(PREVIEW_ROWS) {
        println!(
            "{:<32} {:<20} {:>8}  {}",
            b.species_id,
            b.preset.as_deref().unwrap_or("-"),
            b.probability.map_or_else(|| "-".to_string(), |p| format!("{p:.3}")),
            if b.passed { "yes" } else { "no" }
        );
    }
    if outcome.best.len() > PREVIEW_ROWS {
        println!("... {} more", outcome.best.len() - PREVIEW_ROWS);
    }
    println!();
    println!(
        "{} chunks run, {} skipped, {} failed rows in {:.1}s -> {}",
        outcome.chunks_run,
        outcome.chunks_skipped,
        outcome.failed_rows,
        t0.elapsed().as_secs_f64(),
        dir.display()
    );
    if outcome.interrupted {
        println!("Interrupted; rerun the same command to resume.");
    }
    Ok(())
}
