//! Batch scoring of species against a list of presets.
//!
//! Species are sorted by id and split into fixed-size chunks. Each chunk is
//! scored by a scoped worker pool; rows come back in (species id, preset
//! declaration order) regardless of which worker finished first. Completed
//! chunks can be checkpointed and skipped on resume.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::checkpoint::CheckpointWriter;
use crate::config::EngineConfig;
use crate::error::{EcoaxisError, Result};
use crate::requirement::{Preset, SpeciesRecord};
use crate::simulate::{Artifacts, SimulationResult, simulate_requirement};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One (species, preset) outcome. Failed rows carry `error` and no estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub chunk: usize,
    pub species_id: String,
    pub preset: String,
    pub probability: Option<f64>,
    pub std_error: Option<f64>,
    pub passed: bool,
    pub group: Option<String>,
    pub fallback: String,
    pub psd_corrected: bool,
    pub error: Option<String>,
}

impl ResultRow {
    fn from_result(chunk: usize, r: &SimulationResult) -> Self {
        Self {
            chunk,
            species_id: r.species_id.clone(),
            preset: r.preset.clone(),
            probability: Some(r.estimate.probability),
            std_error: Some(r.estimate.std_error),
            passed: r.passed,
            group: r.diagnostics.group.clone(),
            fallback: r.diagnostics.summary(),
            psd_corrected: r.estimate.psd_corrected,
            error: None,
        }
    }

    fn failed(chunk: usize, species_id: &str, preset: &str, err: &EcoaxisError) -> Self {
        Self {
            chunk,
            species_id: species_id.to_string(),
            preset: preset.to_string(),
            probability: None,
            std_error: None,
            passed: false,
            group: None,
            fallback: String::new(),
            psd_corrected: false,
            error: Some(err.to_string()),
        }
    }
}

/// Best-passing preset for one species.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestRow {
    pub chunk: usize,
    pub species_id: String,
    /// `None` when every preset row failed.
    pub preset: Option<String>,
    pub probability: Option<f64>,
    pub passed: bool,
}

/// Pick the passing row with the highest probability, or the highest
/// probability overall when none pass. Ties keep the earlier row, so `rows`
/// must be in preset declaration order.
pub fn best_preset(rows: &[ResultRow]) -> Option<&ResultRow> {
    let scored = rows.iter().filter(|r| r.probability.is_some());
    highest(scored.clone().filter(|r| r.passed)).or_else(|| highest(scored))
}

fn highest<'a>(rows: impl Iterator<Item = &'a ResultRow>) -> Option<&'a ResultRow> {
    let mut best: Option<&ResultRow> = None;
    for r in rows {
        if best.is_none_or(|b| r.probability > b.probability) {
            best = Some(r);
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn score_species(
    chunk: usize,
    species: &SpeciesRecord,
    presets: &[Preset],
    artifacts: &Artifacts,
    cfg: &EngineConfig,
) -> (Vec<ResultRow>, BestRow) {
    let rows: Vec<ResultRow> = presets
        .iter()
        .map(|p| match simulate_requirement(species, p, artifacts, cfg) {
            Ok(r) => ResultRow::from_result(chunk, &r),
            Err(e) => {
                log::warn!("{} / {}: {e}", species.id, p.name);
                ResultRow::failed(chunk, &species.id, &p.name, &e)
            }
        })
        .collect();
    let best = match best_preset(&rows) {
        Some(r) => BestRow {
            chunk,
            species_id: species.id.clone(),
            preset: Some(r.preset.clone()),
            probability: r.probability,
            passed: r.passed,
        },
        None => BestRow {
            chunk,
            species_id: species.id.clone(),
            preset: None,
            probability: None,
            passed: false,
        },
    };
    (rows, best)
}

/// Score one chunk on up to `threads` scoped workers.
pub fn run_chunk(
    chunk: usize,
    species: &[SpeciesRecord],
    presets: &[Preset],
    artifacts: &Artifacts,
    cfg: &EngineConfig,
    threads: usize,
) -> (Vec<ResultRow>, Vec<BestRow>) {
    if species.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let per_worker = species.len().div_ceil(threads.max(1));
    let parts: Vec<(Vec<ResultRow>, Vec<BestRow>)> = std::thread::scope(|s| {
        let handles: Vec<_> = species
            .chunks(per_worker)
            .map(|slice| {
                s.spawn(move || {
                    let mut rows = Vec::new();
                    let mut best = Vec::new();
                    for sp in slice {
                        let (r, b) = score_species(chunk, sp, presets, artifacts, cfg);
                        rows.extend(r);
                        best.push(b);
                    }
                    (rows, best)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    });

    let mut rows = Vec::with_capacity(species.len() * presets.len());
    let mut best = Vec::with_capacity(species.len());
    for (r, b) in parts {
        rows.extend(r);
        best.extend(b);
    }
    (rows, best)
}

/// Summary of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Rows produced by this invocation (skipped chunks contribute none).
    pub rows: Vec<ResultRow>,
    pub best: Vec<BestRow>,
    pub total_chunks: usize,
    pub chunks_run: usize,
    pub chunks_skipped: usize,
    pub failed_rows: usize,
    /// `stop` was raised before every chunk finished.
    pub interrupted: bool,
}

/// Score every species against every preset.
///
/// With a checkpoint, chunks it already records are skipped and each newly
/// finished chunk is persisted before the next starts. `stop` is polled
/// between chunks.
pub fn run_batch(
    mut species: Vec<SpeciesRecord>,
    presets: &[Preset],
    artifacts: &Artifacts,
    cfg: &EngineConfig,
    mut checkpoint: Option<&mut CheckpointWriter>,
    stop: &AtomicBool,
) -> Result<BatchOutcome> {
    cfg.validate()?;
    if presets.is_empty() {
        return Err(EcoaxisError::InvalidConfig("no presets given".into()));
    }
    for p in presets {
        p.validate()?;
    }

    species.sort_by(|a, b| a.id.cmp(&b.id));
    let chunks: Vec<&[SpeciesRecord]> = species.chunks(cfg.chunk_size).collect();
    let threads = cfg.worker_threads();
    let mut outcome = BatchOutcome {
        total_chunks: chunks.len(),
        ..BatchOutcome::default()
    };
    log::info!(
        "batch: {} species x {} presets in {} chunks on {threads} threads",
        species.len(),
        presets.len(),
        chunks.len()
    );

    for (idx, chunk) in chunks.iter().enumerate() {
        if checkpoint.as_ref().is_some_and(|c| c.is_complete(idx)) {
            outcome.chunks_skipped += 1;
            continue;
        }
        if stop.load(Ordering::SeqCst) {
            log::warn!("batch: stop requested; {idx} of {} chunks handled", chunks.len());
            outcome.interrupted = true;
            break;
        }

        let (rows, best) = run_chunk(idx, chunk, presets, artifacts, cfg, threads);
        if let Some(cp) = checkpoint.as_deref_mut() {
            cp.write_chunk(idx, &rows, &best)?;
        }
        outcome.failed_rows += rows.iter().filter(|r| r.error.is_some()).count();
        outcome.chunks_run += 1;
        log::info!("chunk {}/{} done ({} rows)", idx + 1, chunks.len(), rows.len());
        outcome.rows.extend(rows);
        outcome.best.extend(best);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{Axis, Bin};
    use crate::copula::{CopulaArtifact, RejectedModel};
    use crate::sigma::SigmaArtifact;

    fn artifacts() -> Artifacts {
        Artifacts {
            copulas: CopulaArtifact::new(None, Vec::new()),
            sigma: SigmaArtifact::uniform(&Axis::ALL, 1.0),
        }
    }

    fn presets() -> Vec<Preset> {
        vec![
            Preset::new("lh", [(Axis::L, Bin::High)], 0.6),
            Preset::new("mh", [(Axis::M, Bin::High)], 0.6),
            Preset::new("ml", [(Axis::M, Bin::Low)], 0.6),
        ]
    }

    fn species(n: usize) -> Vec<SpeciesRecord> {
        (0..n)
            .rev()
            .map(|i| {
                SpeciesRecord::new(
                    format!("sp{i:03}"),
                    [(Axis::L, 3.0 + i as f64 * 0.3), (Axis::M, 8.0 - i as f64 * 0.3)],
                )
            })
            .collect()
    }

    fn row(preset: &str, p: Option<f64>, passed: bool) -> ResultRow {
        ResultRow {
            chunk: 0,
            species_id: "s".into(),
            preset: preset.into(),
            probability: p,
            std_error: None,
            passed,
            group: None,
            fallback: String::new(),
            psd_corrected: false,
            error: None,
        }
    }

    #[test]
    fn test_best_preset_rules() {
        let rows = vec![
            row("a", Some(0.9), false),
            row("b", Some(0.7), true),
            row("c", Some(0.7), true),
        ];
        assert_eq!(best_preset(&rows).unwrap().preset, "b");

        let none_pass = vec![row("a", Some(0.3), false), row("b", Some(0.5), false), row("c", None, false)];
        assert_eq!(best_preset(&none_pass).unwrap().preset, "b");

        let tie = vec![row("x", Some(0.4), false), row("y", Some(0.4), false)];
        assert_eq!(best_preset(&tie).unwrap().preset, "x");

        assert!(best_preset(&[row("a", None, false)]).is_none());
    }

    #[test]
    fn test_batch_is_deterministic_across_threads_and_chunks() {
        let mut cfg = EngineConfig::default();
        cfg.draws = 2_000;
        cfg.threads = 1;
        cfg.chunk_size = 100;
        let stop = AtomicBool::new(false);
        let a = run_batch(species(10), &presets(), &artifacts(), &cfg, None, &stop).unwrap();

        cfg.threads = 4;
        cfg.chunk_size = 3;
        let b = run_batch(species(10), &presets(), &artifacts(), &cfg, None, &stop).unwrap();

        let strip = |rows: &[ResultRow]| -> Vec<(String, String, Option<f64>)> {
            rows.iter()
                .map(|r| (r.species_id.clone(), r.preset.clone(), r.probability))
                .collect()
        };
        assert_eq!(strip(&a.rows), strip(&b.rows));
        assert_eq!(a.rows.len(), 30);
        assert_eq!(a.rows[0].species_id, "sp000");
        assert_eq!(a.rows[1].preset, "mh");
        assert_eq!(b.total_chunks, 4);
        assert_eq!(a.best.len(), 10);
    }

    #[test]
    fn test_row_errors_do_not_abort_batch() {
        let mut cfg = EngineConfig::default();
        cfg.draws = 500;
        let mut sp = species(3);
        sp.push(SpeciesRecord::new("broken", [(Axis::L, 5.0)]));
        let stop = AtomicBool::new(false);
        let out = run_batch(sp, &presets(), &artifacts(), &cfg, None, &stop).unwrap();
        assert_eq!(out.rows.len(), 12);
        assert_eq!(out.failed_rows, 2);
        let broken_best = out.best.iter().find(|b| b.species_id == "broken").unwrap();
        assert_eq!(broken_best.preset.as_deref(), Some("lh"));
    }

    #[test]
    fn test_unusable_artifact_entries_fail_only_their_rows() {
        let mut art = artifacts();
        art.copulas.rejected.push(RejectedModel {
            axes: vec![Axis::T, Axis::R],
            reason: "correlation is 3x3 for 2 axes".into(),
        });
        art.sigma.axes.remove(&Axis::N);
        art.sigma.rejected.insert(Axis::N, "sigma for N is -1".into());

        let presets = vec![
            Preset::new("l_only", [(Axis::L, Bin::High)], 0.6),
            Preset::new("warm_calcareous", [(Axis::T, Bin::High), (Axis::R, Bin::High)], 0.6),
            Preset::new("sun_fertile", [(Axis::L, Bin::High), (Axis::N, Bin::High)], 0.6),
        ];
        let sp = vec![SpeciesRecord::new(
            "sp",
            [(Axis::L, 7.0), (Axis::T, 6.0), (Axis::R, 6.0), (Axis::N, 6.0)],
        )];
        let mut cfg = EngineConfig::default();
        cfg.draws = 500;
        let stop = AtomicBool::new(false);
        let out = run_batch(sp, &presets, &art, &cfg, None, &stop).unwrap();

        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.failed_rows, 2);
        assert!(out.rows[0].error.is_none() && out.rows[0].probability.is_some());
        assert!(out.rows[1].error.as_deref().unwrap().contains("Malformed artifact"));
        assert!(out.rows[2].error.as_deref().unwrap().contains("Malformed artifact"));
        assert_eq!(out.best[0].preset.as_deref(), Some("l_only"));
    }

    #[test]
    fn test_stop_flag_halts_between_chunks() {
        let mut cfg = EngineConfig::default();
        cfg.draws = 100;
        cfg.chunk_size = 2;
        let stop = AtomicBool::new(true);
        let out = run_batch(species(6), &presets(), &artifacts(), &cfg, None, &stop).unwrap();
        assert!(out.interrupted);
        assert_eq!(out.chunks_run, 0);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_empty_presets_rejected() {
        let stop = AtomicBool::new(false);
        let err = run_batch(species(1), &[], &artifacts(), &EngineConfig::default(), None, &stop);
        assert!(matches!(err, Err(EcoaxisError::InvalidConfig(_))));
    }
}
