//! Chunk checkpoints for batch simulation runs.
//!
//! A checkpoint is a directory containing:
//! - `rows.csv`: one row per (species, preset)
//! - `best.csv`: best-passing preset per species
//! - `progress.json`: run id, config fingerprint and completed chunk indices
//!
//! Every CSV row starts with its chunk index. On resume, rows from chunks not
//! listed in `progress.json` (a crash between the CSV flush and the progress
//! update) are dropped before appending, so no row is ever duplicated.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::batch::{BestRow, ResultRow};
use crate::config::EngineConfig;
use crate::error::{EcoaxisError, Result};
use crate::requirement::{Preset, SpeciesRecord};

const ROWS_FILE: &str = "rows.csv";
const BEST_FILE: &str = "best.csv";
const PROGRESS_FILE: &str = "progress.json";

const ROWS_HEADER: [&str; 10] = [
    "chunk",
    "species_id",
    "preset",
    "probability",
    "std_error",
    "passed",
    "group",
    "fallback",
    "psd_corrected",
    "error",
];
const BEST_HEADER: [&str; 5] = ["chunk", "species_id", "best_preset", "probability", "passed"];

// ---------------------------------------------------------------------------
// Progress metadata (progress.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub version: u32,
    pub run_id: String,
    pub fingerprint: String,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub presets: Vec<String>,
    pub completed_chunks: BTreeSet<usize>,
    pub started_at: String,
    pub updated_at: String,
    pub ecoaxis_version: String,
}

/// Identity of a batch run; a resumed run must match it exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub fingerprint: String,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub presets: Vec<String>,
}

impl RunSpec {
    /// Identity of scoring `species` against `presets` with `cfg` and the
    /// artifacts summarized by `artifact_digest` (see [`digest_files`]).
    ///
    /// The fingerprint covers the engine settings, the artifact bytes, every
    /// species (sorted by id, with means and group labels) and the full
    /// presets including targets and thresholds.
    pub fn new(
        cfg: &EngineConfig,
        artifact_digest: &str,
        species: &[SpeciesRecord],
        presets: &[Preset],
    ) -> Result<Self> {
        let mut sorted: Vec<&SpeciesRecord> = species.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = Sha256::new();
        hasher.update(cfg.fingerprint().as_bytes());
        hasher.update(artifact_digest.as_bytes());
        hasher.update(serde_json::to_vec(&sorted)?);
        hasher.update(serde_json::to_vec(presets)?);

        let chunk_size = cfg.chunk_size.max(1);
        Ok(Self {
            fingerprint: hex_prefix(&hasher.finalize(), 8),
            chunk_size,
            total_chunks: species.len().div_ceil(chunk_size),
            presets: presets.iter().map(|p| p.name.clone()).collect(),
        })
    }
}

/// SHA-256 over the contents of `paths`, in order.
pub fn digest_files(paths: &[&Path]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let bytes = fs::read(path)?;
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex_prefix(&hasher.finalize(), 32))
}

fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    digest.iter().take(bytes).map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Incremental writer for a checkpoint directory.
pub struct CheckpointWriter {
    dir: PathBuf,
    rows_writer: csv::Writer<File>,
    best_writer: csv::Writer<File>,
    progress: Progress,
    resumed: bool,
}

impl CheckpointWriter {
    /// Open `dir`, resuming when it already holds a matching `progress.json`.
    pub fn open(dir: &Path, spec: &RunSpec) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let progress_path = dir.join(PROGRESS_FILE);

        if progress_path.exists() {
            let raw = fs::read_to_string(&progress_path)?;
            let progress: Progress = serde_json::from_str(&raw).map_err(|e| {
                EcoaxisError::MalformedArtifact(format!("{}: {e}", progress_path.display()))
            })?;
            check_matches(&progress, spec)?;
            prune_incomplete(&dir.join(ROWS_FILE), &ROWS_HEADER, &progress.completed_chunks)?;
            prune_incomplete(&dir.join(BEST_FILE), &BEST_HEADER, &progress.completed_chunks)?;
            log::info!(
                "resuming run {} ({}/{} chunks complete)",
                progress.run_id,
                progress.completed_chunks.len(),
                progress.total_chunks
            );
            return Ok(Self {
                dir: dir.to_path_buf(),
                rows_writer: csv::Writer::from_writer(append(&dir.join(ROWS_FILE))?),
                best_writer: csv::Writer::from_writer(append(&dir.join(BEST_FILE))?),
                progress,
                resumed: true,
            });
        }

        let mut rows_writer = csv::Writer::from_path(dir.join(ROWS_FILE))?;
        rows_writer.write_record(ROWS_HEADER)?;
        rows_writer.flush()?;
        let mut best_writer = csv::Writer::from_path(dir.join(BEST_FILE))?;
        best_writer.write_record(BEST_HEADER)?;
        best_writer.flush()?;

        let now = format_iso8601(now_since_epoch());
        let progress = Progress {
            version: 1,
            run_id: Uuid::new_v4().to_string(),
            fingerprint: spec.fingerprint.clone(),
            chunk_size: spec.chunk_size,
            total_chunks: spec.total_chunks,
            presets: spec.presets.clone(),
            completed_chunks: BTreeSet::new(),
            started_at: now.clone(),
            updated_at: now,
            ecoaxis_version: crate::VERSION.to_string(),
        };
        let writer = Self {
            dir: dir.to_path_buf(),
            rows_writer,
            best_writer,
            progress,
            resumed: false,
        };
        writer.write_progress()?;
        log::info!("checkpoint run {} at {}", writer.progress.run_id, dir.display());
        Ok(writer)
    }

    pub fn is_complete(&self, chunk: usize) -> bool {
        self.progress.completed_chunks.contains(&chunk)
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn run_id(&self) -> &str {
        &self.progress.run_id
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a finished chunk and mark it complete.
    pub fn write_chunk(&mut self, chunk: usize, rows: &[ResultRow], best: &[BestRow]) -> Result<()> {
        if self.is_complete(chunk) {
            return Err(EcoaxisError::InvalidConfig(format!(
                "chunk {chunk} already checkpointed"
            )));
        }
        for r in rows {
            self.rows_writer.write_record([
                chunk.to_string(),
                r.species_id.clone(),
                r.preset.clone(),
                opt_f64(r.probability),
                opt_f64(r.std_error),
                r.passed.to_string(),
                r.group.clone().unwrap_or_default(),
                r.fallback.clone(),
                r.psd_corrected.to_string(),
                r.error.clone().unwrap_or_default(),
            ])?;
        }
        self.rows_writer.flush()?;

        for b in best {
            self.best_writer.write_record([
                chunk.to_string(),
                b.species_id.clone(),
                b.preset.clone().unwrap_or_default(),
                opt_f64(b.probability),
                b.passed.to_string(),
            ])?;
        }
        self.best_writer.flush()?;

        self.progress.completed_chunks.insert(chunk);
        self.progress.updated_at = format_iso8601(now_since_epoch());
        self.write_progress()
    }

    /// Flush everything and return the checkpoint directory.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.rows_writer.flush()?;
        self.best_writer.flush()?;
        self.write_progress()?;
        Ok(self.dir)
    }

    fn write_progress(&self) -> Result<()> {
        let tmp = self.dir.join(format!("{PROGRESS_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(&self.progress)?)?;
        fs::rename(&tmp, self.dir.join(PROGRESS_FILE))?;
        Ok(())
    }
}

fn check_matches(progress: &Progress, spec: &RunSpec) -> Result<()> {
    if progress.fingerprint != spec.fingerprint {
        return Err(EcoaxisError::InvalidConfig(format!(
            "checkpoint fingerprint {} does not match config {}",
            progress.fingerprint, spec.fingerprint
        )));
    }
    if progress.chunk_size != spec.chunk_size
        || progress.total_chunks != spec.total_chunks
        || progress.presets != spec.presets
    {
        return Err(EcoaxisError::InvalidConfig(
            "checkpoint was written for a different species/preset layout".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().append(true).open(path)?)
}

/// Rewrite `path` keeping only the header and records of completed chunks.
/// Records with the wrong field count and a torn final record are dropped.
fn prune_incomplete(path: &Path, header: &[&str], completed: &BTreeSet<usize>) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}: unreadable tail: {e}", path.display());
                dropped += 1;
                break;
            }
        };
        let chunk = record.get(0).and_then(|c| c.parse::<usize>().ok());
        match chunk {
            Some(c) if record.len() == header.len() && completed.contains(&c) => kept.push(record),
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        log::warn!("{}: dropped {dropped} rows from unfinished chunks", path.display());
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for record in &kept {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn opt_f64(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_default()
}

fn now_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Format a duration-since-epoch as a full ISO-8601 timestamp.
/// Example: `2026-02-15T01:30:00Z`
fn format_iso8601(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day, hour, min, sec) = secs_to_utc(secs);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Convert seconds since Unix epoch to (year, month, day, hour, minute, second) UTC.
fn secs_to_utc(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let sec = secs % 60;
    let min = (secs / 60) % 60;
    let hour = (secs / 3600) % 24;

    let mut days = secs / 86400;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let feb = if is_leap(year) { 29 } else { 28 };
    let months_days: [u64; 12] = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12u64;
    for (i, &md) in months_days.iter().enumerate() {
        if days < md {
            month = i as u64 + 1;
            break;
        }
        days -= md;
    }
    (year, month, days + 1, hour, min, sec)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
