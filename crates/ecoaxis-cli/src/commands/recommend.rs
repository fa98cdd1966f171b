//! `ecoaxis recommend`: per-axis bins with borderline and confidence tags.

use std::path::Path;

use ecoaxis_core::{Result, recommend_axes};

use super::{load_engine_config, read_predictions, write_csv};

const RECOMMEND_HEADER: [&str; 6] =
    ["species_id", "axis", "value", "bin", "borderline", "confidence"];

pub fn run(predictions: &Path, config: Option<&Path>, out: &Path) -> Result<()> {
    let cfg = load_engine_config(config)?;
    let species = read_predictions(predictions, None)?;

    let rows: Vec<_> = species.iter().flat_map(|s| recommend_axes(s, &cfg)).collect();
    let borderline = rows.iter().filter(|r| r.borderline).count();
    write_csv(
        out,
        &RECOMMEND_HEADER,
        rows.iter().map(|r| {
            vec![
                r.species_id.clone(),
                r.axis.to_string(),
                format!("{:.3}", r.value),
                r.bin.to_string(),
                r.borderline.to_string(),
                r.confidence.to_string(),
            ]
        }),
    )?;
    println!(
        "{} rows for {} species ({borderline} borderline) -> {}",
        rows.len(),
        species.len(),
        out.display()
    );
    Ok(())
}
