//! Per-axis recommendation rows.

use serde::Serialize;

use crate::axis::{Axis, Bin, Reliability};
use crate::config::EngineConfig;
use crate::requirement::SpeciesRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisRecommendation {
    pub species_id: String,
    pub axis: Axis,
    pub value: f64,
    pub bin: Bin,
    pub borderline: bool,
    pub confidence: Reliability,
}

/// One row per predicted axis. Confidence starts at the axis reliability and
/// drops one level for borderline values. Non-finite predictions are skipped.
pub fn recommend_axes(species: &SpeciesRecord, cfg: &EngineConfig) -> Vec<AxisRecommendation> {
    species
        .means
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(&axis, &value)| {
            let borderline = cfg.bins.is_borderline(value, cfg.borderline_width);
            let base = cfg.reliability(axis);
            AxisRecommendation {
                species_id: species.id.clone(),
                axis,
                value,
                bin: cfg.bins.bin_of(value),
                borderline,
                confidence: if borderline { base.downgrade() } else { base },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_confidence() {
        let s = SpeciesRecord::new(
            "sp",
            [(Axis::M, 7.5), (Axis::N, 6.3), (Axis::R, 2.0), (Axis::L, f64::NAN)],
        );
        let rows = recommend_axes(&s, &EngineConfig::default());
        assert_eq!(rows.len(), 3);

        let m = rows.iter().find(|r| r.axis == Axis::M).unwrap();
        assert_eq!((m.bin, m.borderline, m.confidence), (Bin::High, false, Reliability::High));

        let n = rows.iter().find(|r| r.axis == Axis::N).unwrap();
        assert_eq!((n.bin, n.borderline, n.confidence), (Bin::Med, true, Reliability::Medium));

        let r = rows.iter().find(|r| r.axis == Axis::R).unwrap();
        assert_eq!((r.bin, r.confidence), (Bin::Low, Reliability::Low));
    }

    #[test]
    fn test_custom_edges_and_width() {
        let mut cfg = EngineConfig::default();
        cfg.bins.high_lower = 8.0;
        cfg.borderline_width = 0.1;
        let s = SpeciesRecord::new("sp", [(Axis::T, 7.5)]);
        let rows = recommend_axes(&s, &cfg);
        assert_eq!(rows[0].bin, Bin::Med);
        assert!(!rows[0].borderline);
        assert_eq!(rows[0].confidence, Reliability::Medium);
    }
}
