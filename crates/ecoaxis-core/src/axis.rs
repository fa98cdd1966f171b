//! Indicator axes, bins and per-axis reliability.
//!
//! The five EIVE axes share a 0–10 scale. Bin membership uses open-ended outer
//! bins so that simulated values outside the nominal range still land in
//! `low` or `high`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EcoaxisError;

/// One continuous ecological indicator dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Light.
    L,
    /// Temperature.
    T,
    /// Moisture.
    M,
    /// Reaction (soil pH).
    R,
    /// Nutrients.
    N,
}

impl Axis {
    /// All axes in canonical order.
    pub const ALL: [Axis; 5] = [Axis::L, Axis::T, Axis::M, Axis::R, Axis::N];

    pub fn name(self) -> &'static str {
        match self {
            Self::L => "L",
            Self::T => "T",
            Self::M => "M",
            Self::R => "R",
            Self::N => "N",
        }
    }

    /// Position in [`Axis::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::L => 0,
            Self::T => 1,
            Self::M => 2,
            Self::R => 3,
            Self::N => 4,
        }
    }

    /// Human-readable indicator name.
    pub fn description(self) -> &'static str {
        match self {
            Self::L => "light",
            Self::T => "temperature",
            Self::M => "moisture",
            Self::R => "reaction",
            Self::N => "nutrients",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Axis {
    type Err = EcoaxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "L" | "LIGHT" => Ok(Self::L),
            "T" | "TEMPERATURE" => Ok(Self::T),
            "M" | "MOISTURE" => Ok(Self::M),
            "R" | "REACTION" => Ok(Self::R),
            "N" | "NUTRIENTS" => Ok(Self::N),
            other => Err(EcoaxisError::parse("axis", format!("unknown axis '{other}'"))),
        }
    }
}

/// Target bin on an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bin {
    Low,
    Med,
    High,
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Med => write!(f, "med"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for Bin {
    type Err = EcoaxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "med" | "medium" => Ok(Self::Med),
            "high" => Ok(Self::High),
            other => Err(EcoaxisError::parse("bin", format!("unknown bin '{other}'"))),
        }
    }
}

/// Interior cut points of the low/med/high scheme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinEdges {
    /// Upper (exclusive) edge of `low`, lower (inclusive) edge of `med`.
    pub low_upper: f64,
    /// Upper (exclusive) edge of `med`, lower (inclusive) edge of `high`.
    pub high_lower: f64,
}

impl Default for BinEdges {
    fn default() -> Self {
        Self {
            low_upper: 3.5,
            high_lower: 6.5,
        }
    }
}

impl BinEdges {
    pub fn is_valid(&self) -> bool {
        self.low_upper.is_finite() && self.high_lower.is_finite() && self.low_upper < self.high_lower
    }

    /// Half-open interval `[lower, upper)` covered by `bin`.
    pub fn range(&self, bin: Bin) -> (f64, f64) {
        match bin {
            Bin::Low => (f64::NEG_INFINITY, self.low_upper),
            Bin::Med => (self.low_upper, self.high_lower),
            Bin::High => (self.high_lower, f64::INFINITY),
        }
    }

    pub fn bin_of(&self, value: f64) -> Bin {
        if value < self.low_upper {
            Bin::Low
        } else if value < self.high_lower {
            Bin::Med
        } else {
            Bin::High
        }
    }

    pub fn contains(&self, bin: Bin, value: f64) -> bool {
        let (lo, hi) = self.range(bin);
        value >= lo && value < hi
    }

    /// Distance from `value` to the nearest interior edge.
    pub fn edge_distance(&self, value: f64) -> f64 {
        (value - self.low_upper)
            .abs()
            .min((value - self.high_lower).abs())
    }

    pub fn is_borderline(&self, value: f64, width: f64) -> bool {
        self.edge_distance(value) < width
    }
}

/// Externally derived confidence in an axis' predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Low,
    Medium,
    High,
}

impl Reliability {
    /// One level down, saturating at `Low`.
    pub fn downgrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }

    /// Default tags from cross-validated skill: M and N strongest, R weakest.
    pub fn default_for(axis: Axis) -> Self {
        match axis {
            Axis::M | Axis::N => Self::High,
            Axis::L | Axis::T => Self::Medium,
            Axis::R => Self::Low,
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_parse() {
        assert_eq!("l".parse::<Axis>().unwrap(), Axis::L);
        assert_eq!("Moisture".parse::<Axis>().unwrap(), Axis::M);
        assert!("X".parse::<Axis>().is_err());
    }

    #[test]
    fn test_axis_order_is_canonical() {
        let mut v = vec![Axis::N, Axis::L, Axis::R, Axis::M, Axis::T];
        v.sort();
        assert_eq!(v, Axis::ALL.to_vec());
    }

    #[test]
    fn test_bin_of_default_edges() {
        let e = BinEdges::default();
        assert_eq!(e.bin_of(0.0), Bin::Low);
        assert_eq!(e.bin_of(3.49), Bin::Low);
        assert_eq!(e.bin_of(3.5), Bin::Med);
        assert_eq!(e.bin_of(6.49), Bin::Med);
        assert_eq!(e.bin_of(6.5), Bin::High);
        assert_eq!(e.bin_of(10.0), Bin::High);
    }

    #[test]
    fn test_outer_bins_open_ended() {
        let e = BinEdges::default();
        assert!(e.contains(Bin::High, 11.2));
        assert!(e.contains(Bin::Low, -0.4));
        assert!(!e.contains(Bin::Med, 6.5));
    }

    #[test]
    fn test_borderline() {
        let e = BinEdges::default();
        assert!(e.is_borderline(6.3, 0.5));
        assert!(e.is_borderline(3.9, 0.5));
        assert!(!e.is_borderline(5.0, 0.5));
        assert!(!e.is_borderline(9.0, 0.5));
    }

    #[test]
    fn test_edges_validity() {
        assert!(BinEdges::default().is_valid());
        let bad = BinEdges {
            low_upper: 7.0,
            high_lower: 3.0,
        };
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_reliability_downgrade() {
        assert_eq!(Reliability::High.downgrade(), Reliability::Medium);
        assert_eq!(Reliability::Medium.downgrade(), Reliability::Low);
        assert_eq!(Reliability::Low.downgrade(), Reliability::Low);
        assert_eq!(Reliability::default_for(Axis::R), Reliability::Low);
    }

    #[test]
    fn test_bin_serde_lowercase() {
        let s = serde_json::to_string(&Bin::High).unwrap();
        assert_eq!(s, "\"high\"");
        let b: Bin = serde_json::from_str("\"med\"").unwrap();
        assert_eq!(b, Bin::Med);
    }
}
