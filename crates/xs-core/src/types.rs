//! Common data types for xsyst

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Uniform 1D binning over `[x_min, x_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    /// Number of bins (excluding under/overflow).
    pub n_bins: usize,
    /// Lower edge of the first bin.
    pub x_min: f64,
    /// Upper edge of the last bin.
    pub x_max: f64,
}

impl Binning {
    /// Create a binning, rejecting empty or inverted ranges.
    pub fn new(n_bins: usize, x_min: f64, x_max: f64) -> Result<Self> {
        if n_bins == 0 {
            return Err(Error::Configuration("binning needs at least one bin".into()));
        }
        if !(x_min.is_finite() && x_max.is_finite()) || x_max <= x_min {
            return Err(Error::Configuration(format!(
                "invalid binning range [{x_min}, {x_max})"
            )));
        }
        Ok(Self { n_bins, x_min, x_max })
    }

    /// Bin width.
    pub fn width(&self) -> f64 {
        (self.x_max - self.x_min) / self.n_bins as f64
    }

    /// Bin edges (length = n_bins + 1).
    pub fn edges(&self) -> Vec<f64> {
        let w = self.width();
        (0..=self.n_bins).map(|i| self.x_min + w * i as f64).collect()
    }

    /// Index of the bin containing `x`, or `None` for under/overflow and NaN.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.x_min && x < self.x_max) {
            return None;
        }
        let pos = (x - self.x_min) / (self.x_max - self.x_min) * self.n_bins as f64;
        // Rounding can push values just below x_max onto n_bins.
        Some((pos as usize).min(self.n_bins - 1))
    }
}

/// Owned binned content of one template for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedVector {
    /// Binning shared with the template definition.
    pub binning: Binning,
    /// Sum of weights per bin.
    pub content: Vec<f64>,
    /// Sum of squared weights per bin.
    pub sumw2: Vec<f64>,
}

impl BinnedVector {
    /// Empty histogram with the given binning.
    pub fn zeros(binning: Binning) -> Self {
        Self { binning, content: vec![0.0; binning.n_bins], sumw2: vec![0.0; binning.n_bins] }
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.content.len()
    }

    /// Sum of bin contents.
    pub fn integral(&self) -> f64 {
        self.content.iter().sum()
    }

    /// Per-bin statistical uncertainty, `sqrt(sumw2)`.
    pub fn errors(&self) -> Vec<f64> {
        self.sumw2.iter().map(|s| s.max(0.0).sqrt()).collect()
    }

    /// Same binning and uncertainties, new contents.
    ///
    /// Used for variations: the nominal uncertainty is carried forward unchanged.
    pub fn with_content(&self, content: Vec<f64>) -> Self {
        debug_assert_eq!(content.len(), self.content.len());
        Self { binning: self.binning, content, sumw2: self.sumw2.clone() }
    }
}

/// Location of one (sample, template) histogram inside a stacked vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Sample name.
    pub sample: String,
    /// Template name.
    pub template: String,
    /// Number of bins contributed.
    pub n_bins: usize,
    /// Offset of the first bin in the stacked vector.
    pub offset: usize,
}

impl Block {
    /// Index range covered in the stacked vector.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.n_bins
    }
}

/// Metadata value stored next to histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// Boolean flag.
    Flag(bool),
    /// Numeric value.
    Number(f64),
    /// Free text.
    Text(String),
}

impl MetaValue {
    /// Text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(x) => Some(*x),
            _ => None,
        }
    }

    /// Flag payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Flag(b)
    }
}

impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Number(x)
    }
}

impl From<usize> for MetaValue {
    fn from(x: usize) -> Self {
        MetaValue::Number(x as f64)
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

/// Origin of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleCategory {
    /// Beam-on data.
    OnBeam,
    /// Beam-off (cosmic-only) data.
    OffBeam,
    /// Simulated neutrino interactions overlaid on cosmic data.
    Overlay,
    /// Interactions outside the detector volume.
    Dirt,
    /// Enhanced strangeness-production simulation.
    Strangeness,
}

impl SampleCategory {
    /// Whether the sample is simulation and can carry reweighting columns.
    pub fn is_simulation(&self) -> bool {
        matches!(self, SampleCategory::Overlay | SampleCategory::Dirt | SampleCategory::Strangeness)
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleCategory::OnBeam => "on_beam",
            SampleCategory::OffBeam => "off_beam",
            SampleCategory::Overlay => "overlay",
            SampleCategory::Dirt => "dirt",
            SampleCategory::Strangeness => "strangeness",
        }
    }
}

impl fmt::Display for SampleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_beam" | "onbeam" | "data" | "beam_on" => Ok(SampleCategory::OnBeam),
            "off_beam" | "offbeam" | "ext" | "beam_off" => Ok(SampleCategory::OffBeam),
            "overlay" | "mc" => Ok(SampleCategory::Overlay),
            "dirt" => Ok(SampleCategory::Dirt),
            "strangeness" | "strange" => Ok(SampleCategory::Strangeness),
            other => Err(Error::Configuration(format!("unknown sample category '{other}'"))),
        }
    }
}

/// One dataset handed to the builders: a stable name, its category and its event table.
#[derive(Debug, Clone)]
pub struct Sample<T> {
    /// Stable sample name (used in store keys).
    pub name: String,
    /// Sample origin.
    pub category: SampleCategory,
    /// Protons-on-target exposure, when known.
    pub pot: Option<f64>,
    /// Event table.
    pub table: T,
}

impl<T> Sample<T> {
    /// Create a sample without exposure bookkeeping.
    pub fn new(name: impl Into<String>, category: SampleCategory, table: T) -> Self {
        Self { name: name.into(), category, pot: None, table }
    }

    /// Attach a protons-on-target exposure.
    pub fn with_pot(mut self, pot: f64) -> Self {
        self.pot = Some(pot);
        self
    }
}
