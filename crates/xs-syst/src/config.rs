//! Systematics catalogue and run options.
//!
//! Both are plain values built once per run and passed down by reference.

use std::path::Path;

use serde::{Deserialize, Serialize};
use xs_core::{Error, Result, SampleCategory, SamplePolicy};

/// Default per-event nominal weight column.
pub const DEFAULT_NOMINAL_WEIGHT: &str = "nominal_event_weight";

/// Two-point systematic built from per-event up/down weight ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnisimSpec {
    /// Systematic name.
    pub name: String,
    /// Column holding the up/nominal weight ratio.
    #[serde(alias = "up_weight_ratio_column")]
    pub up: String,
    /// Column holding the down/nominal weight ratio.
    #[serde(default, alias = "down_weight_ratio_column")]
    pub down: Option<String>,
    /// Down variation is the nominal itself.
    #[serde(default)]
    pub one_sided: bool,
    /// Downstream interpolation is log-normal.
    #[serde(default)]
    pub log_normal: bool,
    /// Downstream fit may float this systematic.
    #[serde(default)]
    pub floatable: bool,
}

impl UnisimSpec {
    /// Two-sided unisim.
    pub fn new(name: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: up.into(),
            down: Some(down.into()),
            one_sided: false,
            log_normal: false,
            floatable: false,
        }
    }

    /// One-sided unisim (down = nominal).
    pub fn one_sided(name: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: up.into(),
            down: None,
            one_sided: true,
            log_normal: false,
            floatable: false,
        }
    }

    /// Set the log-normal flag.
    pub fn log_normal(mut self, on: bool) -> Self {
        self.log_normal = on;
        self
    }

    /// Set the floatable flag.
    pub fn floatable(mut self, on: bool) -> Self {
        self.floatable = on;
        self
    }

    /// Check the definition is usable.
    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        if self.up.trim().is_empty() {
            return Err(Error::Configuration(format!("unisim '{}': empty up column", self.name)));
        }
        if !self.one_sided && self.down.as_deref().is_none_or(|d| d.trim().is_empty()) {
            return Err(Error::Configuration(format!(
                "unisim '{}': two-sided systematic needs a down column",
                self.name
            )));
        }
        Ok(())
    }
}

/// Many-universe systematic decomposed into eigenmodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultisimSpec {
    /// Systematic name.
    pub name: String,
    /// Per-event weight-vector column (one entry per universe).
    #[serde(alias = "per_event_weight_vector_column")]
    pub weights: String,
    /// Optional per-event central-value column dividing every universe weight.
    #[serde(default, alias = "central_value_column")]
    pub central_value: Option<String>,
    /// Number of universes; non-positive means read it from the data.
    #[serde(default = "auto_universes")]
    pub max_universes: i64,
    /// Hard cap on retained eigenmodes.
    #[serde(default)]
    pub max_modes: Option<usize>,
    /// Minimum explained variance fraction, in `(0, 1]`.
    #[serde(default = "default_keep_fraction")]
    pub keep_fraction: f64,
    /// Remove the overall-normalization component before accumulating.
    #[serde(default)]
    pub split_rate_shape: bool,
    /// Emit the removed normalization as a log-normal rate systematic.
    #[serde(default)]
    pub rate_log_normal: bool,
}

fn auto_universes() -> i64 {
    -1
}

fn default_keep_fraction() -> f64 {
    0.99
}

impl MultisimSpec {
    /// Multisim with auto-detected universe count and default truncation.
    pub fn new(name: impl Into<String>, weights: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: weights.into(),
            central_value: None,
            max_universes: auto_universes(),
            max_modes: None,
            keep_fraction: default_keep_fraction(),
            split_rate_shape: false,
            rate_log_normal: false,
        }
    }

    /// Set the central-value column.
    pub fn central_value(mut self, column: impl Into<String>) -> Self {
        self.central_value = Some(column.into());
        self
    }

    /// Fix the number of universes.
    pub fn universes(mut self, n: usize) -> Self {
        self.max_universes = i64::try_from(n).unwrap_or(i64::MAX);
        self
    }

    /// Cap the number of retained modes.
    pub fn max_modes(mut self, n: usize) -> Self {
        self.max_modes = Some(n);
        self
    }

    /// Set the explained-variance threshold.
    pub fn keep_fraction(mut self, f: f64) -> Self {
        self.keep_fraction = f;
        self
    }

    /// Enable the rate/shape split, optionally emitting the log-normal rate.
    pub fn split_rate_shape(mut self, rate_log_normal: bool) -> Self {
        self.split_rate_shape = true;
        self.rate_log_normal = rate_log_normal;
        self
    }

    /// Configured universe count, if fixed.
    pub fn fixed_universes(&self) -> Option<usize> {
        usize::try_from(self.max_universes).ok().filter(|&n| n > 0)
    }

    /// Whether a separate rate systematic is produced.
    pub fn emits_rate(&self) -> bool {
        self.split_rate_shape && self.rate_log_normal
    }

    /// Name of the rate systematic.
    pub fn rate_name(&self) -> String {
        format!("{}_rate", self.name)
    }

    /// Name of eigenmode `index`.
    pub fn mode_name(&self, index: usize) -> String {
        format!("{}_mode{index:03}", self.name)
    }

    /// Check the definition is usable.
    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        if self.weights.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "multisim '{}': empty weight-vector column",
                self.name
            )));
        }
        if !(self.keep_fraction > 0.0 && self.keep_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "multisim '{}': keep_fraction {} outside (0, 1]",
                self.name, self.keep_fraction
            )));
        }
        if self.max_modes == Some(0) {
            return Err(Error::Configuration(format!(
                "multisim '{}': max_modes must be at least 1",
                self.name
            )));
        }
        if self.rate_log_normal && !self.split_rate_shape {
            log::warn!(
                "multisim '{}': rate_log_normal has no effect without split_rate_shape",
                self.name
            );
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Configuration("systematic with empty name".into()));
    }
    if name.contains('/') {
        return Err(Error::Configuration(format!("systematic name '{name}' contains '/'")));
    }
    Ok(())
}

/// Every systematic processed in one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystematicsConfig {
    /// Two-point systematics.
    #[serde(default)]
    pub unisim: Vec<UnisimSpec>,
    /// Many-universe systematics.
    #[serde(default)]
    pub multisim: Vec<MultisimSpec>,
}

impl SystematicsConfig {
    /// Read a YAML file, or JSON when the extension is `.json`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Configuration(format!("reading systematics config {}: {e}", path.display()))
        })?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
        let cfg: Self = if ext == "json" {
            serde_json::from_slice(&bytes).map_err(|e| Error::Configuration(e.to_string()))
        } else {
            serde_yaml_ng::from_slice(&bytes).map_err(|e| Error::Configuration(e.to_string()))
        }
        .map_err(|e| e.context(path.display()))?;
        cfg.validate().map_err(|e| e.context(path.display()))?;
        Ok(cfg)
    }

    /// Parse YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml_ng::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate every spec and reject duplicate names.
    ///
    /// A rate systematic derived from a multisim counts as a name of its own.
    pub fn validate(&self) -> Result<()> {
        for s in &self.unisim {
            s.validate()?;
        }
        for s in &self.multisim {
            s.validate()?;
        }
        let mut names: Vec<String> = self.names();
        names.sort();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Configuration(format!("duplicate systematic name '{}'", w[0])));
        }
        Ok(())
    }

    /// Names of every systematic written to the store.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.unisim.iter().map(|s| s.name.clone()).collect();
        for m in &self.multisim {
            names.push(m.name.clone());
            if m.emits_rate() {
                names.push(m.rate_name());
            }
        }
        names
    }

    /// Number of configured systematics.
    pub fn len(&self) -> usize {
        self.unisim.len() + self.multisim.len()
    }

    /// Whether nothing is configured.
    pub fn is_empty(&self) -> bool {
        self.unisim.is_empty() && self.multisim.is_empty()
    }

    /// Conventional catalogue: GENIE reweighting knobs as unisims, GENIE,
    /// flux and hadron-reinteraction universes as multisims.
    pub fn standard() -> Self {
        let knob = |name: &str, stem: &str| {
            UnisimSpec::new(name, format!("knob{stem}up"), format!("knob{stem}dn"))
        };
        Self {
            unisim: vec![
                knob("RPA", "RPA"),
                knob("CCMEC", "CCMEC"),
                knob("AxFFCCQE", "AxFFCCQE"),
                knob("VecFFCCQE", "VecFFCCQE"),
                knob("DecayAngMEC", "DecayAngMEC"),
                knob("ThetaDelta2Npi", "ThetaDelta2Npi"),
                knob("ThetaDelta2NRad", "ThetaDelta2NRad"),
                knob("NormCCCOH", "NormCCCOH").log_normal(true),
                knob("NormNCCOH", "NormNCCOH").log_normal(true),
                knob("xsr_scc_Fv3", "xsr_scc_Fv3"),
                knob("xsr_scc_Fa3", "xsr_scc_Fa3"),
                UnisimSpec::one_sided("RootinoFix", "knobRootinoFix"),
            ],
            multisim: vec![
                MultisimSpec::new("GENIE", "weightsGenie")
                    .universes(500)
                    .central_value("weightSplineTimesTune")
                    .split_rate_shape(true),
                MultisimSpec::new("flux", "weightsFlux").universes(1000).split_rate_shape(true),
                MultisimSpec::new("reint", "weightsReint").universes(1000),
            ],
        }
    }
}

/// Options of one `build_all` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Worker threads for histogram filling (0 = automatic); passed to
    /// `FrameEngine::with_threads` by the command-line driver.
    pub thread_count: usize,
    /// Give overlay (beam simulation) samples systematic variations.
    pub include_overlay: bool,
    /// Give dirt samples systematic variations.
    pub include_dirt: bool,
    /// Give strangeness-enhanced samples systematic variations.
    pub include_strangeness: bool,
    /// Give off-beam samples systematic variations.
    pub include_off_beam: bool,
    /// Clamp negative bins of eigenmode variations to zero.
    pub clamp_negative_bins: bool,
    /// Reuse nominal templates already in the store instead of refilling them.
    pub skip_nominals: bool,
    /// Nominal per-event weight expression.
    pub nominal_weight: String,
    /// Universes per booking batch in multisim processing (`None` = all).
    pub universe_batch: Option<usize>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            thread_count: 0,
            include_overlay: true,
            include_dirt: true,
            include_strangeness: true,
            include_off_beam: false,
            clamp_negative_bins: false,
            skip_nominals: false,
            nominal_weight: DEFAULT_NOMINAL_WEIGHT.to_string(),
            universe_batch: None,
        }
    }
}

impl BuildOptions {
    /// Check the options are usable.
    pub fn validate(&self) -> Result<()> {
        if self.nominal_weight.trim().is_empty() {
            return Err(Error::Configuration("empty nominal weight expression".into()));
        }
        if self.universe_batch == Some(0) {
            return Err(Error::Configuration("universe_batch must be at least 1".into()));
        }
        Ok(())
    }

    /// Sample-eligibility policy implied by the inclusion flags.
    pub fn policy(&self) -> CategoryPolicy {
        CategoryPolicy {
            overlay: self.include_overlay,
            dirt: self.include_dirt,
            strangeness: self.include_strangeness,
            off_beam: self.include_off_beam,
        }
    }
}

/// Eligibility by sample category. On-beam data never gets variations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
    /// Include overlay samples.
    pub overlay: bool,
    /// Include dirt samples.
    pub dirt: bool,
    /// Include strangeness samples.
    pub strangeness: bool,
    /// Include off-beam samples.
    pub off_beam: bool,
}

impl SamplePolicy for CategoryPolicy {
    fn include(&self, _name: &str, category: SampleCategory) -> bool {
        match category {
            SampleCategory::OnBeam => false,
            SampleCategory::OffBeam => self.off_beam,
            SampleCategory::Overlay => self.overlay,
            SampleCategory::Dirt => self.dirt,
            SampleCategory::Strangeness => self.strangeness,
        }
    }
}
