//! Template catalogue: the 1D templates booked for every sample.
//!
//! The on-disk form is tab-separated with the columns
//! `name  title  selection  variable  weight  bin_count  x_min  x_max`.
//! Blank lines and lines starting with `#` are skipped, as is a header row
//! whose first field is `name`. An empty (or `-`) selection keeps every
//! event; an empty (or `-`) weight falls back to the run's nominal weight.

use std::path::Path;

use serde::{Deserialize, Serialize};
use xs_core::{
    BatchResult, BinnedVector, Binning, Booking, BookingId, Error, EventWeight, HistogramBatch,
    Result, SampleCategory,
};

const N_COLUMNS: usize = 8;

/// Binned content per template, in catalogue order.
pub type TemplateHists = Vec<(String, BinnedVector)>;

/// One template definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Unique template name (used in store keys).
    pub name: String,
    /// Human-readable title.
    pub title: String,
    /// Selection expression; `None` keeps every event.
    pub selection: Option<String>,
    /// Variable expression.
    pub variable: String,
    /// Weight expression; `None` means the nominal event weight.
    pub weight: Option<String>,
    /// Binning.
    pub binning: Binning,
}

impl TemplateSpec {
    /// Per-event base weight of this template for a sample of `category`.
    ///
    /// Simulation uses the template weight, falling back to `nominal`; beam
    /// data carries no simulation weights and counts each event once.
    pub fn base_weight<'a>(&'a self, category: SampleCategory, nominal: &'a str) -> &'a str {
        if category.is_simulation() { self.weight.as_deref().unwrap_or(nominal) } else { "1" }
    }

    /// Booking of this template with the given event weight.
    pub fn booking(&self, label: String, weight: EventWeight) -> Booking {
        Booking {
            label,
            selection: self.selection.clone(),
            variable: self.variable.clone(),
            weight,
            binning: self.binning,
        }
    }
}

/// Ordered, immutable list of templates for one analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateCatalog {
    templates: Vec<TemplateSpec>,
}

impl TemplateCatalog {
    /// Build from definitions, rejecting duplicate names.
    pub fn new(templates: Vec<TemplateSpec>) -> Result<Self> {
        for (i, t) in templates.iter().enumerate() {
            if templates[..i].iter().any(|u| u.name == t.name) {
                return Err(Error::Configuration(format!("duplicate template name '{}'", t.name)));
            }
        }
        Ok(Self { templates })
    }

    /// Read a tab-separated catalogue file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("reading template catalogue {}: {e}", path.display()))
        })?;
        Self::parse(&text).map_err(|e| e.context(path.display()))
    }

    /// Parse tab-separated catalogue text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut templates = Vec::new();
        let mut seen_data = false;
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            if !seen_data && fields[0].eq_ignore_ascii_case("name") {
                seen_data = true;
                continue;
            }
            seen_data = true;
            templates.push(parse_row(&fields).map_err(|e| e.context(format!("line {line_no}")))?);
        }
        Self::new(templates)
    }

    /// Templates in catalogue order.
    pub fn iter(&self) -> std::slice::Iter<'_, TemplateSpec> {
        self.templates.iter()
    }

    /// Template by name.
    pub fn get(&self, name: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the catalogue is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Total number of bins over all templates.
    pub fn total_bins(&self) -> usize {
        self.templates.iter().map(|t| t.binning.n_bins).sum()
    }

    /// Book every template into `batch`, in catalogue order.
    pub fn book_into(
        &self,
        batch: &mut HistogramBatch,
        label: &str,
        weight: impl Fn(&TemplateSpec) -> EventWeight,
    ) -> Vec<BookingId> {
        self.templates
            .iter()
            .map(|t| batch.book(t.booking(format!("{label}/{}", t.name), weight(t))))
            .collect()
    }

    /// Redeem ids returned by [`TemplateCatalog::book_into`].
    pub fn collect(&self, result: &mut BatchResult, ids: &[BookingId]) -> Result<TemplateHists> {
        self.templates
            .iter()
            .zip(ids)
            .map(|(t, &id)| Ok((t.name.clone(), result.take(id)?)))
            .collect()
    }
}

impl<'a> IntoIterator for &'a TemplateCatalog {
    type Item = &'a TemplateSpec;
    type IntoIter = std::slice::Iter<'a, TemplateSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.templates.iter()
    }
}

fn parse_row(fields: &[&str]) -> Result<TemplateSpec> {
    if fields.len() < N_COLUMNS {
        return Err(Error::Configuration(format!(
            "expected {N_COLUMNS} tab-separated columns, found {}",
            fields.len()
        )));
    }
    let name = fields[0];
    if name.is_empty() {
        return Err(Error::Configuration("empty template name".into()));
    }
    if fields[3].is_empty() {
        return Err(Error::Configuration(format!("template '{name}' has no variable")));
    }
    let n_bins: usize = parse_num(fields[5], "bin_count")?;
    let x_min: f64 = parse_num(fields[6], "x_min")?;
    let x_max: f64 = parse_num(fields[7], "x_max")?;
    Ok(TemplateSpec {
        name: name.to_string(),
        title: fields[1].to_string(),
        selection: optional(fields[2]),
        variable: fields[3].to_string(),
        weight: optional(fields[4]),
        binning: Binning::new(n_bins, x_min, x_max)
            .map_err(|e| e.context(format!("template '{name}'")))?,
    })
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse().map_err(|_| Error::Configuration(format!("malformed {what} '{s}'")))
}

fn optional(s: &str) -> Option<String> {
    (!s.is_empty() && s != "-").then(|| s.to_string())
}
