//! Batched weighted-histogram evaluation over an [`EventFrame`].
//!
//! Every distinct selection, variable and weight expression of a batch is
//! compiled and evaluated once. The bookings are then split into one group
//! per worker thread and each group is filled in a single pass over the
//! rows, so hundreds of universe weights booked against the same selection
//! cost one selection evaluation and one scan per worker.
//!
//! Every booking accumulates its rows in table order whatever the grouping,
//! so parallel and sequential filling give bit-identical histograms.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use xs_core::{
    BatchResult, BinnedVector, Binning, Booking, EventWeight, HistogramBatch, HistogramEngine,
};

use crate::error::{FrameError, Result};
use crate::expr::CompiledExpr;
use crate::frame::{EventFrame, JaggedColumn};

/// [`HistogramEngine`] backed by in-memory [`EventFrame`]s.
#[derive(Debug, Clone)]
pub struct FrameEngine {
    parallel: bool,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl FrameEngine {
    /// Engine filling bookings on the current rayon pool.
    pub fn new() -> Self {
        Self { parallel: true, pool: None }
    }

    /// Engine filling every booking in one pass on the calling thread.
    pub fn sequential() -> Self {
        Self { parallel: false, pool: None }
    }

    /// Engine with its own pool of `threads` workers (0 = the current rayon pool).
    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Ok(Self::new());
        }
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        log::debug!("histogram engine: {threads} worker threads");
        Ok(Self { parallel: true, pool: Some(Arc::new(pool)) })
    }

    /// Worker threads bookings are spread over.
    pub fn threads(&self) -> usize {
        match (&self.pool, self.parallel) {
            (_, false) => 1,
            (Some(pool), true) => pool.current_num_threads(),
            (None, true) => rayon::current_num_threads(),
        }
    }

    /// Fill every booking of `batch`; errors carry the failing booking's label.
    pub fn fill(&self, frame: &EventFrame, batch: &HistogramBatch) -> Result<Vec<BinnedVector>> {
        let cache = ColumnCache::build(frame, batch.bookings())?;
        let plans: Vec<FillPlan<'_>> = batch
            .bookings()
            .iter()
            .map(|b| FillPlan::resolve(b, frame, &cache))
            .collect::<Result<_>>()?;
        log::debug!(
            "filling {} bookings over {} events ({} distinct expressions)",
            plans.len(),
            frame.n_rows(),
            cache.len()
        );
        let n_rows = frame.n_rows();
        let hists = match (&self.pool, self.parallel) {
            (_, false) => scan(&plans, n_rows),
            (Some(pool), true) => pool.install(|| scan_grouped(&plans, n_rows)),
            (None, true) => scan_grouped(&plans, n_rows),
        };
        Ok(hists)
    }
}

/// One pass over the rows filling every plan.
fn scan(plans: &[FillPlan<'_>], n_rows: usize) -> Vec<BinnedVector> {
    let mut hists: Vec<BinnedVector> = plans.iter().map(|p| BinnedVector::zeros(p.binning)).collect();
    for row in 0..n_rows {
        for (plan, h) in plans.iter().zip(hists.iter_mut()) {
            plan.fill_row(row, h);
        }
    }
    hists
}

/// One group of plans per worker of the current pool, each group scanned once.
fn scan_grouped(plans: &[FillPlan<'_>], n_rows: usize) -> Vec<BinnedVector> {
    if plans.is_empty() {
        return Vec::new();
    }
    let group = plans.len().div_ceil(rayon::current_num_threads().max(1));
    let groups: Vec<Vec<BinnedVector>> =
        plans.par_chunks(group).map(|g| scan(g, n_rows)).collect();
    groups.into_iter().flatten().collect()
}

impl Default for FrameEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HistogramEngine for FrameEngine {
    type Table = EventFrame;

    fn evaluate(&self, table: &EventFrame, batch: &HistogramBatch) -> xs_core::Result<BatchResult> {
        Ok(BatchResult::new(self.fill(table, batch)?))
    }

    fn vector_len(&self, table: &EventFrame, column: &str) -> xs_core::Result<Option<usize>> {
        let col = table.jagged(column).ok_or_else(|| {
            if table.column(column).is_some() {
                xs_core::Error::Configuration(format!(
                    "column '{column}' is a scalar column, expected a per-event weight vector"
                ))
            } else {
                FrameError::MissingColumn(column.to_string()).into()
            }
        })?;
        Ok((col.n_rows() > 0).then(|| col.row(0).len()))
    }

    fn n_events(&self, table: &EventFrame) -> usize {
        table.n_rows()
    }
}

// ── Shared expression columns ──────────────────────────────────

struct ColumnCache {
    values: HashMap<String, Vec<f64>>,
}

impl ColumnCache {
    fn build(frame: &EventFrame, bookings: &[Booking]) -> Result<Self> {
        let mut values: HashMap<String, Vec<f64>> = HashMap::new();
        for b in bookings {
            let nominal = match &b.weight {
                EventWeight::Expr(e) => e.as_str(),
                EventWeight::Scaled { nominal, .. } | EventWeight::Universe { nominal, .. } => {
                    nominal.as_str()
                }
            };
            let exprs = b.selection.iter().map(String::as_str).chain([b.variable.as_str(), nominal]);
            for src in exprs {
                if values.contains_key(src) {
                    continue;
                }
                let col = CompiledExpr::compile(src)
                    .and_then(|e| e.eval_frame(frame))
                    .map_err(|e| label_error(e, &b.label))?;
                values.insert(src.to_string(), col);
            }
        }
        Ok(Self { values })
    }

    fn get(&self, src: &str) -> &[f64] {
        // `build` inserted every expression a booking references.
        self.values.get(src).map(Vec::as_slice).unwrap_or(&[])
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

fn label_error(e: FrameError, label: &str) -> FrameError {
    match e {
        FrameError::Expression(m) => FrameError::Expression(format!("{label}: {m}")),
        other => other,
    }
}

// ── Per-booking fill ───────────────────────────────────────────

enum WeightColumn<'a> {
    Plain(&'a [f64]),
    Scaled { nominal: &'a [f64], ratio: &'a [f64] },
    Universe { nominal: &'a [f64], vector: &'a JaggedColumn, universe: usize, cv: Option<&'a [f64]> },
}

impl WeightColumn<'_> {
    fn at(&self, row: usize) -> f64 {
        match self {
            WeightColumn::Plain(w) => w[row],
            WeightColumn::Scaled { nominal, ratio } => nominal[row] * ratio[row],
            WeightColumn::Universe { nominal, vector, universe, cv } => {
                nominal[row]
                    * universe_factor(vector.get(row, *universe), cv.map(|c| c[row]))
            }
        }
    }
}

/// Multiplicative factor of one event in one universe.
///
/// A missing element, a zero or non-finite central value, and a non-finite
/// ratio all give the neutral factor 1.
pub fn universe_factor(element: Option<f64>, central_value: Option<f64>) -> f64 {
    let Some(w) = element else {
        return 1.0;
    };
    let f = match central_value {
        None => w,
        Some(cv) if cv != 0.0 && cv.is_finite() => w / cv,
        Some(_) => return 1.0,
    };
    if f.is_finite() { f } else { 1.0 }
}

struct FillPlan<'a> {
    selection: Option<&'a [f64]>,
    variable: &'a [f64],
    weight: WeightColumn<'a>,
    binning: Binning,
}

impl<'a> FillPlan<'a> {
    fn resolve(b: &'a Booking, frame: &'a EventFrame, cache: &'a ColumnCache) -> Result<Self> {
        let weight = match &b.weight {
            EventWeight::Expr(e) => WeightColumn::Plain(cache.get(e)),
            EventWeight::Scaled { nominal, ratio_column } => WeightColumn::Scaled {
                nominal: cache.get(nominal),
                ratio: frame.require(ratio_column)?,
            },
            EventWeight::Universe { nominal, vector_column, universe, central_value } => {
                let vector = frame
                    .jagged(vector_column)
                    .ok_or_else(|| FrameError::MissingColumn(vector_column.clone()))?;
                let cv = central_value.as_deref().map(|c| frame.require(c)).transpose()?;
                WeightColumn::Universe {
                    nominal: cache.get(nominal),
                    vector,
                    universe: *universe,
                    cv,
                }
            }
        };
        Ok(Self {
            selection: b.selection.as_deref().map(|s| cache.get(s)),
            variable: cache.get(&b.variable),
            weight,
            binning: b.binning,
        })
    }

    fn fill_row(&self, row: usize, h: &mut BinnedVector) {
        if let Some(sel) = self.selection {
            if sel[row] <= 0.0 {
                return;
            }
        }
        let Some(bin) = self.binning.find_bin(self.variable[row]) else {
            return;
        };
        let w = self.weight.at(row);
        h.content[bin] += w;
        h.sumw2[bin] += w * w;
    }
}
