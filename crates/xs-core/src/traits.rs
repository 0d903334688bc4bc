//! Collaborator traits for xsyst
//!
//! The synthesis builders never touch events or files directly: weighted
//! histograms come from a [`HistogramEngine`] that evaluates whole batches
//! of bookings in one scan, and every result goes through a [`TemplateStore`].

use crate::types::{BinnedVector, Binning, MetaValue, SampleCategory};
use crate::{Error, Result};

/// Per-event weight of one booking.
#[derive(Debug, Clone, PartialEq)]
pub enum EventWeight {
    /// Scalar weight expression.
    Expr(String),
    /// `nominal × ratio_column`, for two-point reweighting.
    Scaled {
        /// Nominal weight expression.
        nominal: String,
        /// Per-event ratio column.
        ratio_column: String,
    },
    /// `nominal × vector[universe] / central_value` for one universe.
    ///
    /// Events whose vector is shorter than `universe + 1` get a factor of 1.
    Universe {
        /// Nominal weight expression.
        nominal: String,
        /// Per-event weight-vector column.
        vector_column: String,
        /// Universe index.
        universe: usize,
        /// Optional per-event central-value column dividing the factor.
        central_value: Option<String>,
    },
}

/// One weighted, filtered 1D histogram request.
#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    /// Free-form label used in error messages.
    pub label: String,
    /// Selection expression (entries pass if > 0); `None` keeps every event.
    pub selection: Option<String>,
    /// Variable expression.
    pub variable: String,
    /// Event weight.
    pub weight: EventWeight,
    /// Binning.
    pub binning: Binning,
}

/// Handle to a booked histogram, redeemed against a [`BatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookingId(usize);

impl BookingId {
    /// Position of the booking in its batch.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Bookings accumulated for a single evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct HistogramBatch {
    bookings: Vec<Booking>,
}

impl HistogramBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a booking; the returned id is valid for this batch's result only.
    pub fn book(&mut self, booking: Booking) -> BookingId {
        self.bookings.push(booking);
        BookingId(self.bookings.len() - 1)
    }

    /// Number of bookings.
    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    /// Whether nothing was booked.
    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Bookings in submission order.
    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }
}

/// Realized histograms of one batch, in booking order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    hists: Vec<Option<BinnedVector>>,
}

impl BatchResult {
    /// Wrap engine output; `hists[i]` answers booking `i`.
    pub fn new(hists: Vec<BinnedVector>) -> Self {
        Self { hists: hists.into_iter().map(Some).collect() }
    }

    /// Number of histograms in the result.
    pub fn len(&self) -> usize {
        self.hists.len()
    }

    /// Whether the result is empty.
    pub fn is_empty(&self) -> bool {
        self.hists.is_empty()
    }

    /// Move the histogram for `id` out of the result.
    pub fn take(&mut self, id: BookingId) -> Result<BinnedVector> {
        self.hists.get_mut(id.0).and_then(Option::take).ok_or_else(|| {
            Error::DataAvailability(format!("booking #{} missing from batch result", id.0))
        })
    }
}

/// Batched weighted-histogram backend.
pub trait HistogramEngine: Send + Sync {
    /// Event table type the engine scans.
    type Table;

    /// Realize every booking of `batch` over `table` in one pass.
    fn evaluate(&self, table: &Self::Table, batch: &HistogramBatch) -> Result<BatchResult>;

    /// Length of the vector column `column` on the first event, `None` for an empty table.
    fn vector_len(&self, table: &Self::Table, column: &str) -> Result<Option<usize>>;

    /// Number of events in `table`.
    fn n_events(&self, table: &Self::Table) -> usize;
}

/// Keyed persistence of binned vectors and metadata.
///
/// Writes are upserts. Nothing is durable before [`TemplateStore::commit`].
pub trait TemplateStore {
    /// Read the histogram at `key`.
    fn read_hist(&self, key: &str) -> Result<Option<BinnedVector>>;

    /// Write (or overwrite) the histogram at `key`.
    fn write_hist(&mut self, key: &str, hist: BinnedVector) -> Result<()>;

    /// Read the metadata value at `key`.
    fn read_meta(&self, key: &str) -> Result<Option<MetaValue>>;

    /// Write (or overwrite) the metadata value at `key`.
    fn write_meta(&mut self, key: &str, value: MetaValue) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Vec<String>;

    /// Persist all pending writes.
    fn commit(&mut self) -> Result<()>;
}

/// Decides which samples receive systematic variations.
pub trait SamplePolicy {
    /// Whether a sample of `category` named `name` is eligible.
    fn include(&self, name: &str, category: SampleCategory) -> bool;
}

impl<F> SamplePolicy for F
where
    F: Fn(&str, SampleCategory) -> bool,
{
    fn include(&self, name: &str, category: SampleCategory) -> bool {
        self(name, category)
    }
}
