//! # xs-core
//!
//! Core types and collaborator traits for xsyst, the systematic-template
//! synthesis engine.
//!
//! ## Architecture
//!
//! The builders in `xs-syst` depend only on the [`HistogramEngine`] and
//! [`TemplateStore`] traits defined here, not on a concrete event-table
//! backend or file format.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod keys;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use traits::{
    BatchResult, Booking, BookingId, EventWeight, HistogramBatch, HistogramEngine, SamplePolicy,
    TemplateStore,
};
pub use types::{BinnedVector, Binning, Block, MetaValue, Sample, SampleCategory};
