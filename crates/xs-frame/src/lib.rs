//! # xs-frame
//!
//! Columnar event tables and the batched histogram backend for xsyst.
//!
//! ## Example
//!
//! ```
//! use xs_core::{Binning, Booking, EventWeight, HistogramBatch, HistogramEngine};
//! use xs_frame::{EventFrame, FrameEngine};
//!
//! let frame = EventFrame::new()
//!     .with_column("reco_e", vec![0.3, 0.7, 1.4]).unwrap()
//!     .with_column("w", vec![1.0, 0.5, 2.0]).unwrap();
//!
//! let mut batch = HistogramBatch::new();
//! let id = batch.book(Booking {
//!     label: "reco_e".into(),
//!     selection: Some("reco_e > 0.5".into()),
//!     variable: "reco_e".into(),
//!     weight: EventWeight::Expr("w".into()),
//!     binning: Binning::new(2, 0.0, 2.0).unwrap(),
//! });
//! let mut result = FrameEngine::new().evaluate(&frame, &batch).unwrap();
//! assert_eq!(result.take(id).unwrap().content, vec![0.5, 2.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod event_parquet;
pub mod expr;
pub mod frame;

pub use engine::{FrameEngine, universe_factor};
pub use error::{FrameError, Result};
pub use event_parquet::{frame_from_batches, read_parquet_frame};
pub use expr::CompiledExpr;
pub use frame::{EventFrame, JaggedColumn};
