//! # xs-syst
//!
//! Systematic template synthesis: two-point (unisim) variations and
//! many-universe (multisim) covariance with eigenmode decomposition.
//!
//! ## Pipeline
//!
//! 1. [`NominalBuilder`] fills every template of every sample.
//! 2. [`UnisimVariationBuilder`] fills `pos`/`neg` templates per eligible sample.
//! 3. [`MultisimCovarianceBuilder`] stacks all eligible (sample, template)
//!    blocks, replays each universe and accumulates the shape covariance;
//!    [`EigenmodeSelector`] turns its leading modes into `pos`/`neg` templates.
//!
//! [`SystematicsOrchestrator`] runs the stages and writes everything through
//! a [`xs_core::TemplateStore`], such as [`JsonTemplateStore`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod eigen;
pub mod multisim;
pub mod nominal;
pub mod orchestrator;
mod staged;
pub mod store;
pub mod unisim;

pub use catalog::{TemplateCatalog, TemplateHists, TemplateSpec};
pub use config::{
    BuildOptions, CategoryPolicy, DEFAULT_NOMINAL_WEIGHT, MultisimSpec, SystematicsConfig,
    UnisimSpec,
};
pub use eigen::{Eigenmode, EigenmodeSelector, ModeVariation, Spectrum, retained_modes};
pub use multisim::{
    CovarianceAccumulator, MultisimCovariance, MultisimCovarianceBuilder, StackLayout, rms,
};
pub use nominal::NominalBuilder;
pub use orchestrator::{BuildReport, Failure, SystematicsOrchestrator};
pub use store::JsonTemplateStore;
pub use unisim::{UnisimVariationBuilder, UnisimVariations};
