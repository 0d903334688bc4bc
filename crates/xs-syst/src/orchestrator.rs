//! Runs every configured systematic over the sample corpus.
//!
//! Systematics are processed one at a time. Each one is computed in full,
//! staged, written and committed before the next starts, so a failure
//! leaves earlier systematics intact and writes nothing partial. Only store
//! I/O failures stop the run.

use std::fmt;

use xs_core::{Error, HistogramEngine, Result, Sample, SamplePolicy, TemplateStore, keys};

use crate::catalog::TemplateCatalog;
use crate::config::{BuildOptions, CategoryPolicy, MultisimSpec, SystematicsConfig, UnisimSpec};
use crate::eigen::EigenmodeSelector;
use crate::multisim::MultisimCovarianceBuilder;
use crate::nominal::NominalBuilder;
use crate::staged::StagedWrites;
use crate::unisim::UnisimVariationBuilder;

/// A systematic (or nominal stage) that did not complete.
#[derive(Debug)]
pub struct Failure {
    /// Systematic name, or `nominal:{sample}` for the nominal stage.
    pub name: String,
    /// What went wrong.
    pub error: Error,
}

/// Outcome of [`SystematicsOrchestrator::build_all`].
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Systematics written, in processing order (derived rate systematics included).
    pub completed: Vec<String>,
    /// Systematics skipped because no sample was eligible.
    pub skipped: Vec<String>,
    /// Failures, in processing order.
    pub failed: Vec<Failure>,
}

impl BuildReport {
    /// Whether nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} skipped, {} failed",
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        for fail in &self.failed {
            write!(f, "\n  {}: {}", fail.name, fail.error)?;
        }
        Ok(())
    }
}

/// Dispatches systematics to the unisim and multisim builders.
pub struct SystematicsOrchestrator<'a, E, P = CategoryPolicy> {
    engine: &'a E,
    templates: &'a TemplateCatalog,
    options: &'a BuildOptions,
    policy: P,
}

impl<'a, E: HistogramEngine> SystematicsOrchestrator<'a, E, CategoryPolicy> {
    /// Orchestrator using the category flags of `options` for eligibility.
    pub fn new(engine: &'a E, templates: &'a TemplateCatalog, options: &'a BuildOptions) -> Self {
        Self { engine, templates, options, policy: options.policy() }
    }
}

impl<'a, E: HistogramEngine, P: SamplePolicy> SystematicsOrchestrator<'a, E, P> {
    /// Replace the eligibility policy.
    pub fn with_policy<Q: SamplePolicy>(self, policy: Q) -> SystematicsOrchestrator<'a, E, Q> {
        SystematicsOrchestrator {
            engine: self.engine,
            templates: self.templates,
            options: self.options,
            policy,
        }
    }

    /// Samples that receive systematic variations, in input order.
    pub fn eligible<'s>(&self, samples: &'s [Sample<E::Table>]) -> Vec<&'s Sample<E::Table>> {
        samples.iter().filter(|s| self.policy.include(&s.name, s.category)).collect()
    }

    /// Nominal templates for every sample, eligible or not.
    pub fn build_nominals<S: TemplateStore>(
        &self,
        samples: &[Sample<E::Table>],
        store: &mut S,
        report: &mut BuildReport,
    ) -> Result<()> {
        let builder = NominalBuilder::new(self.engine, self.templates, &self.options.nominal_weight);
        for sample in samples {
            if let Err(e) = builder.write(sample, store) {
                if e.aborts_run() {
                    return Err(e);
                }
                log::error!("{e}");
                report.failed.push(Failure { name: format!("nominal:{}", sample.name), error: e });
            }
        }
        store.commit()?;
        log::info!("nominal templates written for {} samples", samples.len());
        Ok(())
    }

    /// Nominals (unless skipped), then every unisim and multisim in turn.
    pub fn build_all<S: TemplateStore>(
        &self,
        samples: &[Sample<E::Table>],
        systematics: &SystematicsConfig,
        store: &mut S,
    ) -> Result<BuildReport> {
        self.options.validate()?;
        let mut report = BuildReport::default();
        if !self.options.skip_nominals {
            self.build_nominals(samples, store, &mut report)?;
        }

        let eligible = self.eligible(samples);
        log::info!(
            "{} of {} samples eligible for {} systematics",
            eligible.len(),
            samples.len(),
            systematics.len()
        );

        for spec in &systematics.unisim {
            let outcome = if eligible.is_empty() {
                None
            } else {
                Some(self.unisim(spec, &eligible).map(|w| (w, vec![spec.name.clone()])))
            };
            self.finish(&spec.name, outcome, store, &mut report)?;
        }
        for spec in &systematics.multisim {
            let outcome = if eligible.is_empty() {
                None
            } else {
                Some(self.multisim(spec, &eligible, store))
            };
            self.finish(&spec.name, outcome, store, &mut report)?;
        }
        log::info!("systematics done: {report}");
        Ok(report)
    }

    fn finish<S: TemplateStore>(
        &self,
        name: &str,
        outcome: Option<Result<(StagedWrites, Vec<String>)>>,
        store: &mut S,
        report: &mut BuildReport,
    ) -> Result<()> {
        match outcome {
            None => {
                log::warn!("systematic '{name}': no eligible samples, skipped");
                report.skipped.push(name.to_string());
            }
            Some(Ok((staged, names))) => {
                let n = staged.n_hists();
                match staged.apply(store) {
                    Ok(()) => {
                        store.commit()?;
                        log::info!("systematic '{name}': {n} histograms written");
                        report.completed.extend(names);
                    }
                    Err(e) => return Self::record(name, e, report),
                }
            }
            Some(Err(e)) => return Self::record(name, e, report),
        }
        Ok(())
    }

    fn record(name: &str, e: Error, report: &mut BuildReport) -> Result<()> {
        if e.aborts_run() {
            return Err(e);
        }
        log::error!("systematic '{name}' failed: {e}");
        report.failed.push(Failure { name: name.to_string(), error: e });
        Ok(())
    }

    fn unisim(&self, spec: &UnisimSpec, samples: &[&Sample<E::Table>]) -> Result<StagedWrites> {
        log::info!("unisim '{}': {} samples", spec.name, samples.len());
        let builder =
            UnisimVariationBuilder::new(self.engine, self.templates, &self.options.nominal_weight);
        let mut staged = StagedWrites::new();
        for sample in samples {
            let v = builder.build(sample, spec)?;
            for (label, hists) in [(keys::POS, v.up), (keys::NEG, v.down)] {
                for (template, hist) in hists {
                    let key = keys::variation(&sample.name, &spec.name, label, &template);
                    staged.hist(key, hist).map_err(|e| e.context(format!("unisim '{}'", spec.name)))?;
                }
            }
        }
        staged.meta(keys::syst_meta(&spec.name, "type"), "unisim")?;
        staged.meta(keys::syst_meta(&spec.name, "log_normal"), spec.log_normal)?;
        staged.meta(keys::syst_meta(&spec.name, "floatable"), spec.floatable)?;
        Ok(staged)
    }

    fn multisim<S: TemplateStore>(
        &self,
        spec: &MultisimSpec,
        samples: &[&Sample<E::Table>],
        store: &S,
    ) -> Result<(StagedWrites, Vec<String>)> {
        let ctx = || format!("multisim '{}'", spec.name);
        log::info!("multisim '{}': {} samples", spec.name, samples.len());
        let cov = MultisimCovarianceBuilder::new(
            self.engine,
            self.templates,
            &self.options.nominal_weight,
        )
        .universe_batch(self.options.universe_batch)
        .build(samples, spec, store)
        .map_err(|e| e.context(ctx()))?;

        let selector = EigenmodeSelector::for_spec(spec)
            .clamp_negative_bins(self.options.clamp_negative_bins);
        let modes = selector.select(&cov.covariance);
        if modes.is_empty() {
            log::warn!("multisim '{}': no shape variance, zero eigenmodes retained", spec.name);
        }

        let mut staged = StagedWrites::new();
        let blocks = cov.layout.blocks();
        let mut clamped = 0;
        for mode in &modes {
            let name = spec.mode_name(mode.index);
            let var = selector.materialize(mode, blocks, &cov.nominal_hists);
            clamped += var.clamped;
            for (label, hists) in [(keys::POS, var.up), (keys::NEG, var.down)] {
                for (block, hist) in blocks.iter().zip(hists) {
                    let key = keys::variation(&block.sample, &name, label, &block.template);
                    staged.hist(key, hist).map_err(|e| e.context(ctx()))?;
                }
            }
            staged.meta(keys::syst_meta(&name, "type"), "eigenmode")?;
            staged.meta(keys::syst_meta(&name, "parent"), spec.name.as_str())?;
            staged.meta(keys::syst_meta(&name, "eigenvalue"), mode.eigenvalue)?;
        }
        if clamped > 0 {
            log::warn!("multisim '{}': {clamped} negative bins clamped to zero", spec.name);
        }
        staged.meta(keys::syst_meta(&spec.name, "type"), "multisim_eigen")?;
        staged.meta(keys::syst_meta(&spec.name, "nuniv"), cov.n_universes)?;
        staged.meta(keys::syst_meta(&spec.name, "nmodes"), modes.len())?;

        let mut names = vec![spec.name.clone()];
        if spec.emits_rate() {
            let rate = spec.rate_name();
            let sigma = cov.sigma_theta.unwrap_or(0.0);
            let (up, down) = cov.rate_variations(sigma);
            for (label, hists) in [(keys::POS, up), (keys::NEG, down)] {
                for (block, hist) in blocks.iter().zip(hists) {
                    let key = keys::variation(&block.sample, &rate, label, &block.template);
                    staged.hist(key, hist).map_err(|e| e.context(ctx()))?;
                }
            }
            staged.meta(keys::syst_meta(&rate, "type"), "rate")?;
            staged.meta(keys::syst_meta(&rate, "log_normal"), true)?;
            staged.meta(keys::syst_meta(&rate, "sigma_theta"), sigma)?;
            staged.meta(keys::syst_meta(&rate, "parent"), spec.name.as_str())?;
            log::info!("multisim '{}': rate sigma_theta = {sigma:.4}", spec.name);
            names.push(rate);
        }
        log::info!(
            "multisim '{}': U = {}, {} of {} modes retained",
            spec.name,
            cov.n_universes,
            modes.len(),
            cov.layout.len()
        );
        Ok((staged, names))
    }
}
