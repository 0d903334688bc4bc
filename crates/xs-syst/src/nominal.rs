//! Nominal templates: every template of every sample, nominal weight.

use xs_core::{EventWeight, HistogramBatch, HistogramEngine, Result, Sample, TemplateStore, keys};

use crate::catalog::{TemplateCatalog, TemplateHists};
use crate::staged::StagedWrites;

/// Fills and stores the nominal templates that multisim processing reads back.
pub struct NominalBuilder<'a, E> {
    engine: &'a E,
    templates: &'a TemplateCatalog,
    nominal_weight: &'a str,
}

impl<'a, E: HistogramEngine> NominalBuilder<'a, E> {
    /// Create a builder.
    pub fn new(engine: &'a E, templates: &'a TemplateCatalog, nominal_weight: &'a str) -> Self {
        Self { engine, templates, nominal_weight }
    }

    /// Fill every template of `sample` in one batch.
    ///
    /// Beam-on and beam-off data carry no simulation weights and are filled
    /// with unit weight.
    pub fn build(&self, sample: &Sample<E::Table>) -> Result<TemplateHists> {
        let mut batch = HistogramBatch::new();
        let ids = self.templates.book_into(&mut batch, &sample.name, |t| {
            EventWeight::Expr(t.base_weight(sample.category, self.nominal_weight).to_string())
        });
        let mut result = self.engine.evaluate(&sample.table, &batch)?;
        self.templates.collect(&mut result, &ids)
    }

    /// Fill and write the nominal templates and per-sample metadata of `sample`.
    ///
    /// Metadata: `category`, `n_events` and, when known, `pot`.
    pub fn write<S: TemplateStore>(&self, sample: &Sample<E::Table>, store: &mut S) -> Result<()> {
        let ctx = || format!("nominals of sample '{}'", sample.name);
        let hists = self.build(sample).map_err(|e| e.context(ctx()))?;
        let n_events = self.engine.n_events(&sample.table);

        let mut staged = StagedWrites::new();
        for (template, hist) in hists {
            staged.hist(keys::nominal(&sample.name, &template), hist).map_err(|e| e.context(ctx()))?;
        }
        staged.meta(keys::sample_meta(&sample.name, "category"), sample.category.as_str())?;
        staged.meta(keys::sample_meta(&sample.name, "n_events"), n_events)?;
        if let Some(pot) = sample.pot {
            staged.meta(keys::sample_meta(&sample.name, "pot"), pot)?;
        }
        staged.apply(store)?;
        log::debug!(
            "nominals for '{}': {} templates, {n_events} events",
            sample.name,
            self.templates.len()
        );
        Ok(())
    }
}
