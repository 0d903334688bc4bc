//! Two-point (unisim) variations.

use xs_core::{
    BatchResult, BookingId, EventWeight, HistogramBatch, HistogramEngine, Result, Sample,
};

use crate::catalog::{TemplateCatalog, TemplateHists};
use crate::config::UnisimSpec;

/// Up and down templates of one sample for one unisim.
#[derive(Debug, Clone, PartialEq)]
pub struct UnisimVariations {
    /// Up (`pos`) variation per template.
    pub up: TemplateHists,
    /// Down (`neg`) variation per template.
    pub down: TemplateHists,
}

/// Builds unisim variations, one sample at a time.
pub struct UnisimVariationBuilder<'a, E> {
    engine: &'a E,
    templates: &'a TemplateCatalog,
    nominal_weight: &'a str,
}

impl<'a, E: HistogramEngine> UnisimVariationBuilder<'a, E> {
    /// Create a builder.
    pub fn new(engine: &'a E, templates: &'a TemplateCatalog, nominal_weight: &'a str) -> Self {
        Self { engine, templates, nominal_weight }
    }

    /// Fill up and down variations of every template of `sample` in one batch.
    ///
    /// Up weight is `nominal × up_ratio`; down weight is `nominal × down_ratio`,
    /// or the nominal weight alone for a one-sided systematic.
    pub fn build(&self, sample: &Sample<E::Table>, spec: &UnisimSpec) -> Result<UnisimVariations> {
        let ctx = || format!("unisim '{}', sample '{}'", spec.name, sample.name);
        spec.validate().map_err(|e| e.context(ctx()))?;
        let label = format!("{}/{}", sample.name, spec.name);
        let mut batch = HistogramBatch::new();
        let up_ids = self.templates.book_into(&mut batch, &format!("{label}/up"), |t| {
            EventWeight::Scaled {
                nominal: t.base_weight(sample.category, self.nominal_weight).to_string(),
                ratio_column: spec.up.clone(),
            }
        });
        let down_ids = self.templates.book_into(&mut batch, &format!("{label}/down"), |t| {
            let nominal = t.base_weight(sample.category, self.nominal_weight).to_string();
            match (&spec.down, spec.one_sided) {
                (Some(down), false) => {
                    EventWeight::Scaled { nominal, ratio_column: down.clone() }
                }
                _ => EventWeight::Expr(nominal),
            }
        });
        let mut result = self.engine.evaluate(&sample.table, &batch).map_err(|e| e.context(ctx()))?;
        self.collect(&mut result, &up_ids, &down_ids).map_err(|e| e.context(ctx()))
    }

    fn collect(
        &self,
        result: &mut BatchResult,
        up_ids: &[BookingId],
        down_ids: &[BookingId],
    ) -> Result<UnisimVariations> {
        Ok(UnisimVariations {
            up: self.templates.collect(result, up_ids)?,
            down: self.templates.collect(result, down_ids)?,
        })
    }
}
