//! Writes held back until a whole unit of work has succeeded.

use xs_core::{BinnedVector, Error, MetaValue, Result, TemplateStore};

/// Histograms and metadata for one systematic (or one sample's nominals).
#[derive(Debug, Default)]
pub(crate) struct StagedWrites {
    hists: Vec<(String, BinnedVector)>,
    meta: Vec<(String, MetaValue)>,
}

impl StagedWrites {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a histogram. Anything the store would refuse (shape mismatch,
    /// non-finite content or sumw2) fails the whole unit here, before any
    /// write happens.
    pub(crate) fn hist(&mut self, key: String, hist: BinnedVector) -> Result<()> {
        let n = hist.binning.n_bins;
        if hist.content.len() != n || hist.sumw2.len() != n {
            return Err(Error::DegenerateInput(format!(
                "'{key}': {n} bins declared, {} contents, {} sumw2",
                hist.content.len(),
                hist.sumw2.len()
            )));
        }
        for (what, values) in [("content", &hist.content), ("sumw2", &hist.sumw2)] {
            if let Some(i) = values.iter().position(|v| !v.is_finite()) {
                return Err(Error::DegenerateInput(format!(
                    "'{key}': {what} of bin {i} is {}",
                    values[i]
                )));
            }
        }
        self.hists.push((key, hist));
        Ok(())
    }

    /// Queue a metadata value; non-finite numbers fail the whole unit.
    pub(crate) fn meta(&mut self, key: String, value: impl Into<MetaValue>) -> Result<()> {
        let value = value.into();
        if let MetaValue::Number(v) = value {
            if !v.is_finite() {
                return Err(Error::DegenerateInput(format!("'{key}': metadata value is {v}")));
            }
        }
        self.meta.push((key, value));
        Ok(())
    }

    pub(crate) fn n_hists(&self) -> usize {
        self.hists.len()
    }

    pub(crate) fn apply<S: TemplateStore>(self, store: &mut S) -> Result<()> {
        for (key, hist) in self.hists {
            store.write_hist(&key, hist)?;
        }
        for (key, value) in self.meta {
            store.write_meta(&key, value)?;
        }
        Ok(())
    }
}
