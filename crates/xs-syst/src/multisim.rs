//! Multisim covariance over the stacked (sample, template) vector.
//!
//! Every eligible sample contributes one block per template; the blocks are
//! concatenated into a vector of length `L`. Each universe is replayed as a
//! full stacked vector `Tu` and its residual against the nominal `T0` is
//! accumulated into an `L × L` covariance. The accumulator is dense, so
//! memory grows as `8·L²` bytes and every universe costs `O(L²)`.

use nalgebra::DMatrix;
use xs_core::{
    BinnedVector, Block, Error, EventWeight, HistogramBatch, HistogramEngine, Result, Sample,
    TemplateStore, keys,
};

use crate::catalog::TemplateCatalog;
use crate::config::MultisimSpec;

/// Covariance allocations above this size are logged.
const LARGE_COVARIANCE_BYTES: usize = 1 << 30;

/// Placement of every (sample, template) block in the stacked vector.
///
/// Blocks are ordered sample-major, templates in catalogue order.
#[derive(Debug, Clone, PartialEq)]
pub struct StackLayout {
    blocks: Vec<Block>,
    len: usize,
}

impl StackLayout {
    /// Lay out `templates` for each of `samples`.
    pub fn new<'s>(samples: impl IntoIterator<Item = &'s str>, templates: &TemplateCatalog) -> Self {
        let mut blocks = Vec::new();
        let mut offset = 0;
        for sample in samples {
            for t in templates {
                let n_bins = t.binning.n_bins;
                blocks.push(Block {
                    sample: sample.to_string(),
                    template: t.name.clone(),
                    n_bins,
                    offset,
                });
                offset += n_bins;
            }
        }
        Self { blocks, len: offset }
    }

    /// Blocks in stacking order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Stacked length `L`.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is stacked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Running covariance of universe residuals.
///
/// Only the lower triangle is accumulated; [`CovarianceAccumulator::finish`]
/// divides by the universe count and mirrors it.
#[derive(Debug, Clone)]
pub struct CovarianceAccumulator {
    t0: Vec<f64>,
    t0_norm2: f64,
    split_rate_shape: bool,
    lower: DMatrix<f64>,
    residual: Vec<f64>,
    thetas: Vec<f64>,
    n_universes: usize,
    n_degenerate: usize,
}

impl CovarianceAccumulator {
    /// Start accumulating around the nominal stack `t0`.
    pub fn new(t0: Vec<f64>, split_rate_shape: bool) -> Result<Self> {
        let t0_norm2 = dot(&t0, &t0);
        if !(t0_norm2 > 0.0 && t0_norm2.is_finite()) {
            return Err(Error::DegenerateInput(format!(
                "nominal stack has dot(T0, T0) = {t0_norm2}, nothing to decompose"
            )));
        }
        let l = t0.len();
        let bytes = l.saturating_mul(l).saturating_mul(std::mem::size_of::<f64>());
        if bytes > LARGE_COVARIANCE_BYTES {
            log::warn!("allocating {l}x{l} covariance ({:.1} GiB)", bytes as f64 / (1u64 << 30) as f64);
        }
        Ok(Self {
            t0,
            t0_norm2,
            split_rate_shape,
            lower: DMatrix::zeros(l, l),
            residual: vec![0.0; l],
            thetas: Vec::new(),
            n_universes: 0,
            n_degenerate: 0,
        })
    }

    /// Stacked length.
    pub fn len(&self) -> usize {
        self.t0.len()
    }

    /// Whether the stack is empty (never true for a constructed accumulator).
    pub fn is_empty(&self) -> bool {
        self.t0.is_empty()
    }

    /// Universes added so far.
    pub fn n_universes(&self) -> usize {
        self.n_universes
    }

    /// Universes whose rate scale was non-positive.
    pub fn n_degenerate(&self) -> usize {
        self.n_degenerate
    }

    /// Add one universe's stacked vector.
    ///
    /// With the rate/shape split, `theta = ln(s)` is recorded for
    /// `s = 1 + dot(T0, Tu − T0) / dot(T0, T0)` (or 0 when `s ≤ 0`) and the
    /// residual is `Tu − s·T0`; otherwise the residual is `T0 − Tu`.
    pub fn add_universe(&mut self, tu: &[f64]) -> Result<()> {
        let l = self.t0.len();
        if tu.len() != l {
            return Err(Error::DataAvailability(format!(
                "universe {} has {} bins, nominal stack has {l}",
                self.n_universes,
                tu.len()
            )));
        }
        if let Some(i) = tu.iter().position(|v| !v.is_finite()) {
            return Err(Error::DegenerateInput(format!(
                "universe {} has non-finite content in stacked bin {i}",
                self.n_universes
            )));
        }

        if self.split_rate_shape {
            let t0_dot_tu = dot(&self.t0, tu);
            let alpha = (t0_dot_tu - self.t0_norm2) / self.t0_norm2;
            let s = 1.0 + alpha;
            let theta = if s > 0.0 {
                s.ln()
            } else {
                self.n_degenerate += 1;
                log::warn!("universe {}: rate scale {s} <= 0, theta set to 0", self.n_universes);
                0.0
            };
            self.thetas.push(theta);
            for ((r, &x), &x0) in self.residual.iter_mut().zip(tu).zip(&self.t0) {
                *r = x - s * x0;
            }
        } else {
            for ((r, &x), &x0) in self.residual.iter_mut().zip(tu).zip(&self.t0) {
                *r = x0 - x;
            }
        }

        let data = self.lower.as_mut_slice();
        let r = &self.residual;
        for (j, &rj) in r.iter().enumerate() {
            if rj == 0.0 {
                continue;
            }
            // Column-major: column j starts at j * l.
            let col = &mut data[j * l + j..(j + 1) * l];
            for (c, &ri) in col.iter_mut().zip(&r[j..]) {
                *c += ri * rj;
            }
        }
        self.n_universes += 1;
        Ok(())
    }

    /// Covariance divided by the universe count, mirrored to full symmetry,
    /// plus the per-universe rate logarithms (empty without the split).
    pub fn finish(self) -> Result<(DMatrix<f64>, Vec<f64>)> {
        if self.n_universes == 0 {
            return Err(Error::DegenerateInput("no universes accumulated".into()));
        }
        let mut cov = self.lower;
        cov /= self.n_universes as f64;
        cov.fill_upper_triangle_with_lower_triangle();
        Ok((cov, self.thetas))
    }
}

/// Root mean square of the rate logarithms.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Result of one multisim covariance build.
#[derive(Debug, Clone)]
pub struct MultisimCovariance {
    /// Block placement.
    pub layout: StackLayout,
    /// Stacked nominal `T0`.
    pub nominal: Vec<f64>,
    /// Nominal histogram of every block, in block order.
    pub nominal_hists: Vec<BinnedVector>,
    /// Symmetric `L × L` shape covariance.
    pub covariance: DMatrix<f64>,
    /// Number of universes `U`.
    pub n_universes: usize,
    /// Per-universe rate logarithms (empty without the rate/shape split).
    pub thetas: Vec<f64>,
    /// RMS of `thetas`, present with the rate/shape split.
    pub sigma_theta: Option<f64>,
}

impl MultisimCovariance {
    /// Nominal blocks scaled by `exp(+sigma)` and `exp(-sigma)`.
    ///
    /// Bin uncertainties are carried over from the nominal unchanged.
    pub fn rate_variations(&self, sigma: f64) -> (Vec<BinnedVector>, Vec<BinnedVector>) {
        let scale = |f: f64| -> Vec<BinnedVector> {
            self.nominal_hists
                .iter()
                .map(|h| h.with_content(h.content.iter().map(|x| x * f).collect()))
                .collect()
        };
        (scale(sigma.exp()), scale((-sigma).exp()))
    }
}

/// Replays every universe over the eligible samples and accumulates the
/// shape covariance.
pub struct MultisimCovarianceBuilder<'a, E> {
    engine: &'a E,
    templates: &'a TemplateCatalog,
    nominal_weight: &'a str,
    universe_batch: Option<usize>,
}

impl<'a, E: HistogramEngine> MultisimCovarianceBuilder<'a, E> {
    /// Create a builder submitting all universes of a sample in one batch.
    pub fn new(engine: &'a E, templates: &'a TemplateCatalog, nominal_weight: &'a str) -> Self {
        Self { engine, templates, nominal_weight, universe_batch: None }
    }

    /// Limit the number of universes per booking batch.
    pub fn universe_batch(mut self, n: Option<usize>) -> Self {
        self.universe_batch = n.filter(|&n| n > 0);
        self
    }

    /// Universe count: the configured one, or the weight-vector length on
    /// the first event of the first sample.
    pub fn universe_count(&self, first: &Sample<E::Table>, spec: &MultisimSpec) -> Result<usize> {
        if let Some(n) = spec.fixed_universes() {
            return Ok(n);
        }
        match self.engine.vector_len(&first.table, &spec.weights) {
            Ok(Some(n)) if n > 0 => Ok(n),
            Ok(Some(_)) => Err(Error::DegenerateInput(format!(
                "'{}' is empty on the first event of sample '{}'",
                spec.weights, first.name
            ))),
            Ok(None) => Err(Error::DegenerateInput(format!(
                "cannot determine universe count: sample '{}' has no events",
                first.name
            ))),
            Err(e) => Err(e.context(format!("sample '{}'", first.name))),
        }
    }

    /// Read `T0` for every block from the nominal templates in `store`.
    pub fn read_nominal<S: TemplateStore + ?Sized>(
        &self,
        layout: &StackLayout,
        store: &S,
    ) -> Result<(Vec<f64>, Vec<BinnedVector>)> {
        let mut t0 = Vec::with_capacity(layout.len());
        let mut hists = Vec::with_capacity(layout.blocks().len());
        for block in layout.blocks() {
            let key = keys::nominal(&block.sample, &block.template);
            let hist = store.read_hist(&key)?.ok_or_else(|| {
                Error::DataAvailability(format!("missing nominal histogram '{key}'"))
            })?;
            if hist.n_bins() != block.n_bins {
                return Err(Error::DataAvailability(format!(
                    "nominal '{key}' has {} bins, template has {}",
                    hist.n_bins(),
                    block.n_bins
                )));
            }
            t0.extend_from_slice(&hist.content);
            hists.push(hist);
        }
        Ok((t0, hists))
    }

    /// Build `{T0, covariance, thetas}` for `spec` jointly over `samples`.
    pub fn build<S: TemplateStore + ?Sized>(
        &self,
        samples: &[&Sample<E::Table>],
        spec: &MultisimSpec,
        store: &S,
    ) -> Result<MultisimCovariance> {
        spec.validate()?;
        let Some(first) = samples.first() else {
            return Err(Error::DegenerateInput("no eligible samples".into()));
        };
        let n_universes = self.universe_count(first, spec)?;
        let layout = StackLayout::new(samples.iter().map(|s| s.name.as_str()), self.templates);
        if layout.is_empty() {
            return Err(Error::DegenerateInput("no template bins to stack".into()));
        }
        let (t0, nominal_hists) = self.read_nominal(&layout, store)?;
        let mut acc = CovarianceAccumulator::new(t0.clone(), spec.split_rate_shape)?;
        log::debug!(
            "multisim '{}': {} samples, L = {}, U = {n_universes}",
            spec.name,
            samples.len(),
            layout.len()
        );

        let chunk = self.universe_batch.unwrap_or(n_universes).min(n_universes);
        let n_templates = self.templates.len();
        let mut start = 0;
        while start < n_universes {
            let end = (start + chunk).min(n_universes);
            let mut stacks = vec![vec![0.0; layout.len()]; end - start];
            for (si, sample) in samples.iter().enumerate() {
                let blocks = &layout.blocks()[si * n_templates..(si + 1) * n_templates];
                self.fill_sample(sample, spec, start..end, blocks, &mut stacks)
                    .map_err(|e| e.context(format!("sample '{}'", sample.name)))?;
            }
            for tu in &stacks {
                acc.add_universe(tu)?;
            }
            log::debug!("multisim '{}': universes {start}..{end} accumulated", spec.name);
            start = end;
        }

        if acc.n_degenerate() > 0 {
            log::warn!(
                "multisim '{}': {} of {n_universes} universes had a non-positive rate scale",
                spec.name,
                acc.n_degenerate()
            );
        }
        let (covariance, thetas) = acc.finish()?;
        let sigma_theta = spec.split_rate_shape.then(|| rms(&thetas));
        Ok(MultisimCovariance {
            layout,
            nominal: t0,
            nominal_hists,
            covariance,
            n_universes,
            thetas,
            sigma_theta,
        })
    }

    /// One batch: every template of `sample` for every universe in `universes`.
    fn fill_sample(
        &self,
        sample: &Sample<E::Table>,
        spec: &MultisimSpec,
        universes: std::ops::Range<usize>,
        blocks: &[Block],
        stacks: &mut [Vec<f64>],
    ) -> Result<()> {
        let mut batch = HistogramBatch::new();
        let ids: Vec<_> = universes
            .map(|u| {
                let label = format!("{}/{}/u{u}", sample.name, spec.name);
                self.templates.book_into(&mut batch, &label, |t| EventWeight::Universe {
                    nominal: t.base_weight(sample.category, self.nominal_weight).to_string(),
                    vector_column: spec.weights.clone(),
                    universe: u,
                    central_value: spec.central_value.clone(),
                })
            })
            .collect();
        let mut result = self.engine.evaluate(&sample.table, &batch)?;
        for (stack, ids) in stacks.iter_mut().zip(&ids) {
            let hists = self.templates.collect(&mut result, ids)?;
            for (block, (_, hist)) in blocks.iter().zip(hists) {
                stack[block.range()].copy_from_slice(&hist.content);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn layout_offsets() {
        let cat = TemplateCatalog::parse("a\tA\t\tx\t\t2\t0\t1\nb\tB\t\tx\t\t3\t0\t1\n").unwrap();
        let layout = StackLayout::new(["nu", "dirt"], &cat);
        assert_eq!(layout.len(), 10);
        let offsets: Vec<usize> = layout.blocks().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, [0, 2, 5, 7]);
        assert_eq!(layout.blocks()[3].sample, "dirt");
        assert_eq!(layout.blocks()[3].template, "b");
        assert_eq!(layout.blocks().iter().map(|b| b.n_bins).sum::<usize>(), layout.len());
    }

    #[test]
    fn two_universe_scenario() {
        let mut acc = CovarianceAccumulator::new(vec![10.0, 20.0, 5.0, 15.0], false).unwrap();
        acc.add_universe(&[12.0, 18.0, 5.0, 15.0]).unwrap();
        acc.add_universe(&[8.0, 22.0, 5.0, 15.0]).unwrap();
        let (v, thetas) = acc.finish().unwrap();
        assert!(thetas.is_empty());
        let expected = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, -4.0, 0.0, 0.0, //
                -4.0, 4.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0,
            ],
        );
        assert_eq!(v, expected);
    }

    #[test]
    fn identical_universes_have_no_rate_or_shape() {
        let t0 = vec![3.0, 1.0, 4.0];
        let mut acc = CovarianceAccumulator::new(t0.clone(), true).unwrap();
        for _ in 0..5 {
            acc.add_universe(&t0).unwrap();
        }
        let (v, thetas) = acc.finish().unwrap();
        assert_eq!(thetas, vec![0.0; 5]);
        assert_eq!(rms(&thetas), 0.0);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn pure_rate_universe_has_no_shape() {
        let t0 = vec![10.0, 20.0, 5.0];
        let mut acc = CovarianceAccumulator::new(t0.clone(), true).unwrap();
        let up: Vec<f64> = t0.iter().map(|x| x * 1.2).collect();
        let down: Vec<f64> = t0.iter().map(|x| x * 0.8).collect();
        acc.add_universe(&up).unwrap();
        acc.add_universe(&down).unwrap();
        let (v, thetas) = acc.finish().unwrap();
        assert_relative_eq!(thetas[0], 1.2f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(thetas[1], 0.8f64.ln(), epsilon = 1e-12);
        assert!(v.iter().all(|x| x.abs() < 1e-20));
        let expected = ((1.2f64.ln().powi(2) + 0.8f64.ln().powi(2)) / 2.0).sqrt();
        assert_relative_eq!(rms(&thetas), expected, epsilon = 1e-12);
    }

    #[test]
    fn non_positive_scale_gives_zero_theta() {
        let mut acc = CovarianceAccumulator::new(vec![1.0, 1.0], true).unwrap();
        acc.add_universe(&[-1.0, -2.0]).unwrap();
        assert_eq!(acc.n_degenerate(), 1);
        let (v, thetas) = acc.finish().unwrap();
        assert_eq!(thetas, vec![0.0]);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn degenerate_nominal() {
        let err = CovarianceAccumulator::new(vec![0.0, 0.0], false).unwrap_err();
        assert_eq!(err.kind(), xs_core::ErrorKind::DegenerateInput);
        assert!(CovarianceAccumulator::new(Vec::new(), true).is_err());
    }

    #[test]
    fn finish_without_universes_fails() {
        let acc = CovarianceAccumulator::new(vec![1.0], false).unwrap();
        assert!(acc.finish().is_err());
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut acc = CovarianceAccumulator::new(vec![1.0, 2.0], false).unwrap();
        assert!(acc.add_universe(&[1.0]).is_err());
        assert!(acc.add_universe(&[1.0, f64::NAN]).is_err());
        assert_eq!(acc.n_universes(), 0);
    }
}
