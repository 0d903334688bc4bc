//! Eigenmode selection and materialization.
//!
//! The shape covariance is diagonalized with nalgebra's symmetric solver.
//! Modes are ranked by eigenvalue (descending, ties by solver index),
//! non-positive eigenvalues carry no variance, and modes are retained until
//! the explained fraction reaches `keep_fraction` or `max_modes` is hit.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use xs_core::{BinnedVector, Block};

use crate::config::MultisimSpec;

/// Full eigendecomposition, sorted by descending eigenvalue.
#[derive(Debug, Clone)]
pub struct Spectrum {
    eigenvalues: Vec<f64>,
    eigenvectors: Vec<Vec<f64>>,
}

impl Spectrum {
    /// Diagonalize the symmetric matrix `cov`.
    ///
    /// Each eigenvector's largest-magnitude component is made positive so the
    /// output does not depend on the solver's sign choice.
    pub fn of(cov: &DMatrix<f64>) -> Self {
        let n = cov.nrows();
        let eigen = SymmetricEigen::new(cov.clone());
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]).then(a.cmp(&b))
        });
        let eigenvalues = order.iter().map(|&k| eigen.eigenvalues[k]).collect();
        let eigenvectors = order
            .iter()
            .map(|&k| {
                let mut v: Vec<f64> = eigen.eigenvectors.column(k).iter().copied().collect();
                let lead = v.iter().copied().fold(0.0f64, |m, x| if x.abs() > m.abs() { x } else { m });
                if lead < 0.0 {
                    v.iter_mut().for_each(|x| *x = -*x);
                }
                v
            })
            .collect();
        Self { eigenvalues, eigenvectors }
    }

    /// Eigenvalues, descending.
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Unit eigenvector of the `k`-th largest eigenvalue.
    pub fn eigenvector(&self, k: usize) -> &[f64] {
        &self.eigenvectors[k]
    }

    /// Number of modes (the matrix dimension).
    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Whether the matrix was empty.
    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    /// `Σ max(λ, 0)`.
    pub fn total_variance(&self) -> f64 {
        total_variance(&self.eigenvalues)
    }

    /// `Σ λ_k v_k v_kᵀ` over every mode.
    pub fn reconstruct(&self) -> DMatrix<f64> {
        let n = self.len();
        let mut m = DMatrix::zeros(n, n);
        for (&lambda, v) in self.eigenvalues.iter().zip(&self.eigenvectors) {
            let v = DVector::from_column_slice(v);
            m += (&v * v.transpose()) * lambda;
        }
        m
    }
}

fn total_variance(eigenvalues: &[f64]) -> f64 {
    eigenvalues.iter().map(|&l| l.max(0.0)).sum()
}

/// Positions (into `sorted`) of the retained modes.
///
/// `sorted` must be descending. Non-positive (and NaN) eigenvalues are
/// skipped; the walk stops, inclusive, at the first mode where the count
/// reaches `max_modes` or the cumulative fraction reaches `keep_fraction`.
pub fn retained_modes(sorted: &[f64], max_modes: Option<usize>, keep_fraction: f64) -> Vec<usize> {
    let total = total_variance(sorted);
    let mut kept = Vec::new();
    if total <= 0.0 || !total.is_finite() {
        return kept;
    }
    let mut cumulative = 0.0;
    for (k, &lambda) in sorted.iter().enumerate() {
        if lambda.is_nan() || lambda <= 0.0 {
            continue;
        }
        kept.push(k);
        cumulative += lambda;
        if max_modes.is_some_and(|m| kept.len() >= m) || cumulative / total >= keep_fraction {
            break;
        }
    }
    kept
}

/// One retained principal direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Eigenmode {
    /// Position among the retained modes (0 = largest).
    pub index: usize,
    /// Eigenvalue.
    pub eigenvalue: f64,
    /// Unit eigenvector over the stacked vector.
    pub vector: Vec<f64>,
}

impl Eigenmode {
    /// `sqrt(max(λ, 0))`.
    pub fn stdev(&self) -> f64 {
        self.eigenvalue.max(0.0).sqrt()
    }
}

/// Up and down templates of one mode, one per block.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeVariation {
    /// `nominal + stdev·v` per block.
    pub up: Vec<BinnedVector>,
    /// `nominal − stdev·v` per block.
    pub down: Vec<BinnedVector>,
    /// Bins set to zero by clamping.
    pub clamped: usize,
}

/// Chooses eigenmodes and turns them into perturbed templates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EigenmodeSelector {
    max_modes: Option<usize>,
    keep_fraction: f64,
    clamp_negative_bins: bool,
}

impl EigenmodeSelector {
    /// Selector keeping at most `max_modes` modes and at least `keep_fraction`
    /// of the variance.
    pub fn new(max_modes: Option<usize>, keep_fraction: f64) -> Self {
        Self { max_modes, keep_fraction, clamp_negative_bins: false }
    }

    /// Selector with the truncation settings of `spec`.
    pub fn for_spec(spec: &MultisimSpec) -> Self {
        Self::new(spec.max_modes, spec.keep_fraction)
    }

    /// Clamp negative bins of both variations to zero.
    pub fn clamp_negative_bins(mut self, on: bool) -> Self {
        self.clamp_negative_bins = on;
        self
    }

    /// Retained modes of `cov`, largest first.
    pub fn select(&self, cov: &DMatrix<f64>) -> Vec<Eigenmode> {
        self.select_from(&Spectrum::of(cov))
    }

    /// Retained modes of an existing spectrum.
    pub fn select_from(&self, spectrum: &Spectrum) -> Vec<Eigenmode> {
        retained_modes(spectrum.eigenvalues(), self.max_modes, self.keep_fraction)
            .into_iter()
            .enumerate()
            .map(|(index, k)| Eigenmode {
                index,
                eigenvalue: spectrum.eigenvalues()[k],
                vector: spectrum.eigenvector(k).to_vec(),
            })
            .collect()
    }

    /// Perturb every block's nominal by `±stdev·v`.
    ///
    /// `nominal[b]` is the histogram of `blocks[b]`; its bin uncertainties
    /// are copied onto both variations unchanged.
    pub fn materialize(
        &self,
        mode: &Eigenmode,
        blocks: &[Block],
        nominal: &[BinnedVector],
    ) -> ModeVariation {
        let stdev = mode.stdev();
        let mut clamped = 0;
        let mut clamp = |x: f64| {
            if self.clamp_negative_bins && x < 0.0 {
                clamped += 1;
                0.0
            } else {
                x
            }
        };
        let mut up = Vec::with_capacity(blocks.len());
        let mut down = Vec::with_capacity(blocks.len());
        for (block, nom) in blocks.iter().zip(nominal) {
            let delta = &mode.vector[block.range()];
            let (u, d): (Vec<f64>, Vec<f64>) = nom
                .content
                .iter()
                .zip(delta)
                .map(|(&x, &v)| (x + stdev * v, x - stdev * v))
                .unzip();
            up.push(nom.with_content(u.into_iter().map(&mut clamp).collect()));
            down.push(nom.with_content(d.into_iter().map(&mut clamp).collect()));
        }
        ModeVariation { up, down, clamped }
    }
}
