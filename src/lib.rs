//! # otcyto
//!
//! Pairwise optimal transport distances (OTD) between collections of point clouds,
//! displacement ("Brenier") maps derived from their gradients, and figures that show
//! where each source point is transported.
//!
//! ## The Problem
//!
//! Given a set of source samples (e.g. cell populations from a cytometry panel) and a set
//! of target samples, measure how much "work" it takes to morph every source into every
//! target, and for each pair describe *where* every source point wants to go.
//!
//! ## Key Types
//!
//! | Item | Role |
//! |------|------|
//! | [`PointCloud`] | One sample: an `N × D` matrix of points |
//! | [`Divergence`] | The injected distance: two clouds in, a [`Loss`] out |
//! | [`SamplesLoss`] | Debiased Sinkhorn divergence with three backends |
//! | [`OtdPairwise`] | Runs a divergence over sources × targets, caches displacement maps |
//! | [`LabeledMatrix`] | Distance/timing matrices with sample names, CSV output |
//! | [`plot::figure_clouds`] | Source/target scatter with optional displacement arrows |
//!
//! ## Quick Start
//!
//! ```rust
//! use otcyto::{OtdPairwise, PairwiseConfig, PointCloud, SamplesLoss};
//!
//! let source = PointCloud::sphere(50);
//! let target = PointCloud::sphere(50).translated(&[1.0, 0.0, 0.0]);
//!
//! let mut otd = OtdPairwise::new(
//!     vec![source],
//!     vec![target],
//!     SamplesLoss::default(),
//!     PairwiseConfig::default(),
//! )
//! .unwrap();
//! otd.compute().unwrap();
//!
//! let table = otd.otd_table();
//! assert!(table.get(0, 0) > 0.0);
//!
//! let map = otd.displacement_map(0, 0).unwrap();
//! assert_eq!(map.dim(), (50, 3));
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Displacement before compute**: [`OtdPairwise::displacement_map`] returns
//!    [`Error::Precompute`] until [`OtdPairwise::compute`] has run.
//! 2. **Skipped pairs read as zero**: a skipped cell is indistinguishable from a genuine
//!    zero distance in the matrix; only its displacement map reports
//!    [`Error::NotDifferentiable`].
//! 3. **Tiny blur**: `ε = blurᵖ` below ~1e-6 makes the `f32` potentials coarse. Values stay
//!    finite but lose digits.
//! 4. **Source clouds are tracked**: clouds handed to the engine as sources come back with
//!    `requires_grad() == true`.
//!
//! ## References
//!
//! - Cuturi (2013). "Sinkhorn Distances: Lightspeed Computation of Optimal Transport"
//! - Feydy et al. (2019). "Interpolating between Optimal Transport and MMD using Sinkhorn
//!   Divergences"
//! - Feydy (2020). "Geometric data analysis, beyond convolutions" (ε-scaling, multiscale)

use std::path::PathBuf;

use thiserror::Error;

pub mod cloud;
pub mod flow;
pub mod loss;
pub mod multiscale;
pub mod pairwise;
pub mod plot;
pub mod selfcheck;
pub mod sinkhorn;
pub mod table;

pub use cloud::PointCloud;
pub use flow::advect;
pub use loss::{Divergence, FnDivergence, Loss, SourceGradient};
pub use pairwise::{
    DisplacementCache, OtdPairwise, OutputFormat, PairwiseConfig, PairwiseOutput, SkipPolicy,
};
pub use selfcheck::{check_backends, BackendReport};
pub use sinkhorn::{Backend, SamplesLoss, SinkhornGraph};
pub use table::LabeledMatrix;

/// Error variants for pairwise transport computations.
#[derive(Debug, Error)]
pub enum Error {
    /// A name list does not match its cloud list.
    #[error("the number of {what} ({clouds}) and {what} names ({names}) must be equal")]
    Validation {
        /// Which collection failed (`"sources"` or `"targets"`).
        what: &'static str,
        /// Number of clouds.
        clouds: usize,
        /// Number of names.
        names: usize,
    },

    /// Displacement maps were requested before the distances were computed.
    #[error("OTD must be computed before displacement maps can be derived (call compute() first)")]
    Precompute,

    /// The pair has no gradient handle (it was skipped, or the loss returned none).
    #[error(
        "pair ({source_index}, {target_index}) has no gradient; \
         it was skipped or its loss is not differentiable"
    )]
    NotDifferentiable {
        /// Source index.
        source_index: usize,
        /// Target index.
        target_index: usize,
    },

    /// Pair index outside the sources × targets grid.
    #[error(
        "pair ({source_index}, {target_index}) out of range for \
         {n_sources} sources x {n_targets} targets"
    )]
    IndexOutOfRange {
        /// Requested source index.
        source_index: usize,
        /// Requested target index.
        target_index: usize,
        /// Number of sources.
        n_sources: usize,
        /// Number of targets.
        n_targets: usize,
    },

    /// A projection axis does not exist in the point dimension.
    #[error("projection axis {axis} out of range for {dim}-dimensional points")]
    AxisOutOfRange {
        /// Requested column.
        axis: usize,
        /// Point dimension.
        dim: usize,
    },

    /// Two clouds have different point dimensions.
    #[error("point dimensions differ: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    /// Array shape mismatch.
    #[error("shape mismatch: expected ({0}, {1}), got ({2}, {3})")]
    ShapeMismatch(usize, usize, usize, usize),

    /// A point cloud has no points.
    #[error("point cloud is empty")]
    EmptyCloud,

    /// Invalid regularization (blur) parameter.
    #[error("blur must be positive and finite, got {0}")]
    InvalidRegularization(f32),

    /// Invalid ε-scaling ratio.
    #[error("scaling must lie in (0, 1), got {0}")]
    InvalidScaling(f32),

    /// Ground cost exponent is not supported.
    #[error("unsupported cost exponent p = {0} (expected 1 or 2)")]
    UnsupportedExponent(u8),

    /// A NaN or infinity escaped a computation.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),

    /// Reading or writing a file failed.
    #[error("cannot write {}", .path.display())]
    Io {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// CSV serialization failed.
    #[error("CSV error in {}", .path.display())]
    Csv {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Drawing a figure failed.
    #[error("rendering failed: {0}")]
    Render(String),

    /// The installation self-check found a broken backend.
    #[error("self-check failed: {0}")]
    SelfCheck(String),

    /// Failure raised by a user-supplied divergence.
    #[error("divergence failed: {0}")]
    Divergence(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// This is the classic "log-sum-exp trick":
/// \[
/// \log \sum_i \exp(x_i) = m + \log \sum_i \exp(x_i - m), \quad m = \max_i x_i
/// \]
///
/// Returns `-∞` if `len == 0`.
#[inline]
pub(crate) fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f32) -> f32 {
    if len == 0 {
        return f32::NEG_INFINITY;
    }

    let mut max_val = f32::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        // If everything is -inf (or NaN), propagate the max.
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn logsumexp_empty_is_neg_infinity() {
        assert_eq!(logsumexp_by(0, |_| 0.0), f32::NEG_INFINITY);
    }

    #[test]
    fn logsumexp_of_equal_terms() {
        let lse = logsumexp_by(4, |_| 1.0);
        assert!((lse - (1.0 + 4.0f32.ln())).abs() < 1e-6);
    }

    #[test]
    fn validation_message_names_the_collection() {
        let err = Error::Validation {
            what: "sources",
            clouds: 2,
            names: 3,
        };
        assert_eq!(
            err.to_string(),
            "the number of sources (2) and sources names (3) must be equal"
        );
    }

    proptest! {
        #[test]
        fn logsumexp_translation_invariant(
            xs in prop::collection::vec(-50.0f32..50.0, 1..64),
            shift in -10.0f32..10.0
        ) {
            let l1 = logsumexp_by(xs.len(), |i| xs[i]);
            let l2 = logsumexp_by(xs.len(), |i| xs[i] + shift);
            prop_assert!((l2 - (l1 + shift)).abs() < 1e-4);
        }

        #[test]
        fn logsumexp_matches_naive_on_safe_range(
            xs in prop::collection::vec(-20.0f32..20.0, 1..64),
        ) {
            // Naive log(sum(exp(x))) over/underflows for large |x|; hence the restricted range.
            let naive = xs.iter().map(|&x| x.exp()).sum::<f32>().ln();
            let stable = logsumexp_by(xs.len(), |i| xs[i]);
            prop_assert!((stable - naive).abs() < 1e-4);
        }

        #[test]
        fn logsumexp_bounds_by_max(
            xs in prop::collection::vec(-50.0f32..50.0, 1..64),
        ) {
            let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let lse = logsumexp_by(xs.len(), |i| xs[i]);
            // max <= logsumexp <= max + ln(n)
            prop_assert!(lse >= max - 1e-5);
            prop_assert!(lse <= max + (xs.len() as f32).ln() + 1e-5);
        }
    }
}
