//! Point clouds: one sample as an `N × D` matrix of `f32` coordinates.
//!
//! A cloud also carries a `requires_grad` flag. Divergences only attach a
//! [`SourceGradient`](crate::SourceGradient) handle to their output when the *source*
//! cloud is tracked; [`OtdPairwise::new`](crate::OtdPairwise::new) sets the flag on
//! every source it takes ownership of.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{Error, Result};

/// An ordered collection of fixed-dimension points.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    points: Array2<f32>,
    requires_grad: bool,
}

impl PointCloud {
    /// Wrap an `N × D` matrix. Gradient tracking starts disabled.
    pub fn new(points: Array2<f32>) -> Self {
        Self {
            points,
            requires_grad: false,
        }
    }

    /// Build a cloud from rows of equal length.
    ///
    /// Returns [`Error::DimensionMismatch`] if rows differ in length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let d = rows.first().map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(rows.len() * d);
        for row in rows {
            if row.len() != d {
                return Err(Error::DimensionMismatch(d, row.len()));
            }
            flat.extend_from_slice(row);
        }
        let points = Array2::from_shape_vec((rows.len(), d), flat)
            .map_err(|_| Error::Domain("rows do not form a matrix"))?;
        Ok(Self::new(points))
    }

    /// `n` points spread evenly over the unit sphere (Fibonacci lattice).
    pub fn sphere(n: usize) -> Self {
        let golden = std::f32::consts::PI * (1.0 + 5.0f32.sqrt());
        let mut points = Array2::zeros((n, 3));
        for i in 0..n {
            let k = i as f32 + 0.5;
            let phi = (1.0 - 2.0 * k / n as f32).acos();
            let theta = golden * k;
            points[[i, 0]] = theta.cos() * phi.sin();
            points[[i, 1]] = theta.sin() * phi.sin();
            points[[i, 2]] = phi.cos();
        }
        Self::new(points)
    }

    /// `n` samples of an isotropic Gaussian in `d` dimensions, reproducible from `seed`.
    pub fn gaussian(n: usize, d: usize, mean: f32, std: f32, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let points = Array2::from_shape_fn((n, d), |_| {
            let z: f32 = StandardNormal.sample(&mut rng);
            mean + std * z
        });
        Self::new(points)
    }

    /// A copy of this cloud moved by `shift` (one entry per dimension).
    ///
    /// Panics if `shift.len()` differs from the point dimension.
    pub fn translated(&self, shift: &[f32]) -> Self {
        assert_eq!(shift.len(), self.dim(), "shift dimension mismatch");
        let shift = Array1::from_vec(shift.to_vec());
        Self {
            points: &self.points + &shift,
            requires_grad: self.requires_grad,
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// `true` if the cloud holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Point dimension `D`.
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    /// Borrow the coordinates.
    pub fn points(&self) -> ArrayView2<'_, f32> {
        self.points.view()
    }

    /// Consume the cloud, returning its coordinates.
    pub fn into_points(self) -> Array2<f32> {
        self.points
    }

    /// Whether divergences should keep a gradient handle for this cloud.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Enable or disable gradient tracking.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Builder form of [`set_requires_grad`](Self::set_requires_grad).
    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Coordinate-wise mean, or `None` for an empty cloud.
    pub fn centroid(&self) -> Option<Array1<f32>> {
        self.points.mean_axis(Axis(0))
    }
}

impl From<Array2<f32>> for PointCloud {
    fn from(points: Array2<f32>) -> Self {
        Self::new(points)
    }
}
