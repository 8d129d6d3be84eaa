//! The distance contract the pairwise engine is written against.
//!
//! A [`Divergence`] maps two clouds to a [`Loss`]: a scalar value plus, when the source
//! cloud is tracked, a [`SourceGradient`] handle. The handle plays the role of a retained
//! computation graph: it can be asked for `∂loss/∂source` any number of times.

use ndarray::Array2;

use crate::{PointCloud, Result};

/// Gradient of a computed loss with respect to the source cloud coordinates.
pub trait SourceGradient {
    /// `∂loss/∂x`, shaped like the source cloud.
    fn source_gradient(&self) -> Result<Array2<f32>>;
}

impl<F> SourceGradient for F
where
    F: Fn() -> Result<Array2<f32>>,
{
    fn source_gradient(&self) -> Result<Array2<f32>> {
        self()
    }
}

/// A scalar divergence value and its optional gradient handle.
pub struct Loss {
    value: f32,
    graph: Option<Box<dyn SourceGradient>>,
}

impl Loss {
    /// A value with no gradient attached.
    pub fn new(value: f32) -> Self {
        Self { value, graph: None }
    }

    /// A value that can be differentiated with respect to the source cloud.
    pub fn with_graph(value: f32, graph: impl SourceGradient + 'static) -> Self {
        Self {
            value,
            graph: Some(Box::new(graph)),
        }
    }

    /// The divergence value.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Whether a gradient handle is attached.
    pub fn is_differentiable(&self) -> bool {
        self.graph.is_some()
    }

    /// Split into the value and the handle.
    pub fn into_parts(self) -> (f32, Option<Box<dyn SourceGradient>>) {
        (self.value, self.graph)
    }
}

impl std::fmt::Debug for Loss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loss")
            .field("value", &self.value)
            .field("differentiable", &self.graph.is_some())
            .finish()
    }
}

/// A distance between two point clouds.
///
/// Implementations should only attach a gradient handle when `x.requires_grad()`.
pub trait Divergence {
    /// Evaluate the divergence from `x` (source) to `y` (target).
    fn divergence(&self, x: &PointCloud, y: &PointCloud) -> Result<Loss>;
}

impl<D: Divergence + ?Sized> Divergence for &D {
    fn divergence(&self, x: &PointCloud, y: &PointCloud) -> Result<Loss> {
        (**self).divergence(x, y)
    }
}

impl<D: Divergence + ?Sized> Divergence for Box<D> {
    fn divergence(&self, x: &PointCloud, y: &PointCloud) -> Result<Loss> {
        (**self).divergence(x, y)
    }
}

/// Adapter turning a closure into a [`Divergence`].
///
/// ```rust
/// use otcyto::{Divergence, FnDivergence, Loss, PointCloud};
///
/// let centroid_gap = FnDivergence::new(|x: &PointCloud, y: &PointCloud| {
///     let d = &x.centroid().unwrap() - &y.centroid().unwrap();
///     Ok(Loss::new(d.dot(&d)))
/// });
/// let a = PointCloud::sphere(8);
/// let b = a.translated(&[1.0, 0.0, 0.0]);
/// let loss = centroid_gap.divergence(&a, &b).unwrap();
/// assert!((loss.value() - 1.0).abs() < 1e-5);
/// ```
pub struct FnDivergence<F> {
    f: F,
}

impl<F> FnDivergence<F>
where
    F: Fn(&PointCloud, &PointCloud) -> Result<Loss>,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Divergence for FnDivergence<F>
where
    F: Fn(&PointCloud, &PointCloud) -> Result<Loss>,
{
    fn divergence(&self, x: &PointCloud, y: &PointCloud) -> Result<Loss> {
        (self.f)(x, y)
    }
}
