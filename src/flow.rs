//! Moving points along displacement maps.
//!
//! A displacement map is a discrete vector field: one velocity per source point.
//! [`advect`] applies it to the cloud it was derived from.

use ndarray::{Array2, ArrayView2};

use crate::{Error, Result};

/// `points + t · displacement`.
///
/// `t = 1` moves every source point to where its displacement map sends it; values in
/// `(0, 1)` interpolate along the straight-line displacement.
///
/// Returns [`Error::ShapeMismatch`] if the two arrays differ in shape.
pub fn advect(
    points: ArrayView2<'_, f32>,
    displacement: ArrayView2<'_, f32>,
    t: f32,
) -> Result<Array2<f32>> {
    if points.dim() != displacement.dim() {
        return Err(Error::ShapeMismatch(
            points.nrows(),
            points.ncols(),
            displacement.nrows(),
            displacement.ncols(),
        ));
    }
    Ok(&points + &displacement.mapv(|v| t * v))
}
