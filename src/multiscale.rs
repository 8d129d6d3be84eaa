//! Coarse-to-fine warm start for [`Backend::Multiscale`](crate::Backend::Multiscale).
//!
//! Both clouds are binned on a voxel grid of side `cluster_scale`; each occupied voxel
//! becomes one weighted point at the barycenter of its members. The ε-schedule runs on
//! these coarse measures until `ε ≤ cluster_scaleᵖ`, then the coarse potentials are
//! extrapolated to every original point with a single softmin and the solve continues on
//! the full clouds.
//!
//! No kernel truncation happens here: the fine stage still sums over every pair.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView2};

use crate::logsumexp_by;
use crate::sinkhorn::{CostMatrix, Potentials, Problem};

/// Weighted voxel barycenters of a point cloud.
#[derive(Debug, Clone)]
pub struct Clusters {
    /// One row per occupied voxel.
    pub centroids: Array2<f32>,
    /// Log of the total member weight per voxel.
    pub log_weights: Array1<f32>,
    /// Voxel index of every input point.
    pub labels: Vec<usize>,
}

impl Clusters {
    /// Number of occupied voxels.
    pub fn len(&self) -> usize {
        self.centroids.nrows()
    }

    /// `true` if no points were clustered.
    pub fn is_empty(&self) -> bool {
        self.centroids.nrows() == 0
    }
}

/// Voxel size used when none is configured: `diameter / (√D · 2000^{1/D})`.
pub fn default_cluster_scale(diameter: f32, dim: usize) -> f32 {
    let d = dim.max(1) as f32;
    diameter / (d.sqrt() * 2000f32.powf(1.0 / d))
}

/// Bin `points` on a grid of side `scale` anchored at the coordinate-wise minimum.
///
/// Voxels are numbered in lexicographic order of their grid coordinates, so the result
/// does not depend on the order of the input rows beyond floating-point summation.
pub fn grid_cluster(
    points: ArrayView2<'_, f32>,
    log_weights: &Array1<f32>,
    scale: f32,
) -> Clusters {
    let (n, d) = points.dim();
    let mut lo = vec![f32::INFINITY; d];
    for row in points.rows() {
        for (k, &v) in row.iter().enumerate() {
            lo[k] = lo[k].min(v);
        }
    }

    let cells: Vec<Vec<i64>> = points
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .zip(&lo)
                .map(|(&v, &l)| ((v - l) / scale).floor() as i64)
                .collect()
        })
        .collect();

    let mut index: BTreeMap<&[i64], usize> = BTreeMap::new();
    for cell in &cells {
        index.entry(cell.as_slice()).or_insert(0);
    }
    for (k, slot) in index.values_mut().enumerate() {
        *slot = k;
    }
    let labels: Vec<usize> = cells.iter().map(|c| index[c.as_slice()]).collect();

    let k = index.len();
    let mut mass = vec![0.0f64; k];
    let mut sums = Array2::<f64>::zeros((k, d));
    for i in 0..n {
        let w = f64::from(log_weights[i]).exp();
        let c = labels[i];
        mass[c] += w;
        for j in 0..d {
            sums[[c, j]] += w * f64::from(points[[i, j]]);
        }
    }

    let centroids = Array2::from_shape_fn((k, d), |(c, j)| (sums[[c, j]] / mass[c]) as f32);
    let log_weights = Array1::from_iter(mass.iter().map(|&m| m.ln() as f32));
    Clusters {
        centroids,
        log_weights,
        labels,
    }
}

/// Carry coarse potentials over to the full clouds of `fine`.
///
/// Each fine potential is the softmin, at `eps`, of its coarse partner measure:
/// `f(x_i) = -ε · logsumexp_k(log b̃_k + g̃_k/ε - C(x_i, ỹ_k)/ε)`, and likewise for the
/// three other potentials.
pub(crate) fn extrapolate(
    eps: f32,
    fine: &Problem<'_>,
    cx: &Clusters,
    cy: &Clusters,
    coarse: &Potentials,
) -> Potentials {
    let x = fine.xy.x;
    let y = fine.xy.y;
    let against = |rows: ArrayView2<'_, f32>, c: &Clusters, pot: &Array1<f32>| {
        let h = &c.log_weights + &pot.mapv(|v| v / eps);
        CostMatrix::new(rows.view(), c.centroids.view(), fine.cost, false).softmin_rows(eps, &h)
    };
    Potentials {
        f_ba: against(x, cy, &coarse.g_ab),
        g_ab: against(y, cx, &coarse.f_ba),
        f_aa: against(x, cx, &coarse.f_aa),
        g_bb: against(y, cy, &coarse.g_bb),
    }
}

/// Total mass of a set of log-weights.
pub fn total_mass(log_weights: &Array1<f32>) -> f32 {
    logsumexp_by(log_weights.len(), |i| log_weights[i]).exp()
}
