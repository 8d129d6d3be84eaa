//! Debiased Sinkhorn divergence between uniformly weighted point clouds.
//!
//! \[
//! S_\varepsilon(\alpha, \beta) = \mathrm{OT}_\varepsilon(\alpha, \beta)
//!   - \tfrac12 \mathrm{OT}_\varepsilon(\alpha, \alpha)
//!   - \tfrac12 \mathrm{OT}_\varepsilon(\beta, \beta)
//! \]
//!
//! computed from dual potentials, as in GeomLoss:
//! \(S = \langle a, f_{ab} - f_{aa} \rangle + \langle b, g_{ab} - g_{bb} \rangle\).
//!
//! The ground cost is `|x - y|` for `p = 1` and `|x - y|² / 2` for `p = 2`, and
//! `ε = blurᵖ`. The solve anneals ε from `diameterᵖ` down to `blurᵖ` by factors of
//! `scalingᵖ` (ε-scaling), with one averaged symmetric update per step, a short
//! refinement at the final ε and a last extrapolation step.
//!
//! # Backends
//!
//! | Backend | Costs | Notes |
//! |---------|-------|-------|
//! | [`Backend::Tensorized`] | dense `N × M` matrices | fastest for small clouds |
//! | [`Backend::Online`] | recomputed per use | `O(N + M)` memory |
//! | [`Backend::Multiscale`] | coarse clusters, then online | warm start ([`crate::multiscale`]) |
//!
//! # Gradient
//!
//! When the source cloud is tracked, the returned [`Loss`] carries a [`SinkhornGraph`].
//! By the envelope theorem the gradient only needs the converged potentials:
//!
//! \[
//! \nabla_{x_i} S = a_i \sum_j \pi^{ab}_{j|i} \nabla_x C(x_i, y_j)
//!                - a_i \sum_k \pi^{aa}_{k|i} \nabla_x C(x_i, x_k)
//! \]
//!
//! with \(\pi_{j|i} = \mathrm{softmax}_j(\log b_j + (g_j - C_{ij})/\varepsilon)\).
//! For `p = 2` minus `N` times this is the barycentric projection onto the target minus
//! the projection onto the source itself.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::multiscale;
use crate::{logsumexp_by, Divergence, Error, Loss, PointCloud, Result, SourceGradient};

/// Strategy used to evaluate the kernel sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Precompute full cost matrices.
    #[default]
    Tensorized,
    /// Evaluate costs on the fly.
    Online,
    /// Solve on voxel-grid clusters first, then refine on the full clouds.
    Multiscale,
}

impl Backend {
    /// All backends, in the order the self-check exercises them.
    pub const ALL: [Backend; 3] = [Backend::Tensorized, Backend::Online, Backend::Multiscale];
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Tensorized => "tensorized",
            Backend::Online => "online",
            Backend::Multiscale => "multiscale",
        };
        f.pad(name)
    }
}

/// Sinkhorn divergence configuration; implements [`Divergence`].
///
/// # Defaults
///
/// | Parameter | Default |
/// |-----------|---------|
/// | `p` | 2 |
/// | `blur` | 0.05 |
/// | `scaling` | 0.8 |
/// | `backend` | [`Backend::Tensorized`] |
/// | `diameter` | bounding-box diagonal of both clouds |
/// | `cluster_scale` | `diameter / (√D · 2000^{1/D})` |
/// | `refine_iters` | 50 |
/// | `tol` | 1e-5 |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplesLoss {
    /// Ground cost exponent (1 or 2).
    pub p: u8,
    /// Target blur; `ε = blurᵖ`.
    pub blur: f32,
    /// Per-step ratio of the annealed blur, in `(0, 1)`.
    pub scaling: f32,
    /// Kernel evaluation strategy.
    pub backend: Backend,
    /// Starting blur for the annealing schedule.
    pub diameter: Option<f32>,
    /// Voxel size for [`Backend::Multiscale`].
    pub cluster_scale: Option<f32>,
    /// Extra symmetric updates allowed at the final ε.
    pub refine_iters: usize,
    /// Refinement stops once potentials move less than this.
    pub tol: f32,
}

impl Default for SamplesLoss {
    fn default() -> Self {
        Self {
            p: 2,
            blur: 0.05,
            scaling: 0.8,
            backend: Backend::Tensorized,
            diameter: None,
            cluster_scale: None,
            refine_iters: 50,
            tol: 1e-5,
        }
    }
}

impl SamplesLoss {
    /// Sinkhorn divergence with the given exponent and blur, other fields default.
    pub fn new(p: u8, blur: f32) -> Self {
        Self {
            p,
            blur,
            ..Self::default()
        }
    }

    /// Set the ground cost exponent.
    #[must_use]
    pub fn with_p(mut self, p: u8) -> Self {
        self.p = p;
        self
    }

    /// Set the target blur.
    #[must_use]
    pub fn with_blur(mut self, blur: f32) -> Self {
        self.blur = blur;
        self
    }

    /// Set the annealing ratio.
    #[must_use]
    pub fn with_scaling(mut self, scaling: f32) -> Self {
        self.scaling = scaling;
        self
    }

    /// Set the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Fix the starting blur instead of measuring the clouds.
    #[must_use]
    pub fn with_diameter(mut self, diameter: f32) -> Self {
        self.diameter = Some(diameter);
        self
    }

    /// Set the multiscale voxel size.
    #[must_use]
    pub fn with_cluster_scale(mut self, cluster_scale: f32) -> Self {
        self.cluster_scale = Some(cluster_scale);
        self
    }

    /// Set the refinement budget at the final ε.
    #[must_use]
    pub fn with_refine_iters(mut self, refine_iters: usize) -> Self {
        self.refine_iters = refine_iters;
        self
    }

    /// Set the refinement tolerance.
    #[must_use]
    pub fn with_tol(mut self, tol: f32) -> Self {
        self.tol = tol;
        self
    }

    /// Final entropic regularization `ε = blurᵖ`.
    pub fn epsilon(&self) -> f32 {
        self.blur.powi(i32::from(self.p))
    }

    /// Divergence value between two raw point matrices (uniform weights).
    pub fn value(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>) -> Result<f32> {
        Ok(self.solve(x, y)?.value)
    }

    fn validate(&self, x: &ArrayView2<'_, f32>, y: &ArrayView2<'_, f32>) -> Result<GroundCost> {
        let cost = GroundCost::from_exponent(self.p)?;
        if x.nrows() == 0 || y.nrows() == 0 {
            return Err(Error::EmptyCloud);
        }
        if x.ncols() != y.ncols() {
            return Err(Error::DimensionMismatch(x.ncols(), y.ncols()));
        }
        if self.blur <= 0.0 || !self.blur.is_finite() {
            return Err(Error::InvalidRegularization(self.blur));
        }
        if !(self.scaling > 0.0 && self.scaling < 1.0) {
            return Err(Error::InvalidScaling(self.scaling));
        }
        if let Some(d) = self.diameter {
            if d <= 0.0 || !d.is_finite() {
                return Err(Error::Domain("diameter must be positive and finite"));
            }
        }
        if let Some(s) = self.cluster_scale {
            if s <= 0.0 || !s.is_finite() {
                return Err(Error::Domain("cluster_scale must be positive and finite"));
            }
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NonFinite("input points"));
        }
        Ok(cost)
    }

    fn solve(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>) -> Result<Solved> {
        let cost = self.validate(&x, &y)?;
        let p = i32::from(self.p);

        let diameter = self
            .diameter
            .unwrap_or_else(|| max_diameter(&x, &y))
            .max(self.blur);
        let schedule = epsilon_schedule(p, diameter, self.blur, self.scaling)?;
        let log_a = log_uniform(x.nrows());
        let log_b = log_uniform(y.nrows());
        trace!(
            backend = %self.backend,
            steps = schedule.len(),
            diameter,
            "sinkhorn schedule"
        );

        let (pot, eps, iterations) = {
            let fine = Problem::new(
                x.view(),
                y.view(),
                &log_a,
                &log_b,
                cost,
                self.backend == Backend::Tensorized,
            );
            let (mut pot, mut iterations) = match self.backend {
                Backend::Tensorized | Backend::Online => {
                    let mut pot = fine.init(schedule[0]);
                    for &eps in &schedule {
                        pot = pot.averaged(fine.update(eps, &pot)).0;
                    }
                    (pot, schedule.len())
                }
                Backend::Multiscale => {
                    let scale = self
                        .cluster_scale
                        .unwrap_or_else(|| multiscale::default_cluster_scale(diameter, x.ncols()));
                    self.anneal_multiscale(&fine, &schedule, scale)
                }
            };

            let eps = schedule[schedule.len() - 1];
            for _ in 0..self.refine_iters {
                let (next, moved) = pot.averaged(fine.update(eps, &pot));
                pot = next;
                iterations += 1;
                if moved < self.tol {
                    break;
                }
            }
            // Last extrapolation step (no averaging).
            (fine.update(eps, &pot), eps, iterations)
        };
        if !pot.is_finite() {
            return Err(Error::NonFinite("dual potentials"));
        }

        let value = debiased_value(&log_a, &log_b, &pot);
        if !value.is_finite() {
            return Err(Error::NonFinite("sinkhorn divergence"));
        }
        debug!(value, iterations, eps, "sinkhorn divergence solved");

        Ok(Solved {
            value,
            eps,
            cost,
            log_a,
            log_b,
            pot,
        })
    }

    fn anneal_multiscale(
        &self,
        fine: &Problem<'_>,
        schedule: &[f32],
        scale: f32,
    ) -> (Potentials, usize) {
        let cx = multiscale::grid_cluster(fine.xy.x, fine.log_a, scale);
        let cy = multiscale::grid_cluster(fine.xy.y, fine.log_b, scale);
        trace!(
            coarse_x = cx.len(),
            coarse_y = cy.len(),
            scale,
            "multiscale clustering"
        );
        let coarse = Problem::new(
            cx.centroids.view(),
            cy.centroids.view(),
            &cx.log_weights,
            &cy.log_weights,
            fine.cost,
            true,
        );
        let jump = scale.powi(i32::from(self.p));

        let mut pot = coarse.init(schedule[0]);
        let mut on_fine = false;
        for &eps in schedule {
            let next = if on_fine {
                fine.update(eps, &pot)
            } else {
                coarse.update(eps, &pot)
            };
            pot = pot.averaged(next).0;
            if !on_fine && eps <= jump {
                pot = multiscale::extrapolate(eps, fine, &cx, &cy, &pot);
                on_fine = true;
            }
        }
        if !on_fine {
            let eps = schedule[schedule.len() - 1];
            pot = multiscale::extrapolate(eps, fine, &cx, &cy, &pot);
        }
        (pot, schedule.len())
    }
}

impl Divergence for SamplesLoss {
    fn divergence(&self, x: &PointCloud, y: &PointCloud) -> Result<Loss> {
        let solved = self.solve(x.points(), y.points())?;
        if !x.requires_grad() {
            return Ok(Loss::new(solved.value));
        }
        let value = solved.value;
        let graph = SinkhornGraph {
            x: x.points().to_owned(),
            y: y.points().to_owned(),
            log_a: solved.log_a,
            log_b: solved.log_b,
            g_ab: solved.pot.g_ab,
            f_aa: solved.pot.f_aa,
            eps: solved.eps,
            cost: solved.cost,
        };
        Ok(Loss::with_graph(value, graph))
    }
}

struct Solved {
    value: f32,
    eps: f32,
    cost: GroundCost,
    log_a: Array1<f32>,
    log_b: Array1<f32>,
    pot: Potentials,
}

/// Retained state of a solved Sinkhorn problem, enough to differentiate it with
/// respect to the source points.
#[derive(Debug, Clone)]
pub struct SinkhornGraph {
    x: Array2<f32>,
    y: Array2<f32>,
    log_a: Array1<f32>,
    log_b: Array1<f32>,
    g_ab: Array1<f32>,
    f_aa: Array1<f32>,
    eps: f32,
    cost: GroundCost,
}

impl SinkhornGraph {
    /// Entropic regularization the potentials were computed at.
    pub fn epsilon(&self) -> f32 {
        self.eps
    }

    /// Accumulate `Σ_j softmax_j(log_w_j + (pot_j - C(x_i, z_j))/ε) ∇ₓC(x_i, z_j)` into `out`.
    fn conditional_gradient(
        &self,
        xi: ArrayView1<'_, f32>,
        z: &Array2<f32>,
        log_w: &Array1<f32>,
        pot: &Array1<f32>,
        scale: f32,
        out: &mut [f32],
    ) {
        let m = z.nrows();
        let logits: Vec<f32> = (0..m)
            .map(|j| log_w[j] + (pot[j] - self.cost.eval(xi, z.row(j))) / self.eps)
            .collect();
        let lse = logsumexp_by(m, |j| logits[j]);
        for (j, &logit) in logits.iter().enumerate() {
            let w = (logit - lse).exp();
            if w > 0.0 {
                self.cost.accumulate_grad(xi, z.row(j), scale * w, out);
            }
        }
    }
}

impl SourceGradient for SinkhornGraph {
    fn source_gradient(&self) -> Result<Array2<f32>> {
        let (n, d) = self.x.dim();
        let mut grad = Array2::zeros((n, d));
        let mut acc = vec![0.0f32; d];
        for i in 0..n {
            acc.iter_mut().for_each(|v| *v = 0.0);
            let a_i = self.log_a[i].exp();
            let xi = self.x.row(i);
            self.conditional_gradient(xi, &self.y, &self.log_b, &self.g_ab, a_i, &mut acc);
            self.conditional_gradient(xi, &self.x, &self.log_a, &self.f_aa, -a_i, &mut acc);
            for (k, &v) in acc.iter().enumerate() {
                grad[[i, k]] = v;
            }
        }
        if grad.iter().any(|v| !v.is_finite()) {
            return Err(Error::NonFinite("sinkhorn gradient"));
        }
        Ok(grad)
    }
}

/// Ground cost `C(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroundCost {
    /// `|x - y|`
    Euclidean,
    /// `|x - y|² / 2`
    HalfSquared,
}

impl GroundCost {
    fn from_exponent(p: u8) -> Result<Self> {
        match p {
            1 => Ok(GroundCost::Euclidean),
            2 => Ok(GroundCost::HalfSquared),
            other => Err(Error::UnsupportedExponent(other)),
        }
    }

    #[inline]
    pub(crate) fn eval(self, x: ArrayView1<'_, f32>, y: ArrayView1<'_, f32>) -> f32 {
        let sq: f32 = x.iter().zip(y.iter()).map(|(&a, &b)| (a - b) * (a - b)).sum();
        match self {
            GroundCost::Euclidean => sq.sqrt(),
            GroundCost::HalfSquared => 0.5 * sq,
        }
    }

    /// `out += w · ∇ₓC(x, y)`. The Euclidean gradient is taken as zero at `x == y`.
    #[inline]
    fn accumulate_grad(
        self,
        x: ArrayView1<'_, f32>,
        y: ArrayView1<'_, f32>,
        w: f32,
        out: &mut [f32],
    ) {
        match self {
            GroundCost::HalfSquared => {
                for ((o, &a), &b) in out.iter_mut().zip(x.iter()).zip(y.iter()) {
                    *o += w * (a - b);
                }
            }
            GroundCost::Euclidean => {
                let norm = self.eval(x, y);
                if norm <= f32::EPSILON {
                    return;
                }
                for ((o, &a), &b) in out.iter_mut().zip(x.iter()).zip(y.iter()) {
                    *o += w * (a - b) / norm;
                }
            }
        }
    }
}

/// Cost between two point sets, either precomputed or evaluated on demand.
pub(crate) struct CostMatrix<'a> {
    pub(crate) x: ArrayView2<'a, f32>,
    pub(crate) y: ArrayView2<'a, f32>,
    cost: GroundCost,
    dense: Option<Array2<f32>>,
}

impl<'a> CostMatrix<'a> {
    pub(crate) fn new(
        x: ArrayView2<'a, f32>,
        y: ArrayView2<'a, f32>,
        cost: GroundCost,
        tensorized: bool,
    ) -> Self {
        let dense = tensorized.then(|| {
            Array2::from_shape_fn((x.nrows(), y.nrows()), |(i, j)| cost.eval(x.row(i), y.row(j)))
        });
        Self { x, y, cost, dense }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> f32 {
        match &self.dense {
            Some(c) => c[[i, j]],
            None => self.cost.eval(self.x.row(i), self.y.row(j)),
        }
    }

    /// `out_i = -ε · logsumexp_j(h_j - C_ij / ε)`.
    pub(crate) fn softmin_rows(&self, eps: f32, h: &Array1<f32>) -> Array1<f32> {
        let m = self.x.nrows();
        let n = self.y.nrows();
        debug_assert_eq!(h.len(), n);
        let mut out = Array1::zeros(m);
        for i in 0..m {
            let lse = logsumexp_by(n, |j| h[j] - self.at(i, j) / eps);
            out[i] = -eps * lse;
        }
        out
    }

    /// `out_j = -ε · logsumexp_i(h_i - C_ij / ε)`.
    pub(crate) fn softmin_cols(&self, eps: f32, h: &Array1<f32>) -> Array1<f32> {
        let m = self.x.nrows();
        let n = self.y.nrows();
        debug_assert_eq!(h.len(), m);
        let mut out = Array1::zeros(n);
        for j in 0..n {
            let lse = logsumexp_by(m, |i| h[i] - self.at(i, j) / eps);
            out[j] = -eps * lse;
        }
        out
    }
}

/// The three transport problems behind a debiased divergence.
pub(crate) struct Problem<'a> {
    pub(crate) log_a: &'a Array1<f32>,
    pub(crate) log_b: &'a Array1<f32>,
    pub(crate) xy: CostMatrix<'a>,
    xx: CostMatrix<'a>,
    yy: CostMatrix<'a>,
    pub(crate) cost: GroundCost,
}

impl<'a> Problem<'a> {
    fn new(
        x: ArrayView2<'a, f32>,
        y: ArrayView2<'a, f32>,
        log_a: &'a Array1<f32>,
        log_b: &'a Array1<f32>,
        cost: GroundCost,
        tensorized: bool,
    ) -> Self {
        Self {
            log_a,
            log_b,
            xy: CostMatrix::new(x, y, cost, tensorized),
            xx: CostMatrix::new(x, x, cost, tensorized),
            yy: CostMatrix::new(y, y, cost, tensorized),
            cost,
        }
    }

    fn init(&self, eps: f32) -> Potentials {
        Potentials {
            f_ba: self.xy.softmin_rows(eps, self.log_b),
            g_ab: self.xy.softmin_cols(eps, self.log_a),
            f_aa: self.xx.softmin_rows(eps, self.log_a),
            g_bb: self.yy.softmin_rows(eps, self.log_b),
        }
    }

    /// One simultaneous Sinkhorn update of all four potentials.
    fn update(&self, eps: f32, pot: &Potentials) -> Potentials {
        let h_b = self.log_b + &pot.g_ab.mapv(|g| g / eps);
        let h_a = self.log_a + &pot.f_ba.mapv(|f| f / eps);
        let h_aa = self.log_a + &pot.f_aa.mapv(|f| f / eps);
        let h_bb = self.log_b + &pot.g_bb.mapv(|g| g / eps);
        Potentials {
            f_ba: self.xy.softmin_rows(eps, &h_b),
            g_ab: self.xy.softmin_cols(eps, &h_a),
            f_aa: self.xx.softmin_rows(eps, &h_aa),
            g_bb: self.yy.softmin_rows(eps, &h_bb),
        }
    }
}

/// Dual potentials: `f_ba`/`g_ab` for (a, b), `f_aa` for (a, a), `g_bb` for (b, b).
#[derive(Debug, Clone)]
pub(crate) struct Potentials {
    pub(crate) f_ba: Array1<f32>,
    pub(crate) g_ab: Array1<f32>,
    pub(crate) f_aa: Array1<f32>,
    pub(crate) g_bb: Array1<f32>,
}

impl Potentials {
    /// `0.5 · (self + next)`, plus the largest entry of `|next - self|`.
    fn averaged(&self, next: Potentials) -> (Potentials, f32) {
        let moved = [
            (&self.f_ba, &next.f_ba),
            (&self.g_ab, &next.g_ab),
            (&self.f_aa, &next.f_aa),
            (&self.g_bb, &next.g_bb),
        ]
        .iter()
        .flat_map(|(old, new)| old.iter().zip(new.iter()).map(|(&o, &n)| (n - o).abs()))
        .fold(0.0f32, f32::max);
        let avg = Potentials {
            f_ba: 0.5 * (&self.f_ba + &next.f_ba),
            g_ab: 0.5 * (&self.g_ab + &next.g_ab),
            f_aa: 0.5 * (&self.f_aa + &next.f_aa),
            g_bb: 0.5 * (&self.g_bb + &next.g_bb),
        };
        (avg, moved)
    }

    fn is_finite(&self) -> bool {
        [&self.f_ba, &self.g_ab, &self.f_aa, &self.g_bb]
            .iter()
            .all(|p| p.iter().all(|v| v.is_finite()))
    }
}

/// `⟨a, f_ba - f_aa⟩ + ⟨b, g_ab - g_bb⟩`, accumulated in `f64`.
fn debiased_value(log_a: &Array1<f32>, log_b: &Array1<f32>, pot: &Potentials) -> f32 {
    let mut total = 0.0f64;
    for i in 0..log_a.len() {
        total += f64::from(log_a[i]).exp() * f64::from(pot.f_ba[i] - pot.f_aa[i]);
    }
    for j in 0..log_b.len() {
        total += f64::from(log_b[j]).exp() * f64::from(pot.g_ab[j] - pot.g_bb[j]);
    }
    total as f32
}

/// Log-weights of the uniform measure on `n` points.
pub(crate) fn log_uniform(n: usize) -> Array1<f32> {
    Array1::from_elem(n, -(n as f32).ln())
}

/// Bounding-box diagonal of the union of both clouds.
pub(crate) fn max_diameter(x: &ArrayView2<'_, f32>, y: &ArrayView2<'_, f32>) -> f32 {
    let d = x.ncols();
    let mut lo = vec![f32::INFINITY; d];
    let mut hi = vec![f32::NEG_INFINITY; d];
    for row in x.rows().into_iter().chain(y.rows()) {
        for (k, &v) in row.iter().enumerate() {
            lo[k] = lo[k].min(v);
            hi[k] = hi[k].max(v);
        }
    }
    lo.iter()
        .zip(&hi)
        .map(|(&l, &h)| (h - l) * (h - l))
        .sum::<f32>()
        .sqrt()
}

/// Longest annealing schedule a `scaling` may produce.
const MAX_ANNEALING_STEPS: usize = 100_000;

/// Annealing schedule `[diamᵖ, …, blurᵖ]`, geometric with ratio `scalingᵖ`.
///
/// Returns [`Error::InvalidScaling`] when `scaling` is so close to 1 that the schedule
/// would exceed `MAX_ANNEALING_STEPS` steps.
pub(crate) fn epsilon_schedule(p: i32, diameter: f32, blur: f32, scaling: f32) -> Result<Vec<f32>> {
    let pf = p as f32;
    let start = pf * diameter.ln();
    let stop = pf * blur.ln();
    let step = pf * scaling.ln();

    let steps = if start > stop {
        ((start - stop) / -step).ceil()
    } else {
        0.0
    };
    if !steps.is_finite() || steps > MAX_ANNEALING_STEPS as f32 {
        return Err(Error::InvalidScaling(scaling));
    }

    let mut schedule = Vec::with_capacity(steps as usize + 2);
    schedule.push(diameter.powi(p));
    schedule.extend((0..steps as usize).map(|k| (start + k as f32 * step).exp()));
    schedule.push(blur.powi(p));
    Ok(schedule)
}
