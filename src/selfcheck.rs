//! Installation self-check: run every Sinkhorn backend on a known problem.

use std::fmt;

use tracing::{info, instrument};

use crate::{
    logsumexp_by, Backend, Error, OtdPairwise, PairwiseConfig, PointCloud, Result, SamplesLoss,
};

const SPHERE_POINTS: usize = 10;
const MAX_RELATIVE_SPREAD: f32 = 0.05;

/// One backend's result on the self-check problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendTiming {
    /// Backend that ran.
    pub backend: Backend,
    /// Divergence between the sphere and its shifted copy.
    pub value: f32,
    /// Wall-clock seconds for the pair.
    pub seconds: f64,
}

/// Outcome of [`check_backends`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReport {
    entries: Vec<BackendTiming>,
}

impl BackendReport {
    /// Results in [`Backend::ALL`] order.
    pub fn entries(&self) -> &[BackendTiming] {
        &self.entries
    }

    /// Result for one backend.
    pub fn get(&self, backend: Backend) -> Option<&BackendTiming> {
        self.entries.iter().find(|e| e.backend == backend)
    }

    /// `(max - min) / |max|` over all backend values.
    pub fn relative_spread(&self) -> f32 {
        let lo = self.entries.iter().map(|e| e.value).fold(f32::INFINITY, f32::min);
        let hi = self.entries.iter().map(|e| e.value).fold(f32::NEG_INFINITY, f32::max);
        if hi == lo {
            return 0.0;
        }
        (hi - lo) / hi.abs().max(lo.abs())
    }
}

impl fmt::Display for BackendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "{:<12} {:>12.6} {:>10.4}s", e.backend, e.value, e.seconds)?;
        }
        Ok(())
    }
}

/// Run the pairwise engine once per backend on a 10-point sphere against the same sphere
/// shifted by `+1` along every axis, then check that all backends agree.
///
/// Uses `p = 2`, `blur = 1e-7`, `scaling = 0.99`. Any failure is reported as
/// [`Error::SelfCheck`].
#[instrument]
pub fn check_backends() -> Result<BackendReport> {
    check_numerics()?;

    let source = PointCloud::sphere(SPHERE_POINTS);
    let target = source.translated(&[1.0; 3]);
    let mut entries = Vec::with_capacity(Backend::ALL.len());

    for backend in Backend::ALL {
        let loss = SamplesLoss::new(2, 1e-7)
            .with_scaling(0.99)
            .with_backend(backend);
        let mut otd = OtdPairwise::new(
            vec![source.clone()],
            vec![target.clone()],
            loss,
            PairwiseConfig::default(),
        )?;
        otd.compute()
            .map_err(|e| Error::SelfCheck(format!("{backend} backend failed: {e}")))?;
        if !otd.is_computed() {
            return Err(Error::SelfCheck(format!("{backend} backend did not finish")));
        }

        let value = otd.otd_matrix()[[0, 0]];
        let seconds = otd.time_matrix()[[0, 0]];
        if !value.is_finite() {
            return Err(Error::SelfCheck(format!("{backend} backend returned {value}")));
        }
        info!(%backend, value, seconds, "backend ok");
        entries.push(BackendTiming {
            backend,
            value,
            seconds,
        });
    }

    let report = BackendReport { entries };
    let spread = report.relative_spread();
    if spread > MAX_RELATIVE_SPREAD {
        return Err(Error::SelfCheck(format!(
            "backends disagree by {:.1}%:\n{report}",
            100.0 * spread
        )));
    }
    Ok(report)
}

fn check_numerics() -> Result<()> {
    let lse = logsumexp_by(3, |i| [0.0f32, 0.0, 0.0][i]);
    if (lse - 3f32.ln()).abs() > 1e-6 {
        return Err(Error::SelfCheck(format!("logsumexp(0, 0, 0) = {lse}")));
    }
    if logsumexp_by(2, |_| f32::NEG_INFINITY) != f32::NEG_INFINITY {
        return Err(Error::SelfCheck("logsumexp of zero mass is finite".into()));
    }

    let x = PointCloud::sphere(SPHERE_POINTS);
    let diagonal = SamplesLoss::default().value(x.points(), x.points())?;
    if diagonal.abs() > 1e-3 {
        return Err(Error::SelfCheck(format!(
            "divergence of a cloud with itself is {diagonal}"
        )));
    }
    Ok(())
}
