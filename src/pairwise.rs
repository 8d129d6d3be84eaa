//! Pairwise optimal transport distances between two collections of point clouds.
//!
//! [`OtdPairwise`] evaluates a [`Divergence`] on every (source, target) pair, keeps the
//! gradient handle each evaluation returns, and turns those handles into displacement
//! maps on request:
//!
//! \[
//! v_i = -N \, \frac{\partial\, \mathrm{OTD}(x, y)}{\partial x_i}
//! \]
//!
//! where `N` is the number of source points. Maps are computed lazily and cached for the
//! lifetime of the engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::plot::{figure_clouds, Figure, FigureOptions};
use crate::{Divergence, Error, LabeledMatrix, PointCloud, Result, SamplesLoss, SourceGradient};

/// Per-pair progress goes to `info` in verbose mode and to `debug` otherwise.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Decides which (source, target) pairs [`OtdPairwise::compute`] leaves out.
pub struct SkipPolicy(Box<dyn Fn(usize, usize) -> bool>);

impl SkipPolicy {
    /// Compute every pair.
    pub fn never() -> Self {
        Self(Box::new(|_, _| false))
    }

    /// Skip pair `(i, j)` whenever `f(i, j)` is true.
    pub fn from_fn(f: impl Fn(usize, usize) -> bool + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Skip the diagonal `i == j` (useful when sources and targets are the same samples).
    pub fn diagonal() -> Self {
        Self::from_fn(|i, j| i == j)
    }

    /// Whether pair `(i, j)` is skipped.
    pub fn skips(&self, i: usize, j: usize) -> bool {
        (self.0)(i, j)
    }
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for SkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SkipPolicy(..)")
    }
}

/// Shape of [`OtdPairwise::output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain nested vectors.
    #[default]
    Array,
    /// A [`LabeledMatrix`] named by sample.
    Table,
}

/// Distances in the configured [`OutputFormat`].
#[derive(Debug, Clone, PartialEq)]
pub enum PairwiseOutput {
    /// Row-major `sources × targets` values.
    Array(Vec<Vec<f32>>),
    /// Values with source rows and target columns.
    Table(LabeledMatrix),
}

/// Engine settings.
#[derive(Debug, Default)]
pub struct PairwiseConfig {
    /// Source names; `sample_<i>` when unset.
    pub source_names: Option<Vec<String>>,
    /// Target names; `sample_<j>` when unset.
    pub target_names: Option<Vec<String>>,
    /// Log per-pair progress at `info` instead of `debug`.
    pub verbose: bool,
    /// Rewrite the distance table here after every computed pair.
    pub intermediate_file: Option<PathBuf>,
    /// Pairs to leave out.
    pub skip: SkipPolicy,
    /// What [`OtdPairwise::output`] returns.
    pub output_format: OutputFormat,
}

impl PairwiseConfig {
    /// Name the sources.
    pub fn with_source_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.source_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Name the targets.
    pub fn with_target_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.target_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Toggle verbose progress logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Write the distance table to `path` after each pair.
    pub fn with_intermediate_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.intermediate_file = Some(path.into());
        self
    }

    /// Set the skip policy.
    pub fn with_skip(mut self, skip: SkipPolicy) -> Self {
        self.skip = skip;
        self
    }

    /// Set the output format.
    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }
}

/// Lazily filled `sources × targets` grid of displacement maps.
#[derive(Debug, Clone)]
pub struct DisplacementCache {
    maps: Array2<Option<Array2<f32>>>,
}

impl DisplacementCache {
    fn new(n: usize, m: usize) -> Self {
        Self {
            maps: Array2::from_elem((n, m), None),
        }
    }

    /// `(sources, targets)`.
    pub fn shape(&self) -> (usize, usize) {
        self.maps.dim()
    }

    /// The map for `(i, j)`, if it has been computed.
    pub fn get(&self, i: usize, j: usize) -> Option<&Array2<f32>> {
        self.maps.get((i, j)).and_then(Option::as_ref)
    }

    /// Whether `(i, j)` has been computed.
    pub fn is_cached(&self, i: usize, j: usize) -> bool {
        self.get(i, j).is_some()
    }

    /// Number of computed maps.
    pub fn len(&self) -> usize {
        self.maps.iter().filter(|m| m.is_some()).count()
    }

    /// `true` if no map has been computed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computed maps with their `(source, target)` index, row-major.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &Array2<f32>)> {
        self.maps
            .indexed_iter()
            .filter_map(|(ij, m)| m.as_ref().map(|m| (ij, m)))
    }
}

/// Pairwise OTD between `sources` and `targets`, with cached displacement maps.
pub struct OtdPairwise<D: Divergence = SamplesLoss> {
    sources: Vec<PointCloud>,
    targets: Vec<PointCloud>,
    source_names: Vec<String>,
    target_names: Vec<String>,
    loss: D,
    config: PairwiseConfig,
    otd: Array2<f32>,
    time_calculation: Array2<f64>,
    graphs: Array2<Option<Box<dyn SourceGradient>>>,
    otd_calculated: bool,
    displacement: DisplacementCache,
    displacement_all_computed: bool,
}

fn resolve_names(
    given: Option<Vec<String>>,
    clouds: usize,
    what: &'static str,
) -> Result<Vec<String>> {
    match given {
        Some(names) if names.len() != clouds => Err(Error::Validation {
            what,
            clouds,
            names: names.len(),
        }),
        Some(names) => Ok(names),
        None => Ok((0..clouds).map(|i| format!("sample_{i}")).collect()),
    }
}

impl OtdPairwise<SamplesLoss> {
    /// Engine with the default Sinkhorn divergence (`p = 2`, `blur = 0.05`, `scaling = 0.8`).
    pub fn with_default_loss(
        sources: Vec<PointCloud>,
        targets: Vec<PointCloud>,
        config: PairwiseConfig,
    ) -> Result<Self> {
        Self::new(sources, targets, SamplesLoss::default(), config)
    }
}

impl<D: Divergence> OtdPairwise<D> {
    /// Take ownership of the clouds and mark every source as gradient-tracked.
    ///
    /// Returns [`Error::Validation`] when a name list does not match its clouds.
    pub fn new(
        mut sources: Vec<PointCloud>,
        targets: Vec<PointCloud>,
        loss: D,
        mut config: PairwiseConfig,
    ) -> Result<Self> {
        let source_names = resolve_names(config.source_names.take(), sources.len(), "sources")?;
        let target_names = resolve_names(config.target_names.take(), targets.len(), "targets")?;
        for s in &mut sources {
            s.set_requires_grad(true);
        }
        let (n, m) = (sources.len(), targets.len());
        Ok(Self {
            sources,
            targets,
            source_names,
            target_names,
            loss,
            config,
            otd: Array2::zeros((n, m)),
            time_calculation: Array2::zeros((n, m)),
            graphs: Array2::from_shape_fn((n, m), |_| None),
            otd_calculated: false,
            displacement: DisplacementCache::new(n, m),
            displacement_all_computed: false,
        })
    }

    /// Evaluate the divergence on every non-skipped pair, sources outer, targets inner.
    ///
    /// The first failing pair aborts the pass; cells already filled keep their values and
    /// [`is_computed`](Self::is_computed) stays false.
    #[instrument(skip_all, fields(sources = self.sources.len(), targets = self.targets.len()))]
    pub fn compute(&mut self) -> Result<()> {
        let verbose = self.config.verbose;
        let (n, m) = self.otd.dim();
        for i in 0..n {
            for j in 0..m {
                if self.config.skip.skips(i, j) {
                    progress!(verbose, source = i, target = j, "skipping");
                    continue;
                }

                let start = Instant::now();
                let loss = self.loss.divergence(&self.sources[i], &self.targets[j])?;
                let seconds = start.elapsed().as_secs_f64();
                let (value, graph) = loss.into_parts();

                self.otd[[i, j]] = value;
                self.time_calculation[[i, j]] = seconds;
                self.graphs[[i, j]] = graph;
                progress!(
                    verbose,
                    source = %self.source_names[i],
                    target = %self.target_names[j],
                    otd = value,
                    seconds,
                    "pair computed"
                );

                if let Some(path) = &self.config.intermediate_file {
                    self.otd_table().write_csv(path)?;
                    progress!(verbose, path = %path.display(), "wrote intermediate results");
                }
            }
        }
        self.otd_calculated = true;
        info!(pairs = n * m, "pairwise OTD computed");
        Ok(())
    }

    fn check_pair(&self, i: usize, j: usize) -> Result<()> {
        let (n, m) = self.otd.dim();
        if i >= n || j >= m {
            return Err(Error::IndexOutOfRange {
                source_index: i,
                target_index: j,
                n_sources: n,
                n_targets: m,
            });
        }
        Ok(())
    }

    fn check_computed(&self) -> Result<()> {
        if !self.otd_calculated {
            return Err(Error::Precompute);
        }
        Ok(())
    }

    /// Differentiate pair `(i, j)` and store the displacement map, replacing any cached one.
    pub fn compute_displacement_map(&mut self, i: usize, j: usize) -> Result<&Array2<f32>> {
        self.check_computed()?;
        self.check_pair(i, j)?;
        let not_differentiable = Error::NotDifferentiable {
            source_index: i,
            target_index: j,
        };
        let graph = self.graphs[[i, j]].as_ref().ok_or(not_differentiable)?;
        let grad = graph.source_gradient()?;

        let source = &self.sources[i];
        if grad.dim() != (source.len(), source.dim()) {
            return Err(Error::ShapeMismatch(
                source.len(),
                source.dim(),
                grad.nrows(),
                grad.ncols(),
            ));
        }
        let scale = -(source.len() as f32);
        let map = grad.mapv(|g| g * scale);
        debug!(source = i, target = j, "displacement map derived");
        Ok(self.displacement.maps[[i, j]].insert(map))
    }

    /// The displacement map for `(i, j)`, derived on first use.
    pub fn displacement_map(&mut self, i: usize, j: usize) -> Result<&Array2<f32>> {
        self.check_computed()?;
        self.check_pair(i, j)?;
        if !self.displacement.is_cached(i, j) {
            self.compute_displacement_map(i, j)?;
        }
        self.displacement.get(i, j).ok_or(Error::NotDifferentiable {
            source_index: i,
            target_index: j,
        })
    }

    /// Derive every missing displacement map.
    ///
    /// Pairs without a gradient handle (skipped pairs) stay empty in the cache.
    pub fn compute_all_displacement_maps(&mut self) -> Result<()> {
        self.check_computed()?;
        let (n, m) = self.otd.dim();
        for i in 0..n {
            for j in 0..m {
                if self.displacement.is_cached(i, j) {
                    continue;
                }
                if self.graphs[[i, j]].is_none() {
                    debug!(source = i, target = j, "no gradient, leaving displacement empty");
                    continue;
                }
                self.compute_displacement_map(i, j)?;
            }
        }
        self.displacement_all_computed = true;
        Ok(())
    }

    /// Every displacement map, deriving the missing ones first.
    pub fn displacement_maps(&mut self) -> Result<&DisplacementCache> {
        if !self.displacement_all_computed {
            self.compute_all_displacement_maps()?;
        }
        Ok(&self.displacement)
    }

    /// Raw distance matrix.
    pub fn otd_matrix(&self) -> ArrayView2<'_, f32> {
        self.otd.view()
    }

    /// Distances as nested vectors, one per source.
    pub fn otd_array(&self) -> Vec<Vec<f32>> {
        self.otd.rows().into_iter().map(|r| r.to_vec()).collect()
    }

    /// Distances named by sample.
    pub fn otd_table(&self) -> LabeledMatrix {
        LabeledMatrix::from_f32(&self.source_names, &self.target_names, self.otd.view())
    }

    /// Seconds spent per pair.
    pub fn time_matrix(&self) -> ArrayView2<'_, f64> {
        self.time_calculation.view()
    }

    /// Seconds spent per pair, named by sample.
    pub fn time_table(&self) -> LabeledMatrix {
        LabeledMatrix::from_f64(
            &self.source_names,
            &self.target_names,
            self.time_calculation.view(),
        )
    }

    /// Distances in the configured [`OutputFormat`].
    pub fn output(&self) -> PairwiseOutput {
        match self.config.output_format {
            OutputFormat::Array => PairwiseOutput::Array(self.otd_array()),
            OutputFormat::Table => PairwiseOutput::Table(self.otd_table()),
        }
    }

    /// Write the current distance table as CSV.
    pub fn save_intermediate(&self, path: &Path) -> Result<()> {
        self.otd_table().write_csv(path)
    }

    /// Whether [`compute`](Self::compute) has completed.
    pub fn is_computed(&self) -> bool {
        self.otd_calculated
    }

    /// Whether [`compute_all_displacement_maps`](Self::compute_all_displacement_maps) has
    /// completed.
    pub fn is_displacement_all_computed(&self) -> bool {
        self.displacement_all_computed
    }

    /// Source clouds (all gradient-tracked).
    pub fn sources(&self) -> &[PointCloud] {
        &self.sources
    }

    /// Target clouds.
    pub fn targets(&self) -> &[PointCloud] {
        &self.targets
    }

    /// Source names.
    pub fn source_names(&self) -> &[String] {
        &self.source_names
    }

    /// Target names.
    pub fn target_names(&self) -> &[String] {
        &self.target_names
    }

    /// The divergence in use.
    pub fn loss(&self) -> &D {
        &self.loss
    }

    /// Source `i` and target `j` on one figure, first `npoints` rows of each.
    pub fn plot(&self, i: usize, j: usize, npoints: Option<usize>) -> Result<Figure> {
        self.check_pair(i, j)?;
        let options = FigureOptions::default().with_npoints(npoints);
        figure_clouds(self.sources[i].points(), self.targets[j].points(), None, &options)
    }

    /// Like [`plot`](Self::plot), with the displacement map of `(i, j)` drawn as arrows.
    pub fn plot_displacement(
        &mut self,
        i: usize,
        j: usize,
        options: &FigureOptions,
    ) -> Result<Figure> {
        self.check_pair(i, j)?;
        self.displacement_map(i, j)?;
        let map = self.displacement.get(i, j).map(Array2::view);
        figure_clouds(self.sources[i].points(), self.targets[j].points(), map, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnDivergence, Loss};
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct Counters {
        losses: Rc<Cell<usize>>,
        gradients: Rc<Cell<usize>>,
    }

    /// Value `10·|x| + |y|`, gradient `0.5` everywhere.
    fn counting(c: &Counters) -> impl Divergence {
        let c = c.clone();
        FnDivergence::new(move |x: &PointCloud, y: &PointCloud| {
            c.losses.set(c.losses.get() + 1);
            let value = (10 * x.len() + y.len()) as f32;
            if !x.requires_grad() {
                return Ok(Loss::new(value));
            }
            let grads = Rc::clone(&c.gradients);
            let shape = (x.len(), x.dim());
            Ok(Loss::with_graph(value, move || -> Result<Array2<f32>> {
                grads.set(grads.get() + 1);
                Ok(Array2::from_elem(shape, 0.5))
            }))
        })
    }

    fn clouds(sizes: &[usize]) -> Vec<PointCloud> {
        sizes.iter().map(|&n| PointCloud::new(Array2::zeros((n, 2)))).collect()
    }

    fn engine<D: Divergence>(
        sources: &[usize],
        targets: &[usize],
        loss: D,
        config: PairwiseConfig,
    ) -> OtdPairwise<D> {
        OtdPairwise::new(clouds(sources), clouds(targets), loss, config).unwrap()
    }

    #[test]
    fn fresh_engine_is_zeroed() {
        let c = Counters::default();
        let otd = engine(&[1, 2], &[3, 4, 5], counting(&c), PairwiseConfig::default());
        assert_eq!(otd.otd_matrix().dim(), (2, 3));
        assert!(otd.otd_matrix().iter().all(|&v| v == 0.0));
        assert!(otd.time_matrix().iter().all(|&v| v == 0.0));
        assert!(!otd.is_computed());
        assert_eq!(otd.source_names(), ["sample_0", "sample_1"]);
        assert_eq!(c.losses.get(), 0);
    }

    #[test]
    fn sources_become_tracked() {
        let c = Counters::default();
        let otd = engine(&[1, 2], &[1], counting(&c), PairwiseConfig::default());
        assert!(otd.sources().iter().all(PointCloud::requires_grad));
        assert!(otd.targets().iter().all(|t| !t.requires_grad()));
    }

    #[test]
    fn compute_fills_every_cell() {
        let c = Counters::default();
        let mut otd = engine(&[1, 2], &[3, 4], counting(&c), PairwiseConfig::default());
        otd.compute().unwrap();
        assert!(otd.is_computed());
        assert_eq!(otd.otd_array(), vec![vec![13.0, 14.0], vec![23.0, 24.0]]);
        assert_eq!(c.losses.get(), 4);
        assert!(otd.time_matrix().iter().all(|&t| t >= 0.0));
    }

    #[test]
    fn skipped_pairs_stay_zero_and_have_no_gradient() {
        let c = Counters::default();
        let config = PairwiseConfig::default().with_skip(SkipPolicy::diagonal());
        let mut otd = engine(&[1, 2], &[3, 4], counting(&c), config);
        otd.compute().unwrap();
        assert_eq!(otd.otd_array(), vec![vec![0.0, 14.0], vec![23.0, 0.0]]);
        assert_eq!(c.losses.get(), 2);
        assert!(matches!(
            otd.displacement_map(1, 1),
            Err(Error::NotDifferentiable {
                source_index: 1,
                target_index: 1
            })
        ));
        let all = otd.displacement_maps().unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all.is_cached(0, 0));
    }

    #[test]
    fn displacement_before_compute_fails() {
        let c = Counters::default();
        let mut otd = engine(&[1], &[1], counting(&c), PairwiseConfig::default());
        assert!(matches!(otd.displacement_map(0, 0), Err(Error::Precompute)));
        assert!(matches!(otd.compute_all_displacement_maps(), Err(Error::Precompute)));
    }

    #[test]
    fn name_count_must_match() {
        let c = Counters::default();
        let config = PairwiseConfig::default().with_target_names(["only_one"]);
        let err = OtdPairwise::new(clouds(&[1]), clouds(&[1, 1]), counting(&c), config)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Validation {
                what: "targets",
                clouds: 2,
                names: 1
            }
        ));
    }

    #[test]
    fn map_is_negated_gradient_times_point_count() {
        let c = Counters::default();
        let mut otd = engine(&[4], &[2], counting(&c), PairwiseConfig::default());
        otd.compute().unwrap();
        let map = otd.displacement_map(0, 0).unwrap();
        assert_eq!(map.dim(), (4, 2));
        assert!(map.iter().all(|&v| v == -2.0));
    }

    #[test]
    fn cached_map_is_not_recomputed() {
        let c = Counters::default();
        let mut otd = engine(&[3], &[3], counting(&c), PairwiseConfig::default());
        otd.compute().unwrap();
        otd.displacement_map(0, 0).unwrap();
        otd.displacement_map(0, 0).unwrap();
        assert_eq!(c.gradients.get(), 1);
        otd.compute_displacement_map(0, 0).unwrap();
        assert_eq!(c.gradients.get(), 2);
        otd.displacement_maps().unwrap();
        assert_eq!(c.gradients.get(), 2);
        assert!(otd.is_displacement_all_computed());
    }

    #[test]
    fn out_of_range_pair() {
        let c = Counters::default();
        let mut otd = engine(&[1], &[1], counting(&c), PairwiseConfig::default());
        otd.compute().unwrap();
        assert!(matches!(
            otd.displacement_map(0, 1),
            Err(Error::IndexOutOfRange {
                n_sources: 1,
                n_targets: 1,
                ..
            })
        ));
        assert!(matches!(otd.plot(3, 0, None), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn failing_pair_aborts_the_pass() {
        let calls = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&calls);
        let flaky = FnDivergence::new(move |_: &PointCloud, _: &PointCloud| {
            counter.set(counter.get() + 1);
            if counter.get() == 2 {
                return Err(Error::Domain("boom"));
            }
            Ok(Loss::new(1.5))
        });
        let mut otd = engine(&[1], &[1, 1, 1], flaky, PairwiseConfig::default());
        assert!(matches!(otd.compute(), Err(Error::Domain("boom"))));
        assert_eq!(calls.get(), 2);
        assert_eq!(otd.otd_array(), vec![vec![1.5, 0.0, 0.0]]);
        assert!(!otd.is_computed());
    }

    #[test]
    fn aborted_pass_leaves_last_snapshot_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.csv");
        let calls = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&calls);
        let flaky = FnDivergence::new(move |_: &PointCloud, _: &PointCloud| {
            counter.set(counter.get() + 1);
            if counter.get() == 2 {
                return Err(Error::Domain("boom"));
            }
            Ok(Loss::new(1.5))
        });
        let config = PairwiseConfig::default().with_intermediate_file(&path);
        let mut otd = engine(&[1], &[1, 1, 1], flaky, config);
        assert!(otd.compute().is_err());
        let csv = std::fs::read_to_string(&path).unwrap();
        assert_eq!(csv, ",sample_0,sample_1,sample_2\nsample_0,1.5,0.0,0.0\n");
    }

    #[test]
    fn loss_without_graph_is_not_differentiable() {
        let plain = FnDivergence::new(|_: &PointCloud, _: &PointCloud| Ok(Loss::new(0.25)));
        let mut otd = engine(&[2], &[2], plain, PairwiseConfig::default());
        otd.compute().unwrap();
        assert!(matches!(
            otd.compute_displacement_map(0, 0),
            Err(Error::NotDifferentiable { .. })
        ));
    }

    #[test]
    fn table_output_uses_names() {
        let c = Counters::default();
        let config = PairwiseConfig::default()
            .with_source_names(["a"])
            .with_target_names(["x", "y"])
            .with_output_format(OutputFormat::Table);
        let mut otd = engine(&[1], &[1, 2], counting(&c), config);
        otd.compute().unwrap();
        match otd.output() {
            PairwiseOutput::Table(t) => {
                assert_eq!(t.get_by_name("a", "y"), Some(12.0));
                assert_eq!(t.to_csv_string().unwrap(), ",x,y\na,11.0,12.0\n");
            }
            other => panic!("expected a table, got {other:?}"),
        }
        assert_eq!(otd.time_table().col_names(), ["x", "y"]);
    }

    #[test]
    fn intermediate_file_holds_latest_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.csv");
        let c = Counters::default();
        let config = PairwiseConfig::default()
            .with_verbose(true)
            .with_intermediate_file(&path);
        let mut otd = engine(&[1], &[1, 2], counting(&c), config);
        otd.compute().unwrap();
        let csv = std::fs::read_to_string(&path).unwrap();
        assert_eq!(csv, ",sample_0,sample_1\nsample_0,11.0,12.0\n");
    }

    #[test]
    fn output_format_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&OutputFormat::Table).unwrap(), "\"table\"");
    }

    proptest! {
        #[test]
        fn gradients_evaluated_once_per_distinct_pair(
            requests in prop::collection::vec((0usize..3, 0usize..2), 0..20),
        ) {
            let c = Counters::default();
            let mut otd = engine(&[1, 2, 3], &[2, 2], counting(&c), PairwiseConfig::default());
            otd.compute().unwrap();
            let mut distinct = std::collections::BTreeSet::new();
            for &(i, j) in &requests {
                let map = otd.displacement_map(i, j).unwrap().clone();
                distinct.insert((i, j));
                prop_assert_eq!(map.nrows(), i + 1);
            }
            prop_assert_eq!(c.gradients.get(), distinct.len());
        }
    }
}
