use otcyto::{
    Error, OtdPairwise, OutputFormat, PairwiseConfig, PairwiseOutput, PointCloud, SamplesLoss,
    SkipPolicy,
};
use tempfile::TempDir;

fn panel() -> Vec<PointCloud> {
    (0..3)
        .map(|k| PointCloud::gaussian(40, 2, k as f32, 1.0, 100 + k as u64))
        .collect()
}

#[test]
fn self_distances_vanish_and_matrix_is_symmetric() {
    // Sources and targets are the same three samples.
    let loss = SamplesLoss::default().with_blur(0.1);
    let mut otd = OtdPairwise::new(panel(), panel(), loss, PairwiseConfig::default()).unwrap();
    otd.compute().unwrap();

    let d = otd.otd_matrix();
    for i in 0..3 {
        assert!(d[[i, i]].abs() < 1e-4, "diagonal {} = {}", i, d[[i, i]]);
        for j in 0..3 {
            assert!((d[[i, j]] - d[[j, i]]).abs() < 1e-2, "asymmetric at ({}, {})", i, j);
        }
    }
    // Farther means cost more.
    assert!(d[[0, 2]] > d[[0, 1]]);
}

#[test]
fn diagonal_skip_leaves_zeros_and_saves_time() {
    let config = PairwiseConfig::default().with_skip(SkipPolicy::diagonal());
    let mut otd = OtdPairwise::with_default_loss(panel(), panel(), config).unwrap();
    otd.compute().unwrap();
    for i in 0..3 {
        assert_eq!(otd.otd_matrix()[[i, i]], 0.0);
        assert_eq!(otd.time_matrix()[[i, i]], 0.0);
    }
    assert!(otd.otd_matrix()[[0, 1]] > 0.0);
    assert!(matches!(otd.displacement_map(2, 2), Err(Error::NotDifferentiable { .. })));
}

#[test]
fn intermediate_file_matches_final_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("otd_partial.csv");
    let config = PairwiseConfig::default()
        .with_source_names(["ctrl", "stim", "late"])
        .with_target_names(["ref_a", "ref_b", "ref_c"])
        .with_intermediate_file(&path)
        .with_output_format(OutputFormat::Table);
    let mut otd = OtdPairwise::with_default_loss(panel(), panel(), config).unwrap();
    otd.compute().unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.starts_with(",ref_a,ref_b,ref_c\nctrl,"));
    assert_eq!(written, otd.otd_table().to_csv_string().unwrap());

    match otd.output() {
        PairwiseOutput::Table(t) => assert_eq!(t.row_names(), ["ctrl", "stim", "late"]),
        PairwiseOutput::Array(_) => panic!("configured for a table"),
    }
}

#[test]
fn save_intermediate_on_demand() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("otd.csv");
    let otd = OtdPairwise::with_default_loss(panel(), panel(), PairwiseConfig::default()).unwrap();
    otd.save_intermediate(&path).unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.lines().count(), 4);
    assert!(written.lines().nth(1).unwrap().ends_with(",0.0,0.0,0.0"));
}

#[test]
fn solver_errors_propagate() {
    let sources = vec![PointCloud::gaussian(10, 2, 0.0, 1.0, 1)];
    let targets = vec![PointCloud::gaussian(10, 3, 0.0, 1.0, 2)];
    let mut otd =
        OtdPairwise::with_default_loss(sources, targets, PairwiseConfig::default()).unwrap();
    assert!(matches!(otd.compute(), Err(Error::DimensionMismatch(2, 3))));
    assert!(!otd.is_computed());
}

#[test]
fn mismatched_names_are_rejected() {
    let config = PairwiseConfig::default().with_source_names(["a", "b"]);
    let err = OtdPairwise::with_default_loss(panel(), panel(), config).err().unwrap();
    assert_eq!(
        err.to_string(),
        "the number of sources (3) and sources names (2) must be equal"
    );
}
