use approx::assert_relative_eq;
use nalgebra::DMatrix;
use xs_core::{Sample, SampleCategory, TemplateStore};
use xs_frame::{EventFrame, FrameEngine, JaggedColumn};
use xs_syst::{
    BuildOptions, EigenmodeSelector, JsonTemplateStore, MultisimCovarianceBuilder, MultisimSpec,
    NominalBuilder, Spectrum, SystematicsConfig, SystematicsOrchestrator, TemplateCatalog,
};

const CATALOG: &str = "a\tA\t\tx\t\t2\t0\t2\nb\tB\t\ty\t\t2\t0\t2\n";

/// Two templates of two bins: T0 = [10, 20, 5, 15], universes
/// T1 = [12, 18, 5, 15] and T2 = [8, 22, 5, 15].
fn scenario_sample() -> Sample<EventFrame> {
    let frame = EventFrame::new()
        .with_column("x", vec![0.5, 1.5, 5.0, 5.0])
        .unwrap()
        .with_column("y", vec![5.0, 5.0, 0.5, 1.5])
        .unwrap()
        .with_column("w", vec![10.0, 20.0, 5.0, 15.0])
        .unwrap()
        .with_jagged(
            "weightsGenie",
            JaggedColumn::from_rows(&[[1.2, 0.8], [0.9, 1.1], [1.0, 1.0], [1.0, 1.0]]),
        )
        .unwrap();
    Sample::new("nu", SampleCategory::Overlay, frame)
}

fn expected_covariance() -> DMatrix<f64> {
    DMatrix::from_row_slice(
        4,
        4,
        &[
            4.0, -4.0, 0.0, 0.0, //
            -4.0, 4.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0,
        ],
    )
}

#[test]
fn two_universe_scenario_covariance_has_single_mode() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let sample = scenario_sample();
    let mut store = JsonTemplateStore::in_memory();
    NominalBuilder::new(&engine, &cat, "w").write(&sample, &mut store).unwrap();

    let spec = MultisimSpec::new("GENIE", "weightsGenie");
    let cov = MultisimCovarianceBuilder::new(&engine, &cat, "w")
        .build(&[&sample], &spec, &store)
        .expect("covariance build");

    assert_eq!(cov.n_universes, 2);
    assert_eq!(cov.layout.len(), 4);
    assert_eq!(cov.nominal, vec![10.0, 20.0, 5.0, 15.0]);
    assert!(cov.thetas.is_empty());
    assert_eq!(cov.sigma_theta, None);
    let expected = expected_covariance();
    for i in 0..4 {
        for j in 0..4 {
            assert_relative_eq!(cov.covariance[(i, j)], expected[(i, j)], epsilon = 1e-9);
        }
    }

    let spectrum = Spectrum::of(&cov.covariance);
    let nonzero = spectrum.eigenvalues().iter().filter(|l| l.abs() > 1e-9).count();
    assert_eq!(nonzero, 1);
    assert_relative_eq!(spectrum.eigenvalues()[0], 8.0, epsilon = 1e-9);

    let modes = EigenmodeSelector::for_spec(&spec).select(&cov.covariance);
    assert_eq!(modes.len(), 1);
}

#[test]
fn universe_batching_does_not_change_the_result() {
    let engine = FrameEngine::new();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let sample = scenario_sample();
    let mut store = JsonTemplateStore::in_memory();
    NominalBuilder::new(&engine, &cat, "w").write(&sample, &mut store).unwrap();
    let spec = MultisimSpec::new("GENIE", "weightsGenie").split_rate_shape(true);

    let all = MultisimCovarianceBuilder::new(&engine, &cat, "w")
        .build(&[&sample], &spec, &store)
        .unwrap();
    let one_by_one = MultisimCovarianceBuilder::new(&engine, &cat, "w")
        .universe_batch(Some(1))
        .build(&[&sample], &spec, &store)
        .unwrap();
    assert_eq!(all.covariance, one_by_one.covariance);
    assert_eq!(all.thetas, one_by_one.thetas);
}

#[test]
fn scenario_through_orchestrator_writes_one_mode() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![scenario_sample()];
    let options = BuildOptions { nominal_weight: "w".into(), ..BuildOptions::default() };
    let config = SystematicsConfig {
        unisim: Vec::new(),
        multisim: vec![MultisimSpec::new("GENIE", "weightsGenie")],
    };
    let mut store = JsonTemplateStore::in_memory();
    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config, &mut store)
        .unwrap();
    assert!(report.is_success(), "{report}");

    let modes: Vec<String> = store
        .keys("nu/systs/")
        .into_iter()
        .filter(|k| k.ends_with("/pos/hists/a"))
        .collect();
    assert_eq!(modes, ["nu/systs/GENIE_mode000/pos/hists/a"]);
    assert_eq!(
        store.read_meta("__global__/meta/systs/GENIE/nmodes").unwrap(),
        Some(1usize.into())
    );

    let up = store.read_hist("nu/systs/GENIE_mode000/pos/hists/a").unwrap().unwrap();
    let down = store.read_hist("nu/systs/GENIE_mode000/neg/hists/a").unwrap().unwrap();
    // stdev = sqrt(8), eigenvector (1, -1, 0, 0) / sqrt(2) up to sign.
    assert_relative_eq!((up.content[0] - 10.0).abs(), 2.0, epsilon = 1e-9);
    assert_relative_eq!(up.content[0] - 10.0, -(up.content[1] - 20.0), epsilon = 1e-9);
    assert_relative_eq!(up.content[0] + down.content[0], 20.0, epsilon = 1e-9);
    let b_up = store.read_hist("nu/systs/GENIE_mode000/pos/hists/b").unwrap().unwrap();
    assert_relative_eq!(b_up.content[0], 5.0, epsilon = 1e-9);
    assert_relative_eq!(b_up.content[1], 15.0, epsilon = 1e-9);
}
