use approx::assert_relative_eq;
use xs_core::{
    BinnedVector, ErrorKind, MetaValue, Result, Sample, SampleCategory, TemplateStore,
};
use xs_frame::{EventFrame, FrameEngine, JaggedColumn};
use xs_syst::{
    BuildOptions, JsonTemplateStore, MultisimSpec, SystematicsConfig, SystematicsOrchestrator,
    TemplateCatalog, UnisimSpec,
};

const CATALOG: &str = "\
name\ttitle\tselection\tvariable\tweight\tbin_count\tx_min\tx_max
a\tA\t\tx\t\t2\t0\t2
b\tB\ty > 0\ty\t\t2\t0\t2
";

fn overlay() -> Sample<EventFrame> {
    let frame = EventFrame::new()
        .with_column("x", vec![0.5, 1.5, 0.5, 1.5])
        .unwrap()
        .with_column("y", vec![0.5, 0.5, 1.5, 1.5])
        .unwrap()
        .with_column("w", vec![1.0, 2.0, 1.0, 1.5])
        .unwrap()
        .with_column("knobRPAup", vec![1.1, 1.0, 0.9, 1.2])
        .unwrap()
        .with_column("knobRPAdn", vec![0.9, 1.0, 1.1, 0.8])
        .unwrap()
        .with_column("rootino", vec![1.0, 1.3, 1.0, 1.0])
        .unwrap()
        .with_jagged(
            "weightsGenie",
            JaggedColumn::from_rows(&[
                vec![1.1, 0.9, 1.0],
                vec![0.8, 1.3, 1.0],
                vec![1.0, 1.0, 1.2],
                vec![0.9, 1.1, 0.7],
            ]),
        )
        .unwrap()
        .with_jagged("weightsFlat", JaggedColumn::from_rows(&[[1.0, 1.0]; 4]))
        .unwrap();
    Sample::new("nu_overlay", SampleCategory::Overlay, frame).with_pot(1.0e21)
}

fn dirt() -> Sample<EventFrame> {
    let frame = EventFrame::new()
        .with_column("x", vec![0.5, 1.5])
        .unwrap()
        .with_column("y", vec![0.5, 1.5])
        .unwrap()
        .with_column("w", vec![0.5, 1.0])
        .unwrap()
        .with_column("knobRPAup", vec![1.0, 1.1])
        .unwrap()
        .with_column("knobRPAdn", vec![1.0, 0.9])
        .unwrap()
        .with_column("rootino", vec![1.0, 1.0])
        .unwrap()
        .with_jagged("weightsGenie", JaggedColumn::from_rows(&[[1.2, 0.8, 1.0], [1.0, 1.0, 0.9]]))
        .unwrap()
        .with_jagged("weightsFlat", JaggedColumn::from_rows(&[[1.0, 1.0]; 2]))
        .unwrap();
    Sample::new("dirt", SampleCategory::Dirt, frame)
}

fn beam_on() -> Sample<EventFrame> {
    let frame = EventFrame::new()
        .with_column("x", vec![0.5, 0.7, 1.2])
        .unwrap()
        .with_column("y", vec![1.0, 1.0, 1.0])
        .unwrap();
    Sample::new("beam_on", SampleCategory::OnBeam, frame)
}

fn config() -> SystematicsConfig {
    SystematicsConfig {
        unisim: vec![
            UnisimSpec::new("RPA", "knobRPAup", "knobRPAdn").log_normal(true),
            UnisimSpec::one_sided("RootinoFix", "rootino").floatable(true),
            UnisimSpec::new("CCMEC", "knobCCMECup", "knobCCMECdn"),
        ],
        multisim: vec![
            MultisimSpec::new("GENIE", "weightsGenie").keep_fraction(0.95).split_rate_shape(true),
            MultisimSpec::new("flat", "weightsFlat"),
        ],
    }
}

fn options() -> BuildOptions {
    BuildOptions { nominal_weight: "w".into(), ..BuildOptions::default() }
}

fn hist(store: &impl TemplateStore, key: &str) -> BinnedVector {
    store.read_hist(key).unwrap().unwrap_or_else(|| panic!("missing {key}"))
}

#[test]
fn build_all_writes_every_systematic_and_reports_failures() {
    let engine = FrameEngine::new();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![overlay(), dirt(), beam_on()];
    let options = options();
    let mut store = JsonTemplateStore::in_memory();

    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config(), &mut store)
        .expect("run completes");

    assert_eq!(report.completed, ["RPA", "RootinoFix", "GENIE", "GENIE_rate", "flat"]);
    assert!(report.skipped.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "CCMEC");
    assert_eq!(report.failed[0].error.kind(), ErrorKind::DataAvailability);
    assert!(store.keys("").iter().all(|k| !k.contains("CCMEC")));

    // Nominals for every sample, variations only for simulation.
    for s in ["nu_overlay", "dirt", "beam_on"] {
        assert_eq!(store.keys(&format!("{s}/hists/")).len(), 2, "{s}");
    }
    assert_eq!(hist(&store, "beam_on/hists/a").content, vec![2.0, 1.0]);
    assert!(store.keys("beam_on/systs/").is_empty());
    assert_eq!(
        store.read_meta("nu_overlay/meta/pot").unwrap(),
        Some(MetaValue::Number(1.0e21))
    );

    // Unisim metadata is per systematic, not per sample.
    let meta = |syst: &str, field: &str| {
        store.read_meta(&format!("__global__/meta/systs/{syst}/{field}")).unwrap()
    };
    assert_eq!(meta("RPA", "type"), Some("unisim".into()));
    assert_eq!(meta("RPA", "log_normal"), Some(true.into()));
    assert_eq!(meta("RootinoFix", "floatable"), Some(true.into()));

    let up = hist(&store, "nu_overlay/systs/RPA/pos/hists/a");
    assert_relative_eq!(up.content[0], 1.1 + 0.9, epsilon = 1e-12);
    assert_relative_eq!(up.content[1], 2.0 + 1.8, epsilon = 1e-12);
    for s in ["nu_overlay", "dirt"] {
        for t in ["a", "b"] {
            let nominal = hist(&store, &format!("{s}/hists/{t}"));
            let down = hist(&store, &format!("{s}/systs/RootinoFix/neg/hists/{t}"));
            assert_eq!(down, nominal, "{s}/{t}");
        }
    }

    // Multisim: modes, rate, and the zero-variance systematic.
    assert_eq!(meta("GENIE", "type"), Some("multisim_eigen".into()));
    assert_eq!(meta("GENIE", "nuniv"), Some(3usize.into()));
    let nmodes = meta("GENIE", "nmodes").and_then(|m| m.as_f64()).unwrap() as usize;
    assert!(nmodes >= 1);
    for m in 0..nmodes {
        let mode = format!("GENIE_mode{m:03}");
        assert_eq!(meta(&mode, "type"), Some("eigenmode".into()));
        assert_eq!(meta(&mode, "parent"), Some("GENIE".into()));
        for s in ["nu_overlay", "dirt"] {
            for t in ["a", "b"] {
                let nominal = hist(&store, &format!("{s}/hists/{t}"));
                let up = hist(&store, &format!("{s}/systs/{mode}/pos/hists/{t}"));
                let down = hist(&store, &format!("{s}/systs/{mode}/neg/hists/{t}"));
                assert_eq!(up.sumw2, nominal.sumw2);
                for i in 0..2 {
                    assert_relative_eq!(
                        up.content[i] + down.content[i],
                        2.0 * nominal.content[i],
                        epsilon = 1e-9
                    );
                }
            }
        }
    }

    let sigma = meta("GENIE_rate", "sigma_theta").and_then(|m| m.as_f64()).unwrap();
    assert!(sigma > 0.0);
    assert_eq!(meta("GENIE_rate", "type"), Some("rate".into()));
    assert_eq!(meta("GENIE_rate", "log_normal"), Some(true.into()));
    let nominal = hist(&store, "dirt/hists/b");
    let rate_up = hist(&store, "dirt/systs/GENIE_rate/pos/hists/b");
    let rate_down = hist(&store, "dirt/systs/GENIE_rate/neg/hists/b");
    for i in 0..2 {
        assert_relative_eq!(rate_up.content[i], nominal.content[i] * sigma.exp(), epsilon = 1e-12);
        assert_relative_eq!(
            rate_down.content[i],
            nominal.content[i] * (-sigma).exp(),
            epsilon = 1e-12
        );
    }

    assert_eq!(meta("flat", "nmodes"), Some(0usize.into()));
    assert_eq!(meta("flat", "nuniv"), Some(2usize.into()));
    assert!(store.keys("").iter().all(|k| !k.contains("flat_mode")));
}

#[test]
fn rerun_overwrites_with_identical_content() {
    let engine = FrameEngine::new();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![overlay(), dirt()];
    let options = options();
    let orchestrator = SystematicsOrchestrator::new(&engine, &cat, &options);
    let mut store = JsonTemplateStore::in_memory();

    orchestrator.build_all(&samples, &config(), &mut store).unwrap();
    let keys = store.keys("");
    let first: Vec<_> =
        keys.iter().filter(|k| k.contains("/hists/")).map(|k| hist(&store, k)).collect();

    orchestrator.build_all(&samples, &config(), &mut store).unwrap();
    assert_eq!(store.keys(""), keys);
    let second: Vec<_> =
        keys.iter().filter(|k| k.contains("/hists/")).map(|k| hist(&store, k)).collect();
    assert_eq!(first, second);
}

#[test]
fn custom_policy_restricts_eligible_samples() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![overlay(), dirt()];
    let options = options();
    let mut store = JsonTemplateStore::in_memory();

    SystematicsOrchestrator::new(&engine, &cat, &options)
        .with_policy(|name: &str, _: SampleCategory| name != "dirt")
        .build_all(&samples, &config(), &mut store)
        .unwrap();

    assert!(store.keys("dirt/systs/").is_empty());
    assert!(!store.keys("nu_overlay/systs/GENIE_mode000/").is_empty());
}

#[test]
fn no_eligible_samples_skips_systematics() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![beam_on()];
    let options = options();
    let mut store = JsonTemplateStore::in_memory();

    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config(), &mut store)
        .unwrap();
    assert_eq!(report.skipped.len(), 5);
    assert!(report.completed.is_empty());
    assert_eq!(store.keys("__global__/").len(), 0);
}

#[test]
fn multisim_without_nominals_is_a_data_error() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![overlay()];
    let options = BuildOptions { skip_nominals: true, ..options() };
    let mut store = JsonTemplateStore::in_memory();

    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config(), &mut store)
        .unwrap();
    assert!(report.completed.contains(&"RPA".to_string()));
    let genie = report.failed.iter().find(|f| f.name == "GENIE").expect("GENIE failed");
    assert_eq!(genie.error.kind(), ErrorKind::DataAvailability);
    assert!(genie.error.to_string().contains("nu_overlay/hists/a"), "{}", genie.error);
}

/// Store whose commits always fail.
struct ReadOnlyStore(JsonTemplateStore);

impl TemplateStore for ReadOnlyStore {
    fn read_hist(&self, key: &str) -> Result<Option<BinnedVector>> {
        self.0.read_hist(key)
    }

    fn write_hist(&mut self, key: &str, hist: BinnedVector) -> Result<()> {
        self.0.write_hist(key, hist)
    }

    fn read_meta(&self, key: &str) -> Result<Option<MetaValue>> {
        self.0.read_meta(key)
    }

    fn write_meta(&mut self, key: &str, value: MetaValue) -> Result<()> {
        self.0.write_meta(key, value)
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.0.keys(prefix)
    }

    fn commit(&mut self) -> Result<()> {
        Err(xs_core::Error::StoreIo("read-only filesystem".into()))
    }
}

#[test]
fn store_failure_aborts_the_run() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![overlay()];
    let options = options();
    let mut store = ReadOnlyStore(JsonTemplateStore::in_memory());

    let err = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config(), &mut store)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreIo);
}

fn off_beam() -> Sample<EventFrame> {
    let frame = EventFrame::new()
        .with_column("x", vec![0.5, 0.5, 1.5])
        .unwrap()
        .with_column("y", vec![0.5, 1.5, 1.5])
        .unwrap()
        .with_column("w", vec![2.0, 2.0, 2.0])
        .unwrap()
        .with_column("extNorm", vec![1.0, 1.0, 1.0])
        .unwrap()
        .with_jagged("weightsFlat", JaggedColumn::from_rows(&[[1.0, 1.0]; 3]))
        .unwrap();
    Sample::new("ext", SampleCategory::OffBeam, frame)
}

#[test]
fn off_beam_variations_share_the_unit_nominal_weight() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let samples = vec![off_beam()];
    let options = BuildOptions { include_off_beam: true, ..options() };
    let config = SystematicsConfig {
        unisim: vec![UnisimSpec::new("ExtNorm", "extNorm", "extNorm")],
        multisim: vec![MultisimSpec::new("flat", "weightsFlat")],
    };
    let mut store = JsonTemplateStore::in_memory();

    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config, &mut store)
        .unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(report.completed, ["ExtNorm", "flat"]);

    let nominal = hist(&store, "ext/hists/a");
    assert_eq!(nominal.content, vec![2.0, 1.0]);
    for var in ["pos", "neg"] {
        assert_eq!(hist(&store, &format!("ext/systs/ExtNorm/{var}/hists/a")), nominal);
    }
    assert_eq!(
        store.read_meta("__global__/meta/systs/flat/nmodes").unwrap(),
        Some(0usize.into())
    );
    assert!(store.keys("ext/systs/flat_mode").is_empty());
}

#[test]
fn overflowing_sumw2_fails_only_that_systematic() {
    let engine = FrameEngine::sequential();
    let cat = TemplateCatalog::parse(CATALOG).unwrap();
    let hot = EventFrame::new()
        .with_column("x", vec![0.5])
        .unwrap()
        .with_column("y", vec![0.5])
        .unwrap()
        .with_column("w", vec![1.0e200])
        .unwrap()
        .with_column("knobRPAup", vec![1.1])
        .unwrap()
        .with_column("knobRPAdn", vec![0.9])
        .unwrap();
    let samples = vec![overlay(), Sample::new("hot", SampleCategory::Overlay, hot)];
    let options = options();
    let config = SystematicsConfig {
        unisim: vec![UnisimSpec::new("RPA", "knobRPAup", "knobRPAdn")],
        multisim: vec![],
    };
    let mut store = JsonTemplateStore::in_memory();

    let report = SystematicsOrchestrator::new(&engine, &cat, &options)
        .build_all(&samples, &config, &mut store)
        .expect("a non-finite sumw2 does not abort the run");

    let failed: Vec<_> = report.failed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, ["nominal:hot", "RPA"]);
    for f in &report.failed {
        assert_eq!(f.error.kind(), ErrorKind::DegenerateInput, "{}", f.error);
    }
    assert!(report.completed.is_empty());
    assert_eq!(store.keys("nu_overlay/hists/").len(), 2);
    assert!(store.keys("hot/").is_empty());
    assert!(store.keys("").iter().all(|k| !k.contains("RPA")));
}
