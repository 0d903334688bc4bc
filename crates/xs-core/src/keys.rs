//! Hierarchical key scheme of the template store.
//!
//! ```text
//! {sample}/hists/{template}                              nominal
//! {sample}/systs/{syst}/{variation}/hists/{template}     variation
//! {sample}/meta/{field}                                  sample metadata
//! __global__/meta/systs/{syst}/{field}                   systematic metadata
//! ```

/// Pseudo-sample holding run-wide metadata.
pub const GLOBAL: &str = "__global__";

/// Label of the upward variation.
pub const POS: &str = "pos";

/// Label of the downward variation.
pub const NEG: &str = "neg";

/// Key of a nominal template.
pub fn nominal(sample: &str, template: &str) -> String {
    format!("{sample}/hists/{template}")
}

/// Key of a systematic variation of a template.
pub fn variation(sample: &str, syst: &str, variation: &str, template: &str) -> String {
    format!("{sample}/systs/{syst}/{variation}/hists/{template}")
}

/// Key of a per-sample metadata field.
pub fn sample_meta(sample: &str, field: &str) -> String {
    format!("{sample}/meta/{field}")
}

/// Key of a systematic-level metadata field.
pub fn syst_meta(syst: &str, field: &str) -> String {
    format!("{GLOBAL}/meta/systs/{syst}/{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(nominal("nu_run1", "muon_p"), "nu_run1/hists/muon_p");
        assert_eq!(
            variation("nu_run1", "GENIE_mode000", POS, "muon_p"),
            "nu_run1/systs/GENIE_mode000/pos/hists/muon_p"
        );
        assert_eq!(sample_meta("nu_run1", "pot"), "nu_run1/meta/pot");
        assert_eq!(syst_meta("GENIE", "nmodes"), "__global__/meta/systs/GENIE/nmodes");
    }
}
