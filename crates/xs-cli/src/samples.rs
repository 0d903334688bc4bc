//! Sample list: which event tables to read and how to classify them.
//!
//! ```yaml
//! samples:
//!   - name: nu_overlay_run1
//!     category: overlay
//!     path: run1/nu_overlay        # directory holding <tree>.parquet
//!     pot: 1.2e21
//!   - name: beam_on_run1
//!     category: on_beam
//!     path: run1/beam_on.parquet
//! ```
//!
//! A bare list of entries is accepted too. Relative paths are resolved
//! against the directory of the list file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use xs_core::{Sample, SampleCategory};
use xs_frame::{EventFrame, read_parquet_frame};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleEntry {
    pub name: String,
    pub category: String,
    pub path: PathBuf,
    #[serde(default)]
    pub pot: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SampleListFile {
    Wrapped { samples: Vec<SampleEntry> },
    Bare(Vec<SampleEntry>),
}

pub fn read_sample_list(path: &Path) -> Result<Vec<SampleEntry>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading sample list {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let file: SampleListFile = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml_ng::from_slice(&bytes)?
    };
    let entries = match file {
        SampleListFile::Wrapped { samples } => samples,
        SampleListFile::Bare(samples) => samples,
    };
    for (i, e) in entries.iter().enumerate() {
        if entries[..i].iter().any(|p| p.name == e.name) {
            bail!("duplicate sample name '{}' in {}", e.name, path.display());
        }
    }
    Ok(entries)
}

/// Event-table file for a sample: the path itself when it is a file,
/// `<path>/<tree>.parquet` when it is a directory.
pub fn resolve_table_path(base: &Path, path: &Path, tree: &str) -> Result<PathBuf> {
    let full = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
    if full.is_dir() {
        let table = full.join(format!("{tree}.parquet"));
        if !table.is_file() {
            bail!("no table '{tree}' in {}", full.display());
        }
        return Ok(table);
    }
    if !full.is_file() {
        bail!("sample path {} does not exist", full.display());
    }
    Ok(full)
}

/// Read every sample of the list into memory.
pub fn load_samples(list: &Path, tree: &str) -> Result<Vec<Sample<EventFrame>>> {
    let base = list.parent().unwrap_or(Path::new("."));
    let mut samples = Vec::new();
    for entry in read_sample_list(list)? {
        let category: SampleCategory = entry
            .category
            .parse()
            .with_context(|| format!("sample '{}'", entry.name))?;
        let table_path = resolve_table_path(base, &entry.path, tree)
            .with_context(|| format!("sample '{}'", entry.name))?;
        let frame = read_parquet_frame(&table_path)
            .with_context(|| format!("reading {}", table_path.display()))?;
        tracing::info!(
            sample = %entry.name,
            category = %category,
            events = frame.n_rows(),
            "sample loaded"
        );
        let mut sample = Sample::new(entry.name, category, frame);
        if let Some(pot) = entry.pot {
            sample = sample.with_pot(pot);
        }
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_and_bare_lists() {
        let dir = std::env::temp_dir().join(format!("xsyst_samples_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let yaml = dir.join("samples.yaml");
        std::fs::write(
            &yaml,
            "samples:\n  - {name: nu, category: overlay, path: nu.parquet, pot: 1.0e20}\n",
        )
        .unwrap();
        let entries = read_sample_list(&yaml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pot, Some(1.0e20));

        let json = dir.join("samples.json");
        std::fs::write(&json, r#"[{"name": "ext", "category": "off_beam", "path": "ext"}]"#)
            .unwrap();
        let entries = read_sample_list(&json).unwrap();
        assert_eq!(entries[0].category, "off_beam");
        assert_eq!(entries[0].pot, None);

        let dup = dir.join("dup.yaml");
        std::fs::write(
            &dup,
            "- {name: a, category: dirt, path: a}\n- {name: a, category: dirt, path: b}\n",
        )
        .unwrap();
        assert!(read_sample_list(&dup).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn table_path_resolution() {
        let dir = std::env::temp_dir().join(format!("xsyst_resolve_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("run1")).unwrap();
        std::fs::write(dir.join("run1/events.parquet"), b"").unwrap();
        std::fs::write(dir.join("flat.parquet"), b"").unwrap();

        assert_eq!(
            resolve_table_path(&dir, Path::new("run1"), "events").unwrap(),
            dir.join("run1/events.parquet")
        );
        assert_eq!(
            resolve_table_path(&dir, Path::new("flat.parquet"), "events").unwrap(),
            dir.join("flat.parquet")
        );
        assert!(resolve_table_path(&dir, Path::new("run1"), "nuselection").is_err());
        assert!(resolve_table_path(&dir, Path::new("missing.parquet"), "events").is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
