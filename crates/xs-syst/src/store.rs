//! File-backed [`TemplateStore`]: one JSON document holding every entry.
//!
//! Writes go to an in-memory ordered map; [`TemplateStore::commit`] rewrites
//! the file through a sibling temp file and a rename, so a crash never
//! leaves a half-written store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xs_core::{BinnedVector, Error, MetaValue, Result, TemplateStore};

const FORMAT: &str = "xsyst_template_store_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Entry {
    Hist(BinnedVector),
    Meta { value: MetaValue },
}

#[derive(Deserialize)]
struct Document {
    format: String,
    entries: BTreeMap<String, Entry>,
}

/// JSON template store.
#[derive(Debug, Default)]
pub struct JsonTemplateStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Entry>,
    dirty: bool,
}

impl JsonTemplateStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| store_err(&path, e))?;
            let doc: Document = serde_json::from_slice(&bytes).map_err(|e| store_err(&path, e))?;
            if doc.format != FORMAT {
                return Err(Error::StoreIo(format!(
                    "{}: unsupported store format '{}'",
                    path.display(),
                    doc.format
                )));
            }
            doc.entries
        } else {
            BTreeMap::new()
        };
        log::debug!("opened template store {} ({} entries)", path.display(), entries.len());
        Ok(Self { path: Some(path), entries, dirty: false })
    }

    /// Store without a backing file; `commit` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether there are writes not yet committed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn store_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::StoreIo(format!("{}: {e}", path.display()))
}

impl TemplateStore for JsonTemplateStore {
    fn read_hist(&self, key: &str) -> Result<Option<BinnedVector>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Hist(h)) => Ok(Some(h.clone())),
            Some(Entry::Meta { .. }) => {
                Err(Error::DataAvailability(format!("'{key}' holds metadata, not a histogram")))
            }
        }
    }

    fn write_hist(&mut self, key: &str, hist: BinnedVector) -> Result<()> {
        if hist.content.len() != hist.binning.n_bins || hist.sumw2.len() != hist.binning.n_bins {
            return Err(Error::DegenerateInput(format!(
                "'{key}': {} bins declared, {} contents, {} sumw2",
                hist.binning.n_bins,
                hist.content.len(),
                hist.sumw2.len()
            )));
        }
        // JSON has no representation for NaN or infinities.
        if hist.content.iter().chain(&hist.sumw2).any(|v| !v.is_finite()) {
            return Err(Error::DegenerateInput(format!("'{key}': non-finite bin content")));
        }
        self.entries.insert(key.to_string(), Entry::Hist(hist));
        self.dirty = true;
        Ok(())
    }

    fn read_meta(&self, key: &str) -> Result<Option<MetaValue>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Meta { value }) => Ok(Some(value.clone())),
            Some(Entry::Hist(_)) => {
                Err(Error::DataAvailability(format!("'{key}' holds a histogram, not metadata")))
            }
        }
    }

    fn write_meta(&mut self, key: &str, value: MetaValue) -> Result<()> {
        if let MetaValue::Number(x) = value {
            if !x.is_finite() {
                return Err(Error::DegenerateInput(format!("'{key}': non-finite value {x}")));
            }
        }
        self.entries.insert(key.to_string(), Entry::Meta { value });
        self.dirty = true;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn commit(&mut self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty && path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| store_err(dir, e))?;
        }
        let doc = DocumentRef { format: FORMAT, entries: &self.entries };
        let bytes = serde_json::to_vec(&doc).map_err(|e| store_err(path, e))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes).map_err(|e| store_err(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| store_err(path, e))?;
        log::debug!("committed {} entries to {}", self.entries.len(), path.display());
        self.dirty = false;
        Ok(())
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    format: &'a str,
    entries: &'a BTreeMap<String, Entry>,
}
