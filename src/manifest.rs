//! Weight-map manifests for checkpoints split across multiple files.
//!
//! A multi-file checkpoint ships an index file mapping every tensor name to
//! the data file holding it. Resolution answers "which file do I open for
//! this component" without touching any data file.

use crate::selector::Selector;
use crate::types::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// File name of the manifest indexing a multi-file checkpoint.
pub const MANIFEST_FILE_NAME: &str = "model.safetensors.index.json";

/// Manifest mapping tensor names to the physical file holding each.
///
/// Entries are kept sorted by tensor name so resolution is deterministic.
#[derive(Debug, Deserialize)]
pub struct WeightManifest {
    weight_map: BTreeMap<String, String>,
}

/// Outcome of resolving a selector against a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Data file holding the matched tensors — the first of them, when the
    /// matches are split across files.
    pub file_name: String,
    /// False when matches spill into files other than `file_name`; the
    /// caller must recover those separately.
    pub covers_all_matches: bool,
}

impl WeightManifest {
    /// Load a manifest from its index file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&content).map_err(|err| {
            Error::ParseError(format!("{}: invalid weight map: {err}", path.display()))
        })?;
        log::debug!(
            "Loaded weight map with {} entries from {}",
            manifest.weight_map.len(),
            path.display()
        );
        Ok(manifest)
    }

    /// True when `dir` holds a multi-file checkpoint.
    pub fn is_present(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE_NAME).exists()
    }

    /// Number of tensor entries in the manifest.
    pub fn len(&self) -> usize {
        self.weight_map.len()
    }

    /// True when the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.weight_map.is_empty()
    }

    /// Resolve the data file holding the tensors matched by `selector`.
    ///
    /// When the matches span several files, the first observed file is
    /// returned with `covers_all_matches = false` and the remaining tensors
    /// must be recovered by the caller.
    pub fn resolve(&self, selector: &Selector) -> Result<Resolution> {
        let mut files: Vec<&str> = Vec::new();
        for (tensor_name, file_name) in &self.weight_map {
            if !selector.matches(tensor_name) {
                continue;
            }
            if !files.contains(&file_name.as_str()) {
                files.push(file_name);
            }
        }

        let Some(first) = files.first() else {
            return Err(Error::EmptyMatch(selector.to_string()));
        };
        if files.len() > 1 {
            log::warn!(
                "Tensors matching '{selector}' span {} files; reading only {first}",
                files.len()
            );
        }
        Ok(Resolution {
            file_name: (*first).to_string(),
            covers_all_matches: files.len() == 1,
        })
    }
}
