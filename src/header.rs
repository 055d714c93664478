//! Checkpoint header parsing and range-exact tensor reads.
//!
//! A safetensors file is laid out as:
//! - 8 bytes: little-endian `u64` header length `L`
//! - `L` bytes: UTF-8 JSON header, one entry per tensor
//! - raw tensor data, addressed by per-entry byte offsets
//!
//! [`CheckpointFile`] parses the header once and keeps the handle open so
//! matched tensors can be read by seeking to their exact byte ranges,
//! without materializing the rest of the file.

use crate::dtype::Dtype;
use crate::selector::Selector;
use crate::types::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Canonical file name of a single-file checkpoint.
pub const SINGLE_FILE_NAME: &str = "model.safetensors";
/// Extension shared by all checkpoint data files.
const CHECKPOINT_EXTENSION: &str = "safetensors";
/// Header key reserved for file-level metadata rather than a tensor entry.
const METADATA_KEY: &str = "__metadata__";
/// Byte length of the header length prefix.
const LENGTH_PREFIX_BYTES: u64 = 8;

/// One tensor's entry in a checkpoint header.
#[derive(Debug, Clone, Deserialize)]
pub struct TensorRecord {
    /// Declared dtype name, e.g. `"F32"` or `"BF16"`.
    pub dtype: String,
    /// Tensor dimensions.
    pub shape: Vec<usize>,
    /// Start and end byte offsets, relative to the data region.
    pub data_offsets: [u64; 2],
}

/// Parsed checkpoint header: where the data region starts and what it holds.
#[derive(Debug)]
pub struct CheckpointHeader {
    /// Absolute file offset of the first data byte (`8 + header length`).
    pub data_start: u64,
    /// Tensor entries keyed by name.
    pub entries: HashMap<String, TensorRecord>,
}

/// Raw tensor bytes with the declared dtype and shape, exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    /// Tensor dtype.
    pub dtype: Dtype,
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Raw tensor bytes as stored in the checkpoint.
    pub data: Vec<u8>,
}

impl RawTensor {
    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Tensors loaded for one component, keyed by checkpoint name.
pub type LoadedWeights = HashMap<String, RawTensor>;

/// An open checkpoint file with its parsed header.
///
/// Owns the handle for the duration of one load so matched tensors are read
/// without re-opening per tensor. The handle is released when this value is
/// dropped, on success and failure alike.
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
    file: File,
    header: CheckpointHeader,
}

impl CheckpointFile {
    /// Open a checkpoint file and parse its header.
    ///
    /// A path that does not end in the checkpoint extension is treated as a
    /// directory holding the canonical single file, `model.safetensors`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_file(resolve_checkpoint_path(path))
    }

    /// Open a checkpoint file by its exact path, e.g. a data file named by a
    /// weight-map manifest.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::NotFound(path));
        }
        let mut file = File::open(&path)?;
        let header = parse_header(&mut file, &path)?;
        log::debug!(
            "Parsed {} header entries from {}, data region at byte {}",
            header.entries.len(),
            path.display(),
            header.data_start
        );
        Ok(Self { path, file, header })
    }

    /// The parsed header.
    pub fn header(&self) -> &CheckpointHeader {
        &self.header
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All tensor names in this file.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.header.entries.keys().map(String::as_str).collect()
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.header.entries.contains_key(name)
    }

    /// Read every tensor matched by `selector` (or by `spillover`, when a
    /// multi-file resolution deferred part of the previous component to this
    /// file), seeking to each entry's exact byte range.
    ///
    /// Returns an empty mapping when nothing matches; the caller decides
    /// whether that is acceptable.
    pub fn read_matching(
        &mut self,
        selector: &Selector,
        spillover: Option<&Selector>,
    ) -> Result<LoadedWeights> {
        let mut weights = LoadedWeights::new();
        let data_start = self.header.data_start;
        let file = &mut self.file;
        for (name, record) in &self.header.entries {
            let matched = selector.matches(name)
                || spillover.is_some_and(|boundary| boundary.matches(name));
            if !matched {
                continue;
            }
            let dtype = Dtype::parse(&record.dtype)?;
            let [start, end] = record.data_offsets;
            let mut data = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(data_start + start))?;
            file.read_exact(&mut data)?;
            log::debug!("Read tensor '{}' ({} bytes)", name, data.len());
            weights.insert(
                name.clone(),
                RawTensor {
                    dtype,
                    shape: record.shape.clone(),
                    data,
                },
            );
        }
        Ok(weights)
    }
}

/// Resolve a checkpoint path, appending the canonical single-file name when
/// the path does not already point at a checkpoint file.
fn resolve_checkpoint_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == CHECKPOINT_EXTENSION => path.to_path_buf(),
        _ => path.join(SINGLE_FILE_NAME),
    }
}

fn parse_header(file: &mut File, path: &Path) -> Result<CheckpointHeader> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES as usize];
    file.read_exact(&mut prefix).map_err(|err| {
        Error::ParseError(format!(
            "{}: failed to read header length prefix: {err}",
            path.display()
        ))
    })?;
    let header_len = u64::from_le_bytes(prefix);

    let file_size = file.metadata()?.len();
    let data_start = LENGTH_PREFIX_BYTES
        .checked_add(header_len)
        .filter(|start| *start <= file_size)
        .ok_or_else(|| {
            Error::ParseError(format!(
                "{}: declared header length {header_len} exceeds file size {file_size}",
                path.display()
            ))
        })?;

    let mut raw = vec![0u8; header_len as usize];
    file.read_exact(&mut raw).map_err(|err| {
        Error::ParseError(format!(
            "{}: failed to read {header_len}-byte header: {err}",
            path.display()
        ))
    })?;
    let json: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&raw)
        .map_err(|err| {
            Error::ParseError(format!("{}: invalid JSON header: {err}", path.display()))
        })?;

    let available = file_size - data_start;
    let mut entries = HashMap::with_capacity(json.len());
    for (name, value) in json {
        if name == METADATA_KEY {
            continue;
        }
        let record: TensorRecord = serde_json::from_value(value).map_err(|err| {
            Error::ParseError(format!(
                "{}: invalid entry for tensor '{name}': {err}",
                path.display()
            ))
        })?;
        let [start, end] = record.data_offsets;
        if start > end || end > available {
            return Err(Error::OffsetOutOfBounds {
                name,
                start,
                end,
                available,
            });
        }
        entries.insert(name, record);
    }

    Ok(CheckpointHeader {
        data_start,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_checkpoint_bytes(dir: &Path, header_json: &str, data: &[u8]) -> PathBuf {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(header_json.len() as u64).to_le_bytes());
        bytes.extend_from_slice(header_json.as_bytes());
        bytes.extend_from_slice(data);
        let path = dir.join(SINGLE_FILE_NAME);
        fs::write(&path, bytes).expect("write checkpoint");
        path
    }

    #[test]
    fn test_data_start_is_prefix_plus_header_len() {
        let dir = tempdir().expect("temp dir");
        let json = r#"{"t":{"dtype":"F32","shape":[2],"data_offsets":[0,8]}}"#;
        write_checkpoint_bytes(dir.path(), json, &[0u8; 8]);

        let checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        assert_eq!(checkpoint.header().data_start, 8 + json.len() as u64);
        assert!(checkpoint.contains("t"));
        assert_eq!(checkpoint.tensor_names(), vec!["t"]);
    }

    #[test]
    fn test_directory_path_resolves_to_canonical_file() {
        let dir = tempdir().expect("temp dir");
        let json = r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
        let file_path = write_checkpoint_bytes(dir.path(), json, &[7]);

        let via_dir = CheckpointFile::open(dir.path()).expect("open via directory");
        let via_file = CheckpointFile::open(&file_path).expect("open via file path");
        assert_eq!(via_dir.path(), via_file.path());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().expect("temp dir");
        let err = CheckpointFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NotFound(path) if path.ends_with(SINGLE_FILE_NAME)));
    }

    #[test]
    fn test_malformed_header_is_parse_error() {
        let dir = tempdir().expect("temp dir");
        write_checkpoint_bytes(dir.path(), "not json at all", &[]);
        let err = CheckpointFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn test_truncated_prefix_is_parse_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(SINGLE_FILE_NAME);
        fs::write(&path, [1u8, 2, 3]).expect("write truncated file");
        let err = CheckpointFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn test_header_length_past_eof_is_parse_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(SINGLE_FILE_NAME);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        fs::write(&path, bytes).expect("write checkpoint");
        let err = CheckpointFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn test_offsets_past_data_region_are_rejected() {
        let dir = tempdir().expect("temp dir");
        let json = r#"{"t":{"dtype":"F32","shape":[4],"data_offsets":[0,16]}}"#;
        // Only 8 data bytes on disk; the entry claims 16.
        write_checkpoint_bytes(dir.path(), json, &[0u8; 8]);
        let err = CheckpointFile::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::OffsetOutOfBounds {
                end: 16,
                available: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_metadata_entry_is_skipped() {
        let dir = tempdir().expect("temp dir");
        let json = concat!(
            r#"{"__metadata__":{"format":"pt"},"#,
            r#""t":{"dtype":"U8","shape":[2],"data_offsets":[0,2]}}"#
        );
        write_checkpoint_bytes(dir.path(), json, &[1, 2]);

        let checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        assert_eq!(checkpoint.header().entries.len(), 1);
        assert!(!checkpoint.contains(METADATA_KEY));
    }

    #[test]
    fn test_read_matching_is_byte_exact() {
        let dir = tempdir().expect("temp dir");
        let json = concat!(
            r#"{"model.norm.weight":{"dtype":"U8","shape":[4],"data_offsets":[0,4]},"#,
            r#""output.weight":{"dtype":"U8","shape":[3],"data_offsets":[4,7]}}"#
        );
        write_checkpoint_bytes(dir.path(), json, &[10, 11, 12, 13, 20, 21, 22]);

        let mut checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        let weights = checkpoint
            .read_matching(&Selector::new("model.norm"), None)
            .expect("read matching");
        assert_eq!(weights.len(), 1);
        let tensor = &weights["model.norm.weight"];
        assert_eq!(tensor.dtype, Dtype::U8);
        assert_eq!(tensor.shape, vec![4]);
        assert_eq!(tensor.data, vec![10, 11, 12, 13]);

        let weights = checkpoint
            .read_matching(&Selector::new("output.weight"), None)
            .expect("read matching");
        assert_eq!(weights["output.weight"].data, vec![20, 21, 22]);
    }

    #[test]
    fn test_read_matching_with_spillover() {
        let dir = tempdir().expect("temp dir");
        let json = concat!(
            r#"{"model.layers.0.a.weight":{"dtype":"U8","shape":[2],"data_offsets":[0,2]},"#,
            r#""model.layers.1.a.weight":{"dtype":"U8","shape":[2],"data_offsets":[2,4]},"#,
            r#""model.layers.2.a.weight":{"dtype":"U8","shape":[2],"data_offsets":[4,6]}}"#
        );
        write_checkpoint_bytes(dir.path(), json, &[0, 1, 2, 3, 4, 5]);

        let mut checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        let spillover = Selector::new("model.layers.0.");
        let weights = checkpoint
            .read_matching(&Selector::new("model.layers.1."), Some(&spillover))
            .expect("read matching");
        let mut names: Vec<_> = weights.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["model.layers.0.a.weight", "model.layers.1.a.weight"]
        );
    }

    #[test]
    fn test_unsupported_dtype_only_fails_matched_entries() {
        let dir = tempdir().expect("temp dir");
        let json = concat!(
            r#"{"model.norm.weight":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"#,
            r#""output.weight":{"dtype":"F8_E4M3","shape":[1],"data_offsets":[1,2]}}"#
        );
        write_checkpoint_bytes(dir.path(), json, &[1, 2]);

        let mut checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        assert!(checkpoint
            .read_matching(&Selector::new("model.norm"), None)
            .is_ok());
        let err = checkpoint
            .read_matching(&Selector::new("output.weight"), None)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype(_)));
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let dir = tempdir().expect("temp dir");
        let json = r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
        write_checkpoint_bytes(dir.path(), json, &[9]);

        let mut checkpoint = CheckpointFile::open(dir.path()).expect("open checkpoint");
        let weights = checkpoint
            .read_matching(&Selector::new("model.layers.4."), None)
            .expect("read matching");
        assert!(weights.is_empty());
    }
}
