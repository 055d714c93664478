use std::ops::RangeInclusive;
use std::path::PathBuf;
use thiserror::Error;

/// A contiguous range of model layers assigned to one worker.
///
/// The loader only inspects the range boundaries; what a layer means is the
/// model's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Identifier assigned by the orchestration layer.
    pub id: String,
    /// First layer owned by this shard (inclusive).
    pub start_layer: usize,
    /// Last layer owned by this shard (inclusive).
    pub end_layer: usize,
    /// Total number of layers in the model.
    pub total_layers: usize,
}

impl Shard {
    /// Create a shard descriptor.
    pub fn new(
        id: impl Into<String>,
        start_layer: usize,
        end_layer: usize,
        total_layers: usize,
    ) -> Self {
        Self {
            id: id.into(),
            start_layer,
            end_layer,
            total_layers,
        }
    }

    /// True when this shard owns the first model layer and therefore the
    /// embedding table.
    pub fn owns_first_layer(&self) -> bool {
        self.start_layer == 0
    }

    /// True when this shard owns the last model layer and therefore the
    /// final norm and output head.
    pub fn owns_last_layer(&self) -> bool {
        self.end_layer + 1 == self.total_layers
    }

    /// The layer indices owned by this shard.
    pub fn layers(&self) -> RangeInclusive<usize> {
        self.start_layer..=self.end_layer
    }
}

/// shardload error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Checkpoint file or manifest absent on disk.
    #[error("Checkpoint file not found: {0}")]
    NotFound(PathBuf),

    /// Malformed length prefix, header, or manifest.
    #[error("Failed to parse checkpoint: {0}")]
    ParseError(String),

    /// A selector matched no tensor entries where a match was required.
    #[error("No tensors matched selector '{0}'")]
    EmptyMatch(String),

    /// Declared dtype name is not in the supported set.
    #[error("Unsupported tensor dtype: {0}")]
    UnsupportedDtype(String),

    /// Declared byte offsets reach past the end of the data region.
    #[error("Tensor '{name}' offsets [{start}, {end}) exceed the {available}-byte data region")]
    OffsetOutOfBounds {
        name: String,
        start: u64,
        end: u64,
        available: u64,
    },

    /// Failure while loading one structural component, with context.
    #[error("Failed to load {component}: {source}")]
    ComponentLoad {
        component: String,
        #[source]
        source: Box<Error>,
    },

    /// Wrapped IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for shardload operations.
pub type Result<T> = std::result::Result<T, Error>;
