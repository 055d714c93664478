//! Structural selectors for checkpoint tensor names.
//!
//! Checkpoint tensor names are dot-separated paths such as
//! `model.layers.3.self_attn.q_proj.weight`. A [`Selector`] identifies the
//! tensors of one structural component by matching whole name segments, so
//! `model.layers.3` can never match `model.layers.30`.

use std::fmt;

/// One structural weight group of a transformer checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Token embedding table.
    Embedding,
    /// A single transformer layer, by index.
    Layer(usize),
    /// Final normalization before the head.
    FinalNorm,
    /// Output projection head.
    OutputHead,
}

impl Component {
    /// The selector matching this component's tensors under the checkpoint
    /// naming convention.
    pub fn selector(&self) -> Selector {
        match self {
            Self::Embedding => Selector::new("model.embed_tokens"),
            Self::Layer(index) => Selector::new(&format!("model.layers.{index}.")),
            Self::FinalNorm => Selector::new("model.norm"),
            Self::OutputHead => Selector::new("output.weight"),
        }
    }

    /// Selector for the preceding structural boundary, used to recover
    /// tensors that a multi-file resolution deferred to this component's
    /// file. Only a body layer with a predecessor has one.
    pub fn spillover_selector(&self) -> Option<Selector> {
        match self {
            Self::Layer(index) if *index > 0 => Some(Component::Layer(index - 1).selector()),
            _ => None,
        }
    }

    /// Whether an empty load for this component is an error.
    ///
    /// The output head may be legitimately absent when the checkpoint ties
    /// it to the embedding table; everything else must match something.
    pub fn is_required(&self) -> bool {
        !matches!(self, Self::OutputHead)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedding => write!(f, "embedding"),
            Self::Layer(index) => write!(f, "layer {index}"),
            Self::FinalNorm => write!(f, "final norm"),
            Self::OutputHead => write!(f, "output head"),
        }
    }
}

/// A tensor-name pattern matched segment-wise.
///
/// The pattern's dot-separated segments must appear as one consecutive run
/// of the tensor name's segments, each compared exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    segments: Vec<String>,
}

impl Selector {
    /// Build a selector from a dot-separated pattern. A trailing dot, as in
    /// the `model.layers.3.` template form, is accepted and ignored.
    pub fn new(pattern: &str) -> Self {
        Self {
            segments: pattern
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// True when the selector matches the tensor name.
    pub fn matches(&self, name: &str) -> bool {
        if self.segments.is_empty() {
            return false;
        }
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < self.segments.len() {
            return false;
        }
        parts
            .windows(self.segments.len())
            .any(|window| {
                window
                    .iter()
                    .zip(&self.segments)
                    .all(|(part, segment)| *part == segment.as_str())
            })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
