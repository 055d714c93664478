//! Component-level weight loading across single- and multi-file checkpoints.

use crate::header::{CheckpointFile, LoadedWeights};
use crate::manifest::{WeightManifest, MANIFEST_FILE_NAME};
use crate::selector::Component;
use crate::types::{Error, Result, Shard};
use std::path::Path;

/// Load the weights of one structural component from a checkpoint directory.
///
/// The directory holds either a single `model.safetensors` file or several
/// data files indexed by `model.safetensors.index.json`; both layouts are
/// handled here. Only the byte ranges of the matched tensors are read.
///
/// Failures carry the component as context so the orchestration layer can
/// report which part of the shard failed.
pub fn load_component(checkpoint_dir: &Path, component: Component) -> Result<LoadedWeights> {
    load_component_inner(checkpoint_dir, component).map_err(|err| Error::ComponentLoad {
        component: component.to_string(),
        source: Box::new(err),
    })
}

fn load_component_inner(checkpoint_dir: &Path, component: Component) -> Result<LoadedWeights> {
    let selector = component.selector();
    let weights = if WeightManifest::is_present(checkpoint_dir) {
        let manifest_path = checkpoint_dir.join(MANIFEST_FILE_NAME);
        let manifest = WeightManifest::load(&manifest_path)?;
        let resolution = match manifest.resolve(&selector) {
            Err(Error::EmptyMatch(_)) if !component.is_required() => {
                log::debug!(
                    "No '{selector}' entries in {}; treating {component} as absent",
                    manifest_path.display()
                );
                return Ok(LoadedWeights::new());
            }
            other => other?,
        };
        // Manifest entries name data files verbatim; no canonical-name
        // defaulting applies to them.
        let mut file = CheckpointFile::open_file(checkpoint_dir.join(&resolution.file_name))?;
        let spillover = if resolution.covers_all_matches {
            None
        } else {
            component.spillover_selector()
        };
        file.read_matching(&selector, spillover.as_ref())?
    } else {
        let mut file = CheckpointFile::open(checkpoint_dir)?;
        file.read_matching(&selector, None)?
    };

    if weights.is_empty() && component.is_required() {
        return Err(Error::EmptyMatch(selector.to_string()));
    }
    log::info!(
        "Loaded {} tensors for {component} from {}",
        weights.len(),
        checkpoint_dir.display()
    );
    Ok(weights)
}

/// Load every component a shard owns, in the fixed structural order.
///
/// The sequence is: embedding (only when the shard owns the first model
/// layer), each owned layer in ascending index order, then final norm and
/// output head (only when the shard owns the last model layer). Each
/// component's weights are handed to `apply` before the next component is
/// read, so the collaborator can assign and drop them one at a time.
pub fn load_shard<F>(checkpoint_dir: &Path, shard: &Shard, mut apply: F) -> Result<()>
where
    F: FnMut(Component, LoadedWeights) -> Result<()>,
{
    if shard.owns_first_layer() {
        apply(
            Component::Embedding,
            load_component(checkpoint_dir, Component::Embedding)?,
        )?;
    }
    for index in shard.layers() {
        let component = Component::Layer(index);
        apply(component, load_component(checkpoint_dir, component)?)?;
    }
    if shard.owns_last_layer() {
        apply(
            Component::FinalNorm,
            load_component(checkpoint_dir, Component::FinalNorm)?,
        )?;
        apply(
            Component::OutputHead,
            load_component(checkpoint_dir, Component::OutputHead)?,
        )?;
    }
    log::info!(
        "Shard {} loaded layers {}..={} from {}",
        shard.id,
        shard.start_layer,
        shard.end_layer,
        checkpoint_dir.display()
    );
    Ok(())
}
