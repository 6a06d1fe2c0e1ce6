use std::{fs::{self, File}, io::{BufReader, BufWriter, Write}, path::{Path, PathBuf}};

use burn::{module::Module, record::{FullPrecisionSettings, Record}, tensor::backend::Backend};
use serde::{de::{DeserializeOwned, IgnoredAny}, Deserialize, Serialize};

use crate::{config::RunConfig, error::{HarnessError, Result}};

/// Serializable, full precision form of a burn record.
pub type RecordItem<B, R> = <R as Record<B>>::Item<FullPrecisionSettings>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    /// Written at every epoch boundary.
    Ckpt,
    /// Written once when training completes.
    Final,
}

impl CheckpointTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTag::Ckpt => "CKPT",
            CheckpointTag::Final => "Final",
        }
    }
}

/// Everything needed to continue a run: model weights, optimizer state and
/// the iteration the run stopped at.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint<M, O> {
    pub model: M,
    pub optimizer: O,
    pub iteration: usize,
}

// On-disk form. Every field is optional so a missing one can be reported by name.
#[derive(Serialize, Deserialize)]
struct CheckpointFile<M, O> {
    model: Option<M>,
    optimizer: Option<O>,
    iteration: Option<usize>,
}

/// `{dataset}_{neck}_{backbone}_size{image_size}_anchor{anchor_size}_{loss}_{tag}.json`
pub fn checkpoint_name(config: &RunConfig, tag: CheckpointTag) -> String {
    format!(
        "{}_{}_{}_size{}_anchor{:?}_{}_{}.json",
        config.dataset,
        config.neck,
        config.backbone,
        config.image_size,
        config.anchor_size,
        config.loss_mode.tag(),
        tag.as_str(),
    )
}

pub fn checkpoint_path(config: &RunConfig, tag: CheckpointTag) -> PathBuf {
    Path::new(&config.save_folder).join(checkpoint_name(config, tag))
}

/// Writes the checkpoint for `tag` under the configured save folder and
/// returns its path. The file is replaced atomically.
pub fn save<M: Serialize, O: Serialize>(
    config: &RunConfig,
    tag: CheckpointTag,
    checkpoint: Checkpoint<M, O>,
) -> Result<PathBuf> {
    let path = checkpoint_path(config, tag);
    log::info!("Saving to {}", path.display());
    write_atomic(&path, checkpoint)?;
    Ok(path)
}

pub fn write_atomic<M: Serialize, O: Serialize>(path: &Path, checkpoint: Checkpoint<M, O>) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let file = CheckpointFile {
        model: Some(checkpoint.model),
        optimizer: Some(checkpoint.optimizer),
        iteration: Some(checkpoint.iteration),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, &file).map_err(std::io::Error::from)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HarnessError::Io(e.error))?;
    Ok(())
}

pub fn load<M: DeserializeOwned, O: DeserializeOwned>(path: &Path) -> Result<Checkpoint<M, O>> {
    let reader = BufReader::new(File::open(path)?);
    let file: CheckpointFile<M, O> = serde_json::from_reader(reader).map_err(|e| HarnessError::CheckpointDecode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let corrupt = |field| HarnessError::CheckpointCorrupt {
        path: path.to_path_buf(),
        field,
    };
    Ok(Checkpoint {
        model: file.model.ok_or_else(|| corrupt("model"))?,
        optimizer: file.optimizer.ok_or_else(|| corrupt("optimizer"))?,
        iteration: file.iteration.ok_or_else(|| corrupt("iteration"))?,
    })
}

/// Loads only the model weights of a checkpoint into `model`.
pub fn load_weights<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<(M, usize)> {
    let checkpoint: Checkpoint<RecordItem<B, M::Record>, IgnoredAny> = load(path)?;
    let record = <M::Record as Record<B>>::from_item::<FullPrecisionSettings>(checkpoint.model, device);
    Ok((model.load_record(record), checkpoint.iteration))
}
