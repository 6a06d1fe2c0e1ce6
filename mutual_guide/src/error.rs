use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Unknown dataset \"{0}\" (expected one of COCO, VOC, XML)")]
    UnknownDataset(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Checkpoint {path} is corrupt: missing field \"{field}\"")]
    CheckpointCorrupt { path: PathBuf, field: &'static str },
    #[error("Checkpoint {path} could not be decoded\n\tMessage: {message}")]
    CheckpointDecode { path: PathBuf, message: String },
    #[error("Dataset yields no full batch of size {batch_size} ({len} items)")]
    EmptyEpoch { len: usize, batch_size: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
