use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("duplicate layer name `{0}`")]
    DuplicateName(String),
    #[error("layer `{layer}` references unknown input `{input}`")]
    UnresolvedInput { layer: String, input: String },
    #[error("layer `{layer}` shape mismatch: {msg}")]
    ShapeMismatch { layer: String, msg: String },
    #[error("network graph contains a cycle through `{0}`")]
    Cycle(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
