use thiserror::Error;

use crate::{decoder::DecoderError, source::SourceError};

pub mod config;
pub mod decoder;
pub mod file;
pub mod frame;
pub mod live;
pub mod schedule;
pub mod source;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlayerError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("decoder configuration failed: {0}")]
    ConfigureFailed(String),
    #[error("transport: {0}")]
    Transport(#[from] SourceError),
    #[error("decoder: {0}")]
    Decoder(#[from] DecoderError),
    #[error("invariant violation: {0}")]
    Invariant(&'static str),
}
