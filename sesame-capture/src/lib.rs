use thiserror::Error;

use sesame_core::packet::WireError;

use crate::sink::SinkError;

pub mod packetize;
pub mod pipeline;
pub mod sink;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("sink: {0}")]
    Sink(#[from] SinkError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("no {0} capture settings configured")]
    NotConfigured(&'static str),
}
