//! Fatal relay errors. Transient conditions (overflow, underflow, holes) are
//! diagnostics and never show up here.

use crate::endpoint::EndpointKind;
use crate::engine::EngineError;
use crate::format::LayoutError;
use crate::ring::RingError;
use crate::server::ServerError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("graph engine: {0}")]
    Engine(#[from] EngineError),

    #[error("audio server ({context}): {source}")]
    Server {
        context: String,
        #[source]
        source: ServerError,
    },

    #[error("invalid frame layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("ring allocation: {0}")]
    Ring(#[from] RingError),

    #[error("reconfiguration to {frames} frames failed: {reason}")]
    Reconfigure { frames: u32, reason: String },

    #[error("audio server context failed: {0}")]
    ContextFailed(String),

    #[error("{kind} stream failed")]
    StreamFailed { kind: EndpointKind },

    #[error("no monitor source for sink {index}: {message}")]
    NoMonitorSource { index: u32, message: String },

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

impl BridgeError {
    pub fn server(context: impl Into<String>, source: ServerError) -> Self {
        BridgeError::Server {
            context: context.into(),
            source,
        }
    }
}

/// Extension for labelling server results.
pub(crate) trait ServerResultExt<T> {
    fn during(self, context: impl FnOnce() -> String) -> Result<T, BridgeError>;
}

impl<T> ServerResultExt<T> for Result<T, ServerError> {
    fn during(self, context: impl FnOnce() -> String) -> Result<T, BridgeError> {
        self.map_err(|source| BridgeError::server(context(), source))
    }
}
