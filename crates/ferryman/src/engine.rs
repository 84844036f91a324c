//! Graph engine boundary (JACK-style).
//!
//! The engine calls [`ProcessHandler::process`] once per period on its
//! realtime thread and delivers everything else through a
//! [`NotificationHandler`] on a non-realtime thread.

use tracing::{debug, error};

use crate::endpoint::{Direction, EndpointKind};

/// A graph port the relay registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub kind: EndpointKind,
    /// Zero-based channel within the endpoint.
    pub channel: u16,
}

impl PortSpec {
    /// `playback_1..N`, `capture_1..N`, `monitor_1..N`.
    pub fn for_layout(channels: u16) -> Vec<PortSpec> {
        EndpointKind::ALL
            .iter()
            .flat_map(|&kind| {
                (0..channels).map(move |channel| PortSpec {
                    name: format!("{}_{}", kind.port_prefix(), channel + 1),
                    kind,
                    channel,
                })
            })
            .collect()
    }

    /// Graph-side direction. Playback ports are inputs the graph feeds.
    pub fn is_input(&self) -> bool {
        self.kind.direction() == Direction::ToDevice
    }
}

/// What the engine should do after a period. `Quit` stops the client's
/// periods until it is activated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

/// Port buffers for one period.
///
/// Slices are `frames()` long. A port that is not registered returns None.
pub trait PeriodIo {
    fn frames(&self) -> usize;

    /// Samples the graph sent to playback channel `channel`.
    fn playback(&self, channel: usize) -> Option<&[f32]>;

    /// Buffer to fill for a capture or monitor channel.
    fn output(&mut self, kind: EndpointKind, channel: usize) -> Option<&mut [f32]>;
}

/// Realtime period callback. Must not block, allocate, or log.
pub trait ProcessHandler: Send {
    fn process(&mut self, io: &mut dyn PeriodIo) -> Control;
}

/// Non-realtime engine notifications.
pub trait NotificationHandler: Send {
    fn buffer_size(&mut self, frames: u32);

    fn sample_rate(&mut self, rate: u32);

    fn ports_connected(&mut self, a: &str, b: &str, connected: bool) {
        debug!(
            "graph ports {} {} {}",
            a,
            if connected { "connected to" } else { "disconnected from" },
            b
        );
    }

    fn error(&mut self, message: &str) {
        error!("graph engine error: {}", message);
    }

    /// The engine went away. No further periods will arrive.
    fn shutdown(&mut self, reason: &str);
}

/// An open engine client.
pub trait GraphClient: Send {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    /// Current period size in frames.
    fn buffer_size(&self) -> u32;

    fn register_ports(&mut self, ports: &[PortSpec]) -> Result<(), EngineError>;

    fn activate(
        &mut self,
        process: Box<dyn ProcessHandler>,
        notifications: Box<dyn NotificationHandler>,
    ) -> Result<(), EngineError>;

    /// Stop periods and notifications. Idempotent.
    fn deactivate(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to register port {port}: {message}")]
    PortRegistration { port: String, message: String },

    #[error("failed to activate client: {0}")]
    Activation(String),

    #[error("client is already active")]
    AlreadyActive,
}
