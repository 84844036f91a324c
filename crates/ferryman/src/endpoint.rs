//! Server-side endpoints: one per ring, each wrapping at most one server
//! stream.
//!
//! The lifecycle state is kept in an [`EndpointStatus`] atomic so the
//! realtime thread can ask "is this endpoint streaming?" without touching
//! the io lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::format::BufferAttr;
use crate::server::ServerStream;

/// The three relay paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Playback,
    Capture,
    Monitor,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 3] = [
        EndpointKind::Playback,
        EndpointKind::Capture,
        EndpointKind::Monitor,
    ];

    /// Teardown order: monitor first, playback last.
    pub const TEARDOWN_ORDER: [EndpointKind; 3] = [
        EndpointKind::Monitor,
        EndpointKind::Capture,
        EndpointKind::Playback,
    ];

    pub fn direction(self) -> Direction {
        match self {
            EndpointKind::Playback => Direction::ToDevice,
            EndpointKind::Capture | EndpointKind::Monitor => Direction::FromDevice,
        }
    }

    /// Graph port name prefix, e.g. `capture` for `capture_1`.
    pub fn port_prefix(self) -> &'static str {
        match self {
            EndpointKind::Playback => "playback",
            EndpointKind::Capture => "capture",
            EndpointKind::Monitor => "monitor",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            EndpointKind::Playback => 0,
            EndpointKind::Capture => 1,
            EndpointKind::Monitor => 2,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.port_prefix())
    }
}

/// Which way audio crosses the server boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Graph to server sink.
    ToDevice,
    /// Server source to graph.
    FromDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EndpointState {
    Unconnected = 0,
    Connecting = 1,
    Ready = 2,
    /// Stream followed its device to another sink or source.
    Moved = 3,
    Failed = 4,
    Terminated = 5,
}

impl EndpointState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EndpointState::Unconnected,
            1 => EndpointState::Connecting,
            2 => EndpointState::Ready,
            3 => EndpointState::Moved,
            4 => EndpointState::Failed,
            _ => EndpointState::Terminated,
        }
    }

    /// Data may flow through the endpoint's stream.
    pub fn is_streaming(self) -> bool {
        matches!(self, EndpointState::Ready | EndpointState::Moved)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EndpointState::Failed | EndpointState::Terminated)
    }

    pub fn can_transition_to(self, next: EndpointState) -> bool {
        use EndpointState::*;
        match (self, next) {
            (_, Terminated) => true,
            (Failed | Terminated, _) => false,
            (_, Failed) => true,
            (Unconnected, Connecting) => true,
            (Connecting, Ready) => true,
            (Ready, Moved) => true,
            (Moved, Ready) => true,
            _ => false,
        }
    }
}

/// Lock-free mirror of an endpoint's state.
#[derive(Debug)]
pub struct EndpointStatus(AtomicU8);

impl EndpointStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(EndpointState::Unconnected as u8))
    }

    pub fn load(&self) -> EndpointState {
        EndpointState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_streaming(&self) -> bool {
        self.load().is_streaming()
    }

    fn store(&self, state: EndpointState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for EndpointStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One server stream and the attributes negotiated for it.
pub struct StreamEndpoint {
    kind: EndpointKind,
    name: String,
    device: Option<String>,
    attr: BufferAttr,
    stream: Option<Box<dyn ServerStream>>,
    status: Arc<EndpointStatus>,
}

impl StreamEndpoint {
    pub fn new(
        kind: EndpointKind,
        name: impl Into<String>,
        device: Option<String>,
        attr: BufferAttr,
        status: Arc<EndpointStatus>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            device,
            attr,
            stream: None,
            status,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the stream connects to. None means the server default.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn set_device(&mut self, device: Option<String>) {
        self.device = device;
    }

    pub fn attr(&self) -> &BufferAttr {
        &self.attr
    }

    pub fn set_attr(&mut self, attr: BufferAttr) {
        self.attr = attr;
    }

    pub fn state(&self) -> EndpointState {
        self.status.load()
    }

    pub fn is_streaming(&self) -> bool {
        self.status.is_streaming()
    }

    pub fn status(&self) -> &Arc<EndpointStatus> {
        &self.status
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it did.
    pub fn transition(&mut self, next: EndpointState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                "{} endpoint: ignoring transition {:?} -> {:?}",
                self.kind, current, next
            );
            return false;
        }
        debug!("{} endpoint: {:?} -> {:?}", self.kind, current, next);
        self.status.store(next);
        true
    }

    pub fn attach(&mut self, stream: Box<dyn ServerStream>) {
        self.stream = Some(stream);
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream_mut(&mut self) -> Option<&mut (dyn ServerStream + 'static)> {
        self.stream.as_deref_mut()
    }

    pub fn take_stream(&mut self) -> Option<Box<dyn ServerStream>> {
        self.stream.take()
    }
}

impl fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("attr", &self.attr)
            .field("state", &self.state())
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}
