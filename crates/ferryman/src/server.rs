//! Audio server boundary (PulseAudio-style).
//!
//! The server talks to us through events pulled from
//! [`ServerContext::next_event`] on the event-loop thread. Streams are only
//! touched from that thread, or from a notification thread holding the io
//! lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::EndpointKind;
use crate::format::{BufferAttr, SampleSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

/// Flags passed when connecting a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags {
    /// Allow `update_sample_rate` after connecting.
    pub variable_rate: bool,
    /// Let the server size its own latency from the buffer attributes.
    pub adjust_latency: bool,
}

impl StreamFlags {
    /// What every relay stream connects with.
    pub const RELAY: StreamFlags = StreamFlags {
        variable_rate: true,
        adjust_latency: true,
    };
}

/// Next readable fragment of a record stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Fragment<'a> {
    Data(&'a [u8]),
    /// Gap of this many bytes with no data. Still has to be discarded.
    Hole(usize),
    /// Nothing buffered.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    /// Source that carries whatever the sink plays.
    pub monitor_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Context(ContextState),
    Stream {
        kind: EndpointKind,
        state: StreamState,
    },
    /// The server wants `bytes` more playback data.
    Writable { kind: EndpointKind, bytes: usize },
    Readable { kind: EndpointKind },
    /// The stream now lives on `device`.
    Moved { kind: EndpointKind, device: String },
    SinkInfo(SinkInfo),
    SinkInfoFailed { index: u32, message: String },
    /// Delivered after someone called [`Wake::wake`].
    Wakeup,
}

/// Non-blocking event-loop nudge, safe to call from the realtime thread.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

pub trait ServerContext: Send {
    fn connect(&mut self, client_name: &str) -> Result<(), ServerError>;

    fn state(&self) -> ContextState;

    fn create_stream(
        &mut self,
        kind: EndpointKind,
        name: &str,
        spec: &SampleSpec,
    ) -> Result<Box<dyn ServerStream>, ServerError>;

    /// Ask for sink details. The answer arrives as
    /// [`ServerEvent::SinkInfo`] or [`ServerEvent::SinkInfoFailed`].
    fn request_sink_info(&mut self, index: u32) -> Result<(), ServerError>;

    /// Wait up to `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> Option<ServerEvent>;

    fn waker(&self) -> Arc<dyn Wake>;

    fn disconnect(&mut self);
}

pub trait ServerStream: Send {
    fn connect_playback(
        &mut self,
        device: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError>;

    fn connect_record(
        &mut self,
        device: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError>;

    fn state(&self) -> StreamState;

    /// Index of the sink or source the stream is attached to.
    fn device_index(&self) -> Option<u32>;

    /// Borrow a server buffer of at most `len` bytes for playback data.
    fn begin_write(&mut self, len: usize) -> Result<&mut [u8], ServerError>;

    /// Submit the first `len` bytes of the buffer from `begin_write`.
    fn write(&mut self, len: usize) -> Result<(), ServerError>;

    fn readable_size(&self) -> usize;

    fn peek(&mut self) -> Result<Fragment<'_>, ServerError>;

    /// Drop the fragment returned by the last `peek`.
    fn discard(&mut self) -> Result<(), ServerError>;

    fn set_buffer_attr(&mut self, attr: &BufferAttr) -> Result<(), ServerError>;

    fn update_sample_rate(&mut self, rate: u32) -> Result<(), ServerError>;

    fn disconnect(&mut self) -> Result<(), ServerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("{operation} failed: {message}")]
    Failed {
        operation: ServerOp,
        message: String,
    },

    #[error("{0} requires a connected stream")]
    NotConnected(ServerOp),

    #[error("server connection closed")]
    Closed,
}

impl ServerError {
    pub fn failed(operation: ServerOp, message: impl Into<String>) -> Self {
        ServerError::Failed {
            operation,
            message: message.into(),
        }
    }
}

/// Server operations, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOp {
    Connect,
    CreateStream,
    ConnectStream,
    SinkInfo,
    BeginWrite,
    Write,
    Peek,
    Discard,
    SetBufferAttr,
    UpdateSampleRate,
    Disconnect,
}

impl fmt::Display for ServerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerOp::Connect => "connect",
            ServerOp::CreateStream => "create stream",
            ServerOp::ConnectStream => "connect stream",
            ServerOp::SinkInfo => "sink info",
            ServerOp::BeginWrite => "begin write",
            ServerOp::Write => "write",
            ServerOp::Peek => "peek",
            ServerOp::Discard => "discard",
            ServerOp::SetBufferAttr => "set buffer attr",
            ServerOp::UpdateSampleRate => "update sample rate",
            ServerOp::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}
