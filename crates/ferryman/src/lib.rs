//! Ferryman: Realtime Audio Relay
//!
//! Bridges a realtime graph engine (JACK-style, fixed periods on an RT
//! thread) and a desktop audio server (PulseAudio-style, asynchronous
//! streams on an event loop). Three paths cross the boundary:
//!
//! - **Playback**: graph ports to a server sink
//! - **Capture**: a server source to graph ports
//! - **Monitor**: the playback sink's monitor source to graph ports
//!
//! Each path runs through a lock-free byte ring sized from the engine's
//! period. The realtime side ([`relay::RealtimeRelay`]) never blocks; the
//! event loop ([`duplex::DuplexOrchestrator`]) moves bytes between rings and
//! server streams and keeps buffer attributes in step with the engine
//! ([`reconfig::ReconfigurationCoordinator`]).
//!
//! [`session::Session`] wires it all together. The [`sim`] backends let the
//! whole relay run in-process.

pub mod bridge;
pub mod duplex;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod format;
pub mod reconfig;
pub mod relay;
pub mod ring;
pub mod server;
pub mod session;
pub mod shared;
pub mod sim;
pub mod stats;

pub use endpoint::{Direction, EndpointKind, EndpointState};
pub use engine::{
    Control, EngineError, GraphClient, NotificationHandler, PeriodIo, PortSpec, ProcessHandler,
};
pub use error::BridgeError;
pub use format::{BufferAttr, FrameLayout, LayoutError, SampleFormat, SampleSpec};
pub use ring::{RingChannel, RingError, RingReader, RingWriter};
pub use server::{
    ContextState, Fragment, ServerContext, ServerError, ServerEvent, ServerOp, ServerStream,
    SinkInfo, StreamFlags, StreamState, Wake,
};
pub use session::{BridgeConfig, ExitReason, Session};
pub use stats::{EndpointSnapshot, StatsSnapshot};
