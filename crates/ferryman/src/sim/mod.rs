//! In-process backends for the graph engine and the audio server.
//!
//! Each backend comes in two halves: the client half the session owns
//! ([`SimEngine`], [`SimServer`]) and a cloneable handle for driving it from
//! tests or the soak binary.

pub mod engine;
pub mod server;

pub use engine::{ClockHandle, PeriodOutput, SimEngine, SimEngineHandle};
pub use server::{SimServer, SimServerHandle, SimWaker, MONITOR_SOURCE, SINK_NAME, SOURCE_NAME};
