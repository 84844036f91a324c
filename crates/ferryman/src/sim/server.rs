//! In-process audio server with one sink and one source.
//!
//! Everything the sink plays is looped back into its monitor source, so a
//! monitor stream hears playback without any device. Test code drives the
//! server side (capture data, moves, failures) through [`SimServerHandle`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::EndpointKind;
use crate::format::{BufferAttr, SampleSpec, SAMPLE_BYTES};
use crate::server::{
    ContextState, Fragment, ServerContext, ServerError, ServerEvent, ServerOp, ServerStream,
    SinkInfo, StreamFlags, StreamState, Wake,
};

pub const SINK_INDEX: u32 = 0;
pub const SINK_NAME: &str = "sim_output";
pub const MONITOR_SOURCE: &str = "sim_output.monitor";
pub const SOURCE_INDEX: u32 = 1;
pub const SOURCE_NAME: &str = "sim_input";
const MONITOR_INDEX: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Data(Vec<u8>),
    Hole(usize),
}

impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Data(data) => data.len(),
            Chunk::Hole(len) => *len,
        }
    }
}

#[derive(Debug)]
struct StreamSlot {
    name: String,
    state: StreamState,
    rate: u32,
    flags: StreamFlags,
    attr: Option<BufferAttr>,
    device: Option<String>,
    device_index: Option<u32>,
    pending: VecDeque<Chunk>,
    played: Vec<u8>,
    delivered: usize,
    set_attr_calls: usize,
}

impl StreamSlot {
    fn new(name: &str, spec: &SampleSpec) -> Self {
        Self {
            name: name.to_string(),
            state: StreamState::Unconnected,
            rate: spec.rate,
            flags: StreamFlags::default(),
            attr: None,
            device: None,
            device_index: None,
            pending: VecDeque::new(),
            played: Vec::new(),
            delivered: 0,
            set_attr_calls: 0,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    context: ContextState,
    client_name: Option<String>,
    streams: [Option<StreamSlot>; 3],
    fail_next: Vec<ServerOp>,
    disconnected: bool,
}

impl ServerState {
    fn slot(&mut self, kind: EndpointKind) -> Option<&mut StreamSlot> {
        self.streams[kind.index()].as_mut()
    }

    /// Consume a scheduled failure for `op`, if any.
    fn check(&mut self, op: ServerOp) -> Result<(), ServerError> {
        match self.fail_next.iter().position(|&o| o == op) {
            Some(i) => {
                self.fail_next.remove(i);
                Err(ServerError::failed(op, "injected failure"))
            }
            None => Ok(()),
        }
    }

    /// Context-level requests need a live context.
    fn require_context(&self, op: ServerOp) -> Result<(), ServerError> {
        match self.context {
            ContextState::Ready => Ok(()),
            ContextState::Failed | ContextState::Terminated => Err(ServerError::Closed),
            _ => Err(ServerError::NotConnected(op)),
        }
    }

    fn ready_slot(
        &mut self,
        kind: EndpointKind,
        op: ServerOp,
    ) -> Result<&mut StreamSlot, ServerError> {
        self.check(op)?;
        match self.slot(kind) {
            Some(slot) if slot.state == StreamState::Ready => Ok(slot),
            _ => Err(ServerError::NotConnected(op)),
        }
    }
}

struct ServerInner {
    state: Mutex<ServerState>,
    events: Sender<ServerEvent>,
    waker: Arc<SimWaker>,
}

impl ServerInner {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("sim server event dropped, no receiver");
        }
    }
}

/// Coalesces wakeups so at most one is queued at a time.
pub struct SimWaker {
    pending: AtomicBool,
    events: Sender<ServerEvent>,
}

impl Wake for SimWaker {
    fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ServerEvent::Wakeup);
        }
    }
}

/// The context half, handed to the session.
pub struct SimServer {
    inner: Arc<ServerInner>,
    events: Receiver<ServerEvent>,
}

/// The driver half.
#[derive(Clone)]
pub struct SimServerHandle {
    inner: Arc<ServerInner>,
}

impl SimServer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let waker = Arc::new(SimWaker {
            pending: AtomicBool::new(false),
            events: tx.clone(),
        });
        let state = ServerState {
            context: ContextState::Unconnected,
            client_name: None,
            streams: Default::default(),
            fail_next: Vec::new(),
            disconnected: false,
        };
        Self {
            inner: Arc::new(ServerInner {
                state: Mutex::new(state),
                events: tx,
                waker,
            }),
            events: rx,
        }
    }

    pub fn handle(&self) -> SimServerHandle {
        SimServerHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContext for SimServer {
    fn connect(&mut self, client_name: &str) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state();
            state.check(ServerOp::Connect)?;
            state.client_name = Some(client_name.to_string());
            state.context = ContextState::Ready;
        }
        info!("sim server accepted client {}", client_name);
        self.inner.emit(ServerEvent::Context(ContextState::Connecting));
        self.inner.emit(ServerEvent::Context(ContextState::Ready));
        Ok(())
    }

    fn state(&self) -> ContextState {
        self.inner.state().context
    }

    fn create_stream(
        &mut self,
        kind: EndpointKind,
        name: &str,
        spec: &SampleSpec,
    ) -> Result<Box<dyn ServerStream>, ServerError> {
        let mut state = self.inner.state();
        state.check(ServerOp::CreateStream)?;
        state.require_context(ServerOp::CreateStream)?;
        state.streams[kind.index()] = Some(StreamSlot::new(name, spec));
        Ok(Box::new(SimStream {
            kind,
            inner: Arc::clone(&self.inner),
            write_buf: Vec::new(),
            current: None,
        }))
    }

    fn request_sink_info(&mut self, index: u32) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state();
            state.check(ServerOp::SinkInfo)?;
            state.require_context(ServerOp::SinkInfo)?;
        }
        let event = if index == SINK_INDEX {
            ServerEvent::SinkInfo(SinkInfo {
                index,
                name: SINK_NAME.to_string(),
                monitor_source: MONITOR_SOURCE.to_string(),
            })
        } else {
            ServerEvent::SinkInfoFailed {
                index,
                message: "no such sink".to_string(),
            }
        };
        self.inner.emit(event);
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<ServerEvent> {
        let event = self.events.recv_timeout(timeout).ok()?;
        if event == ServerEvent::Wakeup {
            self.inner.waker.pending.store(false, Ordering::Release);
        }
        Some(event)
    }

    fn waker(&self) -> Arc<dyn Wake> {
        Arc::clone(&self.inner.waker) as Arc<dyn Wake>
    }

    fn disconnect(&mut self) {
        let mut state = self.inner.state();
        state.context = ContextState::Terminated;
        state.disconnected = true;
    }
}

struct SimStream {
    kind: EndpointKind,
    inner: Arc<ServerInner>,
    write_buf: Vec<u8>,
    current: Option<Chunk>,
}

impl SimStream {
    fn connect(
        &mut self,
        device: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError> {
        let (device, index) = match (self.kind, device) {
            (EndpointKind::Playback, _) => (device.unwrap_or(SINK_NAME), SINK_INDEX),
            (EndpointKind::Capture, _) => (device.unwrap_or(SOURCE_NAME), SOURCE_INDEX),
            (EndpointKind::Monitor, Some(device)) => (device, MONITOR_INDEX),
            (EndpointKind::Monitor, None) => {
                return Err(ServerError::failed(
                    ServerOp::ConnectStream,
                    "monitor stream needs a source",
                ))
            }
        };
        {
            let mut state = self.inner.state();
            state.check(ServerOp::ConnectStream)?;
            let slot = state
                .slot(self.kind)
                .ok_or(ServerError::NotConnected(ServerOp::ConnectStream))?;
            slot.state = StreamState::Ready;
            slot.flags = flags;
            slot.attr = Some(*attr);
            slot.device = Some(device.to_string());
            slot.device_index = Some(index);
            debug!("sim {} stream {:?} on {}", self.kind, slot.name, device);
        }
        let kind = self.kind;
        self.inner.emit(ServerEvent::Stream {
            kind,
            state: StreamState::Creating,
        });
        self.inner.emit(ServerEvent::Stream {
            kind,
            state: StreamState::Ready,
        });
        if kind == EndpointKind::Playback {
            self.inner.emit(ServerEvent::Writable {
                kind,
                bytes: attr.target_length as usize,
            });
        }
        Ok(())
    }
}

impl ServerStream for SimStream {
    fn connect_playback(
        &mut self,
        device: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError> {
        self.connect(device, attr, flags)
    }

    fn connect_record(
        &mut self,
        device: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError> {
        self.connect(device, attr, flags)
    }

    fn state(&self) -> StreamState {
        self.inner
            .state()
            .slot(self.kind)
            .map_or(StreamState::Unconnected, |slot| slot.state)
    }

    fn device_index(&self) -> Option<u32> {
        self.inner
            .state()
            .slot(self.kind)
            .and_then(|slot| slot.device_index)
    }

    fn begin_write(&mut self, len: usize) -> Result<&mut [u8], ServerError> {
        self.inner
            .state()
            .ready_slot(self.kind, ServerOp::BeginWrite)?;
        self.write_buf.clear();
        self.write_buf.resize(len, 0);
        Ok(&mut self.write_buf)
    }

    fn write(&mut self, len: usize) -> Result<(), ServerError> {
        let data = self
            .write_buf
            .get(..len)
            .ok_or_else(|| ServerError::failed(ServerOp::Write, "write past buffer"))?;
        let looped = {
            let mut state = self.inner.state();
            state
                .ready_slot(self.kind, ServerOp::Write)?
                .played
                .extend_from_slice(data);
            match state.slot(EndpointKind::Monitor) {
                Some(monitor) if monitor.state == StreamState::Ready => {
                    monitor.pending.push_back(Chunk::Data(data.to_vec()));
                    true
                }
                _ => false,
            }
        };
        if looped {
            self.inner.emit(ServerEvent::Readable {
                kind: EndpointKind::Monitor,
            });
        }
        Ok(())
    }

    fn readable_size(&self) -> usize {
        let queued: usize = self
            .inner
            .state()
            .slot(self.kind)
            .map_or(0, |slot| slot.pending.iter().map(Chunk::len).sum());
        queued + self.current.as_ref().map_or(0, Chunk::len)
    }

    fn peek(&mut self) -> Result<Fragment<'_>, ServerError> {
        if self.current.is_none() {
            let mut state = self.inner.state();
            self.current = state
                .ready_slot(self.kind, ServerOp::Peek)?
                .pending
                .pop_front();
        }
        Ok(match &self.current {
            None => Fragment::Empty,
            Some(Chunk::Hole(len)) => Fragment::Hole(*len),
            Some(Chunk::Data(data)) => Fragment::Data(data),
        })
    }

    fn discard(&mut self) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        state.check(ServerOp::Discard)?;
        match self.current.take() {
            Some(Chunk::Data(data)) => {
                if let Some(slot) = state.slot(self.kind) {
                    slot.delivered += data.len();
                }
                Ok(())
            }
            Some(Chunk::Hole(_)) => Ok(()),
            None => Err(ServerError::failed(ServerOp::Discard, "nothing peeked")),
        }
    }

    fn set_buffer_attr(&mut self, attr: &BufferAttr) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        let slot = state.ready_slot(self.kind, ServerOp::SetBufferAttr)?;
        slot.attr = Some(*attr);
        slot.set_attr_calls += 1;
        Ok(())
    }

    fn update_sample_rate(&mut self, rate: u32) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        let slot = state.ready_slot(self.kind, ServerOp::UpdateSampleRate)?;
        if !slot.flags.variable_rate {
            return Err(ServerError::failed(
                ServerOp::UpdateSampleRate,
                "stream was not connected with variable rate",
            ));
        }
        slot.rate = rate;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ServerError> {
        let mut state = self.inner.state();
        state.check(ServerOp::Disconnect)?;
        self.current = None;
        if let Some(slot) = state.slot(self.kind) {
            slot.state = StreamState::Terminated;
            slot.pending.clear();
        }
        Ok(())
    }
}

fn encode(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl SimServerHandle {
    /// Queue interleaved samples on the capture source. Returns false if
    /// there is no connected capture stream.
    pub fn push_capture(&self, samples: &[f32]) -> bool {
        self.push(EndpointKind::Capture, Chunk::Data(encode(samples)))
    }

    /// Queue a gap of `len` bytes on a record stream.
    pub fn push_hole(&self, kind: EndpointKind, len: usize) -> bool {
        self.push(kind, Chunk::Hole(len))
    }

    fn push(&self, kind: EndpointKind, chunk: Chunk) -> bool {
        {
            let mut state = self.inner.state();
            match state.slot(kind) {
                Some(slot) if slot.state == StreamState::Ready => slot.pending.push_back(chunk),
                _ => return false,
            }
        }
        self.inner.emit(ServerEvent::Readable { kind });
        true
    }

    /// Move a stream to another device, the way a user would in a mixer.
    pub fn move_stream(&self, kind: EndpointKind, device: &str) {
        if let Some(slot) = self.inner.state().slot(kind) {
            slot.device = Some(device.to_string());
        }
        self.inner.emit(ServerEvent::Moved {
            kind,
            device: device.to_string(),
        });
    }

    pub fn fail_context(&self) {
        self.inner.state().context = ContextState::Failed;
        self.inner.emit(ServerEvent::Context(ContextState::Failed));
    }

    pub fn terminate_context(&self) {
        self.inner.state().context = ContextState::Terminated;
        self.inner.emit(ServerEvent::Context(ContextState::Terminated));
    }

    pub fn fail_stream(&self, kind: EndpointKind) {
        if let Some(slot) = self.inner.state().slot(kind) {
            slot.state = StreamState::Failed;
        }
        self.inner.emit(ServerEvent::Stream {
            kind,
            state: StreamState::Failed,
        });
    }

    /// Ask for more playback data.
    pub fn request_writable(&self, bytes: usize) {
        self.inner.emit(ServerEvent::Writable {
            kind: EndpointKind::Playback,
            bytes,
        });
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: ServerOp) {
        self.inner.state().fail_next.push(op);
    }

    /// Raw bytes the playback stream has written.
    pub fn played(&self) -> Vec<u8> {
        self.inspect(EndpointKind::Playback, |slot| slot.played.clone())
            .unwrap_or_default()
    }

    pub fn played_samples(&self) -> Vec<f32> {
        decode(&self.played())
    }

    /// Bytes the relay has consumed from a record stream.
    pub fn delivered_bytes(&self, kind: EndpointKind) -> usize {
        self.inspect(kind, |slot| slot.delivered).unwrap_or(0)
    }

    pub fn stream_attr(&self, kind: EndpointKind) -> Option<BufferAttr> {
        self.inspect(kind, |slot| slot.attr).flatten()
    }

    pub fn stream_rate(&self, kind: EndpointKind) -> Option<u32> {
        self.inspect(kind, |slot| slot.rate)
    }

    pub fn stream_state(&self, kind: EndpointKind) -> Option<StreamState> {
        self.inspect(kind, |slot| slot.state)
    }

    pub fn stream_device(&self, kind: EndpointKind) -> Option<String> {
        self.inspect(kind, |slot| slot.device.clone()).flatten()
    }

    pub fn set_attr_calls(&self, kind: EndpointKind) -> usize {
        self.inspect(kind, |slot| slot.set_attr_calls).unwrap_or(0)
    }

    pub fn context_state(&self) -> ContextState {
        self.inner.state().context
    }

    pub fn client_name(&self) -> Option<String> {
        self.inner.state().client_name.clone()
    }

    /// The client closed its context.
    pub fn disconnected(&self) -> bool {
        self.inner.state().disconnected
    }

    fn inspect<T>(&self, kind: EndpointKind, f: impl FnOnce(&StreamSlot) -> T) -> Option<T> {
        self.inner.state().slot(kind).map(|slot| f(slot))
    }
}
