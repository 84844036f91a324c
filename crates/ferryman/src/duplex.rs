//! Server event loop: owns the server context and drives the three
//! endpoints through `create all -> connect all -> run -> teardown all`.
//!
//! The monitor endpoint is special. It records from the monitor source of
//! whatever sink playback landed on, which is only known once playback is
//! ready and the server has answered a sink-info query.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::AsyncStreamBridge;
use crate::endpoint::{EndpointKind, EndpointState};
use crate::error::{BridgeError, ServerResultExt};
use crate::reconfig::ReconfigurationCoordinator;
use crate::server::{
    ContextState, ServerContext, ServerEvent, SinkInfo, StreamFlags, StreamState,
};
use crate::session::ExitReason;
use crate::shared::{IoRings, IoState, Phase, RelayShared, RtRings};
use crate::stats::DiagnosticReceiver;

pub struct DuplexOrchestrator {
    context: Box<dyn ServerContext>,
    shared: Arc<RelayShared>,
    coordinator: Arc<ReconfigurationCoordinator>,
    bridge: AsyncStreamBridge,
    diagnostics: DiagnosticReceiver,
    cancel: CancellationToken,
    client_name: String,
    poll_interval: Duration,
    sink_query: Option<u32>,
}

impl DuplexOrchestrator {
    pub fn new(
        context: Box<dyn ServerContext>,
        shared: Arc<RelayShared>,
        coordinator: Arc<ReconfigurationCoordinator>,
        diagnostics: DiagnosticReceiver,
        cancel: CancellationToken,
        client_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let bridge = AsyncStreamBridge::new(Arc::clone(&shared));
        Self {
            context,
            shared,
            coordinator,
            bridge,
            diagnostics,
            cancel,
            client_name: client_name.into(),
            poll_interval,
            sink_query: None,
        }
    }

    /// Connect the server context. Streams follow once it is ready.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        info!("connecting to audio server as {}", self.client_name);
        let name = self.client_name.clone();
        self.context
            .connect(&name)
            .during(|| format!("connect as {name}"))
    }

    /// Event loop body. Returns once the session is cancelled, after
    /// tearing everything down.
    pub fn run(mut self) {
        if let Err(e) = self.start() {
            self.coordinator.fail(e);
        }

        while !self.cancel.is_cancelled() {
            if let Some(event) = self.context.next_event(self.poll_interval) {
                if let Err(e) = self.dispatch(event) {
                    self.coordinator.fail(e);
                }
            }
            self.diagnostics.log_pending();
        }

        self.diagnostics.log_pending();
        self.teardown_all();
    }

    pub fn dispatch(&mut self, event: ServerEvent) -> Result<(), BridgeError> {
        match event {
            ServerEvent::Context(ContextState::Ready) => {
                info!("audio server context ready");
                let shared = Arc::clone(&self.shared);
                let mut io = shared.lock_io();
                self.create_all(&mut io)?;
                self.connect_all(&mut io)
            }
            ServerEvent::Context(ContextState::Failed) => Err(BridgeError::ContextFailed(
                "unable to reach the audio server".to_string(),
            )),
            ServerEvent::Context(ContextState::Terminated) => {
                info!("audio server context terminated");
                self.coordinator.request_shutdown(ExitReason::ServerClosed);
                Ok(())
            }
            ServerEvent::Context(state) => {
                debug!("audio server context {:?}", state);
                Ok(())
            }
            ServerEvent::Stream { kind, state } => self.on_stream_state(kind, state),
            ServerEvent::Writable {
                kind: EndpointKind::Playback,
                ..
            }
            | ServerEvent::Wakeup => {
                let mut io = self.shared.lock_io();
                self.bridge.on_playback_writable(&mut io)
            }
            ServerEvent::Writable { kind, bytes } => {
                debug!("ignoring writable {} bytes on {} stream", bytes, kind);
                Ok(())
            }
            ServerEvent::Readable { kind } => {
                let mut io = self.shared.lock_io();
                self.bridge.on_readable(&mut io, kind)
            }
            ServerEvent::Moved { kind, device } => {
                let mut io = self.shared.lock_io();
                self.coordinator.on_stream_moved(&mut io, kind, &device)
            }
            ServerEvent::SinkInfo(info) => self.connect_monitor(info),
            ServerEvent::SinkInfoFailed { index, message } => {
                if self.sink_query != Some(index) {
                    return Ok(());
                }
                Err(BridgeError::NoMonitorSource { index, message })
            }
        }
    }

    /// Create one stream per endpoint with the negotiated sample spec.
    pub fn create_all(&mut self, io: &mut IoState) -> Result<(), BridgeError> {
        let spec = io.layout.sample_spec();
        for kind in EndpointKind::ALL {
            let endpoint = io.endpoints.get_mut(kind);
            if endpoint.has_stream() {
                continue;
            }
            let stream = self
                .context
                .create_stream(kind, endpoint.name(), &spec)
                .during(|| format!("create {kind} stream"))?;
            endpoint.attach(stream);
            debug!("created {} stream {:?}", kind, endpoint.name());
        }
        Ok(())
    }

    /// Connect playback and capture. Monitor waits for the playback sink.
    pub fn connect_all(&mut self, io: &mut IoState) -> Result<(), BridgeError> {
        for kind in [EndpointKind::Playback, EndpointKind::Capture] {
            let endpoint = io.endpoints.get_mut(kind);
            if endpoint.state() != EndpointState::Unconnected {
                continue;
            }
            let attr = *endpoint.attr();
            let device = endpoint.device().map(str::to_owned);
            let Some(stream) = endpoint.stream_mut() else {
                continue;
            };
            let connected = match kind {
                EndpointKind::Playback => {
                    stream.connect_playback(device.as_deref(), &attr, StreamFlags::RELAY)
                }
                _ => stream.connect_record(device.as_deref(), &attr, StreamFlags::RELAY),
            };
            connected.during(|| format!("connect {kind} stream"))?;
            endpoint.transition(EndpointState::Connecting);
        }
        Ok(())
    }

    fn on_stream_state(&mut self, kind: EndpointKind, state: StreamState) -> Result<(), BridgeError> {
        match state {
            StreamState::Ready => {
                let device_index = {
                    let mut io = self.shared.lock_io();
                    let endpoint = io.endpoints.get_mut(kind);
                    if !endpoint.transition(EndpointState::Ready) {
                        return Ok(());
                    }
                    info!("{} stream ready", kind);
                    endpoint.stream_mut().and_then(|s| s.device_index())
                };
                if kind == EndpointKind::Playback && self.sink_query.is_none() {
                    self.query_playback_sink(device_index)?;
                }
                Ok(())
            }
            StreamState::Failed => {
                self.shared
                    .lock_io()
                    .endpoints
                    .get_mut(kind)
                    .transition(EndpointState::Failed);
                Err(BridgeError::StreamFailed { kind })
            }
            StreamState::Terminated => {
                self.shared
                    .lock_io()
                    .endpoints
                    .get_mut(kind)
                    .transition(EndpointState::Terminated);
                debug!("{} stream terminated by server", kind);
                Ok(())
            }
            StreamState::Unconnected | StreamState::Creating => {
                debug!("{} stream {:?}", kind, state);
                Ok(())
            }
        }
    }

    fn query_playback_sink(&mut self, device_index: Option<u32>) -> Result<(), BridgeError> {
        let Some(index) = device_index else {
            warn!("playback stream has no sink index, monitor stays disconnected");
            return Ok(());
        };
        debug!("querying sink {} for its monitor source", index);
        self.context
            .request_sink_info(index)
            .during(|| format!("query sink {index}"))?;
        self.sink_query = Some(index);
        Ok(())
    }

    fn connect_monitor(&mut self, info: SinkInfo) -> Result<(), BridgeError> {
        if self.sink_query != Some(info.index) {
            debug!("ignoring info for sink {}", info.index);
            return Ok(());
        }

        let mut io = self.shared.lock_io();
        let endpoint = io.endpoints.get_mut(EndpointKind::Monitor);
        if endpoint.state() != EndpointState::Unconnected {
            return Ok(());
        }

        info!(
            "monitoring sink {} through {}",
            info.name, info.monitor_source
        );
        let attr = *endpoint.attr();
        endpoint.set_device(Some(info.monitor_source.clone()));
        let Some(stream) = endpoint.stream_mut() else {
            return Ok(());
        };
        stream
            .connect_record(Some(&info.monitor_source), &attr, StreamFlags::RELAY)
            .during(|| format!("connect monitor stream to {}", info.monitor_source))?;
        endpoint.transition(EndpointState::Connecting);
        Ok(())
    }

    /// Disconnect monitor, capture, playback; free the rings; close the
    /// context. Every endpoint ends Terminated.
    pub fn teardown_all(&mut self) {
        self.shared.set_phase(Phase::Shutdown);
        {
            let mut io = self.shared.lock_io();
            for kind in EndpointKind::TEARDOWN_ORDER {
                let endpoint = io.endpoints.get_mut(kind);
                if let Some(mut stream) = endpoint.take_stream() {
                    if let Err(e) = stream.disconnect() {
                        warn!("failed to disconnect {} stream: {}", kind, e);
                    }
                }
                endpoint.transition(EndpointState::Terminated);
            }

            let mut rt = self.shared.lock_rt();
            *rt = RtRings::default();
            io.rings = IoRings::default();
        }
        self.context.disconnect();
        info!("audio server streams torn down");
    }
}
