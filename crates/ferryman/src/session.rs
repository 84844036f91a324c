//! One relay session: the graph client, the server event loop, and the
//! state they share.
//!
//! ```text
//!            Session::start
//!                 │
//!   ┌─────────────┼───────────────────────┐
//!   ▼             ▼                       ▼
//! RealtimeRelay  GraphNotifier      "server-loop" thread
//! (engine RT)    (engine notify)    DuplexOrchestrator
//!   │             │                       │
//!   └──── RelayShared (rt lock, io lock, phase, stats) ─┘
//! ```
//!
//! Shutdown from any side fires the session's cancellation token. The event
//! loop then tears down the streams and rings, and `close` deactivates the
//! graph client last.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ferryconf::FerryConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::duplex::DuplexOrchestrator;
use crate::endpoint::{EndpointKind, EndpointState, EndpointStatus, StreamEndpoint};
use crate::engine::{GraphClient, PortSpec};
use crate::error::BridgeError;
use crate::format::{FrameLayout, DEFAULT_CAPACITY_FACTOR};
use crate::reconfig::{GraphNotifier, Outcome, ReconfigurationCoordinator};
use crate::relay::RealtimeRelay;
use crate::server::ServerContext;
use crate::shared::{allocate_rings, Endpoints, IoState, RelayShared};
use crate::stats::{diagnostic_queue, RelayStats, StatsSnapshot, DIAGNOSTIC_QUEUE_CAPACITY};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Someone called `shutdown`.
    Requested,
    /// The graph engine went away.
    GraphShutdown,
    /// The audio server closed the connection.
    ServerClosed,
    /// A fatal error; `close` returns it.
    Failed,
}

impl ExitReason {
    /// Process exit status for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Failed => 1,
            _ => 0,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub client_name: String,
    pub channels: u16,
    pub capacity_factor: u32,
    pub playback_name: String,
    pub capture_name: String,
    pub monitor_name: String,
    pub playback_device: Option<String>,
    pub capture_device: Option<String>,
    /// How long the event loop waits for a server event before it checks
    /// for cancellation.
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&FerryConfig::default())
    }
}

impl From<&FerryConfig> for BridgeConfig {
    fn from(config: &FerryConfig) -> Self {
        Self {
            client_name: config.relay.client_name.clone(),
            channels: config.relay.channels,
            capacity_factor: config.relay.capacity_factor,
            playback_name: config.streams.playback_name.clone(),
            capture_name: config.streams.capture_name.clone(),
            monitor_name: config.streams.monitor_name.clone(),
            playback_device: config.streams.playback_device.clone(),
            capture_device: config.streams.capture_device.clone(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl BridgeConfig {
    fn ring_periods(&self) -> u32 {
        if self.capacity_factor == 0 {
            DEFAULT_CAPACITY_FACTOR
        } else {
            self.capacity_factor
        }
    }

    fn endpoint(&self, kind: EndpointKind, layout: &FrameLayout) -> StreamEndpoint {
        let (name, device) = match kind {
            EndpointKind::Playback => (&self.playback_name, self.playback_device.clone()),
            EndpointKind::Capture => (&self.capture_name, self.capture_device.clone()),
            // Device comes from the playback sink's monitor source
            EndpointKind::Monitor => (&self.monitor_name, None),
        };
        StreamEndpoint::new(
            kind,
            name.as_str(),
            device,
            layout.buffer_attr(),
            Arc::new(EndpointStatus::new()),
        )
    }
}

pub struct Session {
    client: Box<dyn GraphClient>,
    shared: Arc<RelayShared>,
    coordinator: Arc<ReconfigurationCoordinator>,
    cancel: CancellationToken,
    event_loop: Option<JoinHandle<()>>,
    active: bool,
}

impl Session {
    /// Register ports, start the server event loop, activate the client.
    pub fn start(
        config: &BridgeConfig,
        mut client: Box<dyn GraphClient>,
        context: Box<dyn ServerContext>,
    ) -> Result<Self, BridgeError> {
        let layout = FrameLayout::new(
            config.channels,
            client.sample_rate(),
            client.buffer_size(),
            config.ring_periods(),
        )?;
        info!(
            "starting session {}: {} ch @ {} Hz, period {} frames ({:.1}ms), rings {} bytes",
            client.name(),
            layout.channels,
            layout.sample_rate,
            layout.period_frames,
            layout.period_ms(),
            layout.ring_capacity()
        );

        let stats = Arc::new(RelayStats::default());
        let (rt_rings, io_rings) = allocate_rings(&layout)?;
        let endpoints = Endpoints::new(
            config.endpoint(EndpointKind::Playback, &layout),
            config.endpoint(EndpointKind::Capture, &layout),
            config.endpoint(EndpointKind::Monitor, &layout),
        );
        let shared = Arc::new(RelayShared::new(
            rt_rings,
            IoState {
                rings: io_rings,
                endpoints,
                layout,
            },
            Arc::clone(&stats),
        ));

        client.register_ports(&PortSpec::for_layout(layout.channels))?;

        let cancel = CancellationToken::new();
        let waker = context.waker();
        let coordinator = Arc::new(ReconfigurationCoordinator::new(
            Arc::clone(&shared),
            cancel.clone(),
            Arc::clone(&waker),
        ));
        let (diag_tx, diag_rx) = diagnostic_queue(DIAGNOSTIC_QUEUE_CAPACITY, stats);

        let orchestrator = DuplexOrchestrator::new(
            context,
            Arc::clone(&shared),
            Arc::clone(&coordinator),
            diag_rx,
            cancel.clone(),
            config.client_name.clone(),
            config.poll_interval,
        );
        let guard = LoopGuard(Arc::clone(&coordinator));
        let event_loop = thread::Builder::new()
            .name("server-loop".to_string())
            .spawn(move || {
                let _guard = guard;
                orchestrator.run();
            })
            .map_err(|source| BridgeError::Thread {
                name: "server-loop",
                source,
            })?;

        let mut session = Self {
            client,
            shared: Arc::clone(&shared),
            coordinator: Arc::clone(&coordinator),
            cancel,
            event_loop: Some(event_loop),
            active: false,
        };

        let relay = RealtimeRelay::new(shared, diag_tx, waker);
        let notifier = GraphNotifier::new(coordinator);
        if let Err(e) = session.client.activate(Box::new(relay), Box::new(notifier)) {
            session.coordinator.request_shutdown(ExitReason::Failed);
            session.stop();
            return Err(e.into());
        }
        session.active = true;

        info!("session {} running", session.client.name());
        Ok(session)
    }

    /// Token that fires when the session starts shutting down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the session is shutting down, for whatever reason.
    pub async fn wait(&self) -> ExitReason {
        self.cancel.cancelled().await;
        self.coordinator
            .exit_reason()
            .unwrap_or(ExitReason::Requested)
    }

    /// Ask the session to stop. `close` finishes the job.
    pub fn shutdown(&self) {
        self.coordinator.request_shutdown(ExitReason::Requested);
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current layout. Briefly takes the io lock.
    pub fn layout(&self) -> FrameLayout {
        self.shared.lock_io().layout
    }

    pub fn endpoint_state(&self, kind: EndpointKind) -> EndpointState {
        self.shared.status(kind).load()
    }

    pub fn endpoint_states(&self) -> [(EndpointKind, EndpointState); 3] {
        EndpointKind::ALL.map(|kind| (kind, self.endpoint_state(kind)))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats().snapshot()
    }

    /// Stop everything and report how the session ended.
    ///
    /// Clean exits come back as `Ok`; a fatal error is returned as is.
    pub fn close(mut self) -> Result<ExitReason, BridgeError> {
        self.stop();
        match self.coordinator.take_outcome() {
            Some(Outcome::Failed(err)) => Err(err),
            Some(Outcome::Exit(reason)) => Ok(reason),
            None => Ok(ExitReason::Requested),
        }
    }

    /// Tear down in order: event loop (streams, rings, context), then the
    /// graph client. Idempotent.
    fn stop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.coordinator.request_shutdown(ExitReason::Requested);
        }

        if let Some(handle) = self.event_loop.take() {
            debug!("waiting for server loop to finish...");
            if handle.join().is_err() {
                self.coordinator.crashed(BridgeError::Panicked("server-loop"));
            }
        }

        if self.active {
            self.active = false;
            if let Err(e) = self.client.deactivate() {
                warn!("failed to deactivate graph client: {}", e);
            }
            info!("session {} closed", self.client.name());
        }
    }
}

/// Lives on the event loop thread. If the loop unwinds, the session is
/// marked failed so waiters wake up.
struct LoopGuard(Arc<ReconfigurationCoordinator>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.crashed(BridgeError::Panicked("server-loop"));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::Requested.exit_code(), 0);
        assert_eq!(ExitReason::GraphShutdown.exit_code(), 0);
        assert_eq!(ExitReason::ServerClosed.exit_code(), 0);
        assert_eq!(ExitReason::Failed.exit_code(), 1);
    }

    #[test]
    fn test_config_from_ferryconf() {
        let mut config = FerryConfig::default();
        config.relay.channels = 4;
        config.streams.capture_device = Some("usb-mic".to_string());

        let bridge = BridgeConfig::from(&config);
        assert_eq!(bridge.channels, 4);
        assert_eq!(bridge.capacity_factor, 3);
        assert_eq!(bridge.client_name, "ferryman");
        assert_eq!(bridge.capture_device.as_deref(), Some("usb-mic"));
        assert_eq!(bridge.monitor_name, "ferryman monitor");
    }

    #[test]
    fn test_monitor_endpoint_has_no_fixed_device() {
        let mut bridge = BridgeConfig::default();
        bridge.playback_device = Some("hdmi".into());
        let layout = FrameLayout::new(2, 48000, 256, 3).unwrap();

        assert_eq!(
            bridge.endpoint(EndpointKind::Playback, &layout).device(),
            Some("hdmi")
        );
        assert_eq!(bridge.endpoint(EndpointKind::Monitor, &layout).device(), None);
    }
}
