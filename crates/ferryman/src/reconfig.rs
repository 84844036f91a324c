//! Buffer and attribute renegotiation, plus the shutdown latch.
//!
//! Period-size changes replace every ring while holding both locks (io,
//! then rt), so the realtime thread either sees the old ring set or the new
//! one and skips the period in between. In-flight audio is dropped.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoint::{EndpointKind, EndpointState};
use crate::engine::NotificationHandler;
use crate::error::{BridgeError, ServerResultExt};
use crate::server::Wake;
use crate::session::ExitReason;
use crate::shared::{allocate_rings, IoState, Phase, RelayShared};

/// How the session ended.
#[derive(Debug)]
pub enum Outcome {
    Exit(ExitReason),
    Failed(BridgeError),
}

pub struct ReconfigurationCoordinator {
    shared: Arc<RelayShared>,
    cancel: CancellationToken,
    waker: Arc<dyn Wake>,
    outcome: Mutex<Option<Outcome>>,
}

impl ReconfigurationCoordinator {
    pub fn new(shared: Arc<RelayShared>, cancel: CancellationToken, waker: Arc<dyn Wake>) -> Self {
        Self {
            shared,
            cancel,
            waker,
            outcome: Mutex::new(None),
        }
    }

    /// The graph's period size changed to `frames`.
    pub fn on_period_size(&self, frames: u32) -> Result<(), BridgeError> {
        let mut io = self.shared.lock_io();
        if io.layout.period_frames == frames {
            debug!("period size unchanged at {} frames", frames);
            return Ok(());
        }
        if self.shared.phase() == Phase::Shutdown {
            return Ok(());
        }

        let previous = io.layout.period_frames;
        let layout = io
            .layout
            .with_period(frames)
            .map_err(|e| BridgeError::Reconfigure {
                frames,
                reason: e.to_string(),
            })?;

        self.shared.set_phase(Phase::Reconfiguring);
        let (rt_rings, io_rings) =
            allocate_rings(&layout).map_err(|e| BridgeError::Reconfigure {
                frames,
                reason: e.to_string(),
            })?;

        {
            let mut rt = self.shared.lock_rt();
            *rt = rt_rings;
            io.rings = io_rings;
            io.layout = layout;
        }

        let attr = layout.buffer_attr();
        for kind in EndpointKind::ALL {
            let endpoint = io.endpoints.get_mut(kind);
            endpoint.set_attr(attr);
            if !endpoint.is_streaming() {
                continue;
            }
            if let Some(stream) = endpoint.stream_mut() {
                stream
                    .set_buffer_attr(&attr)
                    .during(|| format!("reset {kind} buffer attributes"))?;
            }
        }

        self.shared
            .stats()
            .reconfigurations
            .fetch_add(1, Ordering::Relaxed);
        self.shared.set_phase(Phase::Stable);

        info!(
            "period size {} -> {} frames, rings now {} bytes",
            previous,
            frames,
            layout.ring_capacity()
        );
        Ok(())
    }

    /// The graph's sample rate changed. Rings stay as they are.
    pub fn on_sample_rate(&self, rate: u32) -> Result<(), BridgeError> {
        let mut io = self.shared.lock_io();
        if io.layout.sample_rate == rate {
            debug!("sample rate unchanged at {} Hz", rate);
            return Ok(());
        }

        let previous = io.layout.sample_rate;
        io.layout = io.layout.with_sample_rate(rate)?;

        for kind in EndpointKind::ALL {
            let endpoint = io.endpoints.get_mut(kind);
            if !endpoint.is_streaming() {
                continue;
            }
            if let Some(stream) = endpoint.stream_mut() {
                stream
                    .update_sample_rate(rate)
                    .during(|| format!("update {kind} sample rate"))?;
            }
        }

        info!("sample rate {} -> {} Hz", previous, rate);
        Ok(())
    }

    /// A stream followed its device somewhere else. Caller holds the io lock.
    pub fn on_stream_moved(
        &self,
        io: &mut IoState,
        kind: EndpointKind,
        device: &str,
    ) -> Result<(), BridgeError> {
        let attr = io.layout.buffer_attr();
        let endpoint = io.endpoints.get_mut(kind);
        if !endpoint.transition(EndpointState::Moved) {
            return Ok(());
        }
        info!("{} stream moved to {}", kind, device);

        endpoint.set_attr(attr);
        if let Some(stream) = endpoint.stream_mut() {
            stream
                .set_buffer_attr(&attr)
                .during(|| format!("reapply {kind} buffer attributes after move"))?;
        }
        endpoint.transition(EndpointState::Ready);
        Ok(())
    }

    /// Ask for a clean exit. The first recorded outcome wins.
    pub fn request_shutdown(&self, reason: ExitReason) {
        if self.record(Outcome::Exit(reason)) {
            info!("shutdown requested: {:?}", reason);
        }
        self.stop();
    }

    /// Record a fatal error and shut down.
    pub fn fail(&self, err: BridgeError) {
        error!("relay failed: {}", err);
        if !self.record(Outcome::Failed(err)) {
            warn!("relay already stopping, keeping the earlier outcome");
        }
        self.stop();
    }

    /// Record a crash. Unlike `fail`, this replaces a clean exit that was
    /// already recorded; only an earlier failure is kept.
    pub fn crashed(&self, err: BridgeError) {
        error!("relay crashed: {}", err);
        {
            let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*slot, Some(Outcome::Failed(_))) {
                *slot = Some(Outcome::Failed(err));
            }
        }
        self.stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Exit reason so far, without consuming the outcome.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        let outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        outcome.as_ref().map(|o| match o {
            Outcome::Exit(reason) => *reason,
            Outcome::Failed(_) => ExitReason::Failed,
        })
    }

    pub fn take_outcome(&self) -> Option<Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn record(&self, outcome: Outcome) -> bool {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    fn stop(&self) {
        self.shared.set_phase(Phase::Shutdown);
        self.cancel.cancel();
        self.waker.wake();
    }
}

/// Routes graph notifications to the coordinator.
pub struct GraphNotifier {
    coordinator: Arc<ReconfigurationCoordinator>,
}

impl GraphNotifier {
    pub fn new(coordinator: Arc<ReconfigurationCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl NotificationHandler for GraphNotifier {
    fn buffer_size(&mut self, frames: u32) {
        if let Err(e) = self.coordinator.on_period_size(frames) {
            self.coordinator.fail(e);
        }
    }

    fn sample_rate(&mut self, rate: u32) {
        if let Err(e) = self.coordinator.on_sample_rate(rate) {
            self.coordinator.fail(e);
        }
    }

    fn shutdown(&mut self, reason: &str) {
        info!("graph engine shut down: {}", reason);
        self.coordinator.request_shutdown(ExitReason::GraphShutdown);
    }
}
