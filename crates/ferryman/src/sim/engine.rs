//! In-process graph engine.
//!
//! Periods run when someone calls [`SimEngineHandle::run_period`] or from a
//! clock thread started with [`SimEngineHandle::spawn_clock`]. Notifications
//! are delivered synchronously on the caller's thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::EndpointKind;
use crate::engine::{
    Control, EngineError, GraphClient, NotificationHandler, PeriodIo, PortSpec, ProcessHandler,
};

#[derive(Debug)]
struct EngineState {
    sample_rate: u32,
    buffer_size: u32,
    ports: Vec<PortSpec>,
    active: bool,
    shut_down: bool,
}

impl EngineState {
    fn channels(&self, kind: EndpointKind) -> usize {
        self.ports.iter().filter(|p| p.kind == kind).count()
    }
}

struct EngineInner {
    state: Mutex<EngineState>,
    process: Mutex<Option<Box<dyn ProcessHandler>>>,
    notifications: Mutex<Option<Box<dyn NotificationHandler>>>,
    periods: AtomicU64,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl FnOnce(&mut dyn NotificationHandler)) {
        let mut handler = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match handler.as_mut() {
            Some(handler) => f(handler.as_mut()),
            None => debug!("no notification handler, dropping notification"),
        }
    }
}

/// The client half, handed to the session.
pub struct SimEngine {
    name: String,
    inner: Arc<EngineInner>,
}

/// The driver half, kept by whoever plays the engine.
#[derive(Clone)]
pub struct SimEngineHandle {
    inner: Arc<EngineInner>,
}

impl SimEngine {
    pub fn new(name: impl Into<String>, sample_rate: u32, buffer_size: u32) -> Self {
        let state = EngineState {
            sample_rate,
            buffer_size,
            ports: Vec::new(),
            active: false,
            shut_down: false,
        };
        Self {
            name: name.into(),
            inner: Arc::new(EngineInner {
                state: Mutex::new(state),
                process: Mutex::new(None),
                notifications: Mutex::new(None),
                periods: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> SimEngineHandle {
        SimEngineHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl GraphClient for SimEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.inner.state().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.inner.state().buffer_size
    }

    fn register_ports(&mut self, ports: &[PortSpec]) -> Result<(), EngineError> {
        let mut state = self.inner.state();
        for port in ports {
            if state.ports.iter().any(|p| p.name == port.name) {
                return Err(EngineError::PortRegistration {
                    port: port.name.clone(),
                    message: "port already exists".to_string(),
                });
            }
            debug!("registered port {}:{}", self.name, port.name);
            state.ports.push(port.clone());
        }
        Ok(())
    }

    fn activate(
        &mut self,
        process: Box<dyn ProcessHandler>,
        notifications: Box<dyn NotificationHandler>,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.state();
        if state.active {
            return Err(EngineError::AlreadyActive);
        }
        if state.shut_down {
            return Err(EngineError::Activation("engine has shut down".to_string()));
        }
        *self
            .inner
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(process);
        *self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(notifications);
        state.active = true;
        info!(
            "sim engine {} active: {} Hz, {} frames",
            self.name, state.sample_rate, state.buffer_size
        );
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), EngineError> {
        self.inner.state().active = false;
        // Blocks until an in-flight period finishes
        let process = self
            .inner
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let notifications = self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if process.is_some() || notifications.is_some() {
            debug!("sim engine {} deactivated", self.name);
        }
        Ok(())
    }
}

/// What the graph got back from one period.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodOutput {
    pub capture: Vec<Vec<f32>>,
    pub monitor: Vec<Vec<f32>>,
    pub control: Control,
}

struct SimPeriod {
    frames: usize,
    playback: Vec<Vec<f32>>,
    capture: Vec<Vec<f32>>,
    monitor: Vec<Vec<f32>>,
}

impl PeriodIo for SimPeriod {
    fn frames(&self) -> usize {
        self.frames
    }

    fn playback(&self, channel: usize) -> Option<&[f32]> {
        self.playback.get(channel).map(Vec::as_slice)
    }

    fn output(&mut self, kind: EndpointKind, channel: usize) -> Option<&mut [f32]> {
        let ports = match kind {
            EndpointKind::Capture => &mut self.capture,
            EndpointKind::Monitor => &mut self.monitor,
            EndpointKind::Playback => return None,
        };
        ports.get_mut(channel).map(Vec::as_mut_slice)
    }
}

impl SimEngineHandle {
    pub fn sample_rate(&self) -> u32 {
        self.inner.state().sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.inner.state().buffer_size
    }

    pub fn is_active(&self) -> bool {
        let state = self.inner.state();
        state.active && !state.shut_down
    }

    pub fn ports(&self) -> Vec<PortSpec> {
        self.inner.state().ports.clone()
    }

    /// Periods processed so far.
    pub fn periods(&self) -> u64 {
        self.inner.periods.load(Ordering::Relaxed)
    }

    /// Run one period with `playback` as the playback port contents.
    ///
    /// Missing channels are silent, short ones are zero-padded. Returns None
    /// when the engine is not running. A handler that returns
    /// [`Control::Quit`] gets no further periods.
    pub fn run_period(&self, playback: &[Vec<f32>]) -> Option<PeriodOutput> {
        let (frames, inputs, outputs) = {
            let state = self.inner.state();
            if !state.active || state.shut_down {
                return None;
            }
            (
                state.buffer_size as usize,
                state.channels(EndpointKind::Playback),
                state.channels(EndpointKind::Capture),
            )
        };

        let mut period = SimPeriod {
            frames,
            playback: (0..inputs)
                .map(|ch| {
                    let mut samples = playback.get(ch).cloned().unwrap_or_default();
                    samples.resize(frames, 0.0);
                    samples
                })
                .collect(),
            capture: vec![vec![0.0; frames]; outputs],
            monitor: vec![vec![0.0; frames]; outputs],
        };

        let control = {
            let mut process = self
                .inner
                .process
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            process.as_mut()?.process(&mut period)
        };
        self.inner.periods.fetch_add(1, Ordering::Relaxed);

        if control == Control::Quit {
            let mut state = self.inner.state();
            if state.active {
                state.active = false;
                info!("process handler quit, no more periods");
            }
        }

        Some(PeriodOutput {
            capture: period.capture,
            monitor: period.monitor,
            control,
        })
    }

    /// Change the period size and tell the client.
    pub fn set_buffer_size(&self, frames: u32) {
        self.inner.state().buffer_size = frames;
        self.inner.notify(|n| n.buffer_size(frames));
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.inner.state().sample_rate = rate;
        self.inner.notify(|n| n.sample_rate(rate));
    }

    pub fn connect_ports(&self, a: &str, b: &str, connected: bool) {
        self.inner.notify(|n| n.ports_connected(a, b, connected));
    }

    pub fn report_error(&self, message: &str) {
        self.inner.notify(|n| n.error(message));
    }

    /// The engine goes away. No more periods run.
    pub fn shutdown(&self, reason: &str) {
        self.inner.state().shut_down = true;
        info!("sim engine shutting down: {}", reason);
        self.inner.notify(|n| n.shutdown(reason));
    }

    /// Run periods in real time on a background thread until the returned
    /// handle is stopped or dropped.
    ///
    /// `generator` gets the period size and playback channel count and
    /// returns the playback port contents.
    pub fn spawn_clock<F>(&self, mut generator: F) -> std::io::Result<ClockHandle>
    where
        F: FnMut(usize, usize) -> Vec<Vec<f32>> + Send + 'static,
    {
        let engine = self.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("sim-clock".to_string())
            .spawn(move || {
                let mut periods = 0u64;
                while flag.load(Ordering::Acquire) {
                    let (frames, channels, rate) = {
                        let state = engine.inner.state();
                        (
                            state.buffer_size as usize,
                            state.channels(EndpointKind::Playback),
                            state.sample_rate.max(1),
                        )
                    };
                    let input = generator(frames, channels);
                    if engine.run_period(&input).is_some() {
                        periods += 1;
                    }
                    thread::sleep(Duration::from_secs_f64(frames as f64 / rate as f64));
                }
                periods
            })?;

        Ok(ClockHandle {
            running,
            thread: Some(thread),
        })
    }
}

/// Stops the clock thread on `stop` or drop.
pub struct ClockHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl ClockHandle {
    /// Stop the clock and return how many periods it ran.
    pub fn stop(mut self) -> u64 {
        self.halt()
    }

    fn halt(&mut self) -> u64 {
        self.running.store(false, Ordering::Release);
        self.thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Recorder {
        sizes: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    impl NotificationHandler for Recorder {
        fn buffer_size(&mut self, frames: u32) {
            self.sizes.store(frames, Ordering::SeqCst);
        }

        fn sample_rate(&mut self, _rate: u32) {}

        fn shutdown(&mut self, _reason: &str) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Copies playback channel 0 into capture channel 0.
    struct Passthrough;

    impl ProcessHandler for Passthrough {
        fn process(&mut self, io: &mut dyn PeriodIo) -> Control {
            let input: Vec<f32> = io.playback(0).map(<[f32]>::to_vec).unwrap_or_default();
            if let Some(out) = io.output(EndpointKind::Capture, 0) {
                out.copy_from_slice(&input);
            }
            Control::Continue
        }
    }

    /// Quits on its second period.
    #[derive(Default)]
    struct QuitAfterOne {
        seen: u32,
    }

    impl ProcessHandler for QuitAfterOne {
        fn process(&mut self, _io: &mut dyn PeriodIo) -> Control {
            self.seen += 1;
            if self.seen > 1 {
                Control::Quit
            } else {
                Control::Continue
            }
        }
    }

    fn active_engine() -> (SimEngine, SimEngineHandle, Recorder) {
        let mut engine = SimEngine::new("test", 48000, 4);
        let handle = engine.handle();
        engine.register_ports(&PortSpec::for_layout(1)).unwrap();
        let recorder = Recorder::default();
        let notifications = Recorder {
            sizes: Arc::clone(&recorder.sizes),
            shutdowns: Arc::clone(&recorder.shutdowns),
        };
        engine
            .activate(Box::new(Passthrough), Box::new(notifications))
            .unwrap();
        (engine, handle, recorder)
    }

    #[test]
    fn test_inactive_engine_runs_nothing() {
        let engine = SimEngine::new("idle", 48000, 64);
        assert!(engine.handle().run_period(&[]).is_none());
    }

    #[test]
    fn test_period_pads_short_input() {
        let (_engine, handle, _) = active_engine();
        let out = handle.run_period(&[vec![1.0, 2.0]]).unwrap();
        assert_eq!(out.capture, vec![vec![1.0, 2.0, 0.0, 0.0]]);
        assert_eq!(out.control, Control::Continue);
        assert_eq!(handle.periods(), 1);
    }

    #[test]
    fn test_quit_stops_periods() {
        let mut engine = SimEngine::new("quitter", 48000, 4);
        let handle = engine.handle();
        engine
            .activate(Box::<QuitAfterOne>::default(), Box::new(Recorder::default()))
            .unwrap();

        assert_eq!(handle.run_period(&[]).unwrap().control, Control::Continue);
        assert_eq!(handle.run_period(&[]).unwrap().control, Control::Quit);
        assert!(!handle.is_active());
        assert!(handle.run_period(&[]).is_none());
        assert_eq!(handle.periods(), 2);

        // Clock keeps ticking but runs nothing
        let clock = handle
            .spawn_clock(|frames, channels| vec![vec![0.0; frames]; channels])
            .unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.stop(), 0);
        engine.deactivate().unwrap();
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut engine = SimEngine::new("dup", 48000, 64);
        engine.register_ports(&PortSpec::for_layout(1)).unwrap();
        let err = engine.register_ports(&PortSpec::for_layout(1)).unwrap_err();
        assert!(matches!(err, EngineError::PortRegistration { .. }));
    }

    #[test]
    fn test_double_activation_rejected() {
        let (mut engine, _, _) = active_engine();
        let err = engine
            .activate(Box::new(Passthrough), Box::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyActive);
    }

    #[test]
    fn test_notifications_and_shutdown() {
        let (_engine, handle, recorder) = active_engine();
        handle.set_buffer_size(8);
        assert_eq!(recorder.sizes.load(Ordering::SeqCst), 8);
        assert_eq!(handle.run_period(&[]).unwrap().capture[0].len(), 8);

        handle.shutdown("gone");
        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
        assert!(handle.run_period(&[]).is_none());
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let (mut engine, handle, _) = active_engine();
        engine.deactivate().unwrap();
        engine.deactivate().unwrap();
        assert!(handle.run_period(&[]).is_none());
    }

    #[test]
    fn test_clock_runs_periods() {
        let (_engine, handle, _) = active_engine();
        let clock = handle
            .spawn_clock(|frames, channels| vec![vec![0.5; frames]; channels])
            .unwrap();
        while handle.periods() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(clock.stop() >= 3);
    }
}
