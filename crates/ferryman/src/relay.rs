//! Realtime period callback.
//!
//! Runs on the graph engine's RT thread. Every period it interleaves the
//! playback ports into the playback ring and de-interleaves the capture and
//! monitor rings into their ports, then nudges the event loop.
//!
//! Nothing here blocks, allocates, or logs: the ring set is taken with
//! `try_lock`, xruns go onto the diagnostic queue, counters are atomics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::endpoint::EndpointKind;
use crate::engine::{Control, PeriodIo, ProcessHandler};
use crate::format::SAMPLE_BYTES;
use crate::ring::{whole_frames, RingReader, RingWriter};
use crate::server::Wake;
use crate::shared::{Phase, RelayShared};
use crate::stats::{Diagnostic, DiagnosticSender, XrunKind};

const INBOUND: [EndpointKind; 2] = [EndpointKind::Capture, EndpointKind::Monitor];

pub struct RealtimeRelay {
    shared: Arc<RelayShared>,
    diagnostics: DiagnosticSender,
    waker: Arc<dyn Wake>,
    channels: usize,
}

impl RealtimeRelay {
    pub fn new(
        shared: Arc<RelayShared>,
        diagnostics: DiagnosticSender,
        waker: Arc<dyn Wake>,
    ) -> Self {
        let channels = shared.channels() as usize;
        Self {
            shared,
            diagnostics,
            waker,
            channels,
        }
    }

    fn frame_bytes(&self) -> usize {
        self.channels * SAMPLE_BYTES
    }

    fn relay_playback(&mut self, writer: &mut RingWriter, io: &dyn PeriodIo) {
        let frames = io.frames();
        let need = frames * self.frame_bytes();
        let have = writer.available_to_write();
        let counters = &self.shared.stats().playback;

        // All or nothing: a partial period would be a glitch mid-buffer
        if have < need {
            counters.overflows.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.report(Diagnostic {
                kind: XrunKind::Overflow,
                endpoint: EndpointKind::Playback,
                have,
                need,
            });
            return;
        }

        let Ok(mut regions) = writer.write_regions(need) else {
            return;
        };
        let (first, second) = regions.as_mut_slices();
        let first_frames = first.len() / self.frame_bytes();
        interleave(first, io, 0, self.channels);
        interleave(second, io, first_frames, self.channels);
        regions.commit();

        counters.frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    fn relay_inbound(
        &mut self,
        kind: EndpointKind,
        reader: Option<&mut RingReader>,
        io: &mut dyn PeriodIo,
    ) {
        let frame_bytes = self.frame_bytes();
        let need = io.frames() * frame_bytes;
        let mut filled = 0;

        if let Some(reader) = reader {
            let have = reader.available_to_read();
            let take = whole_frames(have.min(need), frame_bytes);

            if take > 0 {
                if let Ok(regions) = reader.read_regions(take) {
                    let (first, second) = regions.as_slices();
                    deinterleave(first, io, kind, 0, self.channels);
                    deinterleave(second, io, kind, first.len() / frame_bytes, self.channels);
                    regions.commit();
                    filled = take / frame_bytes;
                }
            }

            if take < need && self.shared.status(kind).is_streaming() {
                self.shared
                    .stats()
                    .endpoint(kind)
                    .underflows
                    .fetch_add(1, Ordering::Relaxed);
                self.diagnostics.report(Diagnostic {
                    kind: XrunKind::Underflow,
                    endpoint: kind,
                    have,
                    need,
                });
            }
        }

        silence_from(io, kind, filled, self.channels);
        self.shared
            .stats()
            .endpoint(kind)
            .frames
            .fetch_add(filled as u64, Ordering::Relaxed);
    }
}

impl ProcessHandler for RealtimeRelay {
    fn process(&mut self, io: &mut dyn PeriodIo) -> Control {
        let shared = Arc::clone(&self.shared);
        shared.stats().periods.fetch_add(1, Ordering::Relaxed);

        // The rings are about to be freed; stay out of them for good
        if shared.phase() == Phase::Shutdown {
            silence_inbound(io, self.channels);
            return Control::Quit;
        }

        let Some(mut rings) = shared.try_lock_rt() else {
            shared.stats().skipped_periods.fetch_add(1, Ordering::Relaxed);
            silence_inbound(io, self.channels);
            return Control::Continue;
        };

        if shared.status(EndpointKind::Playback).is_streaming() {
            if let Some(writer) = rings.playback.as_mut() {
                self.relay_playback(writer, &*io);
            }
        }

        for kind in INBOUND {
            let reader = match kind {
                EndpointKind::Capture => rings.capture.as_mut(),
                _ => rings.monitor.as_mut(),
            };
            self.relay_inbound(kind, reader, io);
        }
        drop(rings);

        self.waker.wake();
        Control::Continue
    }
}

/// Write frames `start_frame..` of the playback ports into `dst`.
/// Missing ports and short buffers contribute silence.
fn interleave(dst: &mut [u8], io: &dyn PeriodIo, start_frame: usize, channels: usize) {
    let frame_bytes = channels * SAMPLE_BYTES;
    for ch in 0..channels {
        let src = io.playback(ch);
        let offset = ch * SAMPLE_BYTES;
        for (i, frame) in dst.chunks_exact_mut(frame_bytes).enumerate() {
            let value = src
                .and_then(|samples| samples.get(start_frame + i))
                .copied()
                .unwrap_or(0.0);
            frame[offset..offset + SAMPLE_BYTES].copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// Spread the frames in `src` over the `kind` ports starting at `start_frame`.
fn deinterleave(
    src: &[u8],
    io: &mut dyn PeriodIo,
    kind: EndpointKind,
    start_frame: usize,
    channels: usize,
) {
    let frame_bytes = channels * SAMPLE_BYTES;
    for ch in 0..channels {
        let Some(out) = io.output(kind, ch) else {
            continue;
        };
        let offset = ch * SAMPLE_BYTES;
        for (i, frame) in src.chunks_exact(frame_bytes).enumerate() {
            if let Some(slot) = out.get_mut(start_frame + i) {
                let b = &frame[offset..offset + SAMPLE_BYTES];
                *slot = f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
            }
        }
    }
}

fn silence_from(io: &mut dyn PeriodIo, kind: EndpointKind, from_frame: usize, channels: usize) {
    for ch in 0..channels {
        if let Some(out) = io.output(kind, ch) {
            if from_frame < out.len() {
                out[from_frame..].fill(0.0);
            }
        }
    }
}

fn silence_inbound(io: &mut dyn PeriodIo, channels: usize) {
    for kind in INBOUND {
        silence_from(io, kind, 0, channels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FrameLayout;
    use crate::shared::test_support::{make_streaming, shared};
    use crate::stats::{diagnostic_queue, DiagnosticReceiver};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct TestPeriod {
        frames: usize,
        playback: Vec<Vec<f32>>,
        capture: Vec<Vec<f32>>,
        monitor: Vec<Vec<f32>>,
    }

    impl TestPeriod {
        fn new(frames: usize, playback: Vec<Vec<f32>>) -> Self {
            Self {
                frames,
                playback,
                capture: vec![vec![9.0; frames]; 2],
                monitor: vec![vec![9.0; frames]; 2],
            }
        }
    }

    impl PeriodIo for TestPeriod {
        fn frames(&self) -> usize {
            self.frames
        }

        fn playback(&self, channel: usize) -> Option<&[f32]> {
            self.playback.get(channel).map(|v| v.as_slice())
        }

        fn output(&mut self, kind: EndpointKind, channel: usize) -> Option<&mut [f32]> {
            let set = match kind {
                EndpointKind::Capture => &mut self.capture,
                EndpointKind::Monitor => &mut self.monitor,
                EndpointKind::Playback => return None,
            };
            set.get_mut(channel).map(|v| v.as_mut_slice())
        }
    }

    struct Fixture {
        shared: Arc<RelayShared>,
        relay: RealtimeRelay,
        diagnostics: DiagnosticReceiver,
        waker: Arc<CountingWaker>,
    }

    fn fixture(period: u32) -> Fixture {
        let layout = FrameLayout::new(2, 48000, period, 3).unwrap();
        let shared = shared(layout);
        let (tx, rx) = diagnostic_queue(16, Arc::clone(shared.stats()));
        let waker = Arc::new(CountingWaker::default());
        let relay = RealtimeRelay::new(Arc::clone(&shared), tx, waker.clone());
        Fixture {
            shared,
            relay,
            diagnostics: rx,
            waker,
        }
    }

    fn stereo_ramp(frames: usize) -> Vec<Vec<f32>> {
        vec![
            (0..frames).map(|i| i as f32).collect(),
            (0..frames).map(|i| -(i as f32)).collect(),
        ]
    }

    fn encode(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn decode(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn test_playback_is_interleaved_into_ring() {
        let mut fx = fixture(4);
        make_streaming(&fx.shared, EndpointKind::Playback);

        let mut period = TestPeriod::new(4, stereo_ramp(4));
        assert_eq!(fx.relay.process(&mut period), Control::Continue);

        let mut io = fx.shared.lock_io();
        let reader = io.rings.playback.as_mut().unwrap();
        let mut out = vec![0u8; 32];
        assert_eq!(reader.read(&mut out), 32);
        assert_eq!(
            decode(&out),
            vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0]
        );
        assert_eq!(fx.waker.0.load(Ordering::Relaxed), 1);
        assert_eq!(fx.shared.stats().snapshot().playback.frames, 4);
    }

    #[test]
    fn test_playback_ignored_until_streaming() {
        let mut fx = fixture(4);
        let mut period = TestPeriod::new(4, stereo_ramp(4));
        fx.relay.process(&mut period);

        let io = fx.shared.lock_io();
        assert_eq!(io.rings.playback.as_ref().unwrap().available_to_read(), 0);
    }

    #[test]
    fn test_playback_overflow_writes_nothing() {
        let mut fx = fixture(4);
        make_streaming(&fx.shared, EndpointKind::Playback);

        // Three periods fill the ring; the fourth cannot fit
        for _ in 0..4 {
            let mut period = TestPeriod::new(4, stereo_ramp(4));
            fx.relay.process(&mut period);
        }

        let io = fx.shared.lock_io();
        assert_eq!(io.rings.playback.as_ref().unwrap().available_to_read(), 96);
        drop(io);

        let mut seen = Vec::new();
        fx.diagnostics.drain(|d| seen.push(d));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, XrunKind::Overflow);
        assert_eq!(seen[0].have, 0);
        assert_eq!(seen[0].need, 32);
        assert_eq!(fx.shared.stats().snapshot().playback.overflows, 1);
    }

    #[test]
    fn test_missing_playback_port_is_silent() {
        let mut fx = fixture(2);
        make_streaming(&fx.shared, EndpointKind::Playback);

        let mut period = TestPeriod::new(2, vec![vec![0.5, 0.25]]);
        fx.relay.process(&mut period);

        let mut io = fx.shared.lock_io();
        let mut out = vec![0u8; 16];
        io.rings.playback.as_mut().unwrap().read(&mut out);
        assert_eq!(decode(&out), vec![0.5, 0.0, 0.25, 0.0]);
    }

    #[test]
    fn test_capture_partial_read_then_silence() {
        let mut fx = fixture(4);
        make_streaming(&fx.shared, EndpointKind::Capture);
        {
            let mut io = fx.shared.lock_io();
            let bytes = encode(&[1.0, 10.0, 2.0, 20.0]);
            io.rings.capture.as_mut().unwrap().write(&bytes);
        }

        let mut period = TestPeriod::new(4, Vec::new());
        fx.relay.process(&mut period);

        assert_eq!(period.capture[0], vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(period.capture[1], vec![10.0, 20.0, 0.0, 0.0]);

        let mut seen = Vec::new();
        fx.diagnostics.drain(|d| seen.push(d));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].endpoint, EndpointKind::Capture);
        assert_eq!(seen[0].kind, XrunKind::Underflow);
        assert_eq!(seen[0].have, 16);
        assert_eq!(seen[0].need, 32);

        let snap = fx.shared.stats().snapshot();
        assert_eq!(snap.capture.frames, 2);
        assert_eq!(snap.capture.underflows, 1);
    }

    #[test]
    fn test_unconnected_inbound_is_silent_without_diagnostics() {
        let mut fx = fixture(4);
        let mut period = TestPeriod::new(4, Vec::new());
        fx.relay.process(&mut period);

        assert!(period.capture.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
        assert!(period.monitor.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
        assert_eq!(fx.diagnostics.drain(|_| {}), 0);
    }

    #[test]
    fn test_monitor_reads_across_wrap() {
        let mut fx = fixture(2);
        make_streaming(&fx.shared, EndpointKind::Monitor);
        {
            // Advance the cursors so the next period straddles the wrap
            let mut io = fx.shared.lock_io();
            let writer = io.rings.monitor.as_mut().unwrap();
            writer.write(&[0u8; 40]);
        }
        let mut drain = TestPeriod::new(5, Vec::new());
        fx.relay.process(&mut drain);
        {
            let mut io = fx.shared.lock_io();
            let writer = io.rings.monitor.as_mut().unwrap();
            writer.write(&encode(&[1.0, 2.0, 3.0, 4.0]));
        }

        let mut period = TestPeriod::new(2, Vec::new());
        fx.relay.process(&mut period);
        assert_eq!(period.monitor[0], vec![1.0, 3.0]);
        assert_eq!(period.monitor[1], vec![2.0, 4.0]);
    }

    #[test]
    fn test_period_skipped_while_rings_locked() {
        let mut fx = fixture(4);
        make_streaming(&fx.shared, EndpointKind::Playback);

        let shared = Arc::clone(&fx.shared);
        let _io = shared.lock_io();
        let _rt = shared.lock_rt();

        let mut period = TestPeriod::new(4, stereo_ramp(4));
        assert_eq!(fx.relay.process(&mut period), Control::Continue);

        assert!(period.capture.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
        assert_eq!(fx.shared.stats().snapshot().skipped_periods, 1);
        assert_eq!(fx.shared.stats().snapshot().playback.frames, 0);
        assert_eq!(fx.waker.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_shutdown_silences_without_touching_rings() {
        let mut fx = fixture(4);
        make_streaming(&fx.shared, EndpointKind::Playback);
        fx.shared.set_phase(Phase::Shutdown);

        let mut period = TestPeriod::new(4, stereo_ramp(4));
        assert_eq!(fx.relay.process(&mut period), Control::Quit);

        assert!(period.monitor.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
        let io = fx.shared.lock_io();
        assert_eq!(io.rings.playback.as_ref().unwrap().available_to_read(), 0);
    }
}
