//! Event-loop side of the relay: moves bytes between the rings and the
//! server stream buffers whenever the server says a stream is writable or
//! readable.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::endpoint::EndpointKind;
use crate::error::{BridgeError, ServerResultExt};
use crate::server::Fragment;
use crate::shared::{IoState, RelayShared};

pub struct AsyncStreamBridge {
    shared: Arc<RelayShared>,
}

impl AsyncStreamBridge {
    pub fn new(shared: Arc<RelayShared>) -> Self {
        Self { shared }
    }

    /// Push every whole frame in the playback ring to the server.
    pub fn on_playback_writable(&self, io: &mut IoState) -> Result<(), BridgeError> {
        let IoState {
            rings, endpoints, ..
        } = io;
        let endpoint = endpoints.get_mut(EndpointKind::Playback);
        if !endpoint.is_streaming() {
            return Ok(());
        }
        let (Some(reader), Some(stream)) = (rings.playback.as_mut(), endpoint.stream_mut()) else {
            return Ok(());
        };
        let counters = &self.shared.stats().playback;

        let available = reader.available_to_read();
        if available == 0 {
            counters.underflows.fetch_add(1, Ordering::Relaxed);
            warn!("playback ring underflow: nothing to write");
            return Ok(());
        }

        let buffer = stream
            .begin_write(available)
            .during(|| format!("begin playback write of {available} bytes"))?;
        let len = reader.read(buffer);
        if len == 0 {
            return Ok(());
        }
        stream
            .write(len)
            .during(|| format!("playback write of {len} bytes"))?;

        trace!("wrote {} playback bytes", len);
        Ok(())
    }

    /// Drain a capture or monitor stream into its ring.
    ///
    /// Data the ring cannot take is dropped with an overflow warning. Holes
    /// are counted and skipped.
    pub fn on_readable(&self, io: &mut IoState, kind: EndpointKind) -> Result<(), BridgeError> {
        let IoState {
            rings, endpoints, ..
        } = io;
        let endpoint = endpoints.get_mut(kind);
        let Some(stream) = endpoint.stream_mut() else {
            return Ok(());
        };
        let mut writer = rings.inbound(kind);
        let counters = self.shared.stats().endpoint(kind);

        while stream.readable_size() > 0 {
            match stream.peek().during(|| format!("{kind} peek"))? {
                Fragment::Empty => break,
                Fragment::Hole(len) => {
                    counters.holes.fetch_add(1, Ordering::Relaxed);
                    warn!("{} stream hole of {} bytes", kind, len);
                }
                Fragment::Data(data) => {
                    if let Some(writer) = writer.as_mut() {
                        let space = writer.available_to_write();
                        let written = writer.write(data);
                        if written < data.len() {
                            counters.overflows.fetch_add(1, Ordering::Relaxed);
                            warn!("{} ring overflow: {} < {}", kind, space, data.len());
                        }
                    }
                }
            }
            stream.discard().during(|| format!("{kind} discard"))?;
        }
        Ok(())
    }
}
