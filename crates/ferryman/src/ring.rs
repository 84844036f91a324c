//! Frame-granular SPSC byte ring between the realtime thread and the server
//! event loop.
//!
//! ```text
//!   RealtimeRelay (graph RT thread)        event loop (server thread)
//!        │                                          │
//!   writer.write_regions(period)            reader.read(..) / peek
//!        │                                          │
//!        └────────────► RingChannel ───────────────►│
//!                     (rtrb, lock-free)
//! ```
//!
//! The capacity is a multiple of the frame size and both cursors only move
//! by whole frames, so the wrap point always falls on a frame boundary and
//! each of the two regions holds whole frames.

use rtrb::chunks::{ReadChunk, WriteChunk};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::format::FrameLayout;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring capacity {capacity} is not a positive multiple of the {frame_bytes}-byte frame")]
    InvalidCapacity { capacity: usize, frame_bytes: usize },

    #[error("requested {requested} bytes but only {available} are available")]
    TooFewBytes { requested: usize, available: usize },

    #[error("{bytes} bytes is not a whole number of {frame_bytes}-byte frames")]
    PartialFrame { bytes: usize, frame_bytes: usize },
}

/// A ring before it is split between its two threads.
pub struct RingChannel {
    writer: RingWriter,
    reader: RingReader,
}

impl RingChannel {
    pub fn new(frame_bytes: usize, capacity: usize) -> Result<Self, RingError> {
        if frame_bytes == 0 || capacity == 0 || capacity % frame_bytes != 0 {
            return Err(RingError::InvalidCapacity {
                capacity,
                frame_bytes,
            });
        }

        let (producer, consumer) = RingBuffer::<u8>::new(capacity);
        Ok(Self {
            writer: RingWriter {
                producer,
                frame_bytes,
            },
            reader: RingReader {
                consumer,
                frame_bytes,
            },
        })
    }

    /// Ring sized for `layout`: `period * channels * 4 * capacity_factor`.
    pub fn for_layout(layout: &FrameLayout) -> Result<Self, RingError> {
        Self::new(layout.frame_bytes(), layout.ring_capacity())
    }

    pub fn split(self) -> (RingWriter, RingReader) {
        (self.writer, self.reader)
    }

    pub fn capacity(&self) -> usize {
        self.writer.capacity()
    }

    pub fn frame_bytes(&self) -> usize {
        self.writer.frame_bytes
    }

    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.writer.write(bytes)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read(buf)
    }

    pub fn available_to_write(&self) -> usize {
        self.writer.available_to_write()
    }

    pub fn available_to_read(&self) -> usize {
        self.reader.available_to_read()
    }

    pub fn write_regions(&mut self, len: usize) -> Result<WriteRegions<'_>, RingError> {
        self.writer.write_regions(len)
    }

    pub fn read_regions(&mut self, len: usize) -> Result<ReadRegions<'_>, RingError> {
        self.reader.read_regions(len)
    }
}

/// Producer half. Owns the write cursor.
pub struct RingWriter {
    producer: Producer<u8>,
    frame_bytes: usize,
}

impl RingWriter {
    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Free bytes, always a whole number of frames.
    pub fn available_to_write(&self) -> usize {
        self.producer.slots()
    }

    /// Copy as many whole frames of `bytes` as fit. Never blocks.
    ///
    /// Returns the bytes written; anything short of `bytes.len()` is an
    /// overflow for the caller to report.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let len = whole_frames(bytes.len().min(self.available_to_write()), self.frame_bytes);
        if len == 0 {
            return 0;
        }

        let Ok(mut regions) = self.write_regions(len) else {
            return 0;
        };
        let (first, second) = regions.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&bytes[..split]);
        second.copy_from_slice(&bytes[split..len]);
        regions.commit();
        len
    }

    /// Reserve `len` bytes as up to two slices across the wrap point.
    ///
    /// Nothing becomes visible to the reader until `commit`. Dropping the
    /// regions without committing writes nothing.
    pub fn write_regions(&mut self, len: usize) -> Result<WriteRegions<'_>, RingError> {
        check_frames(len, self.frame_bytes)?;
        let available = self.available_to_write();
        let chunk = self
            .producer
            .write_chunk(len)
            .map_err(|_| RingError::TooFewBytes {
                requested: len,
                available,
            })?;
        Ok(WriteRegions { chunk })
    }
}

/// Consumer half. Owns the read cursor.
pub struct RingReader {
    consumer: Consumer<u8>,
    frame_bytes: usize,
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.consumer.buffer().capacity()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Unread bytes, always a whole number of frames.
    pub fn available_to_read(&self) -> usize {
        self.consumer.slots()
    }

    /// Copy up to `buf.len()` bytes of whole frames into `buf`. Never blocks.
    ///
    /// Returns the bytes read; a short count is an underflow for the caller
    /// to report.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = whole_frames(buf.len().min(self.available_to_read()), self.frame_bytes);
        if len == 0 {
            return 0;
        }

        let Ok(regions) = self.read_regions(len) else {
            return 0;
        };
        let (first, second) = regions.as_slices();
        buf[..first.len()].copy_from_slice(first);
        buf[first.len()..len].copy_from_slice(second);
        regions.commit();
        len
    }

    /// Borrow the next `len` unread bytes as up to two slices.
    ///
    /// The bytes stay in the ring until `commit`.
    pub fn read_regions(&mut self, len: usize) -> Result<ReadRegions<'_>, RingError> {
        check_frames(len, self.frame_bytes)?;
        let available = self.available_to_read();
        let chunk = self
            .consumer
            .read_chunk(len)
            .map_err(|_| RingError::TooFewBytes {
                requested: len,
                available,
            })?;
        Ok(ReadRegions { chunk })
    }
}

/// Reserved space in a ring, split at the wrap point.
pub struct WriteRegions<'a> {
    chunk: WriteChunk<'a, u8>,
}

impl WriteRegions<'_> {
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn as_mut_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        self.chunk.as_mut_slices()
    }

    /// Publish every reserved byte to the reader.
    pub fn commit(self) {
        self.chunk.commit_all();
    }
}

/// Readable bytes in a ring, split at the wrap point.
pub struct ReadRegions<'a> {
    chunk: ReadChunk<'a, u8>,
}

impl ReadRegions<'_> {
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.chunk.as_slices()
    }

    /// Release every borrowed byte back to the writer.
    pub fn commit(self) {
        self.chunk.commit_all();
    }
}

/// Round `bytes` down to a whole number of frames.
pub fn whole_frames(bytes: usize, frame_bytes: usize) -> usize {
    if frame_bytes == 0 {
        return 0;
    }
    bytes - bytes % frame_bytes
}

fn check_frames(len: usize, frame_bytes: usize) -> Result<(), RingError> {
    if len % frame_bytes != 0 {
        return Err(RingError::PartialFrame {
            bytes: len,
            frame_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_ring() -> RingChannel {
        let layout = FrameLayout::new(2, 48000, 256, 3).unwrap();
        RingChannel::for_layout(&layout).unwrap()
    }

    fn ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_one_period_in_three_period_ring() {
        let mut ring = stereo_ring();
        assert_eq!(ring.capacity(), 6144);

        let period = ramp(2048);
        assert_eq!(ring.write(&period), 2048);
        assert_eq!(ring.available_to_read(), 2048);
        assert_eq!(ring.available_to_write(), 4096);
    }

    #[test]
    fn test_write_read_preserves_order() {
        let mut ring = stereo_ring();
        let data = ramp(3000 - 3000 % 8);
        let written = ring.write(&data);
        assert_eq!(written, data.len());

        let mut out = vec![0u8; data.len()];
        assert_eq!(ring.read(&mut out), data.len());
        assert_eq!(out, data);
        assert_eq!(ring.available_to_read(), 0);
    }

    #[test]
    fn test_overflow_writes_only_what_fits() {
        let mut ring = stereo_ring();
        let data = ramp(8192);
        assert_eq!(ring.write(&data), 6144);
        assert_eq!(ring.available_to_write(), 0);
        assert_eq!(ring.write(&data), 0);
    }

    #[test]
    fn test_underflow_reads_whole_frames() {
        let mut ring = stereo_ring();
        ring.write(&ramp(24));

        let mut out = vec![0u8; 2048];
        assert_eq!(ring.read(&mut out), 24);
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn test_partial_frames_are_never_moved() {
        let mut ring = stereo_ring();
        // 13 bytes: one whole frame plus 5 stray bytes
        assert_eq!(ring.write(&ramp(13)), 8);

        let mut out = vec![0u8; 11];
        assert_eq!(ring.read(&mut out), 8);
    }

    #[test]
    fn test_regions_split_at_wrap() {
        let mut ring = stereo_ring();
        let mut scratch = vec![0u8; 4096];
        ring.write(&ramp(4096));
        ring.read(&mut scratch);

        // Cursor now at 4096 of 6144; a 4096-byte write wraps
        let data = ramp(4096);
        {
            let mut regions = ring.write_regions(4096).unwrap();
            let (first, second) = regions.as_mut_slices();
            assert_eq!(first.len(), 2048);
            assert_eq!(second.len(), 2048);
            first.copy_from_slice(&data[..2048]);
            second.copy_from_slice(&data[2048..]);
            regions.commit();
        }

        let regions = ring.read_regions(4096).unwrap();
        let (first, second) = regions.as_slices();
        assert_eq!(first.len() % 8, 0);
        assert_eq!([first, second].concat(), data);
        regions.commit();
        assert_eq!(ring.available_to_read(), 0);
    }

    #[test]
    fn test_uncommitted_regions_change_nothing() {
        let mut ring = stereo_ring();
        {
            let mut regions = ring.write_regions(2048).unwrap();
            regions.as_mut_slices().0.fill(1);
        }
        assert_eq!(ring.available_to_read(), 0);

        ring.write(&ramp(2048));
        {
            let _regions = ring.read_regions(2048).unwrap();
        }
        assert_eq!(ring.available_to_read(), 2048);
    }

    #[test]
    fn test_region_errors() {
        let mut ring = stereo_ring();
        assert_eq!(
            ring.write_regions(12).err(),
            Some(RingError::PartialFrame {
                bytes: 12,
                frame_bytes: 8
            })
        );
        assert_eq!(
            ring.read_regions(8).err(),
            Some(RingError::TooFewBytes {
                requested: 8,
                available: 0
            })
        );
        assert_eq!(
            ring.write_regions(8192).err(),
            Some(RingError::TooFewBytes {
                requested: 8192,
                available: 6144
            })
        );
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(RingChannel::new(8, 0).is_err());
        assert!(RingChannel::new(8, 100).is_err());
        assert!(RingChannel::new(0, 64).is_err());
        assert!(RingChannel::new(8, 16).is_ok());
    }

    #[test]
    fn test_capacity_invariant_holds_across_traffic() {
        let mut ring = stereo_ring();
        let capacity = ring.capacity();
        let mut out = vec![0u8; 6144];

        for step in 0..200usize {
            let write_len = (step * 40) % 5000;
            let read_len = (step * 24) % 3000;
            ring.write(&ramp(write_len));
            ring.read(&mut out[..read_len]);

            let readable = ring.available_to_read();
            let writable = ring.available_to_write();
            assert_eq!(readable + writable, capacity);
            assert!(readable <= capacity);
            assert_eq!(readable % 8, 0);
        }
    }

    #[test]
    fn test_halves_work_across_threads() {
        let (mut writer, mut reader) = stereo_ring().split();
        let data = ramp(8 * 4000);
        let expected = data.clone();

        let producer = std::thread::spawn(move || {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + 512).min(data.len());
                offset += writer.write(&data[offset..end]);
                std::thread::yield_now();
            }
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = vec![0u8; 1024];
        while received.len() < expected.len() {
            let n = reader.read(&mut buf);
            received.extend_from_slice(&buf[..n]);
            std::thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(received, expected);
    }
}
