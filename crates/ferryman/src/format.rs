//! Frame layout and the server-facing stream parameters derived from it.
//!
//! Everything on the wire between the two sides is interleaved native-endian
//! f32, so a frame is `channels * 4` bytes and every size in the relay is a
//! whole number of frames.

use serde::Serialize;

/// Bytes per sample. The relay only carries f32.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Attribute value meaning "let the server choose".
pub const SERVER_DEFAULT: u32 = u32::MAX;

/// Ring capacity in periods when nothing else is configured.
pub const DEFAULT_CAPACITY_FACTOR: u32 = 3;

/// Shape of the audio moving through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    pub channels: u16,
    pub sample_rate: u32,
    /// Graph period in frames.
    pub period_frames: u32,
    /// Ring capacity in periods, at least 2.
    pub capacity_factor: u32,
}

impl FrameLayout {
    pub fn new(
        channels: u16,
        sample_rate: u32,
        period_frames: u32,
        capacity_factor: u32,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            channels,
            sample_rate,
            period_frames,
            capacity_factor,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.channels == 0 {
            return Err(LayoutError::NoChannels);
        }
        if self.period_frames == 0 {
            return Err(LayoutError::EmptyPeriod);
        }
        if self.sample_rate == 0 {
            return Err(LayoutError::ZeroSampleRate);
        }
        if self.capacity_factor < 2 {
            return Err(LayoutError::CapacityFactor(self.capacity_factor));
        }

        // Server attributes are u32 and SERVER_DEFAULT is reserved
        let capacity = (self.period_frames as u64)
            * (self.channels as u64)
            * (SAMPLE_BYTES as u64)
            * (self.capacity_factor as u64);
        if capacity >= SERVER_DEFAULT as u64 || capacity > usize::MAX as u64 {
            return Err(LayoutError::TooLarge { bytes: capacity });
        }
        Ok(())
    }

    /// Same layout with a new period size.
    pub fn with_period(&self, period_frames: u32) -> Result<Self, LayoutError> {
        Self::new(
            self.channels,
            self.sample_rate,
            period_frames,
            self.capacity_factor,
        )
    }

    /// Same layout with a new sample rate.
    pub fn with_sample_rate(&self, sample_rate: u32) -> Result<Self, LayoutError> {
        Self::new(
            self.channels,
            sample_rate,
            self.period_frames,
            self.capacity_factor,
        )
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * SAMPLE_BYTES
    }

    pub fn period_bytes(&self) -> usize {
        self.period_frames as usize * self.frame_bytes()
    }

    pub fn ring_capacity(&self) -> usize {
        self.period_bytes() * self.capacity_factor as usize
    }

    /// Period duration in milliseconds.
    pub fn period_ms(&self) -> f64 {
        self.period_frames as f64 / self.sample_rate as f64 * 1000.0
    }

    pub fn sample_spec(&self) -> SampleSpec {
        SampleSpec {
            format: SampleFormat::F32Ne,
            rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Buffer attributes requested from the server for every endpoint.
    ///
    /// Sizes are in bytes. `validate` guarantees they fit in u32.
    pub fn buffer_attr(&self) -> BufferAttr {
        let period = self.period_bytes() as u32;
        BufferAttr {
            max_length: self.ring_capacity() as u32,
            target_length: period,
            prebuf: SERVER_DEFAULT,
            min_request: period,
            fragment_size: period,
        }
    }
}

/// Sample encoding on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleFormat {
    /// 32-bit float, native endian.
    F32Ne,
}

/// Server sample specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u16,
}

impl SampleSpec {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * SAMPLE_BYTES
    }
}

/// Server-side buffering request, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferAttr {
    /// Upper bound of the server buffer.
    pub max_length: u32,
    /// Playback fill level the server aims for.
    pub target_length: u32,
    /// Bytes buffered before playback starts.
    pub prebuf: u32,
    /// Smallest writable request the server will announce.
    pub min_request: u32,
    /// Record fragment size.
    pub fragment_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("layout needs at least one channel")]
    NoChannels,

    #[error("period size must be at least one frame")]
    EmptyPeriod,

    #[error("sample rate must be non-zero")]
    ZeroSampleRate,

    #[error("capacity factor must be at least 2, got {0}")]
    CapacityFactor(u32),

    #[error("ring of {bytes} bytes does not fit in a server buffer attribute")]
    TooLarge { bytes: u64 },
}
