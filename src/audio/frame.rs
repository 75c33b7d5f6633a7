//! Audio frame type shared by capture, playback, and the upstream codec

use std::time::Duration;

/// Capture sample rate in Hz (what the upstream model expects as input)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback sample rate in Hz (what the upstream model synthesizes)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Default samples per frame
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// A fixed-size chunk of mono 16-bit PCM audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// PCM samples, mono, 16-bit signed
    samples: Vec<i16>,
    /// Sample rate the samples were produced at
    sample_rate: u32,
    /// Interleaved channel count (currently always mono)
    channels: u16,
    /// Monotonic per-direction sequence number, stamped by the producer
    seq: u64,
    /// Time the frame was produced, relative to its pipeline's start
    timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame from raw samples
    #[must_use]
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            seq: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Create a frame of silence with the given length
    #[must_use]
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; len], sample_rate)
    }

    /// Stamp the frame with its position in the producing stream
    #[must_use]
    pub fn stamped(mut self, seq: u64, timestamp: Duration) -> Self {
        self.seq = seq;
        self.timestamp = timestamp;
        self
    }

    /// Borrow the PCM samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Position of this frame in its producing stream
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Time the frame was produced, relative to its pipeline's start
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Number of samples in the frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wall-clock duration this frame represents when played back
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Encode the samples as little-endian bytes for the wire
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Decode little-endian PCM bytes into a frame.
    ///
    /// A trailing odd byte is discarded.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Root-mean-square energy of the frame, normalized to 0.0..=1.0
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let normalized = f64::from(s) / f64::from(i16::MAX);
                normalized * normalized
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

/// Detects dropped frames from the producer's sequence numbers
///
/// Both queues evict under overflow and barge-in clears the playback
/// queue, so consumers run each popped frame through a detector to learn
/// how many frames never arrived.
#[derive(Debug, Default)]
pub struct FrameGapDetector {
    next: Option<u64>,
}

impl FrameGapDetector {
    /// Create a detector that accepts any first sequence number
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a frame's sequence number, returning how many frames were
    /// skipped since the previous observation
    pub fn observe(&mut self, seq: u64) -> u64 {
        let missed = match self.next {
            Some(expected) if seq > expected => seq - expected,
            _ => 0,
        };
        self.next = Some(seq + 1);
        missed
    }
}

/// Encode PCM samples as WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> crate::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| crate::Error::Device(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| crate::Error::Device(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| crate::Error::Device(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_le_bytes() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN], CAPTURE_SAMPLE_RATE);
        let bytes = frame.to_le_bytes();
        let decoded = AudioFrame::from_le_bytes(&bytes, CAPTURE_SAMPLE_RATE);
        assert_eq!(frame, decoded);
    }

    #[test]
    fn odd_trailing_byte_is_discarded() {
        let decoded = AudioFrame::from_le_bytes(&[0x34, 0x12, 0xff], CAPTURE_SAMPLE_RATE);
        assert_eq!(decoded.samples(), &[0x1234]);
    }

    #[test]
    fn duration_matches_sample_rate() {
        let frame = AudioFrame::silence(16_000, CAPTURE_SAMPLE_RATE);
        assert_eq!(frame.duration(), Duration::from_secs(1));
    }

    #[test]
    fn silence_has_zero_energy() {
        let frame = AudioFrame::silence(512, CAPTURE_SAMPLE_RATE);
        assert!(frame.rms() < f32::EPSILON);
    }

    #[test]
    fn full_scale_has_unit_energy() {
        let frame = AudioFrame::new(vec![i16::MAX; 512], CAPTURE_SAMPLE_RATE);
        assert!((frame.rms() - 1.0).abs() < 0.01);
    }

    #[test]
    fn stamping_sets_sequence_and_timestamp() {
        let frame = AudioFrame::silence(512, CAPTURE_SAMPLE_RATE);
        assert_eq!(frame.seq(), 0);
        assert_eq!(frame.timestamp(), Duration::ZERO);
        assert_eq!(frame.channels(), 1);

        let stamped = frame.stamped(41, Duration::from_millis(1312));
        assert_eq!(stamped.seq(), 41);
        assert_eq!(stamped.timestamp(), Duration::from_millis(1312));
    }

    #[test]
    fn gap_detector_counts_skipped_frames() {
        let mut gaps = FrameGapDetector::new();
        assert_eq!(gaps.observe(0), 0);
        assert_eq!(gaps.observe(1), 0);
        assert_eq!(gaps.observe(2), 0);
        // frames 3 and 4 were evicted
        assert_eq!(gaps.observe(5), 2);
        assert_eq!(gaps.observe(6), 0);
    }

    #[test]
    fn gap_detector_accepts_any_starting_sequence() {
        let mut gaps = FrameGapDetector::new();
        assert_eq!(gaps.observe(17), 0);
        assert_eq!(gaps.observe(18), 0);
    }
}
