//! Audio pipeline: frames, queues, capture, and playback
//!
//! Device access goes through the [`CaptureSource`] and [`PlaybackSink`]
//! traits so the session logic can run against in-memory fakes. The cpal
//! implementations live here too.

pub mod capture;
pub mod frame;
pub mod playback;
pub mod queue;

pub use capture::{CaptureGate, CaptureSource, CaptureWorker, MicSource};
pub use frame::{
    AudioFrame, CAPTURE_SAMPLE_RATE, DEFAULT_CHUNK_SIZE, FrameGapDetector, PLAYBACK_SAMPLE_RATE,
};
pub use playback::{PlaybackInterrupt, PlaybackSink, PlaybackWorker, SpeakerSink};
pub use queue::{FrameQueue, PushResult};
