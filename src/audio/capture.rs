//! Microphone capture: device handling, mute gating, and the capture worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::frame::AudioFrame;
use crate::audio::queue::{FrameQueue, PushResult};
use crate::session::{AudioDirection, WorkerEvent};
use crate::{Error, Result};

/// A source of microphone samples
///
/// Implementations accumulate samples in the background; the worker drains
/// them at frame cadence. All methods are callable from any thread.
pub trait CaptureSource: Send + Sync {
    /// Open the device and begin accumulating samples
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start(&self) -> Result<()>;

    /// Stop capturing and release the device
    fn stop(&self);

    /// Take all samples accumulated since the last call
    fn take_samples(&self) -> Vec<i16>;

    /// Take the latest device failure, if one occurred since the last call
    fn take_failure(&self) -> Option<String>;
}

/// Controls whether captured audio is forwarded upstream
///
/// The gate closes while the assistant is thinking or speaking so the model
/// does not hear itself, and stays closed for a short cooldown after each
/// turn to let speaker bleed die down.
#[derive(Debug, Default)]
pub struct CaptureGate {
    muted: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
}

impl CaptureGate {
    /// Create an open gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate until further notice
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Open the gate immediately, clearing any pending cooldown
    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
        if let Ok(mut until) = self.cooldown_until.lock() {
            *until = None;
        }
    }

    /// Open the gate once `cooldown` has elapsed
    pub fn unmute_after(&self, cooldown: Duration) {
        if let Ok(mut until) = self.cooldown_until.lock() {
            *until = Some(Instant::now() + cooldown);
        }
        self.muted.store(false, Ordering::SeqCst);
    }

    /// Whether captured audio should currently be forwarded
    #[must_use]
    pub fn is_open(&self) -> bool {
        if self.muted.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(mut until) = self.cooldown_until.lock() else {
            return false;
        };
        match *until {
            Some(deadline) if Instant::now() < deadline => false,
            Some(_) => {
                *until = None;
                true
            }
            None => true,
        }
    }
}

/// Forwards microphone frames into the outbound queue
pub struct CaptureWorker {
    source: Arc<dyn CaptureSource>,
    gate: Arc<CaptureGate>,
    outbound: Arc<FrameQueue>,
    sample_rate: u32,
    chunk_size: usize,
}

impl CaptureWorker {
    /// Create a worker reading from `source` into `outbound`
    #[must_use]
    pub fn new(
        source: Arc<dyn CaptureSource>,
        gate: Arc<CaptureGate>,
        outbound: Arc<FrameQueue>,
        sample_rate: u32,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            gate,
            outbound,
            sample_rate,
            chunk_size,
        }
    }

    /// Run until cancelled or the outbound queue closes.
    ///
    /// The device buffer is drained every tick even while the gate is
    /// closed, so stale audio never leaks into the next user turn. A fatal
    /// device error gets one reopen attempt before capture degrades.
    pub async fn run(self, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>) {
        if let Err(e) = self.open_with_retry() {
            tracing::error!(error = %e, "capture device unavailable");
            let _ = events
                .send(WorkerEvent::AudioDegraded {
                    direction: AudioDirection::Capture,
                })
                .await;
            return;
        }

        let tick = frame_duration(self.chunk_size, self.sample_rate);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending: Vec<i16> = Vec::with_capacity(self.chunk_size * 2);
        let mut reopened = false;
        let started = tokio::time::Instant::now();
        let mut seq = 0_u64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(reason) = self.source.take_failure() {
                tracing::warn!(error = %reason, "capture device failed");
                self.source.stop();
                if reopened || self.source.start().is_err() {
                    let _ = events
                        .send(WorkerEvent::AudioDegraded {
                            direction: AudioDirection::Capture,
                        })
                        .await;
                    break;
                }
                reopened = true;
                tracing::info!("capture device reopened");
            }

            let samples = self.source.take_samples();
            if !self.gate.is_open() {
                pending.clear();
                continue;
            }
            pending.extend_from_slice(&samples);

            while pending.len() >= self.chunk_size {
                let chunk: Vec<i16> = pending.drain(..self.chunk_size).collect();
                let frame =
                    AudioFrame::new(chunk, self.sample_rate).stamped(seq, started.elapsed());
                seq += 1;
                match self.outbound.push(frame) {
                    PushResult::Accepted => {}
                    PushResult::DroppedOldest => {
                        tracing::debug!(
                            overruns = self.outbound.overruns(),
                            "outbound queue overrun, dropped oldest frame"
                        );
                    }
                    PushResult::Closed => {
                        self.source.stop();
                        return;
                    }
                }
            }
        }

        self.source.stop();
    }

    fn open_with_retry(&self) -> Result<()> {
        if let Err(first) = self.source.start() {
            tracing::warn!(error = %first, "capture open failed, retrying once");
            self.source.stop();
            return self.source.start();
        }
        Ok(())
    }
}

/// Wall-clock duration of one frame
#[must_use]
pub(crate) fn frame_duration(chunk_size: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::from_millis(32);
    }
    Duration::from_secs_f64(chunk_size as f64 / f64::from(sample_rate))
}

#[derive(Debug, Default)]
struct MicShared {
    buffer: Mutex<Vec<i16>>,
    failure: Mutex<Option<String>>,
}

struct MicWorker {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

/// Default-input-device capture source backed by cpal
///
/// The cpal stream is not `Send`, so a dedicated thread owns it and feeds
/// the shared buffer from the stream callback.
pub struct MicSource {
    shared: Arc<MicShared>,
    worker: Mutex<Option<MicWorker>>,
    sample_rate: u32,
}

impl MicSource {
    /// Create a source for the default input device at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(MicShared::default()),
            worker: Mutex::new(None),
            sample_rate,
        }
    }
}

impl CaptureSource for MicSource {
    fn start(&self) -> Result<()> {
        let Ok(mut worker) = self.worker.lock() else {
            return Err(Error::Device("capture worker lock poisoned".to_string()));
        };
        if worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let sample_rate = self.sample_rate;
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::spawn(move || match build_input_stream(sample_rate, &shared) {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                // park until stop; the stream lives as long as this thread
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(MicWorker {
                    stop: stop_tx,
                    handle,
                });
                tracing::debug!(sample_rate = self.sample_rate, "audio capture started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Device("capture thread exited early".to_string())),
        }
    }

    fn stop(&self) {
        let Ok(mut slot) = self.worker.lock() else {
            return;
        };
        if let Some(worker) = slot.take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
            tracing::debug!("audio capture stopped");
        }
    }

    fn take_samples(&self) -> Vec<i16> {
        self.shared
            .buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    fn take_failure(&self) -> Option<String> {
        self.shared.failure.lock().ok().and_then(|mut f| f.take())
    }
}

fn build_input_stream(sample_rate: u32, shared: &Arc<MicShared>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::Device("no suitable input config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    let buffer_shared = Arc::clone(shared);
    let failure_shared = Arc::clone(shared);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer_shared.buffer.lock() {
                    buf.extend(data.iter().map(|&s| {
                        #[allow(clippy::cast_possible_truncation)]
                        let sample = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        sample
                    }));
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                if let Ok(mut failure) = failure_shared.failure.lock() {
                    *failure = Some(err.to_string());
                }
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_mute_blocks_and_unmute_opens() {
        let gate = CaptureGate::new();
        assert!(gate.is_open());
        gate.mute();
        assert!(!gate.is_open());
        gate.unmute();
        assert!(gate.is_open());
    }

    #[test]
    fn gate_cooldown_blocks_until_deadline() {
        let gate = CaptureGate::new();
        gate.mute();
        gate.unmute_after(Duration::from_millis(30));
        assert!(!gate.is_open());
        std::thread::sleep(Duration::from_millis(40));
        assert!(gate.is_open());
    }

    #[test]
    fn unmute_clears_pending_cooldown() {
        let gate = CaptureGate::new();
        gate.unmute_after(Duration::from_secs(60));
        assert!(!gate.is_open());
        gate.unmute();
        assert!(gate.is_open());
    }

    #[test]
    fn frame_duration_at_16k() {
        assert_eq!(frame_duration(512, 16_000), Duration::from_secs_f64(0.032));
    }
}
