//! Speaker playback: device handling and the playback worker

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::capture::frame_duration;
use crate::audio::frame::FrameGapDetector;
use crate::audio::queue::FrameQueue;
use crate::session::{AudioDirection, WorkerEvent};
use crate::{Error, Result};

/// A sink for synthesized speech samples
///
/// Implementations buffer written samples and render them in the
/// background. `clear` discards everything not yet rendered, which is how
/// barge-in silences the speaker mid-sentence.
pub trait PlaybackSink: Send + Sync {
    /// Open the device and begin rendering buffered samples
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start(&self) -> Result<()>;

    /// Stop rendering and release the device
    fn stop(&self);

    /// Queue samples for rendering
    fn write(&self, samples: &[i16]);

    /// Discard all samples not yet rendered
    fn clear(&self);

    /// Number of samples queued but not yet rendered
    fn pending(&self) -> usize;

    /// Take the latest device failure, if one occurred since the last call
    fn take_failure(&self) -> Option<String>;
}

/// Barge-in signal shared between the controller and the playback worker
///
/// The controller bumps the epoch before flushing; the worker re-checks
/// the epoch around every write so a frame it popped before the barge-in
/// never survives in the device buffer.
#[derive(Debug, Default)]
pub struct PlaybackInterrupt {
    epoch: AtomicU64,
}

impl PlaybackInterrupt {
    /// Create a signal with no interrupts recorded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current interrupt epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Record a barge-in, invalidating every frame popped before it
    pub fn raise(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drains the playback queue into the speaker sink
pub struct PlaybackWorker {
    sink: Arc<dyn PlaybackSink>,
    queue: Arc<FrameQueue>,
    interrupt: Arc<PlaybackInterrupt>,
    sample_rate: u32,
    chunk_size: usize,
}

impl PlaybackWorker {
    /// Create a worker draining `queue` into `sink`
    #[must_use]
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        queue: Arc<FrameQueue>,
        interrupt: Arc<PlaybackInterrupt>,
        sample_rate: u32,
        chunk_size: usize,
    ) -> Self {
        Self {
            sink,
            queue,
            interrupt,
            sample_rate,
            chunk_size,
        }
    }

    /// Run until cancelled or the playback queue closes.
    ///
    /// Emits [`WorkerEvent::PlaybackDrained`] each time the queue and the
    /// device buffer both empty out after a write. A fatal device error
    /// gets one reopen attempt before playback degrades.
    pub async fn run(self, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>) {
        if let Err(e) = self.open_with_retry() {
            tracing::error!(error = %e, "playback device unavailable");
            let _ = events
                .send(WorkerEvent::AudioDegraded {
                    direction: AudioDirection::Playback,
                })
                .await;
            return;
        }

        let poll = frame_duration(self.chunk_size, self.sample_rate);
        let mut reopened = false;
        let mut gaps = FrameGapDetector::new();

        loop {
            let epoch = self.interrupt.epoch();
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = self.queue.pop() => frame,
            };
            let Some(frame) = frame else { break };

            let missed = gaps.observe(frame.seq());
            if missed > 0 {
                tracing::debug!(missed, "playback frames dropped before rendering");
            }
            if self.interrupt.epoch() != epoch {
                // popped before the barge-in landed
                continue;
            }

            if let Some(reason) = self.sink.take_failure() {
                tracing::warn!(error = %reason, "playback device failed");
                self.sink.stop();
                if reopened || self.sink.start().is_err() {
                    let _ = events
                        .send(WorkerEvent::AudioDegraded {
                            direction: AudioDirection::Playback,
                        })
                        .await;
                    break;
                }
                reopened = true;
                tracing::info!("playback device reopened");
            }

            self.sink.write(frame.samples());
            if self.interrupt.epoch() != epoch {
                // barge-in landed mid-write; take the frame back out
                self.sink.clear();
                continue;
            }

            // when the queue goes quiet, wait for the device buffer to
            // finish rendering before announcing the drain
            if self.queue.is_empty() {
                let drained = self.wait_for_device_drain(&cancel, poll).await;
                if drained
                    && self.queue.is_empty()
                    && events.send(WorkerEvent::PlaybackDrained).await.is_err()
                {
                    break;
                }
            }
        }

        self.sink.stop();
    }

    /// Returns true once the device buffer is empty; false if cancelled or
    /// new frames arrived meanwhile
    async fn wait_for_device_drain(
        &self,
        cancel: &CancellationToken,
        poll: std::time::Duration,
    ) -> bool {
        loop {
            if !self.queue.is_empty() {
                return false;
            }
            if self.sink.pending() == 0 {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn open_with_retry(&self) -> Result<()> {
        if let Err(first) = self.sink.start() {
            tracing::warn!(error = %first, "playback open failed, retrying once");
            self.sink.stop();
            return self.sink.start();
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SpeakerShared {
    samples: Mutex<VecDeque<i16>>,
    failure: Mutex<Option<String>>,
}

struct SpeakerWorker {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

/// Default-output-device playback sink backed by cpal
///
/// Like capture, the cpal stream lives on its own thread; the output
/// callback pulls from the shared sample deque.
pub struct SpeakerSink {
    shared: Arc<SpeakerShared>,
    worker: Mutex<Option<SpeakerWorker>>,
    sample_rate: u32,
}

impl SpeakerSink {
    /// Create a sink for the default output device at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(SpeakerShared::default()),
            worker: Mutex::new(None),
            sample_rate,
        }
    }
}

impl PlaybackSink for SpeakerSink {
    fn start(&self) -> Result<()> {
        let Ok(mut worker) = self.worker.lock() else {
            return Err(Error::Device("playback worker lock poisoned".to_string()));
        };
        if worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let sample_rate = self.sample_rate;
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::spawn(move || match build_output_stream(sample_rate, &shared) {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(SpeakerWorker {
                    stop: stop_tx,
                    handle,
                });
                tracing::debug!(sample_rate = self.sample_rate, "audio playback started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Device("playback thread exited early".to_string())),
        }
    }

    fn stop(&self) {
        let Ok(mut slot) = self.worker.lock() else {
            return;
        };
        if let Some(worker) = slot.take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
            tracing::debug!("audio playback stopped");
        }
    }

    fn write(&self, samples: &[i16]) {
        if let Ok(mut queue) = self.shared.samples.lock() {
            queue.extend(samples.iter().copied());
        }
    }

    fn clear(&self) {
        if let Ok(mut queue) = self.shared.samples.lock() {
            queue.clear();
        }
    }

    fn pending(&self) -> usize {
        self.shared.samples.lock().map_or(0, |q| q.len())
    }

    fn take_failure(&self) -> Option<String> {
        self.shared.failure.lock().ok().and_then(|mut f| f.take())
    }
}

fn build_output_stream(sample_rate: u32, shared: &Arc<SpeakerShared>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    let samples_shared = Arc::clone(shared);
    let failure_shared = Arc::clone(shared);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = samples_shared
                    .samples
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = queue
                        .pop_front()
                        .map_or(0.0, |s| f32::from(s) / 32768.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
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
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use crate::audio::frame::AudioFrame;

    /// Instant-rendering sink that can raise a barge-in from inside `write`,
    /// landing the interrupt after the worker has already popped the frame
    struct TrackedSink {
        interrupt: Arc<PlaybackInterrupt>,
        queue: Arc<FrameQueue>,
        barge_on_write: AtomicBool,
        writes: AtomicU64,
        clears: AtomicU64,
    }

    impl TrackedSink {
        fn new(interrupt: Arc<PlaybackInterrupt>, queue: Arc<FrameQueue>, barge: bool) -> Arc<Self> {
            Arc::new(Self {
                interrupt,
                queue,
                barge_on_write: AtomicBool::new(barge),
                writes: AtomicU64::new(0),
                clears: AtomicU64::new(0),
            })
        }
    }

    impl PlaybackSink for TrackedSink {
        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn write(&self, _samples: &[i16]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.barge_on_write.swap(false, Ordering::SeqCst) {
                self.interrupt.raise();
                self.queue.clear();
            }
        }

        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }

        fn pending(&self) -> usize {
            0
        }

        fn take_failure(&self) -> Option<String> {
            None
        }
    }

    fn stamped_frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(16, 24_000).stamped(seq, Duration::ZERO)
    }

    #[test]
    fn interrupt_epoch_moves_on_every_raise() {
        let interrupt = PlaybackInterrupt::new();
        let before = interrupt.epoch();
        interrupt.raise();
        interrupt.raise();
        assert_eq!(interrupt.epoch(), before + 2);
    }

    #[tokio::test]
    async fn barge_in_during_write_takes_the_frame_back() {
        let queue = Arc::new(FrameQueue::new(8));
        let interrupt = Arc::new(PlaybackInterrupt::new());
        let sink = TrackedSink::new(Arc::clone(&interrupt), Arc::clone(&queue), true);
        for seq in 0..4 {
            queue.push(stamped_frame(seq));
        }

        let cancel = CancellationToken::new();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let worker = PlaybackWorker::new(
            Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            Arc::clone(&queue),
            interrupt,
            24_000,
            16,
        );
        let task = tokio::spawn(worker.run(cancel.clone(), events_tx));

        // the first write raises the barge-in; the worker must clear the
        // sink and nothing queued earlier may be written afterwards
        let mut settled = false;
        for _ in 0..100 {
            if sink.clears.load(Ordering::SeqCst) >= 1 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(settled, "worker never observed the barge-in");
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert!(events_rx.try_recv().is_err(), "no drain for discarded audio");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drain_announced_once_queue_and_device_empty() {
        let queue = Arc::new(FrameQueue::new(8));
        let interrupt = Arc::new(PlaybackInterrupt::new());
        let sink = TrackedSink::new(Arc::clone(&interrupt), Arc::clone(&queue), false);
        queue.push(stamped_frame(0));
        queue.push(stamped_frame(1));

        let cancel = CancellationToken::new();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let worker = PlaybackWorker::new(
            Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            Arc::clone(&queue),
            interrupt,
            24_000,
            16,
        );
        let task = tokio::spawn(worker.run(cancel.clone(), events_tx));

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, WorkerEvent::PlaybackDrained));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
