//! Shared test utilities
//!
//! Fakes for the upstream transport and audio devices so session tests run
//! without hardware or a live service.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use vesper_voice::audio::{CaptureSource, PlaybackSink};
use vesper_voice::config::{AudioConfig, RetryPolicy, WatchdogConfig};
use vesper_voice::upstream::{ConnectRequest, OutboundMessage, UpstreamEvent};
use vesper_voice::{
    Config, Error, Result, SessionState, UpstreamConnection, UpstreamConnector,
};

/// A config with test-friendly defaults
#[must_use]
pub fn test_config() -> Config {
    Config {
        credential: "test-credential".to_string(),
        voice: "Aoede".to_string(),
        data_dir: PathBuf::from("/tmp"),
        audio: AudioConfig::default(),
        retry: RetryPolicy::default(),
        watchdog: WatchdogConfig::default(),
    }
}

/// How one scripted connection attempt should behave
#[derive(Debug, Clone, Copy)]
pub enum Attempt {
    /// Attempt succeeds; a [`UpstreamLink`] is handed to the test
    Succeed,
    /// Attempt fails with a conflict
    Conflict,
    /// Attempt fails with a transport error
    Transport,
}

/// The server side of a successful scripted connection
pub struct UpstreamLink {
    /// Send events to the session
    pub events: mpsc::Sender<UpstreamEvent>,
    /// Receive what the session sent upstream
    pub outbound: mpsc::Receiver<OutboundMessage>,
    /// The request that opened this connection
    pub request: ConnectRequest,
}

/// Connector that follows a script of attempt outcomes
pub struct ScriptedConnector {
    plan: Mutex<VecDeque<Attempt>>,
    attempts: AtomicU32,
    links: mpsc::Sender<UpstreamLink>,
}

impl ScriptedConnector {
    /// Create a connector following `plan`; attempts beyond the plan
    /// succeed. Successful connections arrive on the returned receiver.
    #[must_use]
    pub fn new(plan: Vec<Attempt>) -> (Arc<Self>, mpsc::Receiver<UpstreamLink>) {
        let (links_tx, links_rx) = mpsc::channel(8);
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.into_iter().collect()),
            attempts: AtomicU32::new(0),
            links: links_tx,
        });
        (connector, links_rx)
    }

    /// Number of connect calls so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<UpstreamConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Succeed);

        match step {
            Attempt::Conflict => Err(Error::Conflict("scripted conflict".to_string())),
            Attempt::Transport => Err(Error::Transport("scripted transport loss".to_string())),
            Attempt::Succeed => {
                let (outbound_tx, outbound_rx) = mpsc::channel(256);
                let (event_tx, event_rx) = mpsc::channel(256);
                self.links
                    .send(UpstreamLink {
                        events: event_tx,
                        outbound: outbound_rx,
                        request,
                    })
                    .await
                    .map_err(|_| Error::Transport("test dropped link receiver".to_string()))?;
                Ok(UpstreamConnection {
                    outbound: outbound_tx,
                    events: event_rx,
                })
            }
        }
    }
}

/// Capture source fed by the test instead of a microphone
#[derive(Default)]
pub struct FakeMic {
    samples: Mutex<Vec<i16>>,
    failure: Mutex<Option<String>>,
    starts: AtomicUsize,
}

impl FakeMic {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue samples as if the user spoke
    pub fn feed(&self, samples: &[i16]) {
        self.samples.lock().unwrap().extend_from_slice(samples);
    }

    /// Inject a device failure observed on the next worker tick
    pub fn fail(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    /// How many times the device was opened
    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl CaptureSource for FakeMic {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {}

    fn take_samples(&self) -> Vec<i16> {
        std::mem::take(&mut self.samples.lock().unwrap())
    }

    fn take_failure(&self) -> Option<String> {
        self.failure.lock().unwrap().take()
    }
}

/// Playback sink that renders instantly and records what it was given
#[derive(Default)]
pub struct FakeSpeaker {
    written: Mutex<Vec<i16>>,
    clears: AtomicUsize,
}

impl FakeSpeaker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All samples written since creation
    #[must_use]
    pub fn written(&self) -> Vec<i16> {
        self.written.lock().unwrap().clone()
    }

    /// How many times the buffer was flushed (barge-in)
    #[must_use]
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for FakeSpeaker {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn write(&self, samples: &[i16]) {
        self.written.lock().unwrap().extend_from_slice(samples);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    // renders instantly, so the device buffer is always empty
    fn pending(&self) -> usize {
        0
    }

    fn take_failure(&self) -> Option<String> {
        None
    }
}

/// Memory sink collecting recorded turns
#[derive(Default)]
pub struct CollectingSink {
    turns: Mutex<Vec<vesper_voice::Turn>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn turns(&self) -> Vec<vesper_voice::Turn> {
        self.turns.lock().unwrap().clone()
    }
}

impl vesper_voice::MemorySink for CollectingSink {
    fn record(&self, turn: vesper_voice::Turn) {
        self.turns.lock().unwrap().push(turn);
    }
}

/// Wait until the session reaches `target`, failing after a deadline
pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, target: SessionState) {
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            if *rx.borrow() == target {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {target}"));
}

/// A frame of speech loud enough to pass any energy threshold
#[must_use]
pub fn speech_frame(len: usize) -> vesper_voice::AudioFrame {
    vesper_voice::AudioFrame::new(vec![12_000; len], 24_000)
}
