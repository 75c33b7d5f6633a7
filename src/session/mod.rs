//! Session orchestration: the state machine that owns the conversation
//!
//! [`SessionController`] is the single writer of session state. Workers
//! (capture, playback, watchdog, the send pump) report back over channels
//! and never touch state themselves; each reconnect spawns a fresh
//! generation of workers fenced by a cancellation token so stale workers
//! cannot act on a new connection.

pub mod watchdog;

pub use watchdog::Watchdog;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    CaptureGate, CaptureSource, CaptureWorker, FrameGapDetector, FrameQueue, PlaybackInterrupt,
    PlaybackSink, PlaybackWorker,
};
use crate::config::Config;
use crate::memory::{MemorySink, Turn};
use crate::tools::{ToolBridge, ToolRegistry};
use crate::upstream::{
    ConnectionManager, ManagedConnection, OutboundMessage, SessionRegistry, TranscriptRole,
    UpstreamConnector, UpstreamEvent,
};
use crate::{Error, Result};

/// Where the session currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; waiting for activation
    Stopped,
    /// Opening the upstream stream
    Connecting,
    /// Streaming microphone audio, waiting for the user
    Listening,
    /// The model is thinking (user turn ended, no audio back yet)
    Processing,
    /// Rendering the model's reply
    Speaking,
    /// Transport lost; about to attempt a fresh connection
    Reconnecting,
    /// Retries exhausted; stays here until a new activation
    Failed,
}

impl SessionState {
    /// Lowercase label used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External commands accepted by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start (or restart after failure) a session
    Activate,
    /// Cut the assistant off mid-reply
    Interrupt,
    /// End the session but keep the daemon running
    Stop,
    /// End the session and exit the daemon
    Shutdown,
}

/// Which half of the audio pipeline an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    /// Microphone side
    Capture,
    /// Speaker side
    Playback,
}

/// Events workers report back to the controller
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Playback queue and device buffer are both empty after audio played
    PlaybackDrained,
    /// A device failed permanently; that direction is silent from now on
    AudioDegraded {
        /// Which direction degraded
        direction: AudioDirection,
    },
    /// The exchange stalled past the liveness threshold
    WatchdogTimeout {
        /// How long the exchange was idle
        idle: Duration,
    },
}

/// Tracks the instant of the last send or receive on the stream
///
/// Cheap to clone; all clones observe the same timestamp.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl ActivityTracker {
    /// Create a tracker with activity recorded as "now"
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle(&self) -> Duration {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        let last = self.last_ms.load(Ordering::SeqCst);
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for talking to a running controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Send a command to the controller
    ///
    /// # Errors
    ///
    /// Returns error if the controller has exited
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Session("controller has exited".to_string()))
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Per-activation session bookkeeping
struct Session {
    id: Uuid,
    resumption_token: Option<String>,
    activity: ActivityTracker,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            resumption_token: None,
            activity: ActivityTracker::new(),
        }
    }
}

/// How one connection's event loop ended
enum DriveExit {
    /// Transport lost, watchdog fired, or upstream said go away
    Reconnect,
    /// A newer session evicted this one
    Evicted,
    /// User asked for the session to end
    Stopped,
    /// User asked for the daemon to exit
    Shutdown,
}

/// Owns the session lifecycle end to end
pub struct SessionController {
    config: Config,
    manager: ConnectionManager,
    tools: Arc<ToolRegistry>,
    capture: Arc<dyn CaptureSource>,
    playback: Arc<dyn PlaybackSink>,
    memory: Arc<dyn MemorySink>,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::Receiver<Command>,
    generation: u64,
}

impl SessionController {
    /// Create a controller and its handle
    #[must_use]
    pub fn new(
        config: Config,
        connector: Arc<dyn UpstreamConnector>,
        registry: Arc<SessionRegistry>,
        tools: Arc<ToolRegistry>,
        capture: Arc<dyn CaptureSource>,
        playback: Arc<dyn PlaybackSink>,
        memory: Arc<dyn MemorySink>,
    ) -> (Self, SessionHandle) {
        let manager = ConnectionManager::new(
            connector,
            registry,
            config.retry.clone(),
            config.credential.clone(),
            config.voice.clone(),
        );
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);
        let (command_tx, command_rx) = mpsc::channel(8);

        let controller = Self {
            config,
            manager,
            tools,
            capture,
            playback,
            memory,
            state_tx,
            commands: command_rx,
            generation: 0,
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    /// Run until shutdown. The controller idles in STOPPED (or FAILED)
    /// until an activation arrives; a fresh activation is the only way out
    /// of FAILED.
    pub async fn run(mut self) {
        tracing::info!("session controller running");
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => break,
                Some(Command::Interrupt | Command::Stop) => {}
                Some(Command::Activate) => {
                    if self.run_active().await {
                        break;
                    }
                }
            }
        }
        publish_state(&self.state_tx, SessionState::Stopped);
        tracing::info!("session controller exited");
    }

    /// One activation: connect, drive, reconnect as needed.
    ///
    /// Returns true if daemon shutdown was requested.
    async fn run_active(&mut self) -> bool {
        let mut session = Session::new();
        tracing::info!(session = %session.id, "session activated");

        loop {
            publish_state(&self.state_tx, SessionState::Connecting);

            // keep taking commands while the connect/backoff cycle runs, so
            // stop and shutdown are not deferred for the whole retry budget
            let token = session.resumption_token.clone();
            let result = {
                let connect = self.manager.connect(session.id, token);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        result = &mut connect => break result,
                        command = self.commands.recv() => match command {
                            None | Some(Command::Shutdown) => {
                                self.manager.release(session.id);
                                publish_state(&self.state_tx, SessionState::Stopped);
                                return true;
                            }
                            Some(Command::Stop) => {
                                tracing::info!(session = %session.id, "session stopped while connecting");
                                self.manager.release(session.id);
                                publish_state(&self.state_tx, SessionState::Stopped);
                                return false;
                            }
                            Some(Command::Activate | Command::Interrupt) => {}
                        },
                    }
                }
            };

            match result {
                Ok(managed) => {
                    let exit = self.drive(&mut session, managed).await;
                    self.manager.release(session.id);
                    match exit {
                        DriveExit::Reconnect => {
                            publish_state(&self.state_tx, SessionState::Reconnecting);
                        }
                        DriveExit::Evicted => {
                            tracing::warn!(session = %session.id, "session evicted");
                            publish_state(&self.state_tx, SessionState::Stopped);
                            return false;
                        }
                        DriveExit::Stopped => {
                            tracing::info!(session = %session.id, "session stopped");
                            publish_state(&self.state_tx, SessionState::Stopped);
                            return false;
                        }
                        DriveExit::Shutdown => {
                            publish_state(&self.state_tx, SessionState::Stopped);
                            return true;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        session = %session.id,
                        state = %*self.state_tx.borrow(),
                        error = %e,
                        "giving up on session"
                    );
                    publish_state(&self.state_tx, SessionState::Failed);
                    return false;
                }
            }
        }
    }

    /// Drive one connection until it ends.
    ///
    /// Spawns a fresh worker generation, runs the event loop, then tears
    /// the generation down before returning.
    #[allow(clippy::too_many_lines)]
    async fn drive(&mut self, session: &mut Session, managed: ManagedConnection) -> DriveExit {
        self.generation += 1;
        let gen_cancel = CancellationToken::new();
        let (worker_tx, mut worker_rx) = mpsc::channel::<WorkerEvent>(16);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(16);

        let outbound_queue = Arc::new(FrameQueue::with_duration(
            self.config.audio.queue_seconds,
            self.config.audio.input_sample_rate,
            self.config.audio.chunk_size,
        ));
        let playback_queue = Arc::new(FrameQueue::with_duration(
            self.config.audio.queue_seconds,
            self.config.audio.output_sample_rate,
            self.config.audio.chunk_size,
        ));
        let gate = Arc::new(CaptureGate::new());
        let interrupt = Arc::new(PlaybackInterrupt::new());

        let capture_worker = CaptureWorker::new(
            Arc::clone(&self.capture),
            Arc::clone(&gate),
            Arc::clone(&outbound_queue),
            self.config.audio.input_sample_rate,
            self.config.audio.chunk_size,
        );
        tokio::spawn(capture_worker.run(gen_cancel.child_token(), worker_tx.clone()));

        let playback_worker = PlaybackWorker::new(
            Arc::clone(&self.playback),
            Arc::clone(&playback_queue),
            Arc::clone(&interrupt),
            self.config.audio.output_sample_rate,
            self.config.audio.chunk_size,
        );
        tokio::spawn(playback_worker.run(gen_cancel.child_token(), worker_tx.clone()));

        let watchdog = Watchdog::new(
            self.config.watchdog.clone(),
            session.activity.clone(),
            self.state_tx.subscribe(),
        );
        tokio::spawn(watchdog.run(gen_cancel.child_token(), worker_tx.clone()));

        let outbound = managed.connection.outbound;
        let mut events = managed.connection.events;
        tokio::spawn(pump_outbound(
            Arc::clone(&outbound_queue),
            outbound.clone(),
            session.activity.clone(),
            gen_cancel.child_token(),
        ));

        let bridge = ToolBridge::new(Arc::clone(&self.tools), outcome_tx);
        let cooldown = self.config.audio.post_turn_cooldown();
        let session_id = session.id;

        session.activity.touch();
        publish_state(&self.state_tx, SessionState::Listening);
        tracing::info!(session = %session_id, generation = self.generation, "session live");

        let mut user_text = String::new();
        let mut assistant_text = String::new();
        let mut turn_done = false;
        let playback_started = Instant::now();
        let mut playback_seq = 0_u64;

        let exit = loop {
            tokio::select! {
                () = managed.cancel.cancelled() => break DriveExit::Evicted,

                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        let _ = outbound.send(OutboundMessage::Close).await;
                        break DriveExit::Shutdown;
                    }
                    Some(Command::Stop) => {
                        let _ = outbound.send(OutboundMessage::Close).await;
                        break DriveExit::Stopped;
                    }
                    Some(Command::Interrupt) => {
                        let dropped =
                            flush_playback(&playback_queue, self.playback.as_ref(), &interrupt);
                        gate.unmute();
                        publish_state(&self.state_tx, SessionState::Listening);
                        tracing::info!(session = %session_id, dropped, "barge-in requested");
                    }
                    Some(Command::Activate) => {}
                },

                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(
                            session = %session_id,
                            state = %*self.state_tx.borrow(),
                            "upstream stream ended"
                        );
                        break DriveExit::Reconnect;
                    };
                    session.activity.touch();
                    match event {
                        UpstreamEvent::Audio(frame) => {
                            playback_queue
                                .push(frame.stamped(playback_seq, playback_started.elapsed()));
                            playback_seq += 1;
                            turn_done = false;
                            if *self.state_tx.borrow() != SessionState::Speaking {
                                gate.mute();
                                publish_state(&self.state_tx, SessionState::Speaking);
                            }
                        }
                        UpstreamEvent::Transcript { role, text } => match role {
                            TranscriptRole::User => user_text.push_str(&text),
                            TranscriptRole::Assistant => assistant_text.push_str(&text),
                        },
                        UpstreamEvent::UserTurnEnded => {
                            if !user_text.is_empty() {
                                self.memory.record(Turn::new(
                                    TranscriptRole::User,
                                    std::mem::take(&mut user_text),
                                ));
                            }
                            gate.mute();
                            publish_state(&self.state_tx, SessionState::Processing);
                        }
                        UpstreamEvent::ToolCall(invocation) => {
                            publish_state(&self.state_tx, SessionState::Processing);
                            bridge.dispatch(invocation);
                        }
                        UpstreamEvent::TurnComplete => {
                            if !assistant_text.is_empty() {
                                self.memory.record(Turn::new(
                                    TranscriptRole::Assistant,
                                    std::mem::take(&mut assistant_text),
                                ));
                            }
                            turn_done = true;
                            gate.unmute_after(cooldown);
                            if playback_queue.is_empty() && self.playback.pending() == 0 {
                                publish_state(&self.state_tx, SessionState::Listening);
                            }
                        }
                        UpstreamEvent::Interrupted => {
                            let dropped =
                                flush_playback(&playback_queue, self.playback.as_ref(), &interrupt);
                            gate.unmute();
                            publish_state(&self.state_tx, SessionState::Listening);
                            tracing::info!(session = %session_id, dropped, "user barged in");
                        }
                        UpstreamEvent::ResumptionToken(token) => {
                            tracing::debug!(session = %session_id, "resumption token refreshed");
                            session.resumption_token = Some(token);
                        }
                        UpstreamEvent::GoAway => {
                            tracing::info!(session = %session_id, "upstream closing, reconnecting early");
                            break DriveExit::Reconnect;
                        }
                    }
                },

                outcome = outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        session.activity.touch();
                        tracing::info!(
                            session = %session_id,
                            call_id = %outcome.call_id,
                            tool = %outcome.tool_name,
                            ok = outcome.error.is_none(),
                            "tool outcome forwarded"
                        );
                        if outbound.send(OutboundMessage::ToolOutcome(outcome)).await.is_err() {
                            break DriveExit::Reconnect;
                        }
                    }
                },

                worker = worker_rx.recv() => {
                    let Some(worker) = worker else { break DriveExit::Reconnect };
                    match worker {
                        WorkerEvent::PlaybackDrained => {
                            if turn_done && *self.state_tx.borrow() == SessionState::Speaking {
                                publish_state(&self.state_tx, SessionState::Listening);
                            }
                        }
                        WorkerEvent::AudioDegraded { direction } => {
                            tracing::warn!(
                                session = %session_id,
                                direction = ?direction,
                                "audio degraded, continuing one-way"
                            );
                        }
                        WorkerEvent::WatchdogTimeout { idle } => {
                            tracing::error!(
                                session = %session_id,
                                state = %*self.state_tx.borrow(),
                                idle_secs = idle.as_secs(),
                                "watchdog timeout, discarding connection"
                            );
                            break DriveExit::Reconnect;
                        }
                    }
                },
            }
        };

        gen_cancel.cancel();
        outbound_queue.close();
        playback_queue.close();
        flush_playback(&playback_queue, self.playback.as_ref(), &interrupt);

        if !user_text.is_empty() {
            self.memory
                .record(Turn::new(TranscriptRole::User, user_text));
        }
        if !assistant_text.is_empty() {
            self.memory
                .record(Turn::new(TranscriptRole::Assistant, assistant_text));
        }

        exit
    }
}

/// Moves captured frames from the outbound queue onto the stream
async fn pump_outbound(
    queue: Arc<FrameQueue>,
    outbound: mpsc::Sender<OutboundMessage>,
    activity: ActivityTracker,
    cancel: CancellationToken,
) {
    let mut gaps = FrameGapDetector::new();
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = queue.pop() => frame,
        };
        let Some(frame) = frame else { return };
        let missed = gaps.observe(frame.seq());
        if missed > 0 {
            tracing::warn!(missed, "capture frames dropped before sending");
        }
        if outbound.send(OutboundMessage::Audio(frame)).await.is_err() {
            // stream gone; the event loop observes the same loss
            return;
        }
        activity.touch();
    }
}

/// Discard everything queued and buffered for the speaker
///
/// The epoch is raised first so the playback worker discards any frame it
/// popped before the flush instead of writing it afterwards.
fn flush_playback(
    queue: &FrameQueue,
    sink: &dyn PlaybackSink,
    interrupt: &PlaybackInterrupt,
) -> usize {
    interrupt.raise();
    let dropped = queue.clear();
    sink.clear();
    dropped
}

/// Publish a state change, logging the transition
fn publish_state(tx: &watch::Sender<SessionState>, next: SessionState) {
    let previous = *tx.borrow();
    if previous == next {
        return;
    }
    tracing::info!(from = %previous, to = %next, "state transition");
    let _ = tx.send(next);
}
