//! Upstream connection layer
//!
//! The live model is reached through a bidirectional stream: microphone
//! frames and tool outcomes go out, synthesized audio and control events
//! come in. The transport itself sits behind [`UpstreamConnector`] so the
//! session logic can be exercised against an in-process fake.

mod echo;
mod manager;
mod registry;

pub use echo::EchoConnector;
pub use manager::{ConnectionManager, ManagedConnection};
pub use registry::{RegisterOutcome, SessionRegistry};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Result;
use crate::audio::AudioFrame;
use crate::tools::{ToolInvocation, ToolOutcome};

/// Parameters for opening an upstream stream
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Local identifier for this session attempt
    pub session_id: Uuid,
    /// Credential identifying the account upstream
    pub credential: String,
    /// Voice profile to synthesize with
    pub voice: String,
    /// Resumption token from a previous stream, if any. Best-effort: the
    /// upstream may reject it, in which case the connector falls back to a
    /// cold start.
    pub resumption_token: Option<String>,
}

/// A message sent to the upstream model
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A chunk of microphone audio
    Audio(AudioFrame),
    /// The result of a tool call the model requested
    ToolOutcome(ToolOutcome),
    /// Orderly end of stream
    Close,
}

/// An event received from the upstream model
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// A chunk of synthesized speech
    Audio(AudioFrame),
    /// A transcript fragment for either side of the conversation
    Transcript {
        /// Who said it
        role: TranscriptRole,
        /// What was said
        text: String,
    },
    /// The upstream detected end of user speech and began thinking
    UserTurnEnded,
    /// The model wants a tool executed
    ToolCall(ToolInvocation),
    /// The model finished its response turn
    TurnComplete,
    /// The user spoke over the model; playback must stop immediately
    Interrupted,
    /// A fresh resumption token to use if the stream drops
    ResumptionToken(String),
    /// The upstream will close this stream shortly; reconnect proactively
    GoAway,
}

/// Which side of the conversation a transcript fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    /// The human speaking into the microphone
    User,
    /// The assistant's synthesized reply
    Assistant,
}

impl TranscriptRole {
    /// Label used in logs and stored transcripts
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open bidirectional stream to the upstream model
///
/// Dropping either channel end is how transport loss surfaces: the send
/// half erroring or the event stream ending both mean the stream is gone.
#[derive(Debug)]
pub struct UpstreamConnection {
    /// Send half of the stream
    pub outbound: mpsc::Sender<OutboundMessage>,
    /// Receive half of the stream
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// Opens streams to the upstream model
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a single stream. A failure here is one connection attempt;
    /// retry policy lives in [`ConnectionManager`], not in connectors.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Conflict`] when the upstream refuses because
    /// another session holds the credential, [`crate::Error::Transport`] for
    /// network-level failures.
    async fn connect(&self, request: ConnectRequest) -> Result<UpstreamConnection>;
}
