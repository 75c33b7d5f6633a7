//! Loopback connector for end-to-end pipeline testing
//!
//! Parrots the user's speech back: buffers microphone frames, and once a
//! stretch of silence follows speech it replays the buffered audio as if
//! it were a synthesized reply. Drives the full state machine (listening,
//! processing, speaking) without a live upstream.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::audio::AudioFrame;
use crate::upstream::{
    ConnectRequest, OutboundMessage, TranscriptRole, UpstreamConnection, UpstreamConnector,
    UpstreamEvent,
};

/// RMS energy above which a frame counts as speech
const SPEECH_THRESHOLD: f32 = 0.015;
/// Consecutive quiet frames that end a user turn (~0.8s at 32ms frames)
const SILENCE_FRAMES: usize = 25;

/// Connector that echoes captured speech back as the reply
pub struct EchoConnector;

#[async_trait]
impl UpstreamConnector for EchoConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<UpstreamConnection> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        tracing::info!(
            session = %request.session_id,
            voice = %request.voice,
            resuming = request.resumption_token.is_some(),
            "loopback upstream connected"
        );

        tokio::spawn(echo_loop(outbound_rx, event_tx, request.session_id));

        Ok(UpstreamConnection {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

async fn echo_loop(
    mut outbound: mpsc::Receiver<OutboundMessage>,
    events: mpsc::Sender<UpstreamEvent>,
    session_id: uuid::Uuid,
) {
    let mut buffered: Vec<AudioFrame> = Vec::new();
    let mut quiet_run = 0usize;
    let mut heard_speech = false;

    while let Some(message) = outbound.recv().await {
        match message {
            OutboundMessage::Audio(frame) => {
                if frame.rms() >= SPEECH_THRESHOLD {
                    heard_speech = true;
                    quiet_run = 0;
                    buffered.push(frame);
                } else if heard_speech {
                    quiet_run += 1;
                    if quiet_run >= SILENCE_FRAMES {
                        if replay(&events, &mut buffered).await.is_err() {
                            return;
                        }
                        heard_speech = false;
                        quiet_run = 0;
                    }
                }
            }
            OutboundMessage::ToolOutcome(outcome) => {
                tracing::info!(
                    call_id = %outcome.call_id,
                    tool = %outcome.tool_name,
                    "loopback received tool outcome"
                );
            }
            OutboundMessage::Close => {
                tracing::info!(session = %session_id, "loopback upstream closed");
                return;
            }
        }
    }
}

/// Replay the buffered speech as a model turn
async fn replay(
    events: &mpsc::Sender<UpstreamEvent>,
    buffered: &mut Vec<AudioFrame>,
) -> std::result::Result<(), mpsc::error::SendError<UpstreamEvent>> {
    events.send(UpstreamEvent::UserTurnEnded).await?;
    events
        .send(UpstreamEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: format!("(echoing {} frames back)", buffered.len()),
        })
        .await?;
    for frame in buffered.drain(..) {
        events.send(UpstreamEvent::Audio(frame)).await?;
    }
    events.send(UpstreamEvent::TurnComplete).await?;
    events
        .send(UpstreamEvent::ResumptionToken(
            uuid::Uuid::new_v4().to_string(),
        ))
        .await?;
    Ok(())
}
