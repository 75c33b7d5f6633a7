//! Vesper - real-time voice session core for a personal assistant
//!
//! This library drives a full-duplex voice conversation against a streaming
//! model service:
//! - Audio pipeline (capture, bounded queues, playback, barge-in)
//! - Connection management (conflict eviction, backoff, resumption)
//! - Session state machine with a liveness watchdog
//! - Tool execution bridged back onto the stream
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  SessionController                    │
//! │   state machine  │  barge-in  │  transcripts          │
//! └──────┬───────────────┬──────────────────┬────────────┘
//!        │               │                  │
//! ┌──────▼──────┐ ┌──────▼───────┐  ┌──────▼───────────┐
//! │   Audio     │ │  Upstream    │  │     Tools        │
//! │ capture /   │ │ connect /    │  │ registry /       │
//! │ playback    │ │ retry /      │  │ async bridge     │
//! │ queues      │ │ registry     │  │                  │
//! └─────────────┘ └──────────────┘  └──────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod memory;
pub mod session;
pub mod tools;
pub mod upstream;

pub use audio::{AudioFrame, FrameQueue, PushResult};
pub use config::Config;
pub use error::{Error, Result};
pub use memory::{JsonlSink, LogSink, MemorySink, Turn};
pub use session::{
    ActivityTracker, Command, SessionController, SessionHandle, SessionState, Watchdog,
    WorkerEvent,
};
pub use tools::{Tool, ToolBridge, ToolInvocation, ToolOutcome, ToolRegistry};
pub use upstream::{
    ConnectRequest, ConnectionManager, EchoConnector, OutboundMessage, SessionRegistry,
    TranscriptRole, UpstreamConnection, UpstreamConnector, UpstreamEvent,
};
