//! Connection lifecycle: eviction, cooldown, retries, release
//!
//! The upstream allows one live stream per credential and keeps a closed
//! stream "occupied" for a short grace window. The manager serializes the
//! whole dance: evict any local holder, wait out the cooldown, then attempt
//! the connection with exponential backoff on transient failures.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::upstream::{
    ConnectRequest, RegisterOutcome, SessionRegistry, UpstreamConnection, UpstreamConnector,
};
use crate::{Error, Result};

/// An established connection plus its registry claim
#[derive(Debug)]
pub struct ManagedConnection {
    /// The open stream
    pub connection: UpstreamConnection,
    /// Session that holds the registry claim
    pub session_id: Uuid,
    /// Cancelled if a later session evicts this one
    pub cancel: CancellationToken,
}

/// Opens upstream connections with conflict eviction and retry
pub struct ConnectionManager {
    connector: Arc<dyn UpstreamConnector>,
    registry: Arc<SessionRegistry>,
    policy: RetryPolicy,
    credential: String,
    voice: String,
}

impl ConnectionManager {
    /// Create a manager bound to one credential
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        registry: Arc<SessionRegistry>,
        policy: RetryPolicy,
        credential: String,
        voice: String,
    ) -> Self {
        Self {
            connector,
            registry,
            policy,
            credential,
            voice,
        }
    }

    /// Open a stream for `session_id`, evicting any previous local holder
    /// and retrying transient failures with exponential backoff.
    ///
    /// The post-close cooldown is honored before every attempt, including
    /// the first, so the upstream has observed the previous stream closing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] once the retry budget is spent,
    /// or the underlying error immediately for non-transient failures.
    pub async fn connect(
        &self,
        session_id: Uuid,
        resumption_token: Option<String>,
    ) -> Result<ManagedConnection> {
        let cancel = self.claim(session_id).await?;

        let mut token = resumption_token;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for_attempt(attempt - 1);
                tracing::info!(
                    session = %session_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
            tokio::time::sleep(self.policy.cooldown()).await;

            let request = ConnectRequest {
                session_id,
                credential: self.credential.clone(),
                voice: self.voice.clone(),
                resumption_token: token.clone(),
            };

            match self.connector.connect(request).await {
                Ok(connection) => {
                    tracing::info!(session = %session_id, attempt, "upstream connected");
                    return Ok(ManagedConnection {
                        connection,
                        session_id,
                        cancel,
                    });
                }
                Err(e) if e.is_transient() => {
                    // a stale resumption token can itself cause rejection;
                    // fall back to a cold start on the next attempt
                    if token.take().is_some() {
                        tracing::debug!(session = %session_id, "dropping resumption token");
                    }
                    tracing::warn!(
                        session = %session_id,
                        attempt,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = e.to_string();
                }
                Err(e) => {
                    self.registry.release(&self.credential, session_id);
                    return Err(e);
                }
            }
        }

        self.registry.release(&self.credential, session_id);
        Err(Error::ConnectionFailed {
            attempts: self.policy.max_attempts,
            reason: last_error,
        })
    }

    /// Release the registry claim for `session_id`
    pub fn release(&self, session_id: Uuid) {
        if self.registry.release(&self.credential, session_id) {
            tracing::debug!(session = %session_id, "released credential claim");
        }
    }

    /// Claim the credential, evicting holders until this session owns it.
    ///
    /// A rival can slip in during the post-eviction cooldown, so the claim
    /// is re-checked in a loop; `connect` must never proceed unregistered.
    async fn claim(&self, session_id: Uuid) -> Result<CancellationToken> {
        let cancel = CancellationToken::new();
        for _ in 0..=self.policy.max_attempts {
            match self
                .registry
                .try_register(&self.credential, session_id, cancel.clone())
            {
                RegisterOutcome::Registered => return Ok(cancel),
                RegisterOutcome::Held { holder } => {
                    tracing::warn!(
                        session = %session_id,
                        holder = %holder,
                        "credential held by another session, evicting"
                    );
                    self.registry.evict(&self.credential);
                    // let the evicted stream close before we claim
                    tokio::time::sleep(self.policy.cooldown()).await;
                }
            }
        }
        Err(Error::Conflict(
            "credential still contended after repeated evictions".to_string(),
        ))
    }
}
