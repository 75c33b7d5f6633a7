//! Bridges model tool calls to local execution
//!
//! Each invocation runs on its own task so a slow tool never stalls the
//! audio path. Exactly one outcome is forwarded per call id, even if the
//! upstream re-delivers an invocation after a resume.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::Error;
use crate::tools::{ToolInvocation, ToolOutcome, ToolRegistry};

/// Dispatches tool invocations and funnels outcomes back to the session
pub struct ToolBridge {
    registry: Arc<ToolRegistry>,
    outcomes: mpsc::Sender<ToolOutcome>,
    seen: Mutex<HashSet<String>>,
}

impl ToolBridge {
    /// Create a bridge sending outcomes to `outcomes`
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, outcomes: mpsc::Sender<ToolOutcome>) -> Self {
        Self {
            registry,
            outcomes,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Execute `invocation` on a background task.
    ///
    /// Duplicate call ids are dropped. Unknown tools and tool failures
    /// produce error outcomes rather than session errors.
    pub fn dispatch(&self, invocation: ToolInvocation) {
        if !self.mark_seen(&invocation.call_id) {
            tracing::warn!(
                call_id = %invocation.call_id,
                tool = %invocation.tool_name,
                "duplicate tool call dropped"
            );
            return;
        }

        tracing::info!(
            call_id = %invocation.call_id,
            tool = %invocation.tool_name,
            "dispatching tool call"
        );

        let tool = self.registry.get(&invocation.tool_name);
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            let outcome = match tool {
                Some(tool) => match tool.execute(&invocation.parameters).await {
                    Ok(output) => ToolOutcome::success(&invocation, output),
                    Err(e) => {
                        tracing::warn!(
                            call_id = %invocation.call_id,
                            tool = %invocation.tool_name,
                            error = %e,
                            "tool execution failed"
                        );
                        ToolOutcome::failure(&invocation, &e)
                    }
                },
                None => {
                    tracing::warn!(
                        call_id = %invocation.call_id,
                        tool = %invocation.tool_name,
                        "unknown tool requested"
                    );
                    ToolOutcome::failure(
                        &invocation,
                        &Error::Tool(format!("unknown tool: {}", invocation.tool_name)),
                    )
                }
            };

            if outcomes.send(outcome).await.is_err() {
                tracing::debug!(
                    call_id = %invocation.call_id,
                    "outcome channel closed, result discarded"
                );
            }
        });
    }

    fn mark_seen(&self, call_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(call_id.to_string())
    }
}
