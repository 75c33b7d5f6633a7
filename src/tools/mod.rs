//! Tool execution: registry, invocations, and the async bridge
//!
//! The model requests tool calls mid-conversation; results flow back as
//! outcomes on the same stream. Tool failures never abort the session,
//! they become error-carrying outcomes.

mod bridge;

pub use bridge::ToolBridge;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum bytes of tool output forwarded upstream
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Upstream-assigned identifier correlating the outcome to the call
    pub call_id: String,
    /// Name of the tool to run
    pub tool_name: String,
    /// Tool parameters as free-form JSON
    pub parameters: serde_json::Value,
    /// When the call was received
    pub issued_at: DateTime<Utc>,
}

/// The result of a tool call, sent back to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Identifier of the call this answers
    pub call_id: String,
    /// Tool that produced the outcome
    pub tool_name: String,
    /// Successful output, absent on failure
    pub output: Option<String>,
    /// Failure description, absent on success
    pub error: Option<String>,
    /// When execution finished
    pub completed_at: DateTime<Utc>,
}

impl ToolOutcome {
    /// Build a success outcome for `invocation`
    #[must_use]
    pub fn success(invocation: &ToolInvocation, output: String) -> Self {
        Self {
            call_id: invocation.call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            output: Some(sanitize_output(&output)),
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Build a failure outcome for `invocation`
    #[must_use]
    pub fn failure(invocation: &ToolInvocation, error: &Error) -> Self {
        Self {
            call_id: invocation.call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            output: None,
            error: Some(error.to_string()),
            completed_at: Utc::now(),
        }
    }
}

/// Clamp tool output to the wire budget and strip control characters
#[must_use]
pub fn sanitize_output(output: &str) -> String {
    let cleaned: String = output
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if cleaned.len() <= MAX_OUTPUT_BYTES {
        return cleaned;
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = cleaned[..end].to_string();
    truncated.push_str("\n[output truncated]");
    truncated
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to invoke this tool
    fn name(&self) -> &str;

    /// Short human-readable description
    fn description(&self) -> &str;

    /// Execute with the given parameters
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] on failure; the bridge converts it into an
    /// error outcome
    async fn execute(&self, parameters: &serde_json::Value) -> Result<String>;
}

/// Registered tools, looked up by name
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Names of all registered tools, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reports the local date and time
///
/// The model has no clock of its own; this keeps "what time is it" answers
/// honest.
pub struct LocalTimeTool;

#[async_trait]
impl Tool for LocalTimeTool {
    fn name(&self) -> &str {
        "local_time"
    }

    fn description(&self) -> &str {
        "Current local date and time"
    }

    async fn execute(&self, _parameters: &serde_json::Value) -> Result<String> {
        Ok(chrono::Local::now().format("%A, %B %-d %Y, %H:%M:%S").to_string())
    }
}
