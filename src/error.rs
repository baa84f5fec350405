use std::time::Duration;
use thiserror::Error;

/// Failure of a single tool call. Each variant is surfaced to the agent as a
/// failed tool result; none of them bring the server down.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("Tool {0} is disabled; restart the server with --allow-code-execution to enable it")]
    CapabilityDisabled(String),
    #[error("Timed out after {0:?} waiting for Blender to respond")]
    Timeout(Duration),
    #[error("Could not reach Blender: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Malformed response from Blender: {0}")]
    Protocol(String),
    #[error("{0}")]
    Handler(String),
}

impl DispatchError {
    pub fn invalid(tool: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
