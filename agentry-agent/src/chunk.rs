// ABOUTME: Stream chunk types emitted by agent backends during streamed execution.
// ABOUTME: Every chunk carries the producing backend id and a per-stream sequence number.

use crate::response::{Citation, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One increment of a streamed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStreamChunk {
    /// Backend that produced this chunk
    pub backend_id: String,
    /// Position within the stream, starting at zero
    pub sequence: u64,
    pub body: ChunkBody,
}

impl AgentStreamChunk {
    pub fn kind(&self) -> ChunkKind {
        self.body.kind()
    }

    /// True for completion and error chunks, after which nothing follows
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ChunkKind::Completion | ChunkKind::Error)
    }
}

/// Payload of a stream chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkBody {
    /// Streaming text for real-time display
    Text { text: String },

    /// Backend invoked a tool
    ToolCall {
        /// Unique identifier for this tool invocation
        id: String,
        name: String,
        input: Value,
    },

    /// Intermediate reasoning step
    Thought { text: String },

    /// Final answer; the stream ends after this
    Completion {
        answer: String,
        #[serde(default)]
        citations: Vec<Citation>,
        #[serde(default)]
        usage: Option<Usage>,
    },

    /// Execution failed; the stream ends after this
    Error {
        code: ErrorCode,
        message: String,
        /// Whether the error is recoverable (can retry)
        recoverable: bool,
    },
}

impl ChunkBody {
    pub fn text(text: impl Into<String>) -> Self {
        ChunkBody::Text { text: text.into() }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        ChunkBody::Thought { text: text.into() }
    }

    pub fn completion(answer: impl Into<String>) -> Self {
        ChunkBody::Completion {
            answer: answer.into(),
            citations: Vec::new(),
            usage: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ChunkBody::Error {
            code,
            message: message.into(),
            recoverable: code.is_recoverable(),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkBody::Text { .. } => ChunkKind::Text,
            ChunkBody::ToolCall { .. } => ChunkKind::ToolCall,
            ChunkBody::Thought { .. } => ChunkKind::Thought,
            ChunkBody::Completion { .. } => ChunkKind::Completion,
            ChunkBody::Error { .. } => ChunkKind::Error,
        }
    }
}

/// Discriminant of [`ChunkBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    ToolCall,
    Thought,
    Completion,
    Error,
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request timed out
    Timeout,
    /// Rate limited by the backend
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// Caller cancelled the request
    Cancelled,
    /// Backend-specific error
    BackendError,
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_body_serializes_with_type_tag() {
        let body = ChunkBody::ToolCall {
            id: "t1".to_string(),
            name: "search".to_string(),
            input: json!({"q": "rust"}),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["name"], "search");
    }

    #[test]
    fn test_terminal_chunks() {
        let chunk = |body| AgentStreamChunk {
            backend_id: "b".to_string(),
            sequence: 0,
            body,
        };
        assert!(chunk(ChunkBody::completion("done")).is_terminal());
        assert!(chunk(ChunkBody::error(ErrorCode::Unknown, "x")).is_terminal());
        assert!(!chunk(ChunkBody::text("partial")).is_terminal());
        assert!(!chunk(ChunkBody::thought("hmm")).is_terminal());
    }

    #[test]
    fn test_error_recoverability_follows_code() {
        match ChunkBody::error(ErrorCode::Timeout, "slow") {
            ChunkBody::Error { recoverable, .. } => assert!(recoverable),
            other => panic!("Expected Error body, got {:?}", other),
        }
        match ChunkBody::error(ErrorCode::AuthFailed, "denied") {
            ChunkBody::Error { recoverable, .. } => assert!(!recoverable),
            other => panic!("Expected Error body, got {:?}", other),
        }
    }
}
