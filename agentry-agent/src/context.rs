// ABOUTME: Per-invocation caller context passed to every backend call.
// ABOUTME: Session and conversation references are carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Caller context for a single execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Opaque reference into the caller's conversation store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Upper bound on a single backend call, overriding the runtime default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_secs: Option<u64>,
}

impl AgentContext {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            conversation_ref: None,
            metadata: Map::new(),
            max_execution_secs: None,
        }
    }

    pub fn with_conversation(mut self, conversation_ref: impl Into<String>) -> Self {
        self.conversation_ref = Some(conversation_ref.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_execution(mut self, limit: Duration) -> Self {
        self.max_execution_secs = Some(limit.as_secs().max(1));
        self
    }

    pub fn max_execution(&self) -> Option<Duration> {
        self.max_execution_secs.map(Duration::from_secs)
    }
}
