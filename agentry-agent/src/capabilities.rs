// ABOUTME: Capability vocabulary and the per-backend capability record.
// ABOUTME: Routing uses capability sets; a missing capability always excludes a backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A named feature a backend can declare support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Incremental chunked output
    Streaming,
    /// External tool invocation
    Tools,
    /// Conversation memory across calls
    Memory,
    /// Non-text inputs (images, audio)
    Multimodal,
    /// Retrieval-augmented generation
    Rag,
    /// Running generated code
    CodeExecution,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Streaming,
        Capability::Tools,
        Capability::Memory,
        Capability::Multimodal,
        Capability::Rag,
        Capability::CodeExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Streaming => "streaming",
            Capability::Tools => "tools",
            Capability::Memory => "memory",
            Capability::Multimodal => "multimodal",
            Capability::Rag => "rag",
            Capability::CodeExecution => "code_execution",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == normalized)
            .ok_or_else(|| format!("unknown capability: {}", s))
    }
}

/// What a backend variant supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_memory: bool,
    #[serde(default)]
    pub supports_multimodal: bool,
    #[serde(default)]
    pub supports_rag: bool,
    #[serde(default)]
    pub supports_code_execution: bool,
    /// Maximum context length in tokens
    #[serde(default = "default_max_context_length")]
    pub max_context_length: u32,
    #[serde(default = "default_languages")]
    pub supported_languages: Vec<String>,
}

fn default_max_context_length() -> u32 {
    4096
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming: false,
            supports_tools: false,
            supports_memory: false,
            supports_multimodal: false,
            supports_rag: false,
            supports_code_execution: false,
            max_context_length: default_max_context_length(),
            supported_languages: default_languages(),
        }
    }
}

impl AgentCapabilities {
    /// Build a capability record from a set of capability names
    pub fn from_set<I>(caps: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        caps.into_iter()
            .fold(Self::default(), |acc, cap| acc.with(cap))
    }

    /// Enable a single capability
    pub fn with(mut self, cap: Capability) -> Self {
        *self.flag_mut(cap) = true;
        self
    }

    pub fn with_max_context_length(mut self, tokens: u32) -> Self {
        self.max_context_length = tokens;
        self
    }

    pub fn supports(&self, cap: Capability) -> bool {
        match cap {
            Capability::Streaming => self.supports_streaming,
            Capability::Tools => self.supports_tools,
            Capability::Memory => self.supports_memory,
            Capability::Multimodal => self.supports_multimodal,
            Capability::Rag => self.supports_rag,
            Capability::CodeExecution => self.supports_code_execution,
        }
    }

    /// The set of capabilities this record declares
    pub fn capability_set(&self) -> BTreeSet<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|cap| self.supports(*cap))
            .collect()
    }

    /// True when every required capability is declared
    pub fn covers(&self, required: &BTreeSet<Capability>) -> bool {
        required.iter().all(|cap| self.supports(*cap))
    }

    /// Capabilities in `required` that this record lacks
    pub fn missing(&self, required: &BTreeSet<Capability>) -> Vec<Capability> {
        required
            .iter()
            .copied()
            .filter(|cap| !self.supports(*cap))
            .collect()
    }

    fn flag_mut(&mut self, cap: Capability) -> &mut bool {
        match cap {
            Capability::Streaming => &mut self.supports_streaming,
            Capability::Tools => &mut self.supports_tools,
            Capability::Memory => &mut self.supports_memory,
            Capability::Multimodal => &mut self.supports_multimodal,
            Capability::Rag => &mut self.supports_rag,
            Capability::CodeExecution => &mut self.supports_code_execution,
        }
    }
}
