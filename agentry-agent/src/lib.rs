// ABOUTME: Agent contract for agentry - the interface every pluggable backend implements.
// ABOUTME: Provides the backend trait, request/response types, stream chunks and built-in backends.

pub mod capabilities;
pub mod chunk;
pub mod context;
pub mod health;
pub mod response;
pub mod stream;
pub mod traits;

pub mod backends;

pub use capabilities::{AgentCapabilities, Capability};
pub use chunk::{AgentStreamChunk, ChunkBody, ChunkKind, ErrorCode};
pub use context::AgentContext;
pub use health::{HealthState, HealthStatus};
pub use response::{AgentOutput, AgentResponse, Citation, Usage};
pub use stream::{chunk_channel, ChunkSink, ChunkStream, StreamClosed, DEFAULT_STREAM_CAPACITY};
pub use traits::{AgentBackend, AgentConfig};
