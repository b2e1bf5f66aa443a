// ABOUTME: Core AgentBackend trait that all backend variants implement.
// ABOUTME: Defines execution, streaming, capability reporting, health and teardown.

use crate::capabilities::AgentCapabilities;
use crate::context::AgentContext;
use crate::health::HealthStatus;
use crate::response::AgentOutput;
use crate::stream::ChunkSink;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Backend configuration as handed to a constructor.
///
/// Always passed explicitly so two instances of the same variant can run with
/// different settings side by side.
pub type AgentConfig = Map<String, Value>;

/// Core trait that all agent backends implement.
///
/// `execute` and `stream` take `&mut self`: an instance serves one call at a
/// time. Concurrency comes from running several instances, which the pool
/// hands out exclusively.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Variant name for logging and metrics
    fn kind(&self) -> &'static str;

    /// What this instance supports
    fn capabilities(&self) -> AgentCapabilities;

    /// One-time setup after construction (connections, model loading)
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run a query to completion
    async fn execute(&mut self, query: &str, context: &AgentContext) -> Result<AgentOutput>;

    /// Run a query, emitting chunks as they are produced.
    ///
    /// Implementations should stop promptly once `sink` reports the stream as
    /// closed. The default runs [`execute`](AgentBackend::execute) and emits a
    /// single completion chunk.
    async fn stream(
        &mut self,
        query: &str,
        context: &AgentContext,
        sink: &mut ChunkSink,
    ) -> Result<()> {
        let output = self.execute(query, context).await?;
        sink.complete(output).await?;
        Ok(())
    }

    /// Check whether the instance can serve requests
    async fn health_check(&self) -> HealthStatus;

    /// Release external resources. Called at most once per instance.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
