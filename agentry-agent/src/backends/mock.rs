// ABOUTME: Mock backend for testing - returns pre-configured responses.
// ABOUTME: Scripts answers, chunk sequences, failures, delays and health results per query.
//!
//! # Example
//!
//! ```no_run
//! use agentry_agent::backends::mock::MockBackend;
//! use agentry_agent::{AgentBackend, AgentContext};
//!
//! # async fn example() {
//! let mut mock = MockBackend::new()
//!     .on_query("hello").respond_text("Hi there!")
//!     .on_query("broken").respond_error("backend exploded");
//!
//! let ctx = AgentContext::new("tenant", "user", "session");
//! let output = mock.execute("hello", &ctx).await.unwrap();
//! assert_eq!(output.answer, "Hi there!");
//! assert!(mock.execute("broken", &ctx).await.is_err());
//! # }
//! ```
//!
//! Clones share their script, health sequence and [`MockProbe`], so a single
//! template can back every instance a pool constructs.

use crate::capabilities::{AgentCapabilities, Capability};
use crate::chunk::ChunkBody;
use crate::context::AgentContext;
use crate::health::HealthStatus;
use crate::response::AgentOutput;
use crate::stream::ChunkSink;
use crate::traits::{AgentBackend, AgentConfig};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock backend for testing
#[derive(Clone)]
pub struct MockBackend {
    capabilities: AgentCapabilities,
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    default_reply: Reply,
    health: Arc<Mutex<HealthScript>>,
    latency: Option<Duration>,
    chunk_delay: Option<Duration>,
    probe: MockProbe,
}

#[derive(Clone)]
struct Expectation {
    pattern: String,
    reply: Reply,
}

#[derive(Debug, Clone)]
enum Reply {
    /// Echo the query back
    Echo,
    Text(String),
    Chunks(Vec<ChunkBody>),
    /// Stream the chunks, then fail
    PartialFailure(Vec<ChunkBody>, String),
    Fail(String),
    /// Never finish; only cancellation ends the call
    Hang,
}

struct HealthScript {
    queue: VecDeque<HealthStatus>,
    otherwise: HealthStatus,
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self {
            capabilities: AgentCapabilities::from_set([Capability::Streaming]),
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            default_reply: Reply::Echo,
            health: Arc::new(Mutex::new(HealthScript {
                queue: VecDeque::new(),
                otherwise: HealthStatus::healthy(),
            })),
            latency: None,
            chunk_delay: None,
            probe: MockProbe::default(),
        }
    }

    /// Build a mock from a configuration map.
    ///
    /// Recognised keys: `answer`, `fail`, `latency_ms`, `chunk_delay_ms`,
    /// `chunks`, `healthy`, `health_message`, `capabilities`,
    /// `max_context_length`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let mut mock = Self::new();

        if let Some(caps) = config.get("capabilities") {
            let names = caps
                .as_array()
                .ok_or_else(|| anyhow!("capabilities must be an array of names"))?;
            let mut set = Vec::with_capacity(names.len());
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| anyhow!("capability names must be strings"))?;
                set.push(name.parse::<Capability>().map_err(|e| anyhow!(e))?);
            }
            mock.capabilities = AgentCapabilities::from_set(set);
        }
        if let Some(tokens) = config.get("max_context_length").and_then(|v| v.as_u64()) {
            mock.capabilities.max_context_length = u32::try_from(tokens).unwrap_or(u32::MAX);
        }

        if let Some(answer) = config.get("answer").and_then(|v| v.as_str()) {
            mock.default_reply = Reply::Text(answer.to_string());
        }
        if let Some(chunks) = config.get("chunks").and_then(|v| v.as_array()) {
            let bodies = chunks
                .iter()
                .filter_map(|c| c.as_str())
                .map(ChunkBody::text)
                .collect();
            mock.default_reply = Reply::Chunks(bodies);
        }
        if config.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            mock.default_reply = Reply::Fail("mock backend configured to fail".to_string());
        }

        mock.latency = config
            .get("latency_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);
        mock.chunk_delay = config
            .get("chunk_delay_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);

        if !config.get("healthy").and_then(|v| v.as_bool()).unwrap_or(true) {
            let message = config
                .get("health_message")
                .and_then(|v| v.as_str())
                .unwrap_or("mock backend configured unhealthy");
            mock = mock.always_unhealthy(message);
        }

        Ok(mock)
    }

    /// Set up an expectation for a query containing the given pattern
    pub fn on_query(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Delay every execution by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay between streamed chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Answer unmatched queries with fixed text instead of an echo
    pub fn with_default_text(mut self, text: &str) -> Self {
        self.default_reply = Reply::Text(text.to_string());
        self
    }

    /// Fail every unmatched query
    pub fn fail_always(mut self, message: &str) -> Self {
        self.default_reply = Reply::Fail(message.to_string());
        self
    }

    /// Never complete unmatched queries
    pub fn hang_always(mut self) -> Self {
        self.default_reply = Reply::Hang;
        self
    }

    /// Health results returned in order, before falling back to healthy
    pub fn health_sequence(self, statuses: Vec<HealthStatus>) -> Self {
        {
            let mut script = self.health.lock().unwrap_or_else(|e| e.into_inner());
            script.queue.extend(statuses);
        }
        self
    }

    /// Report unhealthy on every probe
    pub fn always_unhealthy(self, message: &str) -> Self {
        {
            let mut script = self.health.lock().unwrap_or_else(|e| e.into_inner());
            script.otherwise = HealthStatus::unhealthy(message);
        }
        self
    }

    /// Switch the steady-state health result, affecting every clone
    pub fn set_health(&self, status: HealthStatus) {
        let mut script = self.health.lock().unwrap_or_else(|e| e.into_inner());
        script.queue.clear();
        script.otherwise = status;
    }

    /// Counters shared by every clone of this mock
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    // Match expectations with FIFO preference: check the front first, fall
    // back to searching the queue if the front doesn't match.
    fn take_reply(&self, query: &str) -> Reply {
        let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        let matched = match exp.front() {
            Some(front) if query.contains(&front.pattern) => exp.pop_front(),
            Some(_) => exp
                .iter()
                .position(|e| query.contains(&e.pattern))
                .and_then(|i| exp.remove(i)),
            None => None,
        };
        matched
            .map(|e| e.reply)
            .unwrap_or_else(|| self.default_reply.clone())
    }

    async fn pause(&self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities.clone()
    }

    async fn execute(&mut self, query: &str, context: &AgentContext) -> Result<AgentOutput> {
        let _active = self.probe.enter();
        self.probe.inner.executions.fetch_add(1, Ordering::SeqCst);
        self.pause(self.latency).await;

        let output = match self.take_reply(query) {
            Reply::Echo => AgentOutput::text(format!("Mock: no expectation for '{}'", query)),
            Reply::Text(text) => AgentOutput::text(text),
            Reply::Chunks(bodies) => AgentOutput::text(answer_from_chunks(&bodies)),
            Reply::PartialFailure(_, message) | Reply::Fail(message) => bail!(message),
            Reply::Hang => std::future::pending().await,
        };
        Ok(output.with_metadata("session_id", json!(context.session_id)))
    }

    async fn stream(
        &mut self,
        query: &str,
        _context: &AgentContext,
        sink: &mut ChunkSink,
    ) -> Result<()> {
        let _active = self.probe.enter();
        self.probe.inner.streams.fetch_add(1, Ordering::SeqCst);
        self.pause(self.latency).await;

        let (bodies, failure) = match self.take_reply(query) {
            Reply::Echo => (vec![ChunkBody::text(query)], None),
            Reply::Text(text) => (vec![ChunkBody::text(text)], None),
            Reply::Chunks(bodies) => (bodies, None),
            Reply::PartialFailure(bodies, message) => (bodies, Some(message)),
            Reply::Fail(message) => (Vec::new(), Some(message)),
            Reply::Hang => std::future::pending().await,
        };

        for body in bodies {
            self.pause(self.chunk_delay).await;
            sink.send(body).await?;
        }
        if let Some(message) = failure {
            bail!(message);
        }
        if !sink.is_finished() {
            sink.complete_with_transcript().await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.probe.inner.health_checks.fetch_add(1, Ordering::SeqCst);
        let mut script = self.health.lock().unwrap_or_else(|e| e.into_inner());
        script
            .queue
            .pop_front()
            .unwrap_or_else(|| script.otherwise.clone())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.probe.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn answer_from_chunks(bodies: &[ChunkBody]) -> String {
    let completion = bodies.iter().find_map(|b| match b {
        ChunkBody::Completion { answer, .. } => Some(answer.clone()),
        _ => None,
    });
    completion.unwrap_or_else(|| {
        bodies
            .iter()
            .filter_map(|b| match b {
                ChunkBody::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    })
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    fn push(self, reply: Reply) -> MockBackend {
        self.backend
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                reply,
            });
        self.backend
    }

    /// Respond with a simple text answer
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.push(Reply::Text(text.to_string()))
    }

    /// Stream the given chunks; execute answers with their concatenated text
    pub fn respond_chunks(self, chunks: Vec<ChunkBody>) -> MockBackend {
        self.push(Reply::Chunks(chunks))
    }

    /// Fail with the given message
    pub fn respond_error(self, message: &str) -> MockBackend {
        self.push(Reply::Fail(message.to_string()))
    }

    /// Stream the given chunks, then fail
    pub fn respond_partial_failure(self, chunks: Vec<ChunkBody>, message: &str) -> MockBackend {
        self.push(Reply::PartialFailure(chunks, message.to_string()))
    }

    /// Never respond
    pub fn hang(self) -> MockBackend {
        self.push(Reply::Hang)
    }
}

/// Call counters shared across clones of a [`MockBackend`]
#[derive(Clone, Default)]
pub struct MockProbe {
    inner: Arc<ProbeCounters>,
}

#[derive(Default)]
struct ProbeCounters {
    executions: AtomicUsize,
    streams: AtomicUsize,
    health_checks: AtomicUsize,
    shutdowns: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl MockProbe {
    pub fn executions(&self) -> usize {
        self.inner.executions.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> usize {
        self.inner.streams.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.inner.health_checks.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    /// Calls currently running across all clones
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once
    pub fn peak_active(&self) -> usize {
        self.inner.peak_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveCall {
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_active.fetch_max(now, Ordering::SeqCst);
        ActiveCall {
            probe: self.clone(),
        }
    }
}

struct ActiveCall {
    probe: MockProbe,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.probe.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
