// ABOUTME: Routes queries to backends: selection, checkout, execution, fallback and comparison.
// ABOUTME: Every path checks its instance back in, including errors, timeouts and cancellation.

use crate::descriptor::{AgentDescriptor, BackendProfile};
use crate::error::{RuntimeError, RuntimeResult};
use crate::metrics;
use crate::pool::{InstanceHealth, PoolManager, PoolStats, PooledAgent};
use crate::registry::{AgentRegistry, RegistryStats};
use crate::selection::{Selection, Selector};
use agentry_agent::{
    chunk_channel, AgentCapabilities, AgentContext, AgentOutput, AgentResponse, ChunkSink,
    ChunkStream, Citation, ErrorCode, HealthState, DEFAULT_STREAM_CAPACITY,
};
use anyhow::anyhow;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Runtime-wide execution settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one backend call unless the context sets its own
    pub execution_timeout: Duration,
    /// Fallback attempts after the first failure
    pub max_retries: usize,
    /// Delay before the first fallback; doubles on each further one
    pub retry_delay: Duration,
    pub fallback_enabled: bool,
    pub stream_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(120),
            max_retries: 1,
            retry_delay: Duration::from_millis(200),
            fallback_enabled: true,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

/// Where to go when the chosen backend fails
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Explicit fallback backends, tried in order
    pub chain: Vec<String>,
    /// Overrides the runtime's retry budget for this request
    pub max_retries: Option<usize>,
}

impl FallbackPolicy {
    pub fn chain<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chain: ids.into_iter().map(Into::into).collect(),
            max_retries: None,
        }
    }

    /// Never retry
    pub fn disabled() -> Self {
        Self {
            chain: Vec::new(),
            max_retries: Some(0),
        }
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// One query to run
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub selection: Selection,
    pub query: String,
    pub context: AgentContext,
    pub fallback: FallbackPolicy,
    pub cancel: CancellationToken,
}

impl ExecuteRequest {
    pub fn new(selection: Selection, query: impl Into<String>, context: AgentContext) -> Self {
        Self {
            selection,
            query: query.into(),
            context,
            fallback: FallbackPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One query fanned out to several named backends
#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub backends: Vec<String>,
    pub query: String,
    pub context: AgentContext,
    /// Per-backend bound; defaults to the execution timeout
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CompareRequest {
    pub fn new<I, S>(backends: I, query: impl Into<String>, context: AgentContext) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            query: query.into(),
            context,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result from one backend in a comparison
#[derive(Debug)]
pub struct ComparisonEntry {
    pub backend_id: String,
    pub outcome: RuntimeResult<AgentResponse>,
}

impl ComparisonEntry {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl Serialize for ComparisonEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ComparisonEntry", 3)?;
        state.serialize_field("backend_id", &self.backend_id)?;
        match &self.outcome {
            Ok(response) => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("response", response)?;
            }
            Err(e) => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", &e.to_string())?;
            }
        }
        state.end()
    }
}

/// Per-backend results of a comparison, in request order
#[derive(Debug, Serialize)]
pub struct Comparison {
    pub entries: Vec<ComparisonEntry>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// How to fold several successful responses into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// The quickest successful response
    #[default]
    Fastest,
    /// All answers joined, all citations kept
    Consensus,
    /// Answers labelled by backend
    Concatenate,
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fastest" | "best" => Ok(MergeStrategy::Fastest),
            "consensus" => Ok(MergeStrategy::Consensus),
            "concatenate" | "concat" => Ok(MergeStrategy::Concatenate),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

impl Comparison {
    pub fn successes(&self) -> impl Iterator<Item = &AgentResponse> {
        self.entries.iter().filter_map(|e| e.outcome.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RuntimeError)> {
        self.entries
            .iter()
            .filter_map(|e| e.outcome.as_ref().err().map(|err| (e.backend_id.as_str(), err)))
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    /// Combine the successful responses. None when every backend failed.
    pub fn merge(&self, strategy: MergeStrategy) -> Option<AgentResponse> {
        let responses: Vec<&AgentResponse> = self.successes().collect();
        match responses.as_slice() {
            [] => None,
            [only] => Some((*only).clone()),
            _ => Some(match strategy {
                MergeStrategy::Fastest => responses
                    .iter()
                    .min_by_key(|r| r.duration)
                    .map(|r| (*r).clone())?,
                MergeStrategy::Consensus => {
                    let answer = responses
                        .iter()
                        .map(|r| r.answer.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    let citations: Vec<Citation> =
                        responses.iter().flat_map(|r| r.citations.clone()).collect();
                    let duration = responses.iter().map(|r| r.duration).sum();
                    merged(answer, citations, duration, &responses, "consensus")
                }
                MergeStrategy::Concatenate => {
                    let answer = responses
                        .iter()
                        .map(|r| format!("**{}**: {}", r.backend_id, r.answer))
                        .collect::<Vec<_>>()
                        .join("\n\n---\n\n");
                    let duration = responses.iter().map(|r| r.duration).max().unwrap_or_default();
                    merged(answer, Vec::new(), duration, &responses, "concatenate")
                }
            }),
        }
    }
}

fn merged(
    answer: String,
    citations: Vec<Citation>,
    duration: Duration,
    sources: &[&AgentResponse],
    strategy: &str,
) -> AgentResponse {
    let ids: Vec<_> = sources.iter().map(|r| r.backend_id.clone()).collect();
    let mut output = AgentOutput::text(answer)
        .with_metadata("merged_from", json!(ids))
        .with_metadata("strategy", json!(strategy));
    output.citations = citations;
    AgentResponse::from_output("merged", output, duration)
}

/// Catalog entry plus live pool figures
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub id: String,
    pub kind: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    pub profile: BackendProfile,
    pub enabled: bool,
    pub priority: i32,
    pub pool: Option<PoolStats>,
}

/// Health of one backend across its live instances
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub state: HealthState,
    pub instances: Vec<InstanceHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

enum Attempt<T> {
    Done(T),
    Failed(anyhow::Error, ErrorCode),
    Cancelled,
}

/// Entry point for callers: picks backends, leases instances and runs queries
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    pools: Arc<PoolManager>,
    selector: Selector,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        pools: Arc<PoolManager>,
        selector: Selector,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            pools,
            selector,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a query to completion, falling back to other backends on
    /// execution failure
    pub async fn execute(&self, request: ExecuteRequest) -> RuntimeResult<AgentResponse> {
        validate_query(&request.query)?;
        let candidates = self.plan(&request)?;
        let budget = self.attempt_budget(&request.fallback, candidates.len());
        let deadline = self.deadline_for(&request.context);

        let mut delay = self.config.retry_delay;
        let mut last_error = None;
        for (attempt, descriptor) in candidates.iter().take(budget).enumerate() {
            if attempt > 0 {
                if let Some(previous) = candidates.get(attempt - 1) {
                    metrics::fallback(&previous.id, &descriptor.id);
                    tracing::warn!(
                        from = %previous.id,
                        to = %descriptor.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Falling back to next backend"
                    );
                }
                tokio::select! {
                    biased;
                    _ = request.cancel.cancelled() => return Err(RuntimeError::Cancelled { backend: None }),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2);
            }

            match self
                .run_once(descriptor, &request.query, &request.context, &request.cancel, deadline, "execute")
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| RuntimeError::NoEligibleBackend {
            requirement: "an available backend".to_string(),
        }))
    }

    /// Start a streamed execution. Selection and the first checkout happen
    /// before this returns; chunks are then forwarded by a background task.
    pub async fn stream(&self, request: ExecuteRequest) -> RuntimeResult<ChunkStream> {
        validate_query(&request.query)?;
        let candidates = self.plan(&request)?;
        let budget = self.attempt_budget(&request.fallback, candidates.len());
        let deadline = self.deadline_for(&request.context);

        let first = candidates
            .first()
            .cloned()
            .ok_or_else(|| RuntimeError::NoEligibleBackend {
                requirement: "an available backend".to_string(),
            })?;
        let lease = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(RuntimeError::cancelled(&first.id)),
            lease = self.pools.checkout(&first.id) => lease?,
        };

        let cancel = request.cancel.child_token();
        let (sink, stream) = chunk_channel(&first.id, self.config.stream_capacity, cancel.clone());
        let driver = StreamDriver {
            pools: self.pools.clone(),
            candidates,
            budget,
            deadline,
            retry_delay: self.config.retry_delay,
            query: request.query,
            context: request.context,
            cancel,
        };
        tokio::spawn(driver.run(lease, sink));
        Ok(stream)
    }

    /// Run one query on several backends at once. Failures are reported per
    /// backend; only cancelling the whole request fails the call.
    pub async fn compare(&self, request: CompareRequest) -> RuntimeResult<Comparison> {
        validate_query(&request.query)?;
        if request.backends.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "comparison needs at least one backend".to_string(),
            ));
        }
        let limit = request
            .timeout
            .unwrap_or_else(|| self.deadline_for(&request.context));
        let started = Instant::now();

        let branches = request.backends.iter().map(|id| {
            let token = request.cancel.child_token();
            let query = request.query.as_str();
            let context = &request.context;
            async move {
                let outcome = match self.selector.resolve(&Selection::manual(id.as_str()), context) {
                    Err(e) => Err(e),
                    Ok(candidates) => match candidates.first() {
                        None => Err(RuntimeError::NotFound(id.clone())),
                        Some(descriptor) => {
                            match tokio::time::timeout(
                                limit,
                                self.run_once(descriptor, query, context, &token, limit, "compare"),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(RuntimeError::execution(
                                    id.as_str(),
                                    anyhow!("comparison timed out after {:?}", limit),
                                )),
                            }
                        }
                    },
                };
                if let Err(e) = &outcome {
                    tracing::info!(backend = %id, error = %e, "Comparison branch failed");
                }
                ComparisonEntry {
                    backend_id: id.clone(),
                    outcome,
                }
            }
        });

        let entries = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(RuntimeError::Cancelled { backend: None }),
            entries = futures::future::join_all(branches) => entries,
        };
        if request.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled { backend: None });
        }

        let comparison = Comparison {
            entries,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            backends = request.backends.len(),
            succeeded = comparison.success_count(),
            elapsed_ms = comparison.elapsed.as_millis() as u64,
            "Comparison finished"
        );
        Ok(comparison)
    }

    /// Remove backend `id` from the registry and retire its pool so a later
    /// registration under the same id starts from fresh instances
    pub async fn unregister(&self, id: &str) -> RuntimeResult<Arc<AgentDescriptor>> {
        let descriptor = self.registry.unregister(id)?;
        self.pools.remove(id).await;
        Ok(descriptor)
    }

    /// Every registered backend with its pool figures, sorted by id
    pub fn list_backends(&self) -> Vec<BackendSummary> {
        self.registry
            .list_all()
            .into_iter()
            .map(|d| BackendSummary {
                id: d.id.clone(),
                kind: d.kind.clone(),
                version: d.version.clone(),
                capabilities: d.capabilities.clone(),
                profile: d.profile,
                enabled: d.enabled,
                priority: d.priority,
                pool: self.pools.stats(&d.id),
            })
            .collect()
    }

    /// Declared capabilities of backend `id`
    pub fn capabilities(&self, id: &str) -> RuntimeResult<AgentCapabilities> {
        Ok(self.registry.get(id)?.capabilities.clone())
    }

    /// Latest health of backend `id`. With no live instances, one is leased
    /// and probed.
    pub async fn health(&self, id: &str) -> RuntimeResult<BackendHealth> {
        self.registry.get(id)?;
        let mut instances = self.pools.health_board(id);
        let mut message = None;

        if instances.is_empty() {
            match self.pools.checkout(id).await {
                Ok(mut lease) => {
                    lease.probe().await;
                    lease.checkin().await;
                    instances = self.pools.health_board(id);
                }
                Err(e @ RuntimeError::ConstructionFailed { .. })
                | Err(e @ RuntimeError::InvalidConfiguration { .. }) => {
                    message = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(BackendHealth {
            backend_id: id.to_string(),
            state: overall_state(&instances),
            instances,
            message,
        })
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.statistics()
    }

    /// Ordered backends to try for `request`
    fn plan(&self, request: &ExecuteRequest) -> RuntimeResult<Vec<Arc<AgentDescriptor>>> {
        let ranked = self.selector.resolve(&request.selection, &request.context)?;
        let chain = &request.fallback.chain;

        let mut planned: Vec<Arc<AgentDescriptor>> = Vec::with_capacity(ranked.len() + chain.len());
        let mut seen = BTreeSet::new();
        let mut push = |d: Arc<AgentDescriptor>, planned: &mut Vec<Arc<AgentDescriptor>>| {
            if seen.insert(d.id.clone()) {
                planned.push(d);
            }
        };

        match &request.selection {
            Selection::Manual(_) => {
                for d in ranked {
                    push(d, &mut planned);
                }
                for id in chain {
                    let d = self.registry.get(id)?;
                    if d.enabled {
                        push(d, &mut planned);
                    } else {
                        tracing::debug!(backend = %id, "Skipping disabled fallback backend");
                    }
                }
            }
            Selection::Match(_) if chain.is_empty() => {
                for d in ranked {
                    push(d, &mut planned);
                }
            }
            Selection::Match(_) => {
                if let Some(primary) = ranked.first() {
                    push(primary.clone(), &mut planned);
                }
                for id in chain {
                    self.registry.get(id)?;
                    match ranked.iter().find(|d| &d.id == id) {
                        Some(d) => push(d.clone(), &mut planned),
                        None => tracing::debug!(backend = %id, "Fallback backend not eligible for this request"),
                    }
                }
            }
        }
        Ok(planned)
    }

    fn attempt_budget(&self, policy: &FallbackPolicy, candidates: usize) -> usize {
        let retries = if self.config.fallback_enabled {
            policy.max_retries.unwrap_or(self.config.max_retries)
        } else {
            0
        };
        (retries + 1).min(candidates.max(1))
    }

    fn deadline_for(&self, context: &AgentContext) -> Duration {
        context.max_execution().unwrap_or(self.config.execution_timeout)
    }

    /// One attempt on one backend: checkout, execute, checkin
    async fn run_once(
        &self,
        descriptor: &AgentDescriptor,
        query: &str,
        context: &AgentContext,
        cancel: &CancellationToken,
        deadline: Duration,
        mode: &'static str,
    ) -> RuntimeResult<AgentResponse> {
        let id = descriptor.id.as_str();
        let mut lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::cancelled(id)),
            lease = self.pools.checkout(id) => lease?,
        };

        let started = Instant::now();
        let attempt = {
            let backend = lease.backend_mut();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                result = tokio::time::timeout(deadline, backend.execute(query, context)) => match result {
                    Ok(Ok(output)) => Attempt::Done(output),
                    Ok(Err(e)) => Attempt::Failed(e, ErrorCode::BackendError),
                    Err(_) => Attempt::Failed(anyhow!("execution timed out after {:?}", deadline), ErrorCode::Timeout),
                },
            }
        };
        let elapsed = started.elapsed();

        match attempt {
            Attempt::Done(output) => {
                metrics::execution(id, mode, "ok", elapsed);
                tracing::info!(
                    backend = %id,
                    instance = %lease.instance_id(),
                    session_id = %context.session_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Execution succeeded"
                );
                lease.checkin().await;
                Ok(AgentResponse::from_output(id, output, elapsed))
            }
            Attempt::Cancelled => {
                metrics::execution(id, mode, "cancelled", elapsed);
                tracing::info!(backend = %id, "Execution cancelled");
                lease.checkin().await;
                Err(RuntimeError::cancelled(id))
            }
            Attempt::Failed(error, _) => {
                metrics::execution(id, mode, "failed", elapsed);
                tracing::warn!(backend = %id, error = %format!("{:#}", error), "Execution failed");
                lease.probe().await;
                lease.checkin().await;
                Err(RuntimeError::execution(id, error))
            }
        }
    }
}

fn validate_query(query: &str) -> RuntimeResult<()> {
    if query.trim().is_empty() {
        return Err(RuntimeError::InvalidRequest("query must not be empty".to_string()));
    }
    Ok(())
}

fn overall_state(instances: &[InstanceHealth]) -> HealthState {
    if instances.is_empty() {
        return HealthState::Unhealthy;
    }
    let healthy = instances.iter().filter(|i| i.status.is_healthy()).count();
    let unhealthy = instances.iter().filter(|i| i.status.is_unhealthy()).count();
    if healthy == instances.len() {
        HealthState::Healthy
    } else if unhealthy == instances.len() {
        HealthState::Unhealthy
    } else {
        HealthState::Degraded
    }
}

/// Background task forwarding one streamed execution
struct StreamDriver {
    pools: Arc<PoolManager>,
    candidates: Vec<Arc<AgentDescriptor>>,
    budget: usize,
    deadline: Duration,
    retry_delay: Duration,
    query: String,
    context: AgentContext,
    cancel: CancellationToken,
}

impl StreamDriver {
    async fn run(self, first: PooledAgent, mut sink: ChunkSink) {
        let mut pending = Some(first);
        let mut delay = self.retry_delay;
        let attempts = self.budget.min(self.candidates.len());

        for (attempt, descriptor) in self.candidates.iter().take(attempts).enumerate() {
            let id = descriptor.id.as_str();
            let mut lease = match pending.take() {
                Some(lease) => lease,
                None => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                    let checked_out = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return,
                        lease = self.pools.checkout(id) => lease,
                    };
                    match checked_out {
                        Ok(lease) => lease,
                        Err(e) => {
                            tracing::warn!(backend = %id, error = %e, "Fallback checkout failed");
                            let _ = sink.fail(error_code(&e), e.to_string()).await;
                            return;
                        }
                    }
                }
            };
            sink.retarget(id);

            let started = Instant::now();
            let outcome = {
                let backend = lease.backend_mut();
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Attempt::Cancelled,
                    result = tokio::time::timeout(self.deadline, backend.stream(&self.query, &self.context, &mut sink)) => match result {
                        Ok(Ok(())) => Attempt::Done(()),
                        Ok(Err(e)) => Attempt::Failed(e, ErrorCode::BackendError),
                        Err(_) => Attempt::Failed(anyhow!("stream timed out after {:?}", self.deadline), ErrorCode::Timeout),
                    },
                }
            };
            let elapsed = started.elapsed();
            metrics::stream_chunks(id, sink.sent_this_attempt());

            match outcome {
                Attempt::Done(()) => {
                    if !sink.is_finished() && !sink.is_closed() {
                        let _ = sink.complete_with_transcript().await;
                    }
                    metrics::execution(id, "stream", "ok", elapsed);
                    tracing::info!(
                        backend = %id,
                        chunks = sink.sent_this_attempt(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Stream finished"
                    );
                    lease.checkin().await;
                    return;
                }
                Attempt::Cancelled => {
                    metrics::execution(id, "stream", "cancelled", elapsed);
                    tracing::info!(backend = %id, chunks = sink.sent_this_attempt(), "Stream cancelled");
                    lease.checkin().await;
                    return;
                }
                Attempt::Failed(error, code) => {
                    if sink.is_closed() {
                        // Consumer went away; the backend error is just the closed channel
                        metrics::execution(id, "stream", "cancelled", elapsed);
                        lease.checkin().await;
                        return;
                    }
                    metrics::execution(id, "stream", "failed", elapsed);
                    tracing::warn!(
                        backend = %id,
                        delivered = sink.sent_this_attempt(),
                        error = %format!("{:#}", error),
                        "Stream attempt failed"
                    );
                    lease.probe().await;
                    lease.checkin().await;

                    let can_retry = sink.sent_this_attempt() == 0 && attempt + 1 < attempts;
                    if can_retry {
                        if let Some(next) = self.candidates.get(attempt + 1) {
                            metrics::fallback(id, &next.id);
                            tracing::warn!(from = %id, to = %next.id, "Falling back before first chunk");
                        }
                        continue;
                    }
                    if !sink.is_finished() {
                        let _ = sink.fail(code, format!("backend '{}' failed: {:#}", id, error)).await;
                    }
                    return;
                }
            }
        }
    }
}

fn error_code(error: &RuntimeError) -> ErrorCode {
    match error {
        RuntimeError::Cancelled { .. } => ErrorCode::Cancelled,
        _ => ErrorCode::BackendError,
    }
}
