// ABOUTME: Builds ready-to-use backend instances from registry descriptors.
// ABOUTME: Merges and validates configuration, verifies capabilities and health before handing out.

use crate::descriptor::{validate_config, AgentDescriptor};
use crate::error::{RuntimeError, RuntimeResult};
use crate::metrics;
use crate::registry::AgentRegistry;
use agentry_agent::{AgentBackend, AgentCapabilities, AgentConfig, HealthStatus};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Health samples kept per instance
pub const HEALTH_HISTORY: usize = 8;

/// Consecutive unhealthy probes after which an instance is evicted
pub const EVICTION_THRESHOLD: u32 = 2;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Recent health of one instance
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    samples: VecDeque<HealthStatus>,
    consecutive_failures: u32,
}

impl HealthRecord {
    pub fn record(&mut self, status: HealthStatus) {
        if status.is_unhealthy() {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }
        if self.samples.len() == HEALTH_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(status);
    }

    pub fn latest(&self) -> Option<&HealthStatus> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HealthStatus> {
        self.samples.iter()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Latest probe was unhealthy
    pub fn is_failing(&self) -> bool {
        self.latest().map(|s| s.is_unhealthy()).unwrap_or(false)
    }

    pub fn is_quarantined(&self) -> bool {
        self.consecutive_failures >= EVICTION_THRESHOLD
    }
}

/// A constructed backend plus the runtime's bookkeeping about it
pub struct AgentInstance {
    instance_id: Uuid,
    descriptor: Arc<AgentDescriptor>,
    backend: Box<dyn AgentBackend>,
    capabilities: AgentCapabilities,
    health: HealthRecord,
    created_at: DateTime<Utc>,
    executions: u64,
    destroyed: bool,
}

impl AgentInstance {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn backend_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<AgentDescriptor> {
        &self.descriptor
    }

    pub fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    pub fn health(&self) -> &HealthRecord {
        &self.health
    }

    pub fn record_health(&mut self, status: HealthStatus) {
        self.health.record(status);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Fit to hand to a caller: alive and not failing its latest probe
    pub fn is_eligible(&self) -> bool {
        !self.destroyed && !self.health.is_failing() && !self.health.is_quarantined()
    }

    /// Backend for direct use; counts as one execution
    pub fn backend_mut(&mut self) -> &mut dyn AgentBackend {
        self.executions += 1;
        self.backend.as_mut()
    }

    pub fn backend(&self) -> &dyn AgentBackend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("instance_id", &self.instance_id)
            .field("backend_id", &self.descriptor.id)
            .field("kind", &self.backend.kind())
            .field("executions", &self.executions)
            .field("consecutive_failures", &self.health.consecutive_failures)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Creates and tears down backend instances
pub struct AgentFactory {
    registry: Arc<AgentRegistry>,
    probe_timeout: Duration,
}

impl AgentFactory {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Produce a healthy instance of backend `id`, or fail without leaving
    /// anything half-built behind
    pub async fn create(&self, id: &str, config: &AgentConfig) -> RuntimeResult<AgentInstance> {
        let descriptor = self.registry.get(id)?;
        self.create_from(descriptor, config).await
    }

    /// Like [`AgentFactory::create`], for a descriptor the caller has
    /// already resolved. Pools use this so every instance they hold comes
    /// from the registration the pool was built for.
    pub async fn create_from(
        &self,
        descriptor: Arc<AgentDescriptor>,
        config: &AgentConfig,
    ) -> RuntimeResult<AgentInstance> {
        let backend_id = descriptor.id.clone();
        let id = backend_id.as_str();
        let started = Instant::now();

        let mut merged = descriptor.defaults.clone();
        for (key, value) in config {
            merged.insert(key.clone(), value.clone());
        }

        let issues = validate_config(&descriptor.config_fields, &merged);
        if !issues.is_empty() {
            tracing::warn!(backend = %id, issues = issues.len(), "Rejected backend configuration");
            metrics::construction(id, "invalid_configuration");
            return Err(RuntimeError::InvalidConfiguration {
                backend: id.to_string(),
                issues,
            });
        }

        let mut backend = (descriptor.constructor)(&merged).map_err(|e| {
            metrics::construction(id, "constructor_failed");
            RuntimeError::construction(id, format!("{:#}", e))
        })?;

        if let Err(e) = backend.initialize().await {
            metrics::construction(id, "initialize_failed");
            shutdown_quietly(id, backend.as_mut()).await;
            return Err(RuntimeError::construction(
                id,
                format!("initialization failed: {:#}", e),
            ));
        }

        let capabilities = backend.capabilities();
        let missing = capabilities.missing(&descriptor.capabilities.capability_set());
        if !missing.is_empty() {
            metrics::construction(id, "capability_mismatch");
            shutdown_quietly(id, backend.as_mut()).await;
            let names: Vec<_> = missing.iter().map(|c| c.as_str()).collect();
            return Err(RuntimeError::construction(
                id,
                format!("instance lacks declared capabilities: {}", names.join(", ")),
            ));
        }

        let mut instance = AgentInstance {
            instance_id: Uuid::new_v4(),
            descriptor,
            backend,
            capabilities,
            health: HealthRecord::default(),
            created_at: Utc::now(),
            executions: 0,
            destroyed: false,
        };

        let status = self.probe(&mut instance).await;
        if status.is_unhealthy() {
            metrics::construction(id, "unhealthy");
            self.destroy(&mut instance).await;
            return Err(RuntimeError::construction(
                id,
                format!("initial health check failed: {}", status.describe()),
            ));
        }

        metrics::construction(id, "ok");
        tracing::info!(
            backend = %id,
            instance = %instance.instance_id,
            health = %status.state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Constructed backend instance"
        );
        Ok(instance)
    }

    /// Release the instance's resources. Safe to call more than once.
    pub async fn destroy(&self, instance: &mut AgentInstance) {
        if instance.destroyed {
            return;
        }
        instance.destroyed = true;
        shutdown_quietly(&instance.descriptor.id, instance.backend.as_mut()).await;
        metrics::destroyed(instance.backend_id());
        tracing::debug!(
            backend = %instance.backend_id(),
            instance = %instance.instance_id,
            executions = instance.executions,
            "Destroyed backend instance"
        );
    }

    /// Run one bounded health check and record the result
    pub async fn probe(&self, instance: &mut AgentInstance) -> HealthStatus {
        let started = Instant::now();
        let status = match tokio::time::timeout(self.probe_timeout, instance.backend.health_check()).await {
            Ok(status) => {
                let latency = if status.latency.is_zero() {
                    started.elapsed()
                } else {
                    status.latency
                };
                status.with_latency(latency)
            }
            Err(_) => HealthStatus::unhealthy(format!(
                "health check timed out after {:?}",
                self.probe_timeout
            ))
            .with_latency(started.elapsed()),
        };

        if status.is_unhealthy() {
            tracing::warn!(
                backend = %instance.backend_id(),
                instance = %instance.instance_id,
                message = %status.describe(),
                "Health probe failed"
            );
        }
        metrics::health_probe(instance.backend_id(), status.state);
        instance.health.record(status.clone());
        status
    }
}

async fn shutdown_quietly(id: &str, backend: &mut dyn AgentBackend) {
    if let Err(e) = backend.shutdown().await {
        tracing::warn!(backend = %id, error = %e, "Backend shutdown failed");
    }
}
