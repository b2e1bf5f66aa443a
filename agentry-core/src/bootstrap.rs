// ABOUTME: Explicit registration of built-in backend kinds and runtime wiring from config.
// ABOUTME: Builds Registry -> Factory -> PoolManager -> Orchestrator and starts the health monitor.

use crate::config::{BackendEntry, RuntimeConfig};
use crate::credentials::CredentialProvider;
use crate::descriptor::{AgentDescriptor, FieldConstraint, FieldKind, FieldSpec};
use crate::factory::AgentFactory;
use crate::health::{HealthMonitor, HealthReport, MonitorHandle};
use crate::orchestrator::{BackendHealth, Orchestrator};
use crate::pool::{PoolManager, PoolSettings};
use crate::registry::AgentRegistry;
use crate::selection::Selector;
use agentry_agent::backends::command::CommandBackend;
use agentry_agent::backends::mock::MockBackend;
use agentry_agent::{AgentBackend, AgentConfig, HealthState};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A backend variant compiled into the runtime
pub struct BuiltinKind {
    pub name: &'static str,
    pub fields: fn() -> Vec<FieldSpec>,
    pub construct: fn(&AgentConfig) -> Result<Box<dyn AgentBackend>>,
}

static BUILTIN_KINDS: &[BuiltinKind] = &[
    BuiltinKind {
        name: "mock",
        fields: mock_fields,
        construct: construct_mock,
    },
    BuiltinKind {
        name: "command",
        fields: command_fields,
        construct: construct_command,
    },
];

fn mock_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::optional("capabilities", FieldKind::Array)
            .with_constraint(FieldConstraint::CapabilityNames),
        FieldSpec::optional("max_context_length", FieldKind::Integer)
            .with_constraint(FieldConstraint::NonNegative),
        FieldSpec::optional("answer", FieldKind::String),
        FieldSpec::optional("chunks", FieldKind::Array).with_constraint(FieldConstraint::StringsOnly),
        FieldSpec::optional("fail", FieldKind::Boolean),
        FieldSpec::optional("healthy", FieldKind::Boolean),
        FieldSpec::optional("health_message", FieldKind::String),
        FieldSpec::optional("latency_ms", FieldKind::Integer)
            .with_constraint(FieldConstraint::NonNegative),
        FieldSpec::optional("chunk_delay_ms", FieldKind::Integer)
            .with_constraint(FieldConstraint::NonNegative),
    ]
}

fn construct_mock(config: &AgentConfig) -> Result<Box<dyn AgentBackend>> {
    Ok(Box::new(MockBackend::from_config(config)?))
}

fn command_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required("binary", FieldKind::String),
        FieldSpec::optional("args", FieldKind::Array).with_constraint(FieldConstraint::StringsOnly),
        FieldSpec::optional("working_dir", FieldKind::String),
        FieldSpec::optional("env", FieldKind::Object).with_constraint(FieldConstraint::StringsOnly),
        FieldSpec::optional("timeout_secs", FieldKind::Integer)
            .with_constraint(FieldConstraint::NonNegative),
        FieldSpec::optional("pass_query_via", FieldKind::String).one_of(["arg", "stdin"]),
    ]
}

fn construct_command(config: &AgentConfig) -> Result<Box<dyn AgentBackend>> {
    Ok(Box::new(CommandBackend::from_config(config)?))
}

pub fn builtin_kind(name: &str) -> Option<&'static BuiltinKind> {
    BUILTIN_KINDS.iter().find(|k| k.name == name)
}

pub fn builtin_kind_names() -> Vec<&'static str> {
    BUILTIN_KINDS.iter().map(|k| k.name).collect()
}

/// Registry descriptor for one configured backend
pub fn descriptor_for(entry: &BackendEntry) -> Result<AgentDescriptor> {
    let kind = builtin_kind(&entry.kind)
        .with_context(|| format!("backend '{}' has unknown type '{}'", entry.id, entry.kind))?;
    let capabilities = entry.declared_capabilities();

    let mut defaults = entry.config.clone();
    if kind.name == "mock" {
        // A mock reports whatever it is told; make it match the declaration
        defaults
            .entry("capabilities")
            .or_insert_with(|| json!(capabilities.capability_set()));
        defaults
            .entry("max_context_length")
            .or_insert_with(|| json!(capabilities.max_context_length));
    }

    let construct = kind.construct;
    Ok(AgentDescriptor::builder(&entry.id, kind.name)
        .version(&entry.version)
        .capabilities(capabilities)
        .profile(entry.profile())
        .defaults(defaults)
        .fields((kind.fields)())
        .enabled(entry.enabled)
        .priority(entry.priority)
        .build(move |config| construct(config)))
}

/// One monitor pass plus the health of every registered backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthOverview {
    pub pass: HealthReport,
    pub backends: Vec<BackendHealth>,
}

/// A fully wired runtime
pub struct Runtime {
    pub registry: Arc<AgentRegistry>,
    pub factory: Arc<AgentFactory>,
    pub pools: Arc<PoolManager>,
    pub orchestrator: Arc<Orchestrator>,
    health_interval: Duration,
    monitor: Option<MonitorHandle>,
}

impl Runtime {
    /// Register every configured backend, configure and warm pools, and
    /// start the health monitor
    pub async fn from_config(
        config: &RuntimeConfig,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        let settings = &config.runtime;
        let registry = Arc::new(AgentRegistry::new());
        let factory = Arc::new(
            AgentFactory::new(registry.clone()).with_probe_timeout(settings.health_timeout()),
        );
        let pools = Arc::new(
            PoolManager::new(factory.clone())
                .with_default_max_size(settings.max_pool_size)
                .with_checkout_timeout(settings.checkout_timeout()),
        );

        for entry in &config.backends {
            let descriptor = descriptor_for(entry)?;
            registry
                .register(descriptor)
                .with_context(|| format!("Failed to register backend '{}'", entry.id))?;

            let pool = PoolSettings::default()
                .with_max_size(entry.pool_size.unwrap_or(settings.max_pool_size))
                .with_config(credentials.credentials(&entry.id));
            pools.configure(&entry.id, pool).await;
        }

        for entry in config.backends.iter().filter(|e| e.enabled && e.warm > 0) {
            if let Err(e) = pools.warm_up(&entry.id, entry.warm).await {
                tracing::warn!(backend = %entry.id, error = %e, "Failed to warm pool");
            }
        }

        let selector = Selector::new(registry.clone())
            .with_weights(settings.balanced_weights)
            .with_round_robin_scope(settings.round_robin_scope);
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            pools.clone(),
            selector,
            settings.orchestrator_config(),
        ));

        tracing::info!(
            backends = registry.len(),
            max_pool_size = settings.max_pool_size,
            "Runtime ready"
        );

        let mut runtime = Self {
            registry,
            factory,
            pools,
            orchestrator,
            health_interval: settings.health_interval(),
            monitor: None,
        };
        runtime.start_health_monitor();
        Ok(runtime)
    }

    /// A monitor over this runtime's pools, for one-off passes
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.pools.clone()).with_interval(self.health_interval)
    }

    /// Probe idle instances once, then report each registered backend. A
    /// backend whose check errors is listed as unhealthy with the error
    /// message; it does not stop the others from being reported.
    pub async fn health_overview(&self) -> HealthOverview {
        let pass = self.health_monitor().run_once().await;
        let mut backends = Vec::new();
        for backend in self.orchestrator.list_backends() {
            let health = match self.orchestrator.health(&backend.id).await {
                Ok(health) => health,
                Err(e) => {
                    tracing::warn!(backend = %backend.id, error = %e, "Health check failed");
                    BackendHealth {
                        backend_id: backend.id.clone(),
                        state: HealthState::Unhealthy,
                        instances: self.pools.health_board(&backend.id),
                        message: Some(e.to_string()),
                    }
                }
            };
            backends.push(health);
        }
        HealthOverview { pass, backends }
    }

    pub fn start_health_monitor(&mut self) {
        if self.monitor.is_none() {
            self.monitor = Some(self.health_monitor().spawn());
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().map(|m| m.is_running()).unwrap_or(false)
    }

    /// Stop the monitor and tear down every idle instance
    pub async fn shutdown(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.pools.shutdown().await;
        tracing::info!("Runtime shut down");
    }
}
