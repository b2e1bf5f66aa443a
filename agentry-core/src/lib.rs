// ABOUTME: Runtime that registers, pools, health-checks and routes agent backends.
// ABOUTME: Callers go through the Orchestrator; Runtime::from_config wires everything up.

pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod error;
pub mod factory;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod selection;

pub use bootstrap::{HealthOverview, Runtime};
pub use config::{BackendEntry, RuntimeConfig, RuntimeSettings};
pub use credentials::{CredentialProvider, EnvCredentials, NoCredentials};
pub use descriptor::{AgentDescriptor, BackendProfile, FieldConstraint, FieldKind, FieldSpec};
pub use error::{FieldIssue, FieldProblem, RuntimeError, RuntimeResult};
pub use factory::{AgentFactory, AgentInstance, HealthRecord};
pub use health::{HealthMonitor, HealthReport, MonitorHandle, PoolHealth};
pub use orchestrator::{
    BackendHealth, BackendSummary, CompareRequest, Comparison, ComparisonEntry, ExecuteRequest,
    FallbackPolicy, MergeStrategy, Orchestrator, OrchestratorConfig,
};
pub use pool::{InstanceHealth, PoolManager, PoolSettings, PoolStats, PooledAgent, ProbeSummary};
pub use registry::{AgentRegistry, RegistryStats};
pub use selection::{BalancedWeights, CapabilityMatch, RoundRobinScope, Selection, Selector, Strategy};

// Agent contract types, so callers need only this crate
pub use agentry_agent::{
    AgentBackend, AgentCapabilities, AgentConfig, AgentContext, AgentResponse, AgentStreamChunk,
    Capability, ChunkBody, ChunkKind, ChunkStream, ErrorCode, HealthState, HealthStatus,
};
