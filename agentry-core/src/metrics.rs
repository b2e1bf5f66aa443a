// ABOUTME: Metric names and recording helpers for the runtime.
// ABOUTME: Thin wrappers over the `metrics` facade; a recorder is installed by the binary, if at all.

use agentry_agent::HealthState;
use std::time::Duration;

pub const CONSTRUCTIONS: &str = "agentry_constructions_total";
pub const DESTROYED: &str = "agentry_instances_destroyed_total";
pub const HEALTH_PROBES: &str = "agentry_health_probes_total";
pub const EVICTIONS: &str = "agentry_evictions_total";
pub const CHECKOUTS: &str = "agentry_checkouts_total";
pub const CHECKOUT_WAIT: &str = "agentry_checkout_wait_seconds";
pub const POOL_IDLE: &str = "agentry_pool_idle";
pub const POOL_IN_USE: &str = "agentry_pool_in_use";
pub const EXECUTIONS: &str = "agentry_executions_total";
pub const EXECUTION_DURATION: &str = "agentry_execution_duration_seconds";
pub const FALLBACKS: &str = "agentry_fallbacks_total";
pub const STREAM_CHUNKS: &str = "agentry_stream_chunks_total";

/// Record the outcome of one factory construction attempt
pub fn construction(backend: &str, outcome: &'static str) {
    metrics::counter!(CONSTRUCTIONS, "backend" => backend.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn destroyed(backend: &str) {
    metrics::counter!(DESTROYED, "backend" => backend.to_string()).increment(1);
}

pub fn health_probe(backend: &str, state: HealthState) {
    let state = match state {
        HealthState::Healthy => "healthy",
        HealthState::Degraded => "degraded",
        HealthState::Unhealthy => "unhealthy",
    };
    metrics::counter!(HEALTH_PROBES, "backend" => backend.to_string(), "state" => state).increment(1);
}

pub fn eviction(backend: &str) {
    metrics::counter!(EVICTIONS, "backend" => backend.to_string()).increment(1);
}

/// Record a checkout attempt and how long the caller waited for it
pub fn checkout(backend: &str, outcome: &'static str, waited: Duration) {
    metrics::counter!(CHECKOUTS, "backend" => backend.to_string(), "outcome" => outcome).increment(1);
    metrics::histogram!(CHECKOUT_WAIT, "backend" => backend.to_string()).record(waited.as_secs_f64());
}

pub fn pool_occupancy(backend: &str, idle: usize, in_use: usize) {
    metrics::gauge!(POOL_IDLE, "backend" => backend.to_string()).set(idle as f64);
    metrics::gauge!(POOL_IN_USE, "backend" => backend.to_string()).set(in_use as f64);
}

pub fn execution(backend: &str, mode: &'static str, outcome: &'static str, duration: Duration) {
    metrics::counter!(
        EXECUTIONS,
        "backend" => backend.to_string(),
        "mode" => mode,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(EXECUTION_DURATION, "backend" => backend.to_string(), "mode" => mode)
        .record(duration.as_secs_f64());
}

pub fn fallback(from: &str, to: &str) {
    metrics::counter!(FALLBACKS, "from" => from.to_string(), "to" => to.to_string()).increment(1);
}

pub fn stream_chunks(backend: &str, count: u64) {
    metrics::counter!(STREAM_CHUNKS, "backend" => backend.to_string()).increment(count);
}
