// ABOUTME: Health probe outcome reported by backends and recorded by the runtime.
// ABOUTME: Degraded instances stay usable; unhealthy ones are excluded from checkout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Outcome of a health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Measured probe latency
    #[serde(rename = "latency_ms", with = "latency_ms")]
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(state: HealthState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            latency: Duration::ZERO,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthState::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthState::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthState::Unhealthy, Some(message.into()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state == HealthState::Unhealthy
    }

    /// Message or a placeholder, for error reporting
    pub fn describe(&self) -> String {
        match &self.message {
            Some(msg) => format!("{}: {}", self.state, msg),
            None => self.state.to_string(),
        }
    }
}

mod latency_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_state() {
        assert!(HealthStatus::healthy().is_healthy());
        assert!(!HealthStatus::degraded("slow").is_healthy());
        assert!(!HealthStatus::degraded("slow").is_unhealthy());
        assert!(HealthStatus::unhealthy("down").is_unhealthy());
    }

    #[test]
    fn test_describe_includes_message() {
        assert_eq!(HealthStatus::unhealthy("socket closed").describe(), "unhealthy: socket closed");
        assert_eq!(HealthStatus::healthy().describe(), "healthy");
    }
}
