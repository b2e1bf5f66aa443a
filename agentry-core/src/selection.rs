// ABOUTME: Backend selection: manual by id, or capability match ordered by a tie-break strategy.
// ABOUTME: Ordering is deterministic; ties fall back to priority and then id.

use crate::descriptor::AgentDescriptor;
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::AgentRegistry;
use agentry_agent::{AgentContext, Capability};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How eligible backends are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cheapest first
    CostOptimized,
    /// Lowest expected latency first
    LatencyOptimized,
    /// Highest quality first
    QualityOptimized,
    /// Weighted blend of normalised cost and quality
    #[default]
    Balanced,
    /// Rotate the starting backend on every call
    RoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CostOptimized => "cost_optimized",
            Strategy::LatencyOptimized => "latency_optimized",
            Strategy::QualityOptimized => "quality_optimized",
            Strategy::Balanced => "balanced",
            Strategy::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cost" | "cost_optimized" => Ok(Strategy::CostOptimized),
            "latency" | "latency_optimized" => Ok(Strategy::LatencyOptimized),
            "quality" | "quality_optimized" => Ok(Strategy::QualityOptimized),
            "balanced" => Ok(Strategy::Balanced),
            "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// Weights for [`Strategy::Balanced`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancedWeights {
    pub cost: f64,
    pub quality: f64,
}

impl Default for BalancedWeights {
    fn default() -> Self {
        Self {
            cost: 0.4,
            quality: 0.6,
        }
    }
}

impl BalancedWeights {
    pub fn new(cost: f64, quality: f64) -> Self {
        Self { cost, quality }
    }

    /// Weights must be finite, non-negative and not both zero
    pub fn validate(&self) -> Result<(), String> {
        for (name, w) in [("cost", self.cost), ("quality", self.quality)] {
            if !w.is_finite() || w < 0.0 {
                return Err(format!("{} weight must be a non-negative number, got {}", name, w));
            }
        }
        if self.cost + self.quality <= 0.0 {
            return Err("cost and quality weights must not both be zero".to_string());
        }
        Ok(())
    }
}

/// Whose calls share a round-robin rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundRobinScope {
    #[default]
    Process,
    Tenant,
}

/// Capability requirement plus ordering preference
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityMatch {
    pub required: BTreeSet<Capability>,
    pub min_context_length: Option<u32>,
    pub strategy: Strategy,
    /// Backend ids never to consider
    pub exclude: BTreeSet<String>,
}

impl CapabilityMatch {
    pub fn new<I>(required: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        Self {
            required: required.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_min_context_length(mut self, tokens: u32) -> Self {
        self.min_context_length = Some(tokens);
        self
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude.insert(id.into());
        self
    }

    /// Whether `descriptor` satisfies the hard requirements
    pub fn accepts(&self, descriptor: &AgentDescriptor) -> bool {
        descriptor.enabled
            && !self.exclude.contains(&descriptor.id)
            && descriptor.capabilities.covers(&self.required)
            && self
                .min_context_length
                .map(|min| descriptor.capabilities.max_context_length >= min)
                .unwrap_or(true)
    }

    pub fn describe(&self) -> String {
        let caps: Vec<_> = self.required.iter().map(|c| c.as_str()).collect();
        let mut out = if caps.is_empty() {
            "any capabilities".to_string()
        } else {
            format!("capabilities [{}]", caps.join(", "))
        };
        if let Some(min) = self.min_context_length {
            out.push_str(&format!(" with context >= {}", min));
        }
        out
    }
}

/// Which backend(s) a request may run on
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Manual(String),
    Match(CapabilityMatch),
}

impl Selection {
    pub fn manual(id: impl Into<String>) -> Self {
        Selection::Manual(id.into())
    }

    pub fn matching<I>(required: I, strategy: Strategy) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        Selection::Match(CapabilityMatch::new(required).with_strategy(strategy))
    }
}

/// Resolves a [`Selection`] into an ordered candidate list
pub struct Selector {
    registry: Arc<AgentRegistry>,
    weights: BalancedWeights,
    scope: RoundRobinScope,
    rotations: DashMap<String, usize>,
}

impl Selector {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            weights: BalancedWeights::default(),
            scope: RoundRobinScope::default(),
            rotations: DashMap::new(),
        }
    }

    pub fn with_weights(mut self, weights: BalancedWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_round_robin_scope(mut self, scope: RoundRobinScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn weights(&self) -> BalancedWeights {
        self.weights
    }

    /// Candidates for `selection`, best first
    pub fn resolve(
        &self,
        selection: &Selection,
        context: &AgentContext,
    ) -> RuntimeResult<Vec<Arc<AgentDescriptor>>> {
        match selection {
            Selection::Manual(id) => {
                let descriptor = self.registry.get(id)?;
                if !descriptor.enabled {
                    return Err(RuntimeError::NoEligibleBackend {
                        requirement: format!("backend '{}' (disabled)", id),
                    });
                }
                Ok(vec![descriptor])
            }
            Selection::Match(requirement) => self.rank(requirement, context),
        }
    }

    /// Enabled backends covering the requirement, sorted by id
    pub fn eligible(&self, requirement: &CapabilityMatch) -> Vec<Arc<AgentDescriptor>> {
        self.registry
            .list_by_capability(|descriptor| requirement.accepts(descriptor))
    }

    /// Eligible backends ordered by the requirement's strategy
    pub fn rank(
        &self,
        requirement: &CapabilityMatch,
        context: &AgentContext,
    ) -> RuntimeResult<Vec<Arc<AgentDescriptor>>> {
        let mut candidates = self.eligible(requirement);
        if candidates.is_empty() {
            return Err(RuntimeError::NoEligibleBackend {
                requirement: requirement.describe(),
            });
        }

        match requirement.strategy {
            Strategy::CostOptimized => candidates.sort_by(|a, b| {
                a.profile
                    .cost_per_1k_tokens
                    .total_cmp(&b.profile.cost_per_1k_tokens)
                    .then_with(|| tie_break(a, b))
            }),
            Strategy::LatencyOptimized => candidates.sort_by(|a, b| {
                a.profile
                    .latency_ms
                    .cmp(&b.profile.latency_ms)
                    .then_with(|| tie_break(a, b))
            }),
            Strategy::QualityOptimized => candidates.sort_by(|a, b| {
                b.profile
                    .quality
                    .total_cmp(&a.profile.quality)
                    .then_with(|| tie_break(a, b))
            }),
            Strategy::Balanced => {
                let scores = balanced_scores(&candidates, self.weights);
                let mut scored: Vec<_> = candidates.into_iter().zip(scores).collect();
                scored.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| tie_break(a, b)));
                candidates = scored.into_iter().map(|(d, _)| d).collect();
            }
            Strategy::RoundRobin => {
                candidates.sort_by(|a, b| tie_break(a, b));
                let offset = self.next_rotation(context) % candidates.len();
                candidates.rotate_left(offset);
            }
        }

        tracing::debug!(
            strategy = %requirement.strategy,
            requirement = %requirement.describe(),
            order = ?candidates.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "Ranked candidates"
        );
        Ok(candidates)
    }

    fn next_rotation(&self, context: &AgentContext) -> usize {
        let key = match self.scope {
            RoundRobinScope::Process => String::new(),
            RoundRobinScope::Tenant => context.tenant_id.clone(),
        };
        let mut counter = self.rotations.entry(key).or_insert(0);
        let current = *counter;
        *counter = current.wrapping_add(1);
        current
    }
}

fn tie_break(a: &AgentDescriptor, b: &AgentDescriptor) -> Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
}

/// Balanced score per candidate, in the same order
pub fn balanced_scores(candidates: &[Arc<AgentDescriptor>], weights: BalancedWeights) -> Vec<f64> {
    let (cost_min, cost_max) = bounds(candidates.iter().map(|d| d.profile.cost_per_1k_tokens));
    let (quality_min, quality_max) = bounds(candidates.iter().map(|d| d.profile.quality));

    candidates
        .iter()
        .map(|d| {
            let cost = normalize(d.profile.cost_per_1k_tokens, cost_min, cost_max);
            let quality = normalize(d.profile.quality, quality_min, quality_max);
            weights.cost * (1.0 - cost) + weights.quality * quality
        })
        .collect()
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    if range.abs() < f64::EPSILON {
        0.0
    } else {
        (value - min) / range
    }
}
