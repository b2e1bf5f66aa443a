// ABOUTME: Registry entries describing a backend: identity, capabilities, cost profile and constructor.
// ABOUTME: Also holds the declared config schema used by the factory to validate caller configuration.

use crate::error::FieldIssue;
use agentry_agent::{AgentBackend, AgentCapabilities, AgentConfig, Capability};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Builds a backend from an already merged and validated configuration
pub type Constructor =
    Arc<dyn Fn(&AgentConfig) -> anyhow::Result<Box<dyn AgentBackend>> + Send + Sync>;

/// Routing-relevant figures for a backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Relative cost per thousand tokens
    pub cost_per_1k_tokens: f64,
    /// Relative quality score, higher is better
    pub quality: f64,
    /// Typical latency in milliseconds
    pub latency_ms: u64,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            cost_per_1k_tokens: 0.0,
            quality: 0.5,
            latency_ms: 1000,
        }
    }
}

/// JSON type a config field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

/// Name of a JSON value's type, for error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Restriction on a field's value beyond its JSON type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "values")]
pub enum FieldConstraint {
    /// String drawn from a fixed set
    OneOf(Vec<String>),
    /// Number that is zero or greater
    NonNegative,
    /// Array of known capability names
    CapabilityNames,
    /// Array or object whose items are all strings
    StringsOnly,
}

impl FieldConstraint {
    /// Why `value` breaks the constraint, if it does. Only called once the
    /// field's type already matched.
    pub fn violation(&self, value: &Value) -> Option<String> {
        match self {
            FieldConstraint::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => None,
                _ => Some(format!("must be one of: {}", allowed.join(", "))),
            },
            FieldConstraint::NonNegative => {
                let negative = match value.as_i64() {
                    Some(n) => n < 0,
                    None => value.as_f64().map(|n| n < 0.0).unwrap_or(false),
                };
                negative.then(|| "must not be negative".to_string())
            }
            FieldConstraint::CapabilityNames => {
                let unknown: Vec<String> = value
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter(|item| {
                        item.as_str()
                            .map(|name| name.parse::<Capability>().is_err())
                            .unwrap_or(true)
                    })
                    .map(|item| match item.as_str() {
                        Some(name) => name.to_string(),
                        None => item.to_string(),
                    })
                    .collect();
                (!unknown.is_empty())
                    .then(|| format!("unknown capabilities: {}", unknown.join(", ")))
            }
            FieldConstraint::StringsOnly => {
                let all_strings = match value {
                    Value::Array(items) => items.iter().all(Value::is_string),
                    Value::Object(map) => map.values().all(Value::is_string),
                    _ => true,
                };
                (!all_strings).then(|| "must contain only strings".to_string())
            }
        }
    }
}

/// One declared configuration field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<FieldConstraint>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            constraint: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            constraint: None,
        }
    }

    pub fn with_constraint(mut self, constraint: FieldConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// String field limited to `allowed`
    pub fn one_of<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraint = Some(FieldConstraint::OneOf(
            allowed.into_iter().map(Into::into).collect(),
        ));
        self
    }
}

/// Check `config` against `schema`, collecting every problem rather than
/// stopping at the first
pub fn validate_config(schema: &[FieldSpec], config: &AgentConfig) -> Vec<FieldIssue> {
    let mut issues = Vec::new();
    for field in schema {
        match config.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                issues.push(FieldIssue::missing(&field.name));
            }
            None | Some(Value::Null) => {}
            Some(value) if !field.kind.matches(value) => {
                issues.push(FieldIssue::wrong_type(
                    &field.name,
                    field.kind.as_str(),
                    json_type_name(value),
                ));
            }
            Some(Value::String(s)) if field.required && s.trim().is_empty() => {
                issues.push(FieldIssue::invalid(&field.name, "must not be empty"));
            }
            Some(value) => {
                if let Some(reason) = field.constraint.as_ref().and_then(|c| c.violation(value)) {
                    issues.push(FieldIssue::invalid(&field.name, reason));
                }
            }
        }
    }
    issues
}

/// Everything the runtime knows about a registered backend
#[derive(Clone)]
pub struct AgentDescriptor {
    pub id: String,
    /// Variant name, e.g. "mock" or "command"
    pub kind: String,
    pub version: String,
    /// Capabilities every instance must offer
    pub capabilities: AgentCapabilities,
    pub profile: BackendProfile,
    /// Configuration applied underneath whatever the caller passes
    pub defaults: AgentConfig,
    pub config_fields: Vec<FieldSpec>,
    pub enabled: bool,
    /// Tie-breaker during selection, lower wins
    pub priority: i32,
    pub constructor: Constructor,
}

impl AgentDescriptor {
    pub fn builder(id: impl Into<String>, kind: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            id: id.into(),
            kind: kind.into(),
            version: "0.1.0".to_string(),
            capabilities: AgentCapabilities::default(),
            profile: BackendProfile::default(),
            defaults: AgentConfig::new(),
            config_fields: Vec::new(),
            enabled: true,
            priority: 0,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.supports(capability)
    }
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .field("profile", &self.profile)
            .field("defaults", &self.defaults.keys().collect::<Vec<_>>())
            .field("config_fields", &self.config_fields)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

pub struct DescriptorBuilder {
    id: String,
    kind: String,
    version: String,
    capabilities: AgentCapabilities,
    profile: BackendProfile,
    defaults: AgentConfig,
    config_fields: Vec<FieldSpec>,
    enabled: bool,
    priority: i32,
}

impl DescriptorBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn profile(mut self, profile: BackendProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.profile.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    pub fn quality(mut self, quality: f64) -> Self {
        self.profile.quality = quality;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.profile.latency_ms = latency_ms;
        self
    }

    pub fn defaults(mut self, defaults: AgentConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn default_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.config_fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        self.config_fields.extend(fields);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn build<F>(self, constructor: F) -> AgentDescriptor
    where
        F: Fn(&AgentConfig) -> anyhow::Result<Box<dyn AgentBackend>> + Send + Sync + 'static,
    {
        self.build_with(Arc::new(constructor))
    }

    pub fn build_with(self, constructor: Constructor) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id,
            kind: self.kind,
            version: self.version,
            capabilities: self.capabilities,
            profile: self.profile,
            defaults: self.defaults,
            config_fields: self.config_fields,
            enabled: self.enabled,
            priority: self.priority,
            constructor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldProblem;
    use serde_json::json;

    fn config(value: Value) -> AgentConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_validate_collects_all_issues() {
        let schema = vec![
            FieldSpec::required("binary", FieldKind::String),
            FieldSpec::required("model", FieldKind::String),
            FieldSpec::optional("timeout_secs", FieldKind::Integer),
        ];
        let issues = validate_config(&schema, &config(json!({"timeout_secs": "soon"})));

        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].problem, FieldProblem::Missing);
        assert_eq!(issues[1].field, "model");
        assert_eq!(
            issues[2].problem,
            FieldProblem::WrongType {
                expected: "integer".into(),
                found: "string".into()
            }
        );
    }

    #[test]
    fn test_validate_accepts_optional_absence_and_null() {
        let schema = vec![FieldSpec::optional("env", FieldKind::Object)];
        assert!(validate_config(&schema, &AgentConfig::new()).is_empty());
        assert!(validate_config(&schema, &config(json!({"env": null}))).is_empty());
    }

    #[test]
    fn test_validate_rejects_blank_required_string() {
        let schema = vec![FieldSpec::required("binary", FieldKind::String)];
        let issues = validate_config(&schema, &config(json!({"binary": "  "})));
        assert!(matches!(issues[0].problem, FieldProblem::Invalid(_)));
    }

    #[test]
    fn test_validate_reports_each_value_violation() {
        let schema = vec![
            FieldSpec::optional("pass_query_via", FieldKind::String).one_of(["arg", "stdin"]),
            FieldSpec::optional("timeout_secs", FieldKind::Integer)
                .with_constraint(FieldConstraint::NonNegative),
            FieldSpec::optional("capabilities", FieldKind::Array)
                .with_constraint(FieldConstraint::CapabilityNames),
            FieldSpec::optional("args", FieldKind::Array).with_constraint(FieldConstraint::StringsOnly),
        ];
        let issues = validate_config(
            &schema,
            &config(json!({
                "pass_query_via": "telnet",
                "timeout_secs": -1,
                "capabilities": ["streaming", "telepathy", 7],
                "args": ["--verbose", 3],
            })),
        );

        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["pass_query_via", "timeout_secs", "capabilities", "args"]);
        assert!(issues.iter().all(|i| matches!(i.problem, FieldProblem::Invalid(_))));
        assert_eq!(
            issues[0].problem,
            FieldProblem::Invalid("must be one of: arg, stdin".into())
        );
        assert_eq!(
            issues[2].problem,
            FieldProblem::Invalid("unknown capabilities: telepathy, 7".into())
        );
    }

    #[test]
    fn test_constraints_accept_valid_values() {
        let schema = vec![
            FieldSpec::optional("pass_query_via", FieldKind::String).one_of(["arg", "stdin"]),
            FieldSpec::optional("latency_ms", FieldKind::Integer)
                .with_constraint(FieldConstraint::NonNegative),
            FieldSpec::optional("env", FieldKind::Object).with_constraint(FieldConstraint::StringsOnly),
        ];
        let valid = config(json!({
            "pass_query_via": "stdin",
            "latency_ms": 0,
            "env": {"HOME": "/tmp"},
        }));
        assert!(validate_config(&schema, &valid).is_empty());
    }

    #[test]
    fn test_integer_field_rejects_float() {
        assert!(!FieldKind::Integer.matches(&json!(1.5)));
        assert!(FieldKind::Number.matches(&json!(1.5)));
        assert_eq!(json_type_name(&json!(1.5)), "number");
        assert_eq!(json_type_name(&json!(3)), "integer");
    }
}
