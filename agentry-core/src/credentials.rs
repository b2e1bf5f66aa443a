// ABOUTME: Credential providers that contribute secret config fields per backend.
// ABOUTME: Values are merged into backend configuration and never logged.

use agentry_agent::AgentConfig;
use serde_json::Value;

pub const CREDENTIAL_ENV_PREFIX: &str = "AGENTRY_CRED_";

/// Supplies secret configuration for a backend at construction time
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, backend_id: &str) -> AgentConfig;
}

/// No credentials for anyone
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn credentials(&self, _backend_id: &str) -> AgentConfig {
        AgentConfig::new()
    }
}

/// Reads `AGENTRY_CRED_<ID>_<FIELD>` variables.
///
/// `<ID>` is the backend id uppercased with `-` and `.` mapped to `_`; the
/// field name is lowercased, so `AGENTRY_CRED_OPENAI_MAIN_API_KEY` gives
/// backend `openai-main` the field `api_key`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    vars: Option<Vec<(String, String)>>,
}

impl EnvCredentials {
    /// Read from the process environment on each lookup
    pub fn new() -> Self {
        Self { vars: None }
    }

    /// Read from a fixed set of variables instead of the environment
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    fn prefix_for(backend_id: &str) -> String {
        let id: String = backend_id
            .chars()
            .map(|c| match c {
                '-' | '.' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}_", CREDENTIAL_ENV_PREFIX, id)
    }

    fn collect<I>(prefix: &str, vars: I) -> AgentConfig
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = AgentConfig::new();
        for (key, value) in vars {
            if let Some(field) = key.strip_prefix(prefix) {
                if !field.is_empty() {
                    config.insert(field.to_ascii_lowercase(), Value::String(value));
                }
            }
        }
        config
    }
}

impl CredentialProvider for EnvCredentials {
    fn credentials(&self, backend_id: &str) -> AgentConfig {
        let prefix = Self::prefix_for(backend_id);
        let config = match &self.vars {
            Some(vars) => Self::collect(&prefix, vars.iter().cloned()),
            None => Self::collect(&prefix, std::env::vars()),
        };
        if !config.is_empty() {
            tracing::debug!(
                backend = %backend_id,
                fields = ?config.keys().collect::<Vec<_>>(),
                "Loaded credentials from environment"
            );
        }
        config
    }
}
