use agentry_core::selection::RoundRobinScope;
use agentry_core::{
    AgentBackend, AgentContext, EnvCredentials, ExecuteRequest, HealthState, NoCredentials, Runtime,
    RuntimeConfig, Selection,
};
use serial_test::serial;
use std::time::Duration;

const SAMPLE: &str = r#"
[runtime]
max_pool_size = 3
checkout_timeout_ms = 250
max_retries = 2
round_robin_scope = "tenant"

[runtime.balanced_weights]
cost = 0.7
quality = 0.3

[[backend]]
id = "fast-mock"
type = "mock"
capabilities = ["streaming", "tools"]
cost_per_1k_tokens = 0.2
quality = 0.6
latency_ms = 150
warm = 1

[backend.config]
answer = "canned answer"

[[backend]]
id = "echo"
type = "command"
enabled = false
pool_size = 1

[backend.config]
binary = "echo"
"#;

const ENV_KNOBS: [&str; 5] = [
    "AGENTRY_CONFIG",
    "AGENTRY_MAX_POOL_SIZE",
    "AGENTRY_CHECKOUT_TIMEOUT_MS",
    "AGENTRY_HEALTH_INTERVAL_SECS",
    "AGENTRY_MAX_RETRIES",
];

fn clear_env() {
    for key in ENV_KNOBS {
        std::env::remove_var(key);
    }
}

#[test]
fn test_parse_sample_config() {
    let config = RuntimeConfig::parse(SAMPLE).unwrap();
    assert_eq!(config.runtime.max_pool_size, 3);
    assert_eq!(config.runtime.checkout_timeout(), Duration::from_millis(250));
    assert_eq!(config.runtime.health_interval_secs, 30);
    assert_eq!(config.runtime.round_robin_scope, RoundRobinScope::Tenant);
    assert_eq!(config.runtime.balanced_weights.cost, 0.7);

    assert_eq!(config.backends.len(), 2);
    let mock = &config.backends[0];
    assert_eq!(mock.profile().latency_ms, 150);
    assert!(mock.enabled);
    assert_eq!(mock.warm, 1);
    let echo = &config.backends[1];
    assert!(!echo.enabled);
    assert_eq!(echo.pool_size, Some(1));
    config.validate().unwrap();
}

#[test]
fn test_validate_reports_all_problems() {
    let config = RuntimeConfig::parse(
        r#"
        [runtime.balanced_weights]
        cost = -1.0
        quality = 0.5

        [[backend]]
        id = "dup"
        type = "mock"

        [[backend]]
        id = "dup"
        type = "mock"

        [[backend]]
        id = "weird"
        type = "carrier-pigeon"
        quality = 7.0
        "#,
    )
    .unwrap();

    let message = config.validate().unwrap_err().to_string();
    assert!(message.contains("balanced_weights"));
    assert!(message.contains("duplicate backend id 'dup'"));
    assert!(message.contains("unknown type 'carrier-pigeon'"));
    assert!(message.contains("quality must be within"));
}

#[test]
fn test_parse_error_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[runtime\nmax_pool_size = ").unwrap();

    let err = RuntimeConfig::from_file(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("broken.toml"));
}

#[test]
#[serial]
fn test_load_honours_config_env_var_and_overrides() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentry.toml");
    std::fs::write(&path, SAMPLE).unwrap();

    std::env::set_var("AGENTRY_CONFIG", &path);
    std::env::set_var("AGENTRY_MAX_POOL_SIZE", "9");
    std::env::set_var("AGENTRY_MAX_RETRIES", "0");
    let config = RuntimeConfig::load().unwrap();
    clear_env();

    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.runtime.max_pool_size, 9);
    assert_eq!(config.runtime.max_retries, 0);
    assert_eq!(config.runtime.checkout_timeout_ms, 250);
}

#[test]
#[serial]
fn test_bad_env_override_is_rejected() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentry.toml");
    std::fs::write(&path, SAMPLE).unwrap();

    std::env::set_var("AGENTRY_CHECKOUT_TIMEOUT_MS", "soon");
    let err = RuntimeConfig::load_from(&path).unwrap_err();
    clear_env();

    assert!(err.to_string().contains("AGENTRY_CHECKOUT_TIMEOUT_MS"));
}

#[tokio::test]
#[serial]
async fn test_runtime_from_config_registers_and_warms() {
    clear_env();
    let config = RuntimeConfig::parse(SAMPLE).unwrap();
    let runtime = Runtime::from_config(&config, &NoCredentials).await.unwrap();

    assert_eq!(runtime.registry.len(), 2);
    assert!(!runtime.registry.get("echo").unwrap().enabled);
    assert!(runtime.is_monitoring());

    let stats = runtime.pools.stats("fast-mock").unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.max_size, 3);

    let response = runtime
        .orchestrator
        .execute(ExecuteRequest::new(
            Selection::manual("fast-mock"),
            "anything",
            AgentContext::new("t", "u", "s"),
        ))
        .await
        .unwrap();
    assert_eq!(response.answer, "canned answer");
    assert_eq!(runtime.pools.stats("fast-mock").unwrap().created, 1);

    runtime.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_credentials_reach_the_backend_config() {
    clear_env();
    let config = RuntimeConfig::parse(
        r#"
        [[backend]]
        id = "shell"
        type = "command"
        "#,
    )
    .unwrap();
    let credentials = EnvCredentials::from_vars([("AGENTRY_CRED_SHELL_BINARY", "cat")]);
    let runtime = Runtime::from_config(&config, &credentials).await.unwrap();

    // Without the credential the required binary field would be missing
    let lease = runtime.pools.checkout("shell").await.unwrap();
    assert_eq!(lease.backend().kind(), "command");
    lease.checkin().await;

    runtime.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_missing_required_field_fails_checkout_not_startup() {
    clear_env();
    let config = RuntimeConfig::parse(
        r#"
        [[backend]]
        id = "shell"
        type = "command"
        "#,
    )
    .unwrap();
    let runtime = Runtime::from_config(&config, &NoCredentials).await.unwrap();

    let err = runtime.pools.checkout("shell").await.unwrap_err();
    assert!(err.to_string().contains("'binary' is required"));
    runtime.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_out_of_range_command_values_are_invalid_configuration() {
    clear_env();
    let config = RuntimeConfig::parse(
        r#"
        [[backend]]
        id = "shell"
        type = "command"

        [backend.config]
        binary = "cat"
        pass_query_via = "telnet"
        timeout_secs = -1
        "#,
    )
    .unwrap();
    let runtime = Runtime::from_config(&config, &NoCredentials).await.unwrap();

    let err = runtime.pools.checkout("shell").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_configuration");
    let message = err.to_string();
    assert!(message.contains("'pass_query_via' must be one of: arg, stdin"));
    assert!(message.contains("'timeout_secs' must not be negative"));
    assert_eq!(runtime.pools.stats("shell").unwrap().created, 0);
    runtime.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_unknown_mock_capability_is_invalid_configuration() {
    clear_env();
    let config = RuntimeConfig::parse(
        r#"
        [[backend]]
        id = "fake"
        type = "mock"

        [backend.config]
        capabilities = ["streaming", "telepathy"]
        latency_ms = -5
        "#,
    )
    .unwrap();
    let runtime = Runtime::from_config(&config, &NoCredentials).await.unwrap();

    let err = runtime.pools.checkout("fake").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_configuration");
    let message = err.to_string();
    assert!(message.contains("'capabilities' unknown capabilities: telepathy"));
    assert!(message.contains("'latency_ms' must not be negative"));
    runtime.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_health_overview_reports_every_backend_despite_failures() {
    clear_env();
    let config = RuntimeConfig::parse(
        r#"
        [[backend]]
        id = "good"
        type = "mock"
        warm = 1

        [[backend]]
        id = "sick"
        type = "mock"

        [backend.config]
        healthy = false

        [[backend]]
        id = "shell"
        type = "command"
        "#,
    )
    .unwrap();
    let runtime = Runtime::from_config(&config, &NoCredentials).await.unwrap();

    let overview = runtime.health_overview().await;
    assert_eq!(overview.pass.backends.len(), 1);
    assert_eq!(overview.pass.backends[0].backend_id, "good");
    assert_eq!(overview.pass.backends[0].summary.healthy, 1);

    let ids: Vec<_> = overview.backends.iter().map(|b| b.backend_id.as_str()).collect();
    assert_eq!(ids, vec!["good", "shell", "sick"]);
    assert_eq!(overview.backends[0].state, HealthState::Healthy);
    for failing in &overview.backends[1..] {
        assert_eq!(failing.state, HealthState::Unhealthy);
        assert!(failing.message.is_some());
    }
    assert!(overview.backends[1]
        .message
        .as_deref()
        .unwrap()
        .contains("'binary' is required"));

    runtime.shutdown().await;
}
