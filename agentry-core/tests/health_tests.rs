use agentry_agent::backends::mock::MockBackend;
use agentry_core::{
    AgentDescriptor, AgentFactory, AgentRegistry, HealthMonitor, HealthStatus, PoolManager,
};
use std::sync::Arc;
use std::time::Duration;

fn pools_for(backends: Vec<(&str, MockBackend)>) -> Arc<PoolManager> {
    let registry = Arc::new(AgentRegistry::new());
    for (id, mock) in backends {
        registry
            .register(AgentDescriptor::builder(id, "mock").build(move |_| Ok(Box::new(mock.clone()))))
            .unwrap();
    }
    Arc::new(PoolManager::new(Arc::new(AgentFactory::new(registry))).with_default_max_size(2))
}

#[tokio::test]
async fn test_run_once_reports_every_pool() {
    let pools = pools_for(vec![("a", MockBackend::new()), ("b", MockBackend::new())]);
    pools.warm_up("a", 2).await.unwrap();
    pools.warm_up("b", 1).await.unwrap();

    let report = HealthMonitor::new(pools).run_once().await;
    assert_eq!(report.backends.len(), 2);
    assert_eq!(report.get("a").unwrap().healthy, 2);
    assert_eq!(report.get("b").unwrap().healthy, 1);
    assert_eq!(report.evicted(), 0);
}

#[tokio::test]
async fn test_two_failed_passes_evict_and_free_capacity() {
    let mock = MockBackend::new();
    let handle = mock.clone();
    let probe = mock.probe();
    let pools = pools_for(vec![("a", mock)]);
    pools.warm_up("a", 2).await.unwrap();
    let monitor = HealthMonitor::new(pools.clone());

    handle.set_health(HealthStatus::unhealthy("segfault"));
    let first = monitor.run_once().await;
    assert_eq!(first.unhealthy(), 2);
    assert_eq!(first.evicted(), 0);

    let second = monitor.run_once().await;
    assert_eq!(second.evicted(), 2);
    assert_eq!(probe.shutdowns(), 2);

    // Capacity is available for fresh, healthy instances
    handle.set_health(HealthStatus::healthy());
    let lease = pools.checkout("a").await.unwrap();
    assert!(lease.is_eligible());
    lease.checkin().await;
}

#[tokio::test]
async fn test_recovery_resets_failure_count() {
    let mock = MockBackend::new();
    let handle = mock.clone();
    let pools = pools_for(vec![("a", mock)]);
    pools.warm_up("a", 1).await.unwrap();
    let monitor = HealthMonitor::new(pools.clone());

    handle.set_health(HealthStatus::unhealthy("blip"));
    monitor.run_once().await;
    handle.set_health(HealthStatus::degraded("recovering"));
    monitor.run_once().await;
    handle.set_health(HealthStatus::unhealthy("blip"));
    let report = monitor.run_once().await;

    assert_eq!(report.evicted(), 0);
    assert_eq!(pools.stats("a").unwrap().idle, 1);
}

#[tokio::test]
async fn test_leased_instances_are_not_probed() {
    let mock = MockBackend::new();
    let probe = mock.probe();
    let pools = pools_for(vec![("a", mock)]);
    let lease = pools.checkout("a").await.unwrap();
    let checks_before = probe.health_checks();

    let report = HealthMonitor::new(pools.clone()).run_once().await;
    assert_eq!(report.get("a").unwrap().healthy, 0);
    assert_eq!(probe.health_checks(), checks_before);
    lease.checkin().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawned_monitor_probes_on_interval_and_stops() {
    let mock = MockBackend::new();
    let probe = mock.probe();
    let pools = pools_for(vec![("a", mock)]);
    pools.warm_up("a", 1).await.unwrap();
    let after_warm = probe.health_checks();

    let handle = HealthMonitor::new(pools)
        .with_interval(Duration::from_secs(10))
        .spawn();
    assert!(handle.is_running());

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(probe.health_checks(), after_warm + 3);

    handle.stop().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.health_checks(), after_warm + 3);
}
