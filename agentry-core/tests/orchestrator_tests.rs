use agentry_agent::backends::mock::MockBackend;
use agentry_core::{
    AgentCapabilities, AgentContext, AgentDescriptor, AgentFactory, AgentRegistry, Capability,
    ChunkBody, ChunkKind, CompareRequest, ErrorCode, ExecuteRequest, FallbackPolicy, HealthState,
    MergeStrategy, Orchestrator, OrchestratorConfig, PoolManager, RuntimeError, Selection,
    Selector, Strategy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ctx() -> AgentContext {
    AgentContext::new("tenant-a", "user-1", "session-1")
}

fn mock_descriptor(id: &str, mock: MockBackend) -> AgentDescriptor {
    AgentDescriptor::builder(id, "mock")
        .capabilities(AgentCapabilities::from_set([Capability::Streaming]))
        .build(move |_| Ok(Box::new(mock.clone())))
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_delay: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(descriptors: Vec<AgentDescriptor>, config: OrchestratorConfig) -> Orchestrator {
    let registry = Arc::new(AgentRegistry::new());
    for descriptor in descriptors {
        registry.register(descriptor).unwrap();
    }
    let factory = Arc::new(AgentFactory::new(registry.clone()));
    let pools = Arc::new(PoolManager::new(factory).with_checkout_timeout(Duration::from_secs(2)));
    Orchestrator::new(registry.clone(), pools, Selector::new(registry), config)
}

async fn wait_until_idle(orch: &Orchestrator, id: &str) {
    for _ in 0..100 {
        if orch.pools().stats(id).map(|s| s.in_use == 0).unwrap_or(true) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance of '{}' was never returned", id);
}

#[tokio::test]
async fn test_manual_execute_stamps_backend_and_returns_instance() {
    let mock = MockBackend::new().on_query("capital").respond_text("Paris");
    let orch = orchestrator(vec![mock_descriptor("alpha", mock)], test_config());

    let response = orch
        .execute(ExecuteRequest::new(Selection::manual("alpha"), "capital of France?", ctx()))
        .await
        .unwrap();

    assert_eq!(response.answer, "Paris");
    assert_eq!(response.backend_id, "alpha");
    let stats = orch.pools().stats("alpha").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_blank_query_is_invalid_request() {
    let orch = orchestrator(vec![mock_descriptor("alpha", MockBackend::new())], test_config());
    let err = orch
        .execute(ExecuteRequest::new(Selection::manual("alpha"), "   ", ctx()))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_capability_match_uses_strategy() {
    let cheap = AgentDescriptor::builder("cheap", "mock")
        .capabilities(AgentCapabilities::from_set([Capability::Streaming]))
        .cost(0.1)
        .build(|_| Ok(Box::new(MockBackend::new().with_default_text("from cheap"))));
    let pricey = AgentDescriptor::builder("pricey", "mock")
        .capabilities(AgentCapabilities::from_set([Capability::Streaming]))
        .cost(3.0)
        .build(|_| Ok(Box::new(MockBackend::new().with_default_text("from pricey"))));
    let orch = orchestrator(vec![cheap, pricey], test_config());

    let response = orch
        .execute(ExecuteRequest::new(
            Selection::matching([Capability::Streaming], Strategy::CostOptimized),
            "hi",
            ctx(),
        ))
        .await
        .unwrap();
    assert_eq!(response.backend_id, "cheap");
    assert_eq!(response.answer, "from cheap");
}

#[tokio::test]
async fn test_failing_primary_falls_back_to_explicit_chain() {
    let broken = MockBackend::new().fail_always("upstream 500");
    let healthy = MockBackend::new().with_default_text("backup answer");
    let orch = orchestrator(
        vec![mock_descriptor("primary", broken), mock_descriptor("backup", healthy)],
        test_config(),
    );

    let response = orch
        .execute(
            ExecuteRequest::new(Selection::manual("primary"), "question", ctx())
                .with_fallback(FallbackPolicy::chain(["backup"])),
        )
        .await
        .unwrap();

    assert_eq!(response.backend_id, "backup");
    assert_eq!(response.answer, "backup answer");
    assert_eq!(orch.pools().stats("primary").unwrap().in_use, 0);
}

#[tokio::test]
async fn test_zero_retries_surfaces_primary_failure() {
    let broken = MockBackend::new().fail_always("upstream 500");
    let healthy = MockBackend::new();
    let healthy_probe = healthy.probe();
    let orch = orchestrator(
        vec![mock_descriptor("primary", broken), mock_descriptor("backup", healthy)],
        OrchestratorConfig {
            max_retries: 0,
            ..test_config()
        },
    );

    let err = orch
        .execute(
            ExecuteRequest::new(Selection::manual("primary"), "question", ctx())
                .with_fallback(FallbackPolicy::chain(["backup"])),
        )
        .await
        .unwrap_err();

    match &err {
        RuntimeError::ExecutionFailed { backend, .. } => assert_eq!(backend, "primary"),
        other => panic!("Expected ExecutionFailed, got {:?}", other),
    }
    assert!(err.to_string().contains("upstream 500"));
    assert_eq!(healthy_probe.executions(), 0);
}

#[tokio::test]
async fn test_capability_match_falls_back_through_ranking() {
    let first = AgentDescriptor::builder("first", "mock")
        .capabilities(AgentCapabilities::from_set([Capability::Tools]))
        .priority(0)
        .build(|_| {
            Ok(Box::new(
                MockBackend::new()
                    .with_capabilities(AgentCapabilities::from_set([Capability::Tools]))
                    .fail_always("rate limited"),
            ))
        });
    let second = AgentDescriptor::builder("second", "mock")
        .capabilities(AgentCapabilities::from_set([Capability::Tools]))
        .priority(1)
        .build(|_| {
            Ok(Box::new(
                MockBackend::new()
                    .with_capabilities(AgentCapabilities::from_set([Capability::Tools]))
                    .with_default_text("second wins"),
            ))
        });
    let orch = orchestrator(vec![first, second], test_config());

    let response = orch
        .execute(ExecuteRequest::new(
            Selection::matching([Capability::Tools], Strategy::CostOptimized),
            "use a tool",
            ctx(),
        ))
        .await
        .unwrap();
    assert_eq!(response.backend_id, "second");
}

#[tokio::test]
async fn test_unknown_fallback_backend_is_not_found() {
    let orch = orchestrator(vec![mock_descriptor("alpha", MockBackend::new())], test_config());
    let err = orch
        .execute(
            ExecuteRequest::new(Selection::manual("alpha"), "q", ctx())
                .with_fallback(FallbackPolicy::chain(["ghost"])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(ref id) if id == "ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_fails_and_returns_instance() {
    let mock = MockBackend::new().hang_always();
    let probe = mock.probe();
    let orch = orchestrator(
        vec![mock_descriptor("slow", mock)],
        OrchestratorConfig {
            max_retries: 0,
            ..test_config()
        },
    );

    let err = orch
        .execute(ExecuteRequest::new(
            Selection::manual("slow"),
            "anything",
            ctx().with_max_execution(Duration::from_secs(1)),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::ExecutionFailed { .. }));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(probe.active(), 0);
    assert_eq!(orch.pools().stats("slow").unwrap().in_use, 0);
}

#[tokio::test]
async fn test_cancel_mid_execution() {
    let mock = MockBackend::new().hang_always();
    let probe = mock.probe();
    let orch = Arc::new(orchestrator(vec![mock_descriptor("slow", mock)], test_config()));
    let token = CancellationToken::new();

    let call = {
        let orch = orch.clone();
        let request = ExecuteRequest::new(Selection::manual("slow"), "q", ctx()).with_cancel(token.clone());
        tokio::spawn(async move { orch.execute(request).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled { backend: Some(ref b) } if b == "slow"));
    assert_eq!(probe.active(), 0);
    assert_eq!(orch.pools().stats("slow").unwrap().in_use, 0);
}

#[tokio::test]
async fn test_stream_chunks_are_sequenced_and_attributed() {
    let mock = MockBackend::new().on_query("story").respond_chunks(vec![
        ChunkBody::thought("plotting"),
        ChunkBody::text("Once "),
        ChunkBody::text("upon a time"),
    ]);
    let orch = orchestrator(vec![mock_descriptor("teller", mock)], test_config());

    let stream = orch
        .stream(ExecuteRequest::new(Selection::manual("teller"), "a story", ctx()))
        .await
        .unwrap();
    let chunks = stream.collect_all().await;

    assert_eq!(chunks.len(), 4);
    assert!(chunks.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(chunks.iter().all(|c| c.backend_id == "teller"));
    assert_eq!(chunks.last().unwrap().kind(), ChunkKind::Completion);
    wait_until_idle(&orch, "teller").await;
}

#[tokio::test]
async fn test_stream_falls_back_before_first_chunk() {
    let broken = MockBackend::new().fail_always("connection refused");
    let backup = MockBackend::new().with_default_text("from backup");
    let orch = orchestrator(
        vec![mock_descriptor("primary", broken), mock_descriptor("backup", backup)],
        test_config(),
    );

    let stream = orch
        .stream(
            ExecuteRequest::new(Selection::manual("primary"), "q", ctx())
                .with_fallback(FallbackPolicy::chain(["backup"])),
        )
        .await
        .unwrap();
    let chunks = stream.collect_all().await;

    assert!(chunks.iter().all(|c| c.backend_id == "backup"));
    assert_eq!(chunks.last().unwrap().kind(), ChunkKind::Completion);
    assert_eq!(chunks[0].sequence, 0);
}

#[tokio::test]
async fn test_stream_failure_after_output_ends_with_error_chunk() {
    let mock = MockBackend::new()
        .on_query("q")
        .respond_partial_failure(vec![ChunkBody::text("partial")], "socket closed");
    let backup = MockBackend::new();
    let backup_probe = backup.probe();
    let orch = orchestrator(
        vec![mock_descriptor("primary", mock), mock_descriptor("backup", backup)],
        test_config(),
    );

    let stream = orch
        .stream(
            ExecuteRequest::new(Selection::manual("primary"), "q", ctx())
                .with_fallback(FallbackPolicy::chain(["backup"])),
        )
        .await
        .unwrap();
    let chunks = stream.collect_all().await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].kind(), ChunkKind::Text);
    match &chunks[1].body {
        ChunkBody::Error { code, message, .. } => {
            assert_eq!(*code, ErrorCode::BackendError);
            assert!(message.contains("socket closed"));
        }
        other => panic!("Expected Error chunk, got {:?}", other),
    }
    assert_eq!(backup_probe.streams(), 0);
    wait_until_idle(&orch, "primary").await;
}

#[tokio::test]
async fn test_dropping_stream_cancels_and_returns_instance() {
    let chunks: Vec<_> = (0..50).map(|i| ChunkBody::text(format!("chunk {} ", i))).collect();
    let mock = MockBackend::new()
        .on_query("long")
        .respond_chunks(chunks)
        .with_chunk_delay(Duration::from_millis(20));
    let probe = mock.probe();
    let orch = orchestrator(vec![mock_descriptor("talker", mock)], test_config());

    let mut stream = orch
        .stream(ExecuteRequest::new(Selection::manual("talker"), "long", ctx()))
        .await
        .unwrap();
    let first = stream.recv().await.unwrap();
    assert_eq!(first.sequence, 0);
    drop(stream);

    wait_until_idle(&orch, "talker").await;
    assert_eq!(probe.active(), 0);
    assert_eq!(orch.pools().stats("talker").unwrap().idle, 1);
}

#[tokio::test]
async fn test_compare_reports_each_backend_independently() {
    let orch = orchestrator(
        vec![
            mock_descriptor("a", MockBackend::new().with_default_text("answer a")),
            mock_descriptor("b", MockBackend::new().fail_always("b is down")),
            mock_descriptor("c", MockBackend::new().with_default_text("answer c")),
        ],
        test_config(),
    );

    let comparison = orch
        .compare(CompareRequest::new(["a", "b", "c"], "same question", ctx()))
        .await
        .unwrap();

    let order: Vec<_> = comparison.entries.iter().map(|e| e.backend_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(comparison.success_count(), 2);
    let failures: Vec<_> = comparison.failures().map(|(id, _)| id).collect();
    assert_eq!(failures, vec!["b"]);

    let consensus = comparison.merge(MergeStrategy::Consensus).unwrap();
    assert_eq!(consensus.answer, "answer a\n\nanswer c");
    assert_eq!(consensus.backend_id, "merged");

    let labelled = comparison.merge(MergeStrategy::Concatenate).unwrap();
    assert!(labelled.answer.contains("**a**: answer a"));
    assert!(labelled.answer.contains("\n\n---\n\n"));

    let fastest = comparison.merge(MergeStrategy::Fastest).unwrap();
    assert!(fastest.backend_id == "a" || fastest.backend_id == "c");
}

#[tokio::test]
async fn test_compare_timeout_is_per_backend() {
    let orch = orchestrator(
        vec![
            mock_descriptor("quick", MockBackend::new().with_default_text("done")),
            mock_descriptor("stuck", MockBackend::new().hang_always()),
        ],
        test_config(),
    );

    let comparison = orch
        .compare(
            CompareRequest::new(["quick", "stuck"], "q", ctx()).with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert!(comparison.entries[0].is_success());
    let err = comparison.entries[1].outcome.as_ref().unwrap_err();
    assert!(err.to_string().contains("timed out"));
    wait_until_idle(&orch, "stuck").await;
}

#[tokio::test]
async fn test_cancelled_compare_is_cancelled() {
    let orch = Arc::new(orchestrator(
        vec![
            mock_descriptor("a", MockBackend::new().hang_always()),
            mock_descriptor("b", MockBackend::new().hang_always()),
        ],
        test_config(),
    ));
    let token = CancellationToken::new();

    let call = {
        let orch = orch.clone();
        let request = CompareRequest::new(["a", "b"], "q", ctx()).with_cancel(token.clone());
        tokio::spawn(async move { orch.compare(request).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled { backend: None }));
    wait_until_idle(&orch, "a").await;
    wait_until_idle(&orch, "b").await;
}

#[tokio::test]
async fn test_merge_with_no_successes_is_none() {
    let orch = orchestrator(
        vec![mock_descriptor("a", MockBackend::new().fail_always("nope"))],
        test_config(),
    );
    let comparison = orch
        .compare(CompareRequest::new(["a", "ghost"], "q", ctx()))
        .await
        .unwrap();
    assert!(comparison.merge(MergeStrategy::Consensus).is_none());
    assert!(matches!(
        comparison.entries[1].outcome,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_health_probes_fresh_instance_when_pool_is_empty() {
    let mock = MockBackend::new();
    let probe = mock.probe();
    let orch = orchestrator(vec![mock_descriptor("alpha", mock)], test_config());

    let health = orch.health("alpha").await.unwrap();
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.instances.len(), 1);
    // One probe at construction, one explicit
    assert_eq!(probe.health_checks(), 2);
}

#[tokio::test]
async fn test_health_of_unconstructible_backend_is_unhealthy() {
    let orch = orchestrator(
        vec![mock_descriptor("sick", MockBackend::new().always_unhealthy("no GPU"))],
        test_config(),
    );
    let health = orch.health("sick").await.unwrap();
    assert_eq!(health.state, HealthState::Unhealthy);
    assert!(health.message.unwrap().contains("no GPU"));
}

#[tokio::test]
async fn test_list_backends_includes_pool_stats() {
    let orch = orchestrator(
        vec![
            mock_descriptor("b", MockBackend::new()),
            mock_descriptor("a", MockBackend::new()),
        ],
        test_config(),
    );
    orch.execute(ExecuteRequest::new(Selection::manual("a"), "q", ctx()))
        .await
        .unwrap();

    let summaries = orch.list_backends();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].id, "a");
    assert_eq!(summaries[0].pool.as_ref().unwrap().created, 1);
    assert!(summaries[1].pool.is_none());
    assert!(orch.capabilities("a").unwrap().supports_streaming);
    assert!(matches!(orch.capabilities("zzz"), Err(RuntimeError::NotFound(_))));
}

#[tokio::test]
async fn test_unregister_then_register_serves_new_backend() {
    let old = MockBackend::new().with_default_text("old");
    let old_probe = old.probe();
    let orch = orchestrator(vec![mock_descriptor("a", old)], test_config());

    let response = orch
        .execute(ExecuteRequest::new(Selection::manual("a"), "question", ctx()))
        .await
        .unwrap();
    assert_eq!(response.answer, "old");
    assert_eq!(orch.pools().stats("a").unwrap().idle, 1);

    orch.unregister("a").await.unwrap();
    assert!(orch.pools().stats("a").is_none());
    assert_eq!(old_probe.shutdowns(), 1);
    assert!(matches!(
        orch.execute(ExecuteRequest::new(Selection::manual("a"), "question", ctx()))
            .await,
        Err(RuntimeError::NotFound(_))
    ));

    let new = MockBackend::new().with_default_text("new");
    orch.registry().register(mock_descriptor("a", new)).unwrap();
    let response = orch
        .execute(ExecuteRequest::new(Selection::manual("a"), "question", ctx()))
        .await
        .unwrap();
    assert_eq!(response.answer, "new");
    assert_eq!(orch.pools().stats("a").unwrap().created, 1);
}

#[tokio::test]
async fn test_registry_level_reregistration_replaces_pooled_instances() {
    let old = MockBackend::new().with_default_text("old");
    let old_probe = old.probe();
    let orch = orchestrator(vec![mock_descriptor("a", old)], test_config());
    orch.execute(ExecuteRequest::new(Selection::manual("a"), "question", ctx()))
        .await
        .unwrap();

    orch.registry().unregister("a").unwrap();
    let new = MockBackend::new().with_default_text("new");
    orch.registry().register(mock_descriptor("a", new)).unwrap();

    let response = orch
        .execute(ExecuteRequest::new(Selection::manual("a"), "question", ctx()))
        .await
        .unwrap();
    assert_eq!(response.answer, "new");
    assert_eq!(old_probe.shutdowns(), 1);
}

#[tokio::test]
async fn test_cancelling_request_token_ends_stream_and_returns_instance() {
    let chunks: Vec<_> = (0..50).map(|i| ChunkBody::text(format!("chunk {} ", i))).collect();
    let mock = MockBackend::new()
        .on_query("long")
        .respond_chunks(chunks)
        .with_chunk_delay(Duration::from_millis(20));
    let probe = mock.probe();
    let orch = orchestrator(vec![mock_descriptor("talker", mock)], test_config());

    let token = CancellationToken::new();
    let mut stream = orch
        .stream(ExecuteRequest::new(Selection::manual("talker"), "long", ctx()).with_cancel(token.clone()))
        .await
        .unwrap();
    let first = stream.recv().await.unwrap();
    assert_eq!(first.sequence, 0);

    token.cancel();
    let mut after_cancel = 0;
    while stream.recv().await.is_some() {
        after_cancel += 1;
        assert!(after_cancel < 50, "stream kept running after cancellation");
    }

    wait_until_idle(&orch, "talker").await;
    assert_eq!(probe.active(), 0);
    let stats = orch.pools().stats("talker").unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.destroyed, 0);
}
