//! End-to-end workflow scenarios over in-memory collaborators.

use aura::retrieval::{ChunkMetadata, InMemoryKnowledgeStore};
use aura::{
    Checkpointer, CompletionModel, Error, KnowledgeRetriever, LlmClient, LlmOptions,
    MemoryCheckpointer, MockCompletionModel, RetryPolicy,
};
use aura_service::{
    build_struggle_graph, ServiceConfig, StruggleState, TriggerRequest, WorkflowService,
};
use std::sync::Arc;
use std::time::Duration;

async fn seeded_retriever() -> Arc<KnowledgeRetriever> {
    let store = Arc::new(InMemoryKnowledgeStore::new(Arc::new(
        aura::embeddings::MockEmbeddings::new(32),
    )));
    store
        .add_texts(vec![
            (
                "E0382 means a value was moved; clone it or borrow instead".to_string(),
                ChunkMetadata {
                    language: Some("rust".to_string()),
                    path: "lessons/ownership.md".to_string(),
                    chunk_ix: 0,
                    ..ChunkMetadata::default()
                },
            ),
            (
                "TS2304 means the identifier is not in scope; check imports".to_string(),
                ChunkMetadata {
                    language: Some("typescript".to_string()),
                    path: "lessons/ts-scope.md".to_string(),
                    chunk_ix: 0,
                    ..ChunkMetadata::default()
                },
            ),
        ])
        .await
        .unwrap();
    Arc::new(KnowledgeRetriever::new(store))
}

fn llm_from(model: Arc<MockCompletionModel>) -> Arc<LlmClient> {
    Arc::new(LlmClient::new(
        model as Arc<dyn CompletionModel>,
        LlmOptions {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
                jitter: 0.0,
            },
            batch_delay: Duration::ZERO,
            ..LlmOptions::default()
        },
        100,
    ))
}

fn struggling_request(file: &str, ts: i64) -> TriggerRequest {
    TriggerRequest {
        edit_frequency: 15.0,
        error_logs: vec!["E0382: borrow of moved value".to_string()],
        language_id: Some("rust".to_string()),
        file_path: Some(file.to_string()),
        source: "vscode".to_string(),
        client_timestamp: ts,
        ..TriggerRequest::default()
    }
}

async fn service_with(
    config: ServiceConfig,
    model: Arc<MockCompletionModel>,
) -> (WorkflowService, Arc<MemoryCheckpointer<StruggleState>>) {
    let checkpointer = Arc::new(MemoryCheckpointer::<StruggleState>::new());
    let service = WorkflowService::new(
        &config,
        Arc::clone(&checkpointer) as Arc<dyn Checkpointer<StruggleState>>,
        seeded_retriever().await,
        llm_from(model),
    )
    .unwrap();
    (service, checkpointer)
}

#[tokio::test]
async fn submission_produces_a_completed_lesson_thread() {
    let model = MockCompletionModel::answering("Lesson: prefer borrowing over moving.");
    let (service, _checkpointer) = service_with(ServiceConfig::default(), model).await;

    let response = service
        .submit("client-1", struggling_request("src/main.rs", 10_000))
        .await
        .unwrap();

    assert_eq!(response.status, "completed");
    assert!(response.state.is_struggling);
    assert!(response
        .state
        .lesson_recommendation
        .as_deref()
        .unwrap()
        .contains("borrowing"));
    assert_eq!(response.thread_id, "src/main.rs:0");
}

/// Crash after `maybe_retrieve` completes, restart with the same thread id:
/// the restored state carries `rag_context` and `generate` runs exactly
/// once.
#[tokio::test]
async fn resume_after_crash_runs_generate_exactly_once() {
    let checkpointer = Arc::new(MemoryCheckpointer::<StruggleState>::new());
    let retriever = seeded_retriever().await;
    let model = MockCompletionModel::answering("Lesson: clone less, borrow more.");
    let llm = llm_from(Arc::clone(&model));
    let config = ServiceConfig::default();
    let thread_id = "src/main.rs:0";

    // First process: pauses (then "crashes") right after maybe_retrieve.
    {
        let graph = build_struggle_graph(&config, Arc::clone(&retriever), Arc::clone(&llm))
            .unwrap()
            .with_checkpointer_arc(
                Arc::clone(&checkpointer) as Arc<dyn Checkpointer<StruggleState>>
            )
            .with_thread_id(thread_id)
            .with_interrupt_after(vec!["maybe_retrieve"]);

        let result = graph
            .invoke(StruggleState::from_request(&struggling_request(
                "src/main.rs",
                10_000,
            )))
            .await
            .unwrap();
        assert_eq!(result.interrupted_at.as_deref(), Some("maybe_retrieve"));
        assert!(result.final_state.rag_context.is_some());
        assert_eq!(model.call_count(), 0);
    }

    // Restarted process: same thread id, fresh graph instance.
    let graph = build_struggle_graph(&config, retriever, llm)
        .unwrap()
        .with_checkpointer_arc(Arc::clone(&checkpointer) as Arc<dyn Checkpointer<StruggleState>>)
        .with_thread_id(thread_id);

    let result = graph
        .invoke(StruggleState::from_request(&struggling_request(
            "src/main.rs",
            10_000,
        )))
        .await
        .unwrap();

    let state = result.final_state;
    assert!(state.rag_context.is_some(), "rag_context survives the crash");
    assert!(state.lesson_recommendation.is_some());
    assert_eq!(model.call_count(), 1, "generate ran exactly once");

    // The thread chain is intact: every checkpoint links to its parent.
    let history = checkpointer.list(thread_id).await.unwrap();
    for pair in history.windows(2) {
        assert_eq!(pair[0].parent_id.as_ref(), Some(&pair[1].id));
    }
    assert!(checkpointer.get_writes(thread_id).await.unwrap().is_empty());
}

/// With `struggle` limited to 3 requests per window, four submissions in
/// quick succession yield three successes and one rejection with a valid
/// retry-after hint.
#[tokio::test]
async fn rate_limit_rejects_fourth_submission() {
    let mut config = ServiceConfig::default();
    config.rate_limit.overrides.insert(
        "struggle".to_string(),
        aura_service::config::RateLimitRule {
            requests: 3,
            window_s: 60,
        },
    );
    let model = MockCompletionModel::answering("Lesson.");
    let (service, _checkpointer) = service_with(config, model).await;

    for i in 0..3 {
        let request = struggling_request(&format!("src/file{i}.rs"), 10_000);
        service.submit("client-1", request).await.unwrap();
    }

    let err = service
        .submit("client-1", struggling_request("src/file3.rs", 10_000))
        .await
        .unwrap_err();
    match err {
        Error::RateLimited { retry_after, .. } => {
            let hint = retry_after.expect("retry-after hint present");
            assert!(hint >= Duration::from_secs(1));
            assert!(hint <= Duration::from_secs(60));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // A different client is unaffected.
    service
        .submit("client-2", struggling_request("src/other.rs", 10_000))
        .await
        .unwrap();
}

/// Submissions for the same file within one epoch window share a thread and
/// do not re-run the workflow.
#[tokio::test]
async fn same_epoch_submissions_coalesce() {
    let model = MockCompletionModel::answering("Lesson.");
    let (service, _checkpointer) = service_with(ServiceConfig::default(), Arc::clone(&model)).await;

    let first = service
        .submit("client-1", struggling_request("src/main.rs", 5_000))
        .await
        .unwrap();
    // 50s later, same 60s epoch.
    let second = service
        .submit("client-1", struggling_request("src/main.rs", 55_000))
        .await
        .unwrap();

    assert_eq!(first.thread_id, second.thread_id);
    assert_eq!(model.call_count(), 1, "the completed thread was reused");

    // The next epoch starts a fresh thread.
    let third = service
        .submit("client-1", struggling_request("src/main.rs", 65_000))
        .await
        .unwrap();
    assert_ne!(first.thread_id, third.thread_id);
    assert_eq!(model.call_count(), 2);
}

#[tokio::test]
async fn get_unknown_thread_is_not_found() {
    let model = MockCompletionModel::answering("Lesson.");
    let (service, _checkpointer) = service_with(ServiceConfig::default(), model).await;

    let err = service.get("ghost:0").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn list_paginates_threads() {
    let model = MockCompletionModel::answering("Lesson.");
    let (service, _checkpointer) = service_with(ServiceConfig::default(), model).await;

    for i in 0..3 {
        service
            .submit("client-1", struggling_request(&format!("src/f{i}.rs"), 1_000))
            .await
            .unwrap();
    }

    let page = service.list(1, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 2);
    assert_eq!(page.pages, 2);

    let page2 = service.list(2, 2).await.unwrap();
    assert_eq!(page2.items.len(), 1);

    for item in page.items.iter().chain(page2.items.iter()) {
        assert_eq!(item.status, "completed");
        assert!(item.created_at <= item.updated_at);
    }
}

#[tokio::test]
async fn health_reports_cache_tiers() {
    let model = MockCompletionModel::answering("Lesson.");
    let (service, _checkpointer) = service_with(ServiceConfig::default(), model).await;

    let health = service.health().await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.caches.len(), 1);
    assert_eq!(health.caches[0].backend, "local");
}

#[tokio::test]
async fn audit_endpoint_is_rate_limited_independently() {
    let mut config = ServiceConfig::default();
    config.rate_limit.overrides.insert(
        "audit".to_string(),
        aura_service::config::RateLimitRule {
            requests: 1,
            window_s: 60,
        },
    );
    let model = MockCompletionModel::answering("no");
    let (service, _checkpointer) = service_with(config, model).await;

    let diff = "+++ b/src/lib.rs\n@@ -1,1 +1,2 @@\n fn f() {}\n+fn g() {}\n";
    service.audit("client-1", diff, "ci").await.unwrap();
    let err = service.audit("client-1", diff, "ci").await.unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));

    // The struggle endpoint still has budget.
    service
        .submit("client-1", struggling_request("src/x.rs", 1_000))
        .await
        .unwrap();
}
