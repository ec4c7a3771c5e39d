//! Integration tests for the HTTP client against the stub server.

use super::stub::{StubResponse, StubServer};
use dune_poll::dune::{
    DuneClient, DuneClientConfig, ExecutionId, ExecutionState, PerformanceTier, QueryRequest,
    QueryService,
};
use dune_poll::error::DuneError;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn client(server: &StubServer) -> DuneClient {
    let mut config = DuneClientConfig::new("test-key").with_url(server.base_url());
    config.retry_base_delay = Duration::from_millis(1);
    DuneClient::new(config).unwrap()
}

#[tokio::test]
async fn test_submit_posts_execute_with_parameters() {
    let server = StubServer::start(|_| {
        StubResponse::ok(json!({
            "execution_id": "01HKZJ2683PHF9Q9PHHQ8FW4Q1",
            "state": "QUERY_STATE_PENDING"
        }))
    })
    .await;

    let request = QueryRequest::new("2991576", PerformanceTier::Large)
        .with_parameter("chain", json!("ethereum"));
    let id = client(&server).submit(&request).await.unwrap();

    assert_eq!(id.as_str(), "01HKZJ2683PHF9Q9PHHQ8FW4Q1");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].target,
        "/api/v1/query/2991576/execute?performance=large"
    );
    assert_eq!(requests[0].api_key.as_deref(), Some("test-key"));
    assert_eq!(
        requests[0].json_body(),
        json!({"query_parameters": {"chain": "ethereum"}})
    );
}

#[tokio::test]
async fn test_submit_without_parameters_sends_no_body() {
    let server =
        StubServer::start(|_| StubResponse::ok(json!({"execution_id": "exec-1"}))).await;

    let request = QueryRequest::new("1", PerformanceTier::Medium);
    client(&server).submit(&request).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].target, "/api/v1/query/1/execute?performance=medium");
    assert!(requests[0].body.is_empty());
}

#[tokio::test]
async fn test_status_maps_wire_states() {
    let server = StubServer::start(|_| {
        StubResponse::ok(json!({
            "execution_id": "exec-1",
            "query_id": 2991576,
            "state": "QUERY_STATE_FAILED",
            "submitted_at": "2024-01-01T00:00:00Z"
        }))
    })
    .await;

    let status = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap();

    assert_eq!(
        status.state,
        ExecutionState::Other("QUERY_STATE_FAILED".to_string())
    );
    let requests = server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/api/v1/execution/exec-1/status");
}

#[tokio::test]
async fn test_results_keep_column_order() {
    let server = StubServer::start(|_| {
        StubResponse::ok(json!({
            "execution_id": "exec-1",
            "state": "QUERY_STATE_COMPLETED",
            "result": {
                "rows": [
                    {"vault": "0xabc", "debt": 1200.5},
                    {"vault": "0xdef", "debt": 3}
                ],
                "metadata": {"column_names": ["vault", "debt"], "total_row_count": 2}
            }
        }))
    })
    .await;

    let results = client(&server)
        .results(&ExecutionId::new("exec-1"))
        .await
        .unwrap();

    assert_eq!(results.state, ExecutionState::Completed);
    let result = results.result.unwrap();
    assert_eq!(result.columns, vec!["vault".to_string(), "debt".to_string()]);
    assert_eq!(result.row_count(), 2);
    assert_eq!(result.rows[1]["vault"], json!("0xdef"));
}

#[tokio::test]
async fn test_cancel_posts_and_reads_success() {
    let server = StubServer::start(|_| StubResponse::ok(json!({"success": true}))).await;

    let acknowledged = client(&server)
        .cancel(&ExecutionId::new("exec-1"))
        .await
        .unwrap();

    assert!(acknowledged);
    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].target, "/api/v1/execution/exec-1/cancel");
}

#[tokio::test]
async fn test_auth_error_is_not_retried() {
    let server =
        StubServer::start(|_| StubResponse::error(401, r#"{"error": "invalid API Key"}"#)).await;

    let err = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DuneError::Api { status: 401, .. }));
    assert!(err.to_string().contains("DUNE_API_KEY"));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_error_body_message_is_used() {
    let server = StubServer::start(|_| {
        StubResponse::error(400, r#"{"error": "Query not found or is private"}"#)
    })
    .await;

    let request = QueryRequest::new("42", PerformanceTier::Medium);
    let err = client(&server).submit(&request).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "API error (400): Query not found or is private"
    );
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let server = StubServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            StubResponse::error(502, "bad gateway")
        } else {
            StubResponse::ok(json!({"execution_id": "exec-1", "state": "QUERY_STATE_EXECUTING"}))
        }
    })
    .await;

    let status = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap();

    assert_eq!(status.state, ExecutionState::Executing);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_attempts() {
    let server = StubServer::start(|_| StubResponse::error(429, "slow down")).await;

    let err = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DuneError::Api { status: 429, .. }));
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let server = StubServer::start(|_| StubResponse::error(200, "not json")).await;

    let err = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DuneError::Parse(_)));
}

#[tokio::test]
async fn test_truncated_body_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let server = StubServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            StubResponse::truncated(r#"{"execution_id": "exec-1""#)
        } else {
            StubResponse::ok(json!({"execution_id": "exec-1", "state": "QUERY_STATE_COMPLETED"}))
        }
    })
    .await;

    let status = client(&server)
        .status(&ExecutionId::new("exec-1"))
        .await
        .unwrap();

    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
