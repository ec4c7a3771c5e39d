//! End-to-end polling tests.

use super::stub::{RecordedRequest, StubResponse, StubServer};
use dune_poll::dune::{
    DuneClient, DuneClientConfig, ExecutionId, ExecutionState, PerformanceTier, QueryRequest,
    Row, ScriptedExecution, ScriptedQueryService, ServiceCall,
};
use dune_poll::error::DuneError;
use dune_poll::output::{self, OutputFormat};
use dune_poll::poller::{PollEvent, PollPolicy, Poller, WaitReason};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn fast_policy() -> PollPolicy {
    PollPolicy::default()
        .with_intervals(Duration::from_millis(1), Duration::from_millis(2))
        .with_cooldown(Duration::from_millis(1))
}

fn http_client(server: &StubServer) -> DuneClient {
    let mut config = DuneClientConfig::new("test-key").with_url(server.base_url());
    config.retry_base_delay = Duration::from_millis(1);
    DuneClient::new(config).unwrap()
}

/// Serves executions whose status calls walk through the given states.
fn dune_api(
    scripts: Vec<Vec<&'static str>>,
) -> impl Fn(&RecordedRequest) -> StubResponse + Send + Sync + 'static {
    let submitted = Mutex::new(0usize);
    let status_calls: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());

    move |request: &RecordedRequest| {
        let segments: Vec<&str> = request
            .target
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_start_matches("/api/v1/")
            .split('/')
            .collect();

        match segments.as_slice() {
            ["query", _, "execute"] => {
                let mut submitted = submitted.lock().unwrap();
                *submitted += 1;
                StubResponse::ok(json!({
                    "execution_id": format!("exec-{}", *submitted),
                    "state": "QUERY_STATE_PENDING"
                }))
            }
            ["execution", id, "status"] => {
                let script = script_for(&scripts, id);
                let mut calls = status_calls.lock().unwrap();
                let n = calls.entry(id.to_string()).or_insert(0);
                let state = script[(*n).min(script.len() - 1)];
                *n += 1;
                StubResponse::ok(json!({"execution_id": id, "state": state}))
            }
            ["execution", id, "results"] => StubResponse::ok(json!({
                "execution_id": id,
                "state": "QUERY_STATE_COMPLETED",
                "result": {
                    "rows": [
                        {"vault": "0xabc", "collateral": 2.5, "owner": null},
                        {"vault": "0xdef", "collateral": 10, "owner": "alice, bob"}
                    ],
                    "metadata": {"column_names": ["vault", "collateral", "owner"]}
                }
            })),
            ["execution", _, "cancel"] => StubResponse::ok(json!({"success": true})),
            _ => StubResponse::error(404, r#"{"error": "not found"}"#),
        }
    }
}

fn script_for<'a>(scripts: &'a [Vec<&'static str>], id: &str) -> &'a [&'static str] {
    let index: usize = id.trim_start_matches("exec-").parse().unwrap();
    &scripts[index - 1]
}

#[tokio::test]
async fn test_http_run_polls_to_completion_and_saves_csv() {
    let server = StubServer::start(dune_api(vec![vec![
        "QUERY_STATE_PENDING",
        "QUERY_STATE_EXECUTING",
        "QUERY_STATE_EXECUTING",
        "QUERY_STATE_COMPLETED",
    ]]))
    .await;

    let request = QueryRequest::new("2991576", PerformanceTier::Medium);
    let poller = Poller::new(Arc::new(http_client(&server)), request, fast_policy());
    let result = poller.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(result.row_count(), 2);

    let targets: Vec<String> = server
        .requests()
        .iter()
        .map(|r| format!("{} {}", r.method, r.target))
        .collect();
    assert_eq!(
        targets,
        vec![
            "POST /api/v1/query/2991576/execute?performance=medium",
            "GET /api/v1/execution/exec-1/status",
            "GET /api/v1/execution/exec-1/status",
            "GET /api/v1/execution/exec-1/status",
            "GET /api/v1/execution/exec-1/status",
            "GET /api/v1/execution/exec-1/results",
        ]
    );

    let dir = tempdir().unwrap();
    let path = dir.path().join("liquidations.csv");
    output::write_result(&result, &path, OutputFormat::Csv).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "vault,collateral,owner\n0xabc,2.5,\n0xdef,10,\"alice, bob\"\n"
    );
}

#[tokio::test]
async fn test_http_run_cancels_failed_execution_and_resubmits() {
    let server = StubServer::start(dune_api(vec![
        vec!["QUERY_STATE_EXECUTING", "QUERY_STATE_FAILED"],
        vec!["QUERY_STATE_COMPLETED"],
    ]))
    .await;

    let request = QueryRequest::new("2991576", PerformanceTier::Large);
    let poller = Poller::new(Arc::new(http_client(&server)), request, fast_policy());
    let result = poller.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(result.row_count(), 2);

    let requests = server.requests();
    let cancels: Vec<&str> = requests
        .iter()
        .filter(|r| r.target.ends_with("/cancel"))
        .map(|r| r.target.as_str())
        .collect();
    assert_eq!(cancels, vec!["/api/v1/execution/exec-1/cancel"]);
    assert_eq!(
        requests
            .iter()
            .filter(|r| r.target.contains("/execute"))
            .count(),
        2
    );
    assert!(requests
        .iter()
        .all(|r| r.api_key.as_deref() == Some("test-key")));
}

#[tokio::test]
async fn test_http_run_exhausts_attempts() {
    let server = StubServer::start(dune_api(vec![
        vec!["QUERY_STATE_FAILED"],
        vec!["QUERY_STATE_CANCELLED"],
    ]))
    .await;

    let request = QueryRequest::new("2991576", PerformanceTier::Small);
    let poller = Poller::new(
        Arc::new(http_client(&server)),
        request,
        fast_policy().with_max_attempts(2),
    );
    let err = poller.run(&CancellationToken::new()).await.unwrap_err();

    match err {
        DuneError::RetriesExhausted {
            attempts,
            last_state,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(last_state, "QUERY_STATE_CANCELLED");
        }
        other => panic!("Expected RetriesExhausted, got {:?}", other),
    }
}

fn rows() -> Vec<Row> {
    vec![serde_json::from_value(json!({"vault": "0xabc"})).unwrap()]
}

#[tokio::test]
async fn test_event_stream_for_a_retried_run() {
    let service = Arc::new(
        ScriptedQueryService::new()
            .with_execution(ScriptedExecution::failed())
            .with_execution(
                ScriptedExecution::new([ExecutionState::Pending, ExecutionState::Completed])
                    .with_rows(rows()),
            ),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let policy = fast_policy();
    let poller = Poller::new(
        service.clone(),
        QueryRequest::new("1", PerformanceTier::Medium),
        policy.clone(),
    )
    .with_events(tx);

    poller.run(&CancellationToken::new()).await.unwrap();
    drop(poller);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let first = ExecutionId::new("exec-1");
    let second = ExecutionId::new("exec-2");
    let failed = ExecutionState::Other("QUERY_STATE_FAILED".to_string());
    assert_eq!(
        events,
        vec![
            PollEvent::Submitted {
                attempt: 1,
                execution_id: first.clone()
            },
            PollEvent::State {
                execution_id: first.clone(),
                state: failed.clone()
            },
            PollEvent::Abandoned {
                execution_id: first.clone(),
                state: failed
            },
            PollEvent::Waiting {
                reason: WaitReason::Cooldown,
                duration: policy.cooldown_for(1)
            },
            PollEvent::Submitted {
                attempt: 2,
                execution_id: second.clone()
            },
            PollEvent::State {
                execution_id: second.clone(),
                state: ExecutionState::Pending
            },
            PollEvent::Waiting {
                reason: WaitReason::Pending,
                duration: policy.pending_interval
            },
            PollEvent::State {
                execution_id: second.clone(),
                state: ExecutionState::Completed
            },
            PollEvent::Completed {
                execution_id: second,
                rows: 1
            },
        ]
    );

    assert_eq!(
        service.count_calls(|c| matches!(c, ServiceCall::Cancel(_))),
        1
    );
    assert_eq!(service.calls()[2], ServiceCall::Cancel(first));
}

#[tokio::test]
async fn test_ctrl_c_style_cancellation_from_another_task() {
    let service = Arc::new(
        ScriptedQueryService::new().with_execution(ScriptedExecution::new([
            ExecutionState::Executing,
        ])),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let poller = Poller::new(
        service.clone(),
        QueryRequest::new("1", PerformanceTier::Medium),
        PollPolicy::default(),
    )
    .with_events(tx);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if matches!(event, PollEvent::Waiting { .. }) {
                trigger.cancel();
            }
        }
    });

    let err = poller.run(&cancel).await.unwrap_err();

    assert!(matches!(err, DuneError::Cancelled));
    assert_eq!(
        service.calls().last(),
        Some(&ServiceCall::Cancel(ExecutionId::new("exec-1")))
    );
}
