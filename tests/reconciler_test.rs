//! End-to-end reconciliation over the push stream, the shared connection
//! and the HTTP store.

use std::sync::Arc;
use std::time::Duration;

use opsdeck::auth::{ApiClient, TokenPair, TokenStore};
use opsdeck::connection::memory::MemoryConnection;
use opsdeck::deployment::reconciler::{JOIN, LOG, STATUS};
use opsdeck::deployment::{
    DeploymentReconciler, DeploymentStatus, HttpDeploymentStore, PushStream, ReconcilerOptions,
    ReconcilerUpdate, Source,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMESTAMP: &str = "2024-03-01T12:00:00Z";

fn client(server: &MockServer) -> ApiClient {
    let tokens = TokenStore::with_pair(TokenPair::new("acc".into(), "ref".into()));
    ApiClient::new(&server.uri(), tokens)
}

async fn mount_record(server: &MockServer, status: &str) {
    Mock::given(method("GET"))
        .and(path("/api/deployments/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 9, "status": status })))
        .mount(server)
        .await;
}

async fn mount_history(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/deployments/9/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 9, "status": "running", "branch": "main" },
            { "id": 8, "status": "failed" }
        ])))
        .mount(server)
        .await;
}

async fn next(reconciler: &mut DeploymentReconciler) -> ReconcilerUpdate {
    tokio::time::timeout(Duration::from_secs(5), reconciler.next_update())
        .await
        .expect("update in time")
        .expect("reconciler still live")
}

#[tokio::test]
async fn test_line_on_both_channels_is_shown_once() {
    let server = MockServer::start().await;
    mount_record(&server, "building").await;
    mount_history(&server).await;
    let line = format!(
        "retry: 60000\nevent: log\ndata: {}\n\n",
        json!({ "text": "Step 1/4", "severity": "info", "timestamp": TIMESTAMP })
    );
    Mock::given(method("GET"))
        .and(path("/api/deployments/9/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(line),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let conn = MemoryConnection::new();
    let mut reconciler = DeploymentReconciler::attach(
        "9",
        conn.clone(),
        Arc::new(HttpDeploymentStore::new(client.clone())),
        Some(PushStream::open(client, "9")),
        ReconcilerOptions::default(),
    )
    .await;

    assert_eq!(
        next(&mut reconciler).await,
        ReconcilerUpdate::Status { status: DeploymentStatus::Building, source: Source::Reconcile }
    );
    assert_eq!(conn.emitted_named(JOIN), vec![json!({ "deploymentId": "9" })]);

    conn.deliver(
        LOG,
        json!({ "deploymentId": 9, "text": "Step 1/4", "severity": "info", "timestamp": TIMESTAMP }),
    );
    // Another deployment's line on the shared connection is ignored.
    conn.deliver(
        LOG,
        json!({ "deploymentId": 10, "text": "other", "severity": "info", "timestamp": TIMESTAMP }),
    );

    match next(&mut reconciler).await {
        ReconcilerUpdate::Log(entry) => assert_eq!(entry.text, "Step 1/4"),
        other => panic!("expected log, got {other:?}"),
    }

    conn.deliver(STATUS, json!({ "deploymentId": "9", "status": "running" }));
    let mut updates = Vec::new();
    loop {
        let update = next(&mut reconciler).await;
        let done = matches!(update, ReconcilerUpdate::HistoryRefreshed(_));
        updates.push(update);
        if done {
            break;
        }
    }

    assert!(updates.contains(&ReconcilerUpdate::Status {
        status: DeploymentStatus::Running,
        source: Source::Socket,
    }));
    assert!(!updates.iter().any(|u| matches!(u, ReconcilerUpdate::Log(_))));
    assert_eq!(reconciler.state().logs().len(), 1);
    assert!(!reconciler.state().is_in_progress());
    assert_eq!(reconciler.history().len(), 2);
    assert_eq!(reconciler.history()[0].branch.as_deref(), Some("main"));
}

#[tokio::test]
async fn test_rejoins_once_per_reconnect_while_in_progress() {
    let server = MockServer::start().await;
    mount_record(&server, "deploying").await;
    mount_history(&server).await;

    let conn = MemoryConnection::new();
    let mut reconciler = DeploymentReconciler::attach(
        "9",
        conn.clone(),
        Arc::new(HttpDeploymentStore::new(client(&server))),
        None,
        ReconcilerOptions::default(),
    )
    .await;
    assert!(matches!(next(&mut reconciler).await, ReconcilerUpdate::Status { .. }));

    for expected_joins in 2..=3 {
        conn.simulate_drop();
        conn.simulate_reconnect();
        assert_eq!(next(&mut reconciler).await, ReconcilerUpdate::Rejoined);
        assert_eq!(conn.emitted_named(JOIN).len(), expected_joins);
    }

    conn.deliver(STATUS, json!({ "deploymentId": "9", "status": "stopped" }));
    assert!(matches!(next(&mut reconciler).await, ReconcilerUpdate::Status { .. }));
    assert!(matches!(next(&mut reconciler).await, ReconcilerUpdate::HistoryRefreshed(_)));

    // Finished deployments do not re-join.
    conn.simulate_drop();
    conn.simulate_reconnect();
    let quiet = tokio::time::timeout(Duration::from_millis(200), reconciler.next_update()).await;
    assert!(quiet.is_err());
    assert_eq!(conn.emitted_named(JOIN).len(), 3);
}

#[tokio::test]
async fn test_idle_reconciliation_picks_up_redeploy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/deployments/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 9, "status": "running" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_record(&server, "pending").await;
    mount_history(&server).await;

    let conn = MemoryConnection::new();
    let options = ReconcilerOptions {
        reconcile_interval: Duration::from_millis(100),
        ..ReconcilerOptions::default()
    };
    let mut reconciler = DeploymentReconciler::attach(
        "9",
        conn.clone(),
        Arc::new(HttpDeploymentStore::new(client(&server))),
        None,
        options,
    )
    .await;

    assert!(conn.emitted_named(JOIN).is_empty());
    assert_eq!(
        next(&mut reconciler).await,
        ReconcilerUpdate::Status { status: DeploymentStatus::Running, source: Source::Reconcile }
    );
    assert!(matches!(next(&mut reconciler).await, ReconcilerUpdate::HistoryRefreshed(_)));

    assert_eq!(
        next(&mut reconciler).await,
        ReconcilerUpdate::Status { status: DeploymentStatus::Pending, source: Source::Reconcile }
    );
    assert_eq!(next(&mut reconciler).await, ReconcilerUpdate::Rejoined);
    assert!(reconciler.state().is_in_progress());
    assert_eq!(conn.emitted_named(JOIN).len(), 1);
}
