//! HTTP driver tests against a mock server.
//!
//! Covers the provider instance API and the job queue API as the daemon uses
//! them: request shapes, auth, and how error statuses are classified.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_node_manager::cloud::{
    CloudDriver, CloudError, HttpCloud, InstanceId, InstanceState, TAG_NODE_ID, TAG_OWNER, TAG_SIZE,
};
use fleet_node_manager::queue::{HttpQueue, JobQueue, QueueError};
use fleet_node_manager::size::NodeSize;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn small() -> NodeSize {
    NodeSize {
        name: "small".into(),
        cores: 2,
        ram_mb: 4096,
        scratch_mb: 50_000,
        price: 0.10,
        instance_type: Some("c2.small".into()),
    }
}

fn cloud(server: &MockServer) -> HttpCloud {
    HttpCloud::new(server.uri(), Some("secret".into()), TIMEOUT).unwrap()
}

// =============================================================================
// Cloud driver
// =============================================================================

#[tokio::test]
async fn test_list_instances() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"id": "i-1", "state": "running", "tags": {"fleet-owner": "fleet", "fleet-size": "small"}},
                {"id": "i-2", "state": "pending"}
            ]
        })))
        .mount(&server)
        .await;

    let instances = cloud(&server).list().await.unwrap();

    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].id, InstanceId::new("i-1"));
    assert_eq!(instances[0].owner(), Some("fleet"));
    assert_eq!(instances[1].state, InstanceState::Pending);
    assert!(instances[1].tags.is_empty());
}

#[tokio::test]
async fn test_create_sends_client_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .and(body_partial_json(json!({
            "instance_type": "c2.small",
            "client_token": "node_01"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "i-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let tags = BTreeMap::from([
        (TAG_OWNER.to_string(), "fleet".to_string()),
        (TAG_NODE_ID.to_string(), "node_01".to_string()),
        (TAG_SIZE.to_string(), "small".to_string()),
    ]);
    let id = cloud(&server).create(&small(), &tags).await.unwrap();

    assert_eq!(id, InstanceId::new("i-42"));
}

#[tokio::test]
async fn test_destroy_missing_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/instances/i-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = cloud(&server).destroy(&InstanceId::new("i-gone")).await.unwrap_err();
    assert!(matches!(err, CloudError::NotFound(id) if id.as_str() == "i-gone"));
}

#[tokio::test]
async fn test_destroy_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/instances/i-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    cloud(&server).destroy(&InstanceId::new("i-1")).await.unwrap();
}

#[tokio::test]
async fn test_throttle_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let err = cloud(&server).list().await.unwrap_err();
    assert!(matches!(
        err,
        CloudError::RateLimited {
            retry_after: Some(d)
        } if d == Duration::from_secs(3)
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = cloud(&server).create(&small(), &BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, CloudError::Transient(ref msg) if msg.contains("overloaded")));
}

#[tokio::test]
async fn test_quota_error_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let err = cloud(&server).create(&small(), &BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, CloudError::Terminal(_)));
    assert!(!err.is_retryable());
}

// =============================================================================
// Job queue
// =============================================================================

#[tokio::test]
async fn test_queue_lists_jobs_and_busy_nodes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs"))
        .and(query_param("state", "queued"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [
                {"id": "job-1", "cores": 4, "ram_mb": 8192, "scratch_mb": 0},
                {"id": "job-2", "cores": 1, "ram_mb": 512, "scratch_mb": 100, "node_count": 3}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs"))
        .and(query_param("state", "running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [
                {"id": "job-9", "node": "i-7"},
                {"id": "job-10", "node": "i-7"},
                {"id": "job-11", "node": null}
            ]
        })))
        .mount(&server)
        .await;

    let queue = HttpQueue::new(server.uri(), None, TIMEOUT).unwrap();

    let jobs = queue.list_queued_jobs().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, "job-1");
    assert_eq!(jobs[0].node_count, 1);
    assert_eq!(jobs[1].node_count, 3);

    let busy = queue.busy_nodes().await.unwrap();
    assert_eq!(busy.into_iter().collect::<Vec<_>>(), vec![InstanceId::new("i-7")]);
}

#[tokio::test]
async fn test_queue_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .mount(&server)
        .await;

    let queue = HttpQueue::new(server.uri(), None, TIMEOUT).unwrap();
    let err = queue.list_queued_jobs().await.unwrap_err();

    assert!(matches!(err, QueueError::Status { status: 500, ref body } if body == "db down"));
}

#[tokio::test]
async fn test_queue_unreachable() {
    // Nothing listens on port 9 locally.
    let queue = HttpQueue::new("http://127.0.0.1:9", None, TIMEOUT).unwrap();
    let err = queue.busy_nodes().await.unwrap_err();

    assert!(matches!(err, QueueError::Unreachable(_)));
}
