//! HTTP relay against an in-process fake print server.

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use preprint_service::relay::{deliver, ArtifactRelay, HttpRelay, RelayError, RelayMetadata, RelayTarget};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

#[derive(Default)]
struct Received {
    api_key: Option<String>,
    file_name: Option<String>,
    file_len: usize,
    tweak_option: Option<String>,
}

type Shared = Arc<Mutex<Received>>;

async fn upload(State(received): State<Shared>, headers: HeaderMap, mut multipart: Multipart) -> StatusCode {
    let mut record = Received {
        api_key: headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Received::default()
    };
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name().unwrap_or_default() {
            "file" => {
                record.file_name = field.file_name().map(str::to_string);
                record.file_len = field.bytes().await.unwrap().len();
            }
            "tweak_option" => record.tweak_option = Some(field.text().await.unwrap()),
            _ => {}
        }
    }
    *received.lock().unwrap() = record;
    StatusCode::CREATED
}

async fn spawn_server(received: Shared) -> String {
    let app = Router::new()
        .route("/api/files/local", post(upload))
        .route("/broken/api/files/local", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/api/version", get(|| async { "{}" }))
        .with_state(received);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn metadata() -> RelayMetadata {
    RelayMetadata {
        artifact_name: "demo_withPPS.gcode".to_string(),
        tweak_option: "tweak_keep".to_string(),
    }
}

#[tokio::test]
async fn test_upload_succeeds() {
    let received = Shared::default();
    let base = spawn_server(received.clone()).await;
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("demo_withPPS.gcode");
    std::fs::write(&artifact, b"G28\n").unwrap();

    let relay = HttpRelay::new(Duration::from_secs(5)).unwrap();
    let target = RelayTarget::new(base, Some("SECRET".to_string()));
    let report = deliver(&relay, &target, &artifact, &metadata()).await;

    assert!(report.ok, "{}", report.message);
    assert_eq!(report.status, Some(201));
    let received = received.lock().unwrap();
    assert_eq!(received.api_key.as_deref(), Some("SECRET"));
    assert_eq!(received.file_name.as_deref(), Some("demo_withPPS.gcode"));
    assert_eq!(received.file_len, 4);
    assert_eq!(received.tweak_option.as_deref(), Some("tweak_keep"));
}

#[tokio::test]
async fn test_rejected_upload_is_reported() {
    let base = spawn_server(Shared::default()).await;
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("demo_withPPS.gcode");
    std::fs::write(&artifact, b"G28\n").unwrap();

    let relay = HttpRelay::new(Duration::from_secs(5)).unwrap();
    let target = RelayTarget::new(format!("{base}/broken"), None);
    let err = relay.upload(&target, &artifact, &metadata()).await.unwrap_err();
    assert!(matches!(err, RelayError::Rejected { status: 500, .. }));

    let report = deliver(&relay, &target, &artifact, &metadata()).await;
    assert!(!report.ok);
    assert_eq!(report.status, Some(500));
}

#[tokio::test]
async fn test_unreachable_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("demo.stl");
    std::fs::write(&artifact, b"solid").unwrap();

    let relay = HttpRelay::new(Duration::from_secs(2)).unwrap();
    let target = RelayTarget::new(format!("http://{addr}"), None);
    let err = relay.upload(&target, &artifact, &metadata()).await.unwrap_err();
    assert!(matches!(err, RelayError::Unreachable { .. }));
    assert!(!relay.check_connection(&format!("http://{addr}/api/version")).await);
}

#[tokio::test]
async fn test_missing_artifact() {
    let relay = HttpRelay::new(Duration::from_secs(2)).unwrap();
    let target = RelayTarget::new("http://127.0.0.1:9", None);
    let err = relay
        .upload(&target, std::path::Path::new("/no/such/file.gcode"), &metadata())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Artifact { .. }));
}

#[tokio::test]
async fn test_check_connection() {
    let base = spawn_server(Shared::default()).await;
    let relay = HttpRelay::new(Duration::from_secs(5)).unwrap();
    assert!(relay.check_connection(&format!("{base}/api/version")).await);
    assert!(!relay.check_connection(&format!("{base}/missing")).await);
}
