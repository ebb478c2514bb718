//! Ops endpoints, driven through the router without a socket.

mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use common::{a, txt_registry, StaticSource};
use dns_reconciler::{
    controller::{Controller, ControllerSettings},
    domain_filter::DomainFilter,
    handlers::{router, AppState},
    leader::AlwaysLeader,
    provider::InMemoryProvider,
    registry::Registry,
    source::Source,
};

fn controller() -> Controller {
    Controller::new(
        ControllerSettings::default(),
        vec![StaticSource::new("static", vec![a("web.example.com", "10.0.0.1")]) as Arc<dyn Source>],
        vec![txt_registry(Arc::new(InMemoryProvider::new("example.com"))) as Arc<dyn Registry>],
        Arc::new(AlwaysLeader),
    )
}

fn app(controller: &Controller) -> Router {
    let filter = DomainFilter::new(&["example.com".to_string()], &[]).unwrap();
    router(AppState::new(controller.clone(), filter))
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn healthz_is_ok() {
    let (status, body) = send(app(&controller()), "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn root_lists_filter_and_zones() {
    let (status, body) = send(app(&controller()), "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filter"]["include"][0], "example.com");
    assert_eq!(body["zones"][0], "example.com");
}

#[tokio::test]
async fn changes_404_until_a_cycle_finishes() {
    let controller = controller();

    let (status, body) = send(app(&controller), "GET", "/changes").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    controller.run_once().await;

    let (status, body) = send(app(&controller), "GET", "/changes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cycle"], 1);
    let zone = &body["zones"][0];
    assert_eq!(zone["zone"], "example.com");
    assert_eq!(zone["outcome"]["status"], "applied");
    assert_eq!(zone["changes"]["create"][0]["dnsName"], "web.example.com");
}

#[tokio::test]
async fn trigger_is_accepted() {
    let (status, _) = send(app(&controller()), "POST", "/trigger").await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
