use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::fakes::{FakeChat, FakeEmbedder};
use super::Fixture;
use crate::app::App;
use crate::web::router;

/// block_in_place needs the multi thread scheduler
fn call(app: Arc<App>, request: Request<Body>) -> (StatusCode, Value) {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move {
            let response = router(app).oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test]
fn test_get_product() {
    let fixture = Fixture::new();

    let (status, body) = call(Arc::new(fixture.app()), get("/product/papel%20toalha"));

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["targetProduct"], "papel toalha");
    assert_eq!(body["matches"].as_array().unwrap().len(), 2);
    assert_eq!(body["matches"][0]["similarity"], json!(0.9));
}

#[test]
fn test_get_product_without_match() {
    let fixture = Fixture::new();

    let (status, body) = call(Arc::new(fixture.app()), get("/product/xyz"));

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"targetProduct": "xyz", "matches": []}));
}

#[test]
fn test_blank_target_is_bad_request() {
    let fixture = Fixture::new();
    let app = Arc::new(fixture.app());

    for uri in ["/product/%20%20", "/product/"] {
        let (status, body) = call(app.clone(), get(uri));
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body, json!({"error": "No target product provided."}));
    }
}

#[test]
fn test_bulk_products() {
    let fixture = Fixture::new();

    let (status, body) = call(
        Arc::new(fixture.app()),
        post("/products", json!(["detergente neutro", " ", "luva"])),
    );

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["matches"][0]["itemName"], "DETERGENTE NEUTRO 5L");
    assert_eq!(body[1], json!({"error": "No target product provided."}));
    assert_eq!(body[2]["targetProduct"], "luva");
}

#[test]
fn test_bulk_rejects_non_list_body() {
    let fixture = Fixture::new();

    let (status, _) = call(Arc::new(fixture.app()), post("/products", json!({"target": "x"})));

    assert!(status.is_client_error(), "{status}");
}

#[test]
fn test_admin_reindex_and_reload() {
    let fixture = Fixture::new();
    let app = Arc::new(fixture.app());

    let (status, body) = call(app.clone(), post("/admin/reindex", Value::Null));
    assert_eq!(status, StatusCode::OK);
    assert!(body["chunks"].as_u64().unwrap() > 0);
    assert!(app.index().is_ready());

    let (status, _) = call(app.clone(), post("/admin/reload", Value::Null));
    assert_eq!(status, StatusCode::OK);
    assert!(!app.index().is_ready());
}

#[test]
fn test_admin_invalidate_drops_store_and_index() {
    let fixture = Fixture::new();
    let app = Arc::new(fixture.app());
    app.reindex().unwrap();
    assert!(app.index().storage().exists());

    let (status, body) = call(app.clone(), post("/admin/invalidate", Value::Null));

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"invalidated": true}));
    assert!(!app.index().is_ready());
    assert!(!app.index().storage().exists());
}

#[test]
fn test_malformed_model_output_is_bad_gateway() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering("<html>"));

    let (status, body) = call(Arc::new(fixture.app()), get("/product/papel"));

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("not valid JSON"));
}

#[test]
fn test_exhausted_quota_is_too_many_requests() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::new().failing_first(100));

    let (status, _) = call(Arc::new(fixture.app()), get("/product/papel"));

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[test]
fn test_deadline_is_gateway_timeout() {
    let mut fixture = Fixture::new();
    fixture.config.search.query_timeout_secs = 0;

    let (status, _) = call(Arc::new(fixture.app()), get("/product/papel"));

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[test]
fn test_empty_catalog_is_internal_error() {
    let fixture = Fixture::new();
    fixture.write_catalog(&[]);

    let (status, body) = call(Arc::new(fixture.app()), get("/product/papel"));

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}
