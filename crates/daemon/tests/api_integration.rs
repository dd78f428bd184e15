//! Integration tests for the admin HTTP surface.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use daemon::routes::views::AppState;
use metrics_exporter_prometheus::PrometheusHandle;
use mview::{ConfigLoader, InMemoryDatabase, MviewDeclarations, RefreshLock, ViewProcessor};
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

const VIEW: &str = "customer_grid";

async fn setup() -> (axum::Router, InMemoryDatabase) {
    let db = InMemoryDatabase::new();
    db.create_table(
        "customer",
        &["entity_id", "email", "updated_at"],
        Some("entity_id"),
    )
    .await
    .unwrap();

    let declarations = MviewDeclarations::from_json(
        &json!({
            "views": [{
                "id": VIEW,
                "group": "customers",
                "batch_size": 10,
                "grid": {
                    "table": VIEW,
                    "key_column": "entity_id",
                    "columns": {
                        "email": "customer.email",
                        "updated_at": "customer.updated_at"
                    }
                },
                "subscriptions": [{"name": "customer", "entity_column": "entity_id"}]
            }]
        })
        .to_string(),
    )
    .unwrap();
    let config = ConfigLoader::new().load(&declarations, &db).await.unwrap();
    let processor = ViewProcessor::new(db.clone(), Arc::new(config)).unwrap();
    processor.subscribe_all().await.unwrap();

    let state = Arc::new(AppState {
        processor: Arc::new(processor),
    });
    (daemon::create_app(state, get_metrics_handle()), db)
}

async fn insert_customer(db: &InMemoryDatabase, id: i64, email: &str) {
    let row = json!({
        "entity_id": id,
        "email": email,
        "updated_at": "2024-05-01 10:00:00"
    });
    db.insert("customer", row.as_object().unwrap().clone())
        .await
        .unwrap();
}

async fn send(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_check() {
    let (app, _db) = setup().await;

    let (status, json) = send(&app, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["views"], 1);
}

#[tokio::test]
async fn test_list_views_reports_lag() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;
    insert_customer(&db, 2, "b@example.com").await;

    let (status, json) = send(&app, "GET", "/views").await;

    assert_eq!(status, StatusCode::OK);
    let views = json.as_array().unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0]["view_id"], VIEW);
    assert_eq!(views[0]["group"], "customers");
    assert_eq!(views[0]["state"], "idle");
    assert_eq!(views[0]["checkpoint"], 0);
    assert_eq!(views[0]["changelog_head"], 2);
    assert_eq!(views[0]["lag"], 2);
}

#[tokio::test]
async fn test_get_unknown_view_returns_not_found() {
    let (app, _db) = setup().await;

    let (status, json) = send(&app, "GET", "/views/nope").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&app, "POST", "/views/nope/refresh").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refresh_applies_then_skips() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;

    let (status, json) = send(&app, "POST", &format!("/views/{VIEW}/refresh")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "refreshed");
    assert_eq!(json["upserted"], 1);
    assert_eq!(json["checkpoint"], 1);
    assert_eq!(db.grid_rows(VIEW).await.len(), 1);

    let (status, json) = send(&app, "POST", &format!("/views/{VIEW}/refresh")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "skipped");

    let (_, json) = send(&app, "GET", &format!("/views/{VIEW}")).await;
    assert_eq!(json["checkpoint"], 1);
    assert_eq!(json["lag"], 0);
    assert!(json["last_processed_at"].is_string());
}

#[tokio::test]
async fn test_reindex_rebuilds_grid() {
    let (app, db) = setup().await;
    for id in 1..=3 {
        insert_customer(&db, id, &format!("c{id}@example.com")).await;
    }

    let (status, json) = send(&app, "POST", &format!("/views/{VIEW}/reindex")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["upserted"], 3);
    assert_eq!(json["checkpoint"], 3);
    assert_eq!(db.grid_rows(VIEW).await.len(), 3);
}

#[tokio::test]
async fn test_locked_view_is_busy_or_conflict() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;
    let _held = db.try_lock_view(VIEW).await.unwrap().unwrap();

    let (status, json) = send(&app, "POST", &format!("/views/{VIEW}/refresh")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "busy");

    let (status, json) = send(&app, "POST", &format!("/views/{VIEW}/reindex")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains(VIEW));
    assert!(db.grid_rows(VIEW).await.is_empty());
}

#[tokio::test]
async fn test_refresh_by_group() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;

    let (status, json) = send(&app, "POST", "/refresh?group=orders").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["views"].as_array().unwrap().is_empty());
    assert!(db.grid_rows(VIEW).await.is_empty());

    let (status, json) = send(&app, "POST", "/refresh?group=customers").await;
    assert_eq!(status, StatusCode::OK);
    let views = json["views"].as_array().unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0]["view_id"], VIEW);
    assert_eq!(views[0]["outcome"], "refreshed");
    assert_eq!(db.grid_rows(VIEW).await.len(), 1);
}

#[tokio::test]
async fn test_refresh_all_lists_views_left_for_retry() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;
    db.fail_grid_writes(0, 1);

    let (status, json) = send(&app, "POST", "/refresh").await;

    assert_eq!(status, StatusCode::OK);
    let views = json["views"].as_array().unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0]["view_id"], VIEW);
    assert_eq!(views[0]["outcome"], "retry");
    assert!(views[0]["reason"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, db) = setup().await;
    insert_customer(&db, 1, "a@example.com").await;
    send(&app, "POST", &format!("/views/{VIEW}/refresh")).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("mview_rows_upserted"));
}
