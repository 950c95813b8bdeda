//! Axum router construction.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/encrypt/state", get(handlers::node_state))
        .route("/v1/encrypt/status", get(handlers::status))
        .route("/v1/encrypt/config", put(handlers::update_config))
        .route("/v1/encrypt/reload", post(handlers::reload))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use axum_test::TestServer;
    use common::protocol::{NodeState, ReloadResponse, StatusResponse};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (_dir, state) = AppState::for_tests();
        let app = build(state);
        let req = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn state_before_bootstrap_is_404() {
        let (_dir, state) = AppState::for_tests();
        let app = build(state);
        let req = Request::builder()
            .uri("/v1/encrypt/state")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn unconfigured_status_reports_disabled() {
        let (_dir, state) = AppState::for_tests();
        let server = TestServer::new(build(state)).unwrap();
        let resp = server.get("/v1/encrypt/status").await;
        resp.assert_status_ok();
        let body: StatusResponse = resp.json();
        assert!(body
            .summary
            .contains("Disabled, no configuration file found"));
    }

    #[tokio::test]
    async fn transitions_over_http() {
        let (_dir, state) = AppState::for_tests();
        state.controller.bootstrap().await.unwrap();
        let server = TestServer::new(build(state)).unwrap();

        let prepared: NodeState = server
            .put("/v1/encrypt/config")
            .json(&json!({ "stage": "prepare" }))
            .await
            .json();
        assert_eq!(prepared.stage.as_str(), "prepare");

        let again = server
            .put("/v1/encrypt/config")
            .json(&json!({ "stage": "prepare" }))
            .await;
        again.assert_status(axum::http::StatusCode::CONFLICT);

        let rotated: NodeState = server
            .put("/v1/encrypt/config")
            .json(&json!({ "stage": "rotate" }))
            .await
            .json();
        assert_eq!(rotated.stage.as_str(), "rotate");

        let status: StatusResponse = server.get("/v1/encrypt/status").await.json();
        assert!(status.summary.contains("Current Rotation Stage: rotate"));
        assert!(status.summary.contains("All hashes match"));

        let reload: ReloadResponse = server.post("/v1/encrypt/reload").await.json();
        assert!(!reload.adopted);
        assert_eq!(reload.state.config_hash, rotated.config_hash);
    }

    #[tokio::test]
    async fn malformed_body_and_unknown_stage_are_400() {
        let (_dir, state) = AppState::for_tests();
        state.controller.bootstrap().await.unwrap();
        let server = TestServer::new(build(state)).unwrap();

        server
            .put("/v1/encrypt/config")
            .json(&json!({ "stage": 7 }))
            .await
            .assert_status_bad_request();
        server
            .put("/v1/encrypt/config")
            .json(&json!({ "stage": "explode" }))
            .await
            .assert_status_bad_request();
    }
}
