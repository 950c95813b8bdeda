//! Axum request handlers for all node endpoints.
//!
//! Transitions run on their own task and the handler only awaits it. A client
//! that disconnects or times out cannot interrupt a transition between its
//! local save and its marker publish.

use std::future::Future;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    EncryptionRequest, ErrorResponse, HealthResponse, NodeState, ReloadResponse,
    StatusResponse, ROTATE_KEYS,
};
use common::{EncryptionError, Stage};
use tracing::{error, info, warn};

use super::state::AppState;
use crate::rotation::ReencryptOptions;

/// Map an [`EncryptionError`] to its status code and JSON body.
pub fn error_response(e: EncryptionError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    (status, Json(ErrorResponse::new(e.code(), e.to_string()))).into_response()
}

/// Run `fut` to completion on a separate task.
async fn detached<F, T>(fut: F) -> Result<T, EncryptionError>
where
    F: Future<Output = Result<T, EncryptionError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut).await.map_err(|e| {
        error!(error = %e, "transition task aborted");
        EncryptionError::Unavailable("transition task aborted".into())
    })?
}

/// `GET /health`: `200` once this node has a configuration and a loaded
/// keyring, `503` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let config_loaded =
        state.controller.local_state().await.is_ok() && state.controller.keyring().is_ready();
    let (status_code, status_str) = if config_loaded {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = HealthResponse {
        status: status_str.into(),
        config_loaded,
    };
    (status_code, Json(body)).into_response()
}

/// `GET /v1/encrypt/state`: this node's own view. Polled by peers.
pub async fn node_state(State(state): State<AppState>) -> Response {
    match state.controller.local_state().await {
        Ok(s) => Json(s).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/encrypt/status`: cluster report across this node and its peers.
pub async fn status(State(state): State<AppState>) -> Response {
    match state
        .verifier
        .status(state.local.clone(), state.peers.as_slice())
        .await
    {
        Ok(report) => {
            let summary = report.render();
            Json(StatusResponse { report, summary }).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `PUT /v1/encrypt/config`: request a stage transition or toggle encryption.
///
/// `reencrypt_active` answers `202 Accepted` as soon as the stage is
/// persisted; the pass itself continues in the background.
pub async fn update_config(
    State(state): State<AppState>,
    payload: Result<Json<EncryptionRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return error_response(EncryptionError::BadRequest(rejection.body_text()));
        }
    };
    let controller = state.controller.clone();
    let force = req.force;

    let result: Result<NodeState, EncryptionError> = match (req.stage.as_deref(), req.enable) {
        (Some(_), Some(_)) | (None, None) => Err(EncryptionError::BadRequest(
            "exactly one of stage or enable must be set".into(),
        )),
        (None, Some(true)) => detached(async move { controller.enable().await }).await,
        (None, Some(false)) => detached(async move { controller.disable().await }).await,
        (Some(ROTATE_KEYS), None) => detached(async move { controller.rotate_keys().await }).await,
        (Some(stage), None) => match stage.parse::<Stage>() {
            Ok(Stage::Prepare) => detached(async move { controller.prepare(force).await }).await,
            Ok(Stage::Rotate) => detached(async move { controller.rotate(force).await }).await,
            Ok(Stage::ReencryptActive) => {
                let opts = ReencryptOptions {
                    force,
                    skip: req.skip,
                };
                let started = detached(async move {
                    controller.start_reencrypt(opts).await.map(|(s, _)| s)
                })
                .await;
                return match started {
                    Ok(s) => {
                        info!(skip = opts.skip, force, "re-encryption started in background");
                        (StatusCode::ACCEPTED, Json(s)).into_response()
                    }
                    Err(e) => error_response(e),
                };
            }
            Ok(other) => Err(EncryptionError::BadRequest(format!(
                "stage {other} cannot be requested"
            ))),
            Err(e) => Err(EncryptionError::BadRequest(e)),
        },
    };

    match result {
        Ok(s) => Json(s).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /v1/encrypt/reload`: converge on the published marker.
pub async fn reload(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    let result = detached(async move {
        let adopted = controller.reload().await?;
        let state = controller.local_state().await?;
        Ok(ReloadResponse { adopted, state })
    })
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(e),
    }
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn error_response_uses_error_status_and_code() {
        let resp = error_response(EncryptionError::IllegalTransition("nope".into()));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "illegal_transition");
    }

    #[tokio::test]
    async fn health_is_degraded_before_bootstrap() {
        let (_dir, state) = AppState::for_tests();
        let resp = health(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.controller.bootstrap().await.unwrap();
        let resp = health(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["config_loaded"], true);
    }

    #[tokio::test]
    async fn conflicting_request_is_bad_request() {
        let (_dir, state) = AppState::for_tests();
        state.controller.bootstrap().await.unwrap();
        let req = EncryptionRequest {
            stage: Some("prepare".into()),
            enable: Some(true),
            ..Default::default()
        };
        let resp = update_config(State(state), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn finished_stage_cannot_be_requested() {
        let (_dir, state) = AppState::for_tests();
        state.controller.bootstrap().await.unwrap();
        let req = EncryptionRequest {
            stage: Some("reencrypt_finished".into()),
            ..Default::default()
        };
        let resp = update_config(State(state), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reencrypt_is_accepted_and_finishes() {
        let (_dir, state) = AppState::for_tests();
        let c = state.controller.clone();
        c.bootstrap().await.unwrap();
        c.prepare(false).await.unwrap();
        c.rotate(false).await.unwrap();

        let req = EncryptionRequest {
            stage: Some("reencrypt_active".into()),
            ..Default::default()
        };
        let resp = update_config(State(state), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["stage"], "reencrypt_active");

        // The background pass holds the lock; a reload waits for it.
        c.reload().await.unwrap();
        assert_eq!(c.local_state().await.unwrap().stage, Stage::ReencryptFinished);
    }
}
