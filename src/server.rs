//! HTTP surface of the engine.
//!
//! | method | path                     | body                                  |
//! |--------|--------------------------|---------------------------------------|
//! | POST   | `/callbacks`             | [`CallbackPayload`]                   |
//! | POST   | `/approvals/{id}`        | `{decision, comment, decided_by?}`    |
//! | GET    | `/runs/{id}`             |                                       |
//! | POST   | `/runs/{id}/cancel`      |                                       |
//! | POST   | `/workflows/{id}/runs`   | run input, `{}` when empty            |

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    Engine, OrchflowError, RejectReason, Result,
    hitl::Decision,
    ingress::CallbackPayload,
};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/callbacks", post(callback))
        .route("/approvals/{id}", post(decide))
        .route("/runs/{id}", get(run_status))
        .route("/runs/{id}/cancel", post(cancel))
        .route("/workflows/{id}/runs", post(start_run))
        .with_state(engine)
}

/// Serve the router until the listener fails.
pub async fn serve(
    engine: Arc<Engine>,
    addr: SocketAddr,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.0,
            Json(json!({
                "ok": false,
                "error": self.1,
            })),
        )
            .into_response()
    }
}

impl From<RejectReason> for ApiError {
    fn from(reason: RejectReason) -> Self {
        let status = match reason {
            RejectReason::UnknownRun => StatusCode::NOT_FOUND,
            RejectReason::SecretMismatch => StatusCode::UNAUTHORIZED,
            RejectReason::AlreadyTerminal => StatusCode::CONFLICT,
            RejectReason::MalformedPayload => StatusCode::BAD_REQUEST,
            RejectReason::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError(status, reason.to_string())
    }
}

impl From<OrchflowError> for ApiError {
    fn from(error: OrchflowError) -> Self {
        let status = match &error {
            OrchflowError::Callback(reason) => return (*reason).into(),
            OrchflowError::Compile(_) | OrchflowError::Validation(_) | OrchflowError::Convert(_) => StatusCode::BAD_REQUEST,
            OrchflowError::Approval(_) => StatusCode::CONFLICT,
            OrchflowError::Run(_) => StatusCode::NOT_FOUND,
            OrchflowError::Engine(_) | OrchflowError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, error.to_string())
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

async fn callback(
    State(engine): State<Arc<Engine>>,
    body: Bytes,
) -> ApiResult {
    let payload: CallbackPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "undecodable callback body");
        ApiError::from(RejectReason::MalformedPayload)
    })?;
    let ack = engine.receive_callback(payload)?;
    Ok(Json(json!({
        "ok": true,
        "duplicate": ack.duplicate,
    })))
}

#[derive(Deserialize)]
struct DecisionBody {
    decision: Decision,
    #[serde(default)]
    comment: String,
    #[serde(default = "default_reviewer")]
    decided_by: String,
}

fn default_reviewer() -> String {
    "anonymous".to_string()
}

async fn decide(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let body: DecisionBody = serde_json::from_slice(&body).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let request = engine.decide(&id, body.decision, &body.comment, &body.decided_by)?;
    Ok(Json(serde_json::to_value(request).map_err(OrchflowError::from)?))
}

async fn run_status(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult {
    let run = engine.status(&id)?;
    Ok(Json(serde_json::to_value(run).map_err(OrchflowError::from)?))
}

async fn cancel(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult {
    engine.cancel(&id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn start_run(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let input = if body.is_empty() { json!({}) } else { serde_json::from_slice(&body).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))? };
    let run_id = engine.start_run(&id, input)?;
    Ok(Json(json!({ "run_id": run_id })))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        EngineBuilder, WorkflowModel,
        gateway::{AgentRuntime, DispatchRequest},
        runtime::RunStatus,
    };

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<DispatchRequest>>,
    }

    #[async_trait]
    impl AgentRuntime for Recorder {
        async fn dispatch(
            &self,
            request: &DispatchRequest,
        ) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn abort(
            &self,
            _agent_run_id: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn engine(recorder: Arc<Recorder>) -> Arc<Engine> {
        let engine = EngineBuilder::new().async_worker_thread_number(2).agent_runtime(recorder).build().unwrap();
        engine.launch();
        let model = WorkflowModel::from_json(
            r#"{
                "id": "wf", "name": "single",
                "nodes": [
                    { "id": "start", "type": "trigger" },
                    { "id": "a", "type": "agent", "config": { "agent_id": "writer" } }
                ],
                "edges": [{ "source": "start", "target": "a" }]
            }"#,
        )
        .unwrap();
        engine.deploy(&model).unwrap();
        Arc::new(engine)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).header("content-type", "application/json").body(Body::from(body.to_string())).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(v) = f() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_run_through_http() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine(recorder.clone());
        let app = router(engine.clone());

        engine.runtime().block_on(async {
            let (status, body) = call(&app, "POST", "/workflows/wf/runs", json!({ "topic": "rust" })).await;
            assert_eq!(status, StatusCode::OK);
            let run_id = body["run_id"].as_str().unwrap().to_string();

            let request = wait_for(|| recorder.requests.lock().unwrap().first().cloned()).await;
            assert_eq!(request.input, json!({ "topic": "rust" }));

            let forged = json!({ "run_id": request.run_id, "status": "completed", "output": {}, "secret": "forged" });
            let (status, body) = call(&app, "POST", "/callbacks", forged).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["error"], "secret_mismatch");

            let valid = json!({ "run_id": request.run_id, "status": "completed", "output": { "text": "done" }, "secret": request.secret });
            let (status, body) = call(&app, "POST", "/callbacks", valid.clone()).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["duplicate"], false);
            let (_, body) = call(&app, "POST", "/callbacks", valid).await;
            assert_eq!(body["duplicate"], true);

            let run = wait_for(|| engine.status(&run_id).ok().filter(|r| r.status == RunStatus::Succeeded)).await;
            assert_eq!(run.output, Some(json!({ "text": "done" })));
            let (status, body) = call(&app, "GET", &format!("/runs/{}", run_id), Value::Null).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "succeeded");

            // cancelling a finished run is a no-op
            let (status, _) = call(&app, "POST", &format!("/runs/{}/cancel", run_id), Value::Null).await;
            assert_eq!(status, StatusCode::OK);
        });
        engine.shutdown();
    }

    #[test]
    fn test_rejections() {
        let engine = engine(Arc::new(Recorder::default()));
        let app = router(engine.clone());

        engine.runtime().block_on(async {
            let (status, body) = call(&app, "POST", "/callbacks", json!({ "run_id": "nope", "status": "completed", "secret": "s" })).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "unknown_run");

            let (status, body) = call(&app, "POST", "/callbacks", json!({ "status": "done" })).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "malformed_payload");

            let (status, _) = call(&app, "GET", "/runs/nope", Value::Null).await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (status, _) = call(&app, "POST", "/workflows/ghost/runs", json!({})).await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (status, _) = call(&app, "POST", "/approvals/nope", json!({ "decision": "approve", "comment": "ok" })).await;
            assert_eq!(status, StatusCode::CONFLICT);
        });
        engine.shutdown();
    }
}
