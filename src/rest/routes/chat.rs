// rest/routes/chat.rs — dispatch, reset, and history routes.
//
// This is the boundary where rendering concerns meet the controller: every
// DispatchOutcome variant maps to exactly one response shape, so the front
// end can always tell the user what happened.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dispatch::DispatchOutcome;
use crate::gateway::GatewayError;
use crate::identity;
use crate::AppContext;

const BUSY_MESSAGE: &str =
    "A reply is still being generated for this session. Please wait for it to finish.";
const RATE_LIMITED_MESSAGE: &str =
    "You're sending messages too quickly. Please wait a moment and try again.";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

pub async fn chat(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message must not be empty", "kind": "bad_request" })),
        ));
    }
    if body.session_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "sessionId must not be empty", "kind": "bad_request" })),
        ));
    }

    let identity = identity::resolve(&headers, Some(peer));
    let outcome = ctx
        .dispatcher
        .handle(&body.session_id, &identity, &body.message)
        .await;

    match outcome {
        DispatchOutcome::Reply(message) => Ok(Json(json!({
            "reply": message.content,
            "timestamp": message.timestamp,
        }))),
        DispatchOutcome::Failed(err) => Err((
            failure_status(&err),
            Json(json!({ "error": err.to_string(), "kind": err.kind() })),
        )),
        DispatchOutcome::RateLimited => {
            let retry_after = ctx.dispatcher.limiter().retry_after_secs(&identity).await;
            Err((
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": RATE_LIMITED_MESSAGE,
                    "kind": "rate_limited",
                    "retryAfterSecs": retry_after,
                })),
            ))
        }
        DispatchOutcome::Busy => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": BUSY_MESSAGE, "kind": "busy" })),
        )),
    }
}

fn failure_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::ServerOverloaded => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::ConnectionUnavailable
        | GatewayError::ServerError(_)
        | GatewayError::Unknown => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub session_id: Option<String>,
}

pub async fn reset(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ResetRequest>,
) -> Json<Value> {
    let new_id = ctx
        .dispatcher
        .sessions()
        .reset(body.session_id.as_deref())
        .await;
    Json(json!({ "sessionId": new_id }))
}

pub async fn history(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.dispatcher.sessions().get(&id).await {
        Some(session) => Ok(Json(json!({
            "sessionId": id,
            "messages": session.history().await,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Session not found", "kind": "not_found" })),
        )),
    }
}
