use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use hook_signature::{Authenticator, SIGNATURE_HEADER};
use tracing::Instrument;
use uuid::Uuid;

use crate::runner::CommandRunner;

/// Anything bigger is not a plausible webhook payload.
pub(crate) const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    authenticator: Arc<Authenticator>,
    runner: Arc<dyn CommandRunner>,
    max_body_bytes: usize,
}

impl AppState {
    pub(crate) fn new(authenticator: Arc<Authenticator>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            authenticator,
            runner,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/favicon.ico", any(favicon))
        .fallback(handle_hook)
        .with_state(state)
}

async fn favicon() -> (StatusCode, &'static str) {
    (StatusCode::GONE, "No favicon")
}

async fn handle_hook(State(state): State<AppState>, request: Request) -> Response {
    let span = tracing::info_span!("hook", id = %Uuid::new_v4());
    dispatch(state, request).instrument(span).await
}

async fn dispatch(state: AppState, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    tracing::info!(
        event = "hook.request",
        method = %parts.method,
        path = %parts.uri.path(),
        "handling request"
    );

    if parts.method != Method::POST {
        return reply(StatusCode::METHOD_NOT_ALLOWED);
    }

    let body = match read_body(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err @ BodyError::TooLarge { .. }) => {
            tracing::error!(event = "hook.body_too_large", error = %err, "request body too large");
            return reply(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(err) => {
            tracing::error!(event = "hook.body_unreadable", error = %err, "error reading body");
            return reply(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .map(HeaderValue::as_bytes);
    if let Err(rejection) = state.authenticator.authenticate(&body, signature) {
        tracing::warn!(
            event = "hook.unauthorized",
            reason = %rejection,
            "refusing to run command"
        );
        return reply(StatusCode::UNAUTHORIZED);
    }

    // Detached so a client hanging up does not cancel the command.
    let runner = Arc::clone(&state.runner);
    let execution = tokio::spawn(async move { runner.run(body).await }.in_current_span());
    let outcome = match execution.await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(event = "hook.command_failed", error = %err, "command task failed");
            return reply(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if outcome.is_success() {
        tracing::debug!(event = "hook.command_succeeded", "command succeeded");
        reply(StatusCode::OK)
    } else {
        tracing::error!(event = "hook.command_failed", reason = %outcome, "error running command");
        reply(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

fn reply(status: StatusCode) -> Response {
    match status {
        StatusCode::OK => (status, "OK").into_response(),
        StatusCode::UNAUTHORIZED => (status, "Not authorized.").into_response(),
        StatusCode::METHOD_NOT_ALLOWED => (
            status,
            [(header::ALLOW, HeaderValue::from_static("POST"))],
            "Only POST supported",
        )
            .into_response(),
        _ => (status, "Error").into_response(),
    }
}

#[derive(Debug)]
enum BodyError {
    TooLarge { limit: usize },
    Unreadable(axum::Error),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { limit } => write!(f, "body size exceeded max allowed of {limit} bytes"),
            Self::Unreadable(err) => write!(f, "failed to read body: {err}"),
        }
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Unreadable)?;
        if buffer.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}
