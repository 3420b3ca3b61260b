//! Inbound callback handling
//!
//! Serves the single callback endpoint: `GET` answers the provider's
//! verification challenge, `POST` accepts a JSON batch of events and hands
//! it to the dispatcher. Authentication runs before method dispatch.

use crate::auth::AuthGuard;
use crate::config::{ReceiverBuilder, ReceiverConfig};
use crate::dispatch::Dispatcher;
use crate::events::{EventBatch, EventParseError};
use crate::listener::Listener;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{header, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_extra::{
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state behind the callback route
pub(crate) struct ReceiverState {
    guard: Arc<AuthGuard>,
    dispatcher: Dispatcher,
    max_records: usize,
}

/// A validated receiver: configuration plus dispatch wiring.
///
/// Cheap to clone. Use [`CallbackReceiver::listener`] to serve it, or mount
/// [`CallbackReceiver::router`] in an existing axum application.
#[derive(Clone)]
pub struct CallbackReceiver {
    config: Arc<ReceiverConfig>,
    state: Arc<ReceiverState>,
}

impl CallbackReceiver {
    pub fn builder() -> ReceiverBuilder {
        ReceiverBuilder::new()
    }

    pub(crate) fn new(config: ReceiverConfig, dispatcher: Dispatcher) -> Self {
        let state = ReceiverState {
            guard: Arc::new(config.auth_guard()),
            dispatcher,
            max_records: config.max_records_per_batch,
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    /// Router serving the callback path
    pub fn router(&self) -> Router {
        self.build_router(CancellationToken::new())
    }

    /// Listener owning the HTTP server lifecycle for this receiver
    pub fn listener(&self) -> Listener {
        Listener::new(self.clone())
    }

    /// Router whose in-flight requests are abandoned once `force_close` fires
    pub(crate) fn build_router(&self, force_close: CancellationToken) -> Router {
        Router::new()
            .route(&self.config.path, any(handle_callback))
            .route_layer(middleware::from_fn_with_state(
                Arc::clone(&self.state.guard),
                authenticate,
            ))
            .layer(middleware::from_fn_with_state(
                force_close,
                abandon_on_force_close,
            ))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    echostr: Option<String>,
}

/// Check Basic credentials before the request reaches the handler
async fn authenticate(
    State(guard): State<Arc<AuthGuard>>,
    credentials: Option<TypedHeader<Authorization<Basic>>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = credentials
        .as_ref()
        .map(|TypedHeader(auth)| (auth.username(), auth.password()));

    match guard.authenticate(presented) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            warn!(
                method = %request.method(),
                reason = %rejection,
                "Rejected callback request"
            );
            rejection.into_response()
        }
    }
}

async fn abandon_on_force_close(
    State(force_close): State<CancellationToken>,
    request: Request,
    next: Next,
) -> Response {
    tokio::select! {
        response = next.run(request) => response,
        () = force_close.cancelled() => {
            warn!("Abandoning in-flight callback request on forced shutdown");
            (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response()
        }
    }
}

async fn handle_callback(
    State(state): State<Arc<ReceiverState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    match method {
        Method::GET => verify(&uri),
        Method::POST => receive(&state, body).await,
        other => {
            debug!(method = %other, "Unsupported callback method");
            (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, POST")],
                "Method not allowed",
            )
                .into_response()
        }
    }
}

/// Echo the provider's verification challenge
fn verify(uri: &Uri) -> Response {
    let challenge = match Query::<CallbackQuery>::try_from_uri(uri) {
        Ok(Query(query)) => query.echostr,
        Err(e) => {
            debug!(error = %e, "Unreadable verification query");
            None
        }
    };

    match challenge.filter(|challenge| !challenge.is_empty()) {
        Some(challenge) => {
            info!("Answered callback verification challenge");
            (StatusCode::OK, challenge).into_response()
        }
        None => (StatusCode::BAD_REQUEST, "Missing echostr").into_response(),
    }
}

async fn receive(state: &ReceiverState, body: Bytes) -> Response {
    let batch = match EventBatch::parse(body, state.max_records) {
        Ok(batch) => batch,
        Err(EventParseError::TooManyRecords { count, limit }) => {
            warn!(count, limit, "Rejected oversized callback batch");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Too many records").into_response();
        }
        Err(e) => {
            warn!(error = %e, "Rejected malformed callback payload");
            return (StatusCode::BAD_REQUEST, "Invalid payload").into_response();
        }
    };

    info!(
        batch_id = %batch.id,
        records = batch.len(),
        "Received callback batch"
    );
    debug!(batch_id = %batch.id, raw = %batch.raw_str(), "Callback payload");

    state.dispatcher.dispatch(batch).await;

    StatusCode::OK.into_response()
}
