//! HTTP front: WebSocket upgrades on any path, a static page otherwise.

use crate::config::RelayConfig;
use crate::connection::{Connection, PingCounter};
use crate::multiplexer::ChannelRegistry;
use crate::session;
use axum::{
    extract::{FromRequestParts, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Router,
};
use broker_client::Broker;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Path answered with an empty body instead of the page.
pub const FAVICON_PATH: &str = "/favicon.ico";

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ChannelRegistry>,
    pub broker: Arc<dyn Broker>,
    pub pings: PingCounter,
    pub session_cookie: String,
    pub static_page: PathBuf,
    pub client_buffer_size: usize,
}

impl AppState {
    pub fn new(broker: Arc<dyn Broker>, config: &RelayConfig) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(broker.clone())),
            broker,
            pings: PingCounter::new(),
            session_cookie: config.session_cookie.clone(),
            static_page: config.static_page.clone(),
            client_buffer_size: config.client_buffer_size,
        }
    }
}

/// Create the HTTP router. Every path goes to the same handler.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(relay_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn relay_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        let path = req.uri().path().to_string();
        return serve_page(&state, &path).await;
    }

    let (mut parts, _body) = req.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!("Rejected upgrade on '{}': {}", parts.uri.path(), rejection);
            return rejection.into_response();
        }
    };

    let (channel, session) = session::extract(&parts.uri, &parts.headers, &state.session_cookie);
    let failed_channel = channel.clone();

    ws.on_failed_upgrade(move |e| {
        warn!("WebSocket upgrade on '{}' failed: {}", failed_channel, e);
    })
    .on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        Connection::new(channel, session, state).run(sink, stream).await;
    })
}

async fn serve_page(state: &AppState, path: &str) -> Response {
    if path == FAVICON_PATH {
        return StatusCode::OK.into_response();
    }

    match tokio::fs::read_to_string(&state.static_page).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            warn!(
                "Failed to read static page {}: {}",
                state.static_page.display(),
                e
            );
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
