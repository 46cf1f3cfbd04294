use crate::auth::{self, Identity, IdentityResolver, JwtResolver};
use crate::config::Config;
use crate::error::ChatError;
use crate::hub::ChatHub;
use crate::registry::Connection;
use crate::{db, store::SqliteStore};
use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chat_api::{ClientFrame, ErrorCode, HouseId, Message, RpcError, ServerFrame};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let pool = db::open_pool(config.database_path())?;
        let store = Arc::new(SqliteStore::new(pool));
        let hub = Arc::new(ChatHub::new(store, config.chat.clone()));
        let resolver = Arc::new(JwtResolver::new(config.jwt_secret.0.clone()));
        Ok(Self {
            hub,
            resolver,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/chathub", get(ws_handler))
        .route("/api/houses/:house_id/messages", get(house_messages))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token);
    if let Some(token) = token {
        match state.resolver.resolve_identity(token) {
            Ok(identity) => {
                req.extensions_mut().insert(identity);
                return Ok(next.run(req).await);
            }
            Err(e) => debug!(error = %e, "rejected bearer token"),
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResp>) {
    (status, Json(ErrorResp { error: msg.into() }))
}

async fn house_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(house_id): Path<HouseId>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<ErrorResp>)> {
    match state.hub.history(&identity, house_id).await {
        Ok(messages) => Ok(Json(messages)),
        Err(ChatError::Unauthenticated) => {
            Err(err(StatusCode::UNAUTHORIZED, "unauthenticated"))
        }
        Err(ChatError::Forbidden(_)) => Err(err(StatusCode::FORBIDDEN, "not_a_tenant")),
        Err(e) => {
            warn!(house_id, error = %e, "history lookup failed");
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable"))
        }
    }
}

#[derive(Deserialize)]
struct ConnectParams {
    house_id: Option<HouseId>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    debug!(user_id = identity.user_id, house_id = ?params.house_id, "upgrading chat connection");
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(stream: WebSocket, state: AppState, identity: Identity) {
    let hub = state.hub.clone();
    let send_timeout = state.config.chat.send_timeout;
    let (conn, mut outbox) = hub.connection_opened(identity);
    info!(connection_id = %conn.id, user_id = conn.identity.user_id, "connection opened");

    let (mut sender, mut receiver) = stream.split();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = conn.closed() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if !handle_frame(&hub, &conn, &text, send_timeout).await {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %conn.id, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    hub.connection_closed(&conn);
    info!(connection_id = %conn.id, "connection closed");
    drop(conn);
    // let queued frames and the close frame flush, but never hang on a dead peer
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

/// Returns false when the connection can no longer be served.
async fn handle_frame(hub: &ChatHub, conn: &Connection, text: &str, timeout: Duration) -> bool {
    let reply = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => hub.dispatch(conn, frame).await,
        Err(e) => {
            warn!(connection_id = %conn.id, error = %e, "malformed frame");
            // answer only when the caller can correlate the reply
            let invocation_id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("invocation_id")?.as_u64());
            let Some(invocation_id) = invocation_id else {
                return true;
            };
            ServerFrame::Completion {
                invocation_id,
                error: Some(RpcError::new(ErrorCode::Malformed, e.to_string())),
            }
        }
    };
    conn.deliver(reply, timeout).await.is_ok()
}

/// Run the HTTP server until Ctrl+C, then close every chat connection.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config)?;
    let hub = state.hub.clone();
    info!(%addr, "chat hub listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            hub.close_all();
        })
        .await?;
    Ok(())
}
