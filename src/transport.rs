//! WebSocket transport built on `axum::extract::ws`.
//!
//! One task per connection owns both halves of the split socket and
//! multiplexes inbound client frames against outbound registry-sourced
//! events with a single `tokio::select!`, so there is never more than one
//! writer touching the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::SinkMessage;
use crate::error::{redact_key, Error};
use crate::identity_resolver::IdentityResolver;
use crate::protocol::ClientCommand;
use crate::protocol_handler::{self, select_handshake_key};
use crate::subscription_registry::SubscriptionRegistry;

pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub retry_time_secs: u64,
    pub dev: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    key: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let header_key = headers.get("X-API-Key").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let key = select_handshake_key(params.key, header_key);
    ws.on_upgrade(move |socket| handle_socket(socket, state, key, addr))
}

fn close_message(err: &Error, dev: bool) -> Message {
    Message::Close(Some(CloseFrame {
        code: err.close_code(),
        reason: err.close_reason(dev).into(),
    }))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, key: Option<String>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, rx) = flume::bounded(64);

    let redacted_key = key.as_deref().map(redact_key);
    let conn = match protocol_handler::handshake(
        &state.registry,
        state.resolver.as_ref(),
        tx.clone(),
        addr.to_string(),
        key,
        state.retry_time_secs,
    )
    .await
    {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(api_key = ?redacted_key, error = %err, "handshake failed");
            let _ = sender.send(close_message(&err, state.dev)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(command) => {
                                protocol_handler::handle_command(&state.registry, state.resolver.as_ref(), &conn, command).await
                            }
                            Err(_) => Err(Error::client_protocol("malformed command payload")),
                        };
                        match outcome {
                            Ok(event) => {
                                let _ = tx.try_send(SinkMessage::Event(event));
                            }
                            Err(err) => {
                                tracing::warn!(conn_id = %conn.id, error = %err, "command rejected");
                                let _ = sender.send(close_message(&err, state.dev)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(conn_id = %conn.id, error = %err, "transport error");
                        break;
                    }
                }
            }
            outgoing = rx.recv_async() => {
                match outgoing {
                    Ok(SinkMessage::Event(event)) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => tracing::error!(error = %err, "failed to serialize outbound event"),
                        }
                    }
                    Ok(SinkMessage::Ping) => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    state.registry.deregister_connection(&conn.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_key_wins_over_header_key() {
        let chosen = select_handshake_key(Some("from-query".to_string()), Some("from-header".to_string()));
        assert_eq!(chosen.as_deref(), Some("from-query"));
    }

    #[test]
    fn header_key_used_when_query_absent() {
        let chosen = select_handshake_key(None, Some("from-header".to_string()));
        assert_eq!(chosen.as_deref(), Some("from-header"));
    }
}
