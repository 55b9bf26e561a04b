//! WebSocket connection lifecycle: handshake, read loop, writer task.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cartwheel_core::error::{CartwheelError, CLOSE_AUTH_FAILED};
use cartwheel_core::protocol::{EgressFrame, IngressFrame};
use cartwheel_core::state::ConversationState;

use crate::egress::EgressStream;
use crate::session::{SessionDriver, SessionHandle};
use crate::state::GatewayState;

/// Query parameters of the `/ws` upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer token; may instead arrive as a first frame `{"token": "..."}`.
    pub token: Option<String>,
    /// Session to resume; a fresh id is minted when absent.
    pub session: Option<String>,
}

/// Handle one upgraded WebSocket connection end to end.
pub async fn handle_ws_connection(gateway: Arc<GatewayState>, ws: WebSocket, params: WsParams) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new websocket connection");
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let WsParams { token, session } = params;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let verdict = tokio::time::timeout(gateway.config.auth_timeout(), async {
        let token = match token {
            Some(token) => token,
            None => first_frame_token(&mut ws_rx)
                .await
                .ok_or_else(|| CartwheelError::Auth("no token presented".to_string()))?,
        };
        gateway.auth.verify(&token).await
    })
    .await;

    let principal = match verdict {
        Ok(Ok(principal)) => principal,
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "authentication failed");
            close_with(&mut ws_tx, CLOSE_AUTH_FAILED, "authentication failed").await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_ws_disconnect();
            return;
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "authentication timed out");
            close_with(&mut ws_tx, CLOSE_AUTH_FAILED, "authentication timed out").await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_ws_disconnect();
            return;
        }
    };
    debug!(conn_id = %conn_id, user_id = %principal.user_id, "client authenticated");

    let mut session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut conversation = match gateway.runtime.checkpoints().load(&session_id).await {
        Ok(Some(restored)) if restored.user_id == principal.user_id => {
            info!(
                conn_id = %conn_id,
                session_id = %session_id,
                chat_count = restored.chat_count,
                "resuming session from checkpoint"
            );
            restored
        }
        Ok(Some(_)) => {
            warn!(
                conn_id = %conn_id,
                session_id = %session_id,
                "session owned by another user, minting a fresh one"
            );
            session_id = Uuid::new_v4().to_string();
            ConversationState::new(
                session_id.clone(),
                principal.user_id.clone(),
                conn_id.clone(),
            )
        }
        Ok(None) => ConversationState::new(
            session_id.clone(),
            principal.user_id.clone(),
            conn_id.clone(),
        ),
        Err(e) => {
            warn!(
                session_id = %session_id,
                error = %e,
                "checkpoint load failed, starting fresh"
            );
            ConversationState::new(
                session_id.clone(),
                principal.user_id.clone(),
                conn_id.clone(),
            )
        }
    };
    conversation.connection_id = conn_id.clone();
    conversation.history_window = gateway.config.history_window();
    conversation.chat_limit = gateway.config.chat_limit();

    let cancel = CancellationToken::new();
    gateway.sessions.insert(SessionHandle {
        session_id: session_id.clone(),
        connection_id: conn_id.clone(),
        cancel: cancel.clone(),
    });

    let (egress_tx, mut egress_rx) = mpsc::channel::<EgressFrame>(64);
    let (ingress_tx, ingress_rx) = mpsc::channel::<IngressFrame>(32);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = egress_rx.recv().await {
            if let Ok(text) = serde_json::to_string(&frame) {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let sink = EgressStream::new(egress_tx.clone(), gateway.config.word_delay());
    let driver = SessionDriver::new(gateway.clone(), conversation, sink, cancel.clone());
    let driver_task = tokio::spawn(driver.run(ingress_rx));

    let idle = gateway.config.idle_timeout();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn_id = %conn_id, "session cancelled, closing the connection");
                break;
            }
            next = tokio::time::timeout(idle, ws_rx.next()) => match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!(conn_id = %conn_id, error = %e, "websocket error");
                    break;
                }
                Ok(None) => {
                    debug!(conn_id = %conn_id, "client disconnected");
                    break;
                }
                Err(_) => {
                    info!(conn_id = %conn_id, "idle timeout, closing the connection");
                    break;
                }
            },
        };

        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<IngressFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        reject(&egress_tx, &CartwheelError::Json(e)).await;
                        continue;
                    }
                };
                if let Err(e) = frame.validate() {
                    reject(&egress_tx, &e).await;
                    continue;
                }
                if let Err(e) = gateway.limits.check(&principal.user_id) {
                    reject(&egress_tx, &e).await;
                    continue;
                }
                if ingress_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                debug!(conn_id = %conn_id, "client requested close");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    cancel.cancel();
    drop(ingress_tx);
    drop(egress_tx);
    let _ = driver_task.await;
    let _ = send_task.await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
    info!(conn_id = %conn_id, session_id = %session_id, "connection closed");
}

/// Reply with an error frame; the connection stays open.
async fn reject(egress: &mpsc::Sender<EgressFrame>, error: &CartwheelError) {
    debug!(error = %error, "rejecting inbound frame");
    #[cfg(feature = "metrics")]
    crate::metrics::record_error(error.wire_key());
    let _ = egress.send(EgressFrame::from_error(error)).await;
}

async fn close_with(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}

/// Fallback handshake: the first text frame may carry `{"token": "..."}`.
async fn first_frame_token(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match ws_rx.next().await? {
            Ok(Message::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).ok()?;
                return value
                    .get("token")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned);
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        }
    }
}
