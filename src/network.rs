use crate::hub::{Flow, Hub};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a closing connection may spend flushing queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Upgrade to a WebSocket. The credential is checked after the upgrade so a
/// rejected client just sees the socket close.
pub async fn ws_route(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_connection(socket, hub, params.token, peer))
}

/// Drive one client connection from authentication to cleanup.
pub async fn handle_connection(
    mut socket: WebSocket,
    hub: Arc<Hub>,
    token: Option<String>,
    peer: Option<SocketAddr>,
) {
    info!("New WebSocket connection from {:?}", peer);

    let record = match hub.authenticate(token.as_deref()).await {
        Ok(record) => record,
        Err(e) => {
            warn!("Rejecting connection from {:?}: {}", peer, e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let joined = hub.join(&record).await;
    let ctx = joined.context;
    let kill = joined.kill;
    let mut outbound = joined.outbound;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forward queued frames to the socket; close once the queue is dropped.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if ws_sender.send(msg).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let mut writer_done = false;
    let terminated = loop {
        tokio::select! {
            _ = kill.notified() => break true,
            _ = &mut send_task => {
                writer_done = true;
                break false;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if hub.handle_text(&ctx, &text).await == Flow::Close {
                        break false;
                    }
                }
                Some(Ok(Message::Pong(_))) => hub.mark_alive(ctx.conn).await,
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", ctx.conn, e);
                    break false;
                }
            },
        }
    };

    hub.leave(ctx.conn).await;

    if !writer_done {
        if terminated {
            send_task.abort();
        } else if timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
            send_task.abort();
        }
    }
    info!("{} ({}) cleaned up", ctx.conn, ctx.username);
}
