use super::rest::AppState;
use crate::hub::HubHandle;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use log::{debug, error};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

// Handle WebSocket connection upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state.hub, state.shutdown))
}

/// One realtime member: a writer task drains the hub queue into the socket
/// while this task forwards inbound frames to the hub
async fn handle_socket(socket: WebSocket, addr: SocketAddr, hub: HubHandle, shutdown: CancellationToken) {
    let (member, mut outbound) = match hub.join(&addr.ip().to_string()).await {
        Ok(joined) => joined,
        Err(e) => {
            error!("Failed to join hub for {}: {}", addr, e);
            return;
        }
    };
    debug!("Realtime member {} connected from {}", member.id, addr);

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = receiver.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        if hub.publish(&member, &text).await.is_err() {
            break;
        }
    }

    // Leaving drops the member's queue, which ends the writer
    hub.leave(&member).await;
    let _ = send_task.await;
    debug!("Realtime member {} disconnected", member.id);
}
