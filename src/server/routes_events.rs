//! `GET /ws` — event stream upgrade into the hub.

use crate::events::Subscription;
use crate::server::AppContext;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};

pub async fn ws_handler(State(ctx): State<AppContext>, ws: WebSocketUpgrade) -> Response {
    let subscription = ctx.hub.subscribe();
    ws.on_upgrade(move |socket| client_loop(socket, subscription))
}

/// Pump hub events to the socket until either side goes away. Incoming
/// frames are only watched for close.
async fn client_loop(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("event stream client disconnected");
}
