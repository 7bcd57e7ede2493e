//! `GET /ws/events`: live feed of domain events as JSON text frames.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::core::Core;

pub async fn events_handler(ws: WebSocketUpgrade, State(core): State<Arc<Core>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, core))
}

async fn handle_socket(mut socket: WebSocket, core: Arc<Core>) {
    info!("Event feed client connected");
    // Subscribe before the hello so nothing published after it is missed.
    let mut events = BroadcastStream::new(core.events().subscribe());

    let hello = serde_json::json!({ "type": "connected" }).to_string();
    if socket.send(Message::Text(hello.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            next = events.next() => {
                match next {
                    Some(Ok(event)) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Event feed client gone during send");
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        warn!(missed, "Event feed client lagged behind");
                        let notice = serde_json::json!({ "type": "lagged", "missed": missed }).to_string();
                        if socket.send(Message::Text(notice.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Event feed socket error");
                        break;
                    }
                    // The feed is one-way
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("Event feed client disconnected");
}
