use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::events::{EventKind, TestEvent};
use crate::state::SharedState;

/// GET /ws/tests/{id} — push channel for one test.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(test_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, test_id))
}

fn is_final(event: &TestEvent) -> bool {
    matches!(event.kind, EventKind::TestComplete | EventKind::TestError)
}

async fn send_event(socket: &mut WebSocket, event: &TestEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn handle_socket(mut socket: WebSocket, state: SharedState, test_id: String) {
    let mut rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    // Catch up on buffered events; a test that already finished closes here.
    for event in state.events.history_for(&test_id).await {
        if !send_event(&mut socket, &event).await {
            return;
        }
        if is_final(&event) {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = socket.send(Message::Text(r#"{"type":"shutdown"}"#.into())).await;
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            result = rx.recv() => {
                match result {
                    Ok(event) if event.test_id == test_id => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                        if is_final(&event) {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("WebSocket for {} lagged {} events", test_id, n),
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!("WebSocket client for test {} disconnected", test_id);
}
