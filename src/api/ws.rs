use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::{
    cli::error::DispatchError,
    datapoint::{encode_json, Datapoint, FormatCell, WireFormat},
    engine::Caller,
};

use super::ApiState;

pub async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let id = Uuid::now_v7();
        handle_socket(state, socket, id).instrument(span!(Level::INFO, "WebSocket", client = %id))
    })
}

/// Text messages are commands; replies and pushes are JSON
async fn handle_socket(state: ApiState, socket: WebSocket, id: Uuid) {
    debug!("connected");
    let (push_tx, mut push_rx) = mpsc::channel::<Arc<Datapoint>>(state.push_capacity);
    state.store.register_client(id, Arc::new(push_tx));
    let caller = Caller::session(id, Arc::new(FormatCell::new(WireFormat::Json)));

    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));
    let ws_tx_copy = ws_tx.clone();

    let events = state.events.clone();
    let mut tx_task = tokio::spawn(
        async move {
            while let Some(dp) = push_rx.recv().await {
                let json = match encode_json(&dp, &events) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(name = %dp.name, "push skipped: {e}");
                        continue;
                    }
                };
                if ws_tx.lock().await.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
        }
        .in_current_span(),
    );

    let engine = state.engine.clone();
    let mut rx_task = tokio::spawn(
        async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(cmd_str) => {
                        let reply = reply_json(engine.execute(caller.clone(), cmd_str.as_str()).await);
                        if ws_tx_copy
                            .lock()
                            .await
                            .send(Message::Text(reply.into()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
        .in_current_span(),
    );

    tokio::select! {
        _ = (&mut tx_task) => {
            rx_task.abort();
        },
        _ = (&mut rx_task) => {
            tx_task.abort();
        }
    }

    state.store.unregister_client(&id);
    debug!("disconnected");
}

fn reply_json(result: Result<String, DispatchError>) -> String {
    match result {
        Ok(result) => json!({ "result": result }),
        Err(e) => json!({ "error": e.tag(), "message": e.to_string() }),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_json() {
        assert_eq!(reply_json(Ok("1".into())), r#"{"result":"1"}"#);
        let v: serde_json::Value =
            serde_json::from_str(&reply_json(Err(DispatchError::Parse("bad".into())))).unwrap();
        assert_eq!(v["error"], "PARSE_ERROR");
        assert_eq!(v["message"], "bad");
    }
}
