use std::{io, path::PathBuf, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{any, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::{
    cli::error::DispatchError,
    engine::{Caller, EngineHandle},
    event::EventNames,
    store::DatapointStore,
};

use ws::ws_handler;

pub mod ws;

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    pub store: Arc<DatapointStore>,
    pub events: Arc<EventNames>,
    pub push_capacity: usize,
}

/// Serves `POST /` commands, the `/ws` socket and, optionally, static files
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    www: Option<PathBuf>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut app = Router::new()
        .route("/", post(post_cmd))
        .route("/ws", any(ws_handler));
    if let Some(dir) = www {
        info!("serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }

    if let Ok(addr) = listener.local_addr() {
        info!("http listening on {addr}");
    }
    axum::serve(listener, app.with_state(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn post_cmd(State(state): State<ApiState>, cmd_str: String) -> impl IntoResponse {
    match state.engine.execute(Caller::full(), cmd_str).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e @ (DispatchError::Parse(_) | DispatchError::MalformedFrame(_))) => {
            (StatusCode::BAD_REQUEST, Json(e)).into_response()
        }
        Err(e) => {
            warn!("command failed: {} {e}", e.tag());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{self, Engine},
        timer::{ThreadBackend, TimerPool},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    async fn start() -> (std::net::SocketAddr, CancellationToken) {
        let store = Arc::new(DatapointStore::new());
        let events = Arc::new(EventNames::default());
        let (handle, rx) = engine::channel(16);
        let timers = Arc::new(TimerPool::new(
            1,
            "timer",
            Arc::new(ThreadBackend),
            store.clone(),
            handle.expiry_hook(),
        ));
        Engine::new(store.clone(), timers, events.clone(), handle.clone(), rx)
            .spawn()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let state = ApiState {
            engine: handle,
            store,
            events,
            push_capacity: 8,
        };
        tokio::spawn(serve(listener, state, None, shutdown.clone()));
        (addr, shutdown)
    }

    async fn post(addr: std::net::SocketAddr, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp
    }

    #[tokio::test]
    async fn test_post_cmd() {
        let (addr, shutdown) = start().await;

        let resp = post(addr, "set x 1 5 2 {ok}").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");

        let resp = post(addr, "get x").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.ends_with("x 1 5 2 {ok}"), "{resp}");

        let resp = post(addr, "badcommand").await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
        assert!(resp.contains("\"Parse\""), "{resp}");

        let resp = post(addr, "get missing").await;
        assert!(resp.starts_with("HTTP/1.1 500"), "{resp}");
        assert!(resp.contains("\"NotFound\""), "{resp}");

        shutdown.cancel();
    }
}
