//! Client connections on the primary TCP port.

use std::{io, net::SocketAddr, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::{
    cli::error::DispatchError,
    datapoint::{Datapoint, FormatCell, WireFormat},
    engine::{Caller, EngineHandle},
    event::EventNames,
    store::DatapointStore,
};

pub mod codec;

use codec::{Frame, FrameCodec, Request, RequestCodec};

#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<DatapointStore>,
    pub engine: EngineHandle,
    pub events: Arc<EventNames>,
    pub default_format: WireFormat,
    /// Pushes queued per connection before updates are dropped
    pub push_capacity: usize,
}

/// Accepts connections until `shutdown` is cancelled, then waits for every
/// session to unregister
pub async fn serve(listener: TcpListener, ctx: SessionContext, shutdown: CancellationToken) {
    let tracker = TaskTracker::new();
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {addr}");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let span = span!(Level::INFO, "Session", %peer);
                    tracker.spawn(
                        handle_conn(stream, peer, ctx.clone(), shutdown.clone()).instrument(span),
                    );
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    debug!("all sessions closed");
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    shutdown: CancellationToken,
) {
    let id = Uuid::now_v7();
    let (push_tx, push_rx) = mpsc::channel(ctx.push_capacity);
    ctx.store.register_client(id, Arc::new(push_tx));
    debug!(client = %id, "connected");

    if let Err(e) = run(stream, id, push_rx, &ctx, shutdown).await {
        debug!(client = %id, "transport error: {e}");
    }

    ctx.store.unregister_client(&id);
    info!(client = %id, %peer, "disconnected");
}

async fn run(
    stream: TcpStream,
    id: Uuid,
    mut push_rx: mpsc::Receiver<Arc<Datapoint>>,
    ctx: &SessionContext,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, RequestCodec);
    let mut writer = FramedWrite::new(write, FrameCodec::new(ctx.events.clone()));

    let format = Arc::new(FormatCell::new(ctx.default_format));
    let caller = Caller::session(id, format.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            Some(dp) = push_rx.recv() => {
                writer.send(Frame::Push { dp, format: format.get() }).await?;
            }
            req = reader.next() => {
                let reply = match req {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Request::Line(line))) => {
                        Some(ctx.engine.execute(caller.clone(), line).await)
                    }
                    Some(Ok(Request::Binary(dp))) => {
                        // sets without a reply unless they fail
                        ctx.engine.publish(dp).await.err().map(Err)
                    }
                    Some(Ok(Request::Malformed(msg))) => {
                        Some(Err(DispatchError::MalformedFrame(msg)))
                    }
                };
                if let Some(reply) = reply {
                    writer.send(Frame::Reply(reply)).await?;
                }
            }
        }
    }
}
