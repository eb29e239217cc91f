//! Bidirectional forwarding between TCP and vsock endpoints.
//!
//! For each tuple the proxy:
//! 1. Binds the listen address (TCP or vsock).
//! 2. Accepts connections until the [`ProcessContext`] is cancelled.
//! 3. For each accepted connection, dials the connect address and copies bytes
//!    in both directions until either half closes.
//!
//! Bytes are forwarded opaquely; the proxy never inspects payloads.

use std::future::Future;
use std::io;

use anyhow::{Context, Result};
use common::{Address, Tuple};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::task::TaskTracker;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::context::ProcessContext;

/// Moves bytes for a fixed list of tuples until cancelled.
pub trait Engine: Clone + Send + 'static {
    /// Serve `tuples` until `ctx` is cancelled and in-flight connections have
    /// finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot start (e.g. a listen address
    /// cannot be bound) or stops on its own because of a failure.
    fn serve(
        self,
        tuples: Vec<Tuple>,
        ctx: ProcessContext,
    ) -> impl Future<Output = Result<()>> + Send + 'static;
}

/// Default TCP/vsock engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Proxy;

impl Engine for Proxy {
    fn serve(
        self,
        tuples: Vec<Tuple>,
        ctx: ProcessContext,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        async move {
            // Bind everything up front so a bad address fails the whole start.
            let mut bound = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                let listener = Listener::bind(&tuple.listen)
                    .await
                    .with_context(|| format!("failed to listen on {}", tuple.listen))?;
                bound.push((listener, tuple));
            }

            let tracker = TaskTracker::new();
            let mut loops = JoinSet::new();
            for (listener, tuple) in bound {
                info!(parent: ctx.span(), listen = %tuple.listen, connect = %tuple.connect, "vsock-proxy listening");
                let span = info_span!(parent: ctx.span(), "tuple", listen = %tuple.listen);
                loops.spawn(
                    accept_loop(listener, tuple.connect, ctx.clone(), tracker.clone()).instrument(span),
                );
            }

            while let Some(joined) = loops.join_next().await {
                joined.context("accept loop panicked")?;
            }

            tracker.close();
            debug!(parent: ctx.span(), in_flight = tracker.len(), "draining connections");
            tracker.wait().await;
            Ok(())
        }
    }
}

/// Anything we can forward bytes through.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxStream = Box<dyn Stream>;

enum Listener {
    Tcp(TcpListener),
    Vsock(VsockListener),
}

impl Listener {
    async fn bind(addr: &Address) -> io::Result<Self> {
        match addr {
            Address::Network { host, port } => {
                let host = if host.is_empty() { "0.0.0.0" } else { host.as_str() };
                TcpListener::bind((host, *port)).await.map(Self::Tcp)
            }
            Address::Guest { cid, port } => {
                VsockListener::bind(VsockAddr::new(*cid, *port)).map(Self::Vsock)
            }
        }
    }

    async fn accept(&mut self) -> io::Result<(BoxStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Self::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), format!("vsock://{}:{}", peer.cid(), peer.port())))
            }
        }
    }
}

async fn dial(addr: &Address) -> io::Result<BoxStream> {
    match addr {
        Address::Network { host, port } => {
            let host = if host.is_empty() { "127.0.0.1" } else { host.as_str() };
            let stream = TcpStream::connect((host, *port)).await?;
            Ok(Box::new(stream))
        }
        Address::Guest { cid, port } => {
            let stream = VsockStream::connect(VsockAddr::new(*cid, *port)).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Accept connections on `listener` until `ctx` is cancelled.
async fn accept_loop(
    mut listener: Listener,
    connect: Address,
    ctx: ProcessContext,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = ctx.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let connect = connect.clone();
                tracker.spawn(
                    async move {
                        if let Err(e) = handle_connection(stream, &connect).await {
                            warn!(error = %e, "connection error");
                        }
                    }
                    .instrument(info_span!("conn", %peer)),
                );
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }
    debug!("accept loop stopped");
}

/// Handle a single accepted connection.
async fn handle_connection(inbound: BoxStream, connect: &Address) -> Result<()> {
    let outbound = dial(connect)
        .await
        .with_context(|| format!("failed to connect to {connect}"))?;
    debug!(%connect, "upstream connection established");

    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);

    let inbound_to_outbound = copy_half(in_read, out_write, "listen→connect");
    let outbound_to_inbound = copy_half(out_read, in_write, "connect→listen");

    // Run both directions concurrently; stop when either half finishes.
    tokio::select! {
        res = inbound_to_outbound => { res? }
        res = outbound_to_inbound => { res? }
    }

    Ok(())
}

/// Copy bytes from `reader` to `writer`, logging the direction on completion.
async fn copy_half<R, W>(mut reader: R, mut writer: W, label: &'static str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = tokio::io::copy(&mut reader, &mut writer).await?;
    debug!(label, bytes, "half-close");
    Ok(())
}
