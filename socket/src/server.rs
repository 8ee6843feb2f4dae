use std::{
    any::Any,
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use scopeguard::defer;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

const SHUTDOWN_POLL_INITIAL: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL_MULTIPLIER: f64 = 1.5;
const SHUTDOWN_POLL_MAX: Duration = Duration::from_secs(60);

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}
impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

/// Listener abstraction consumed by [`Server::serve`] and wrapped by
/// [`crate::filter::FilteredListener`].
#[async_trait]
pub trait Listen: Send + Sync {
    type Conn: IoStream;
    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listen for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// An accepted stream paired with its cancellation scope.
///
/// The stream is owned here and closed by drop exactly once, when the
/// handler returns. The handler may cancel the scope early; the token is
/// a child of the server's base token, so cancelling it affects only this
/// connection.
#[derive(Debug)]
pub struct SocketContext<S> {
    stream: S,
    peer_addr: SocketAddr,
    cancellation: CancellationToken,
}

impl<S> SocketContext<S> {
    pub fn new(stream: S, peer_addr: SocketAddr, cancellation: CancellationToken) -> Self {
        Self {
            stream,
            peer_addr,
            cancellation,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn into_parts(self) -> (S, SocketAddr, CancellationToken) {
        (self.stream, self.peer_addr, self.cancellation)
    }
}

impl<S> AsyncRead for SocketContext<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for SocketContext<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Per-connection handler driven by [`Server::serve`].
#[async_trait]
pub trait ConnHandler: Send + Sync {
    async fn handle_conn<S>(&self, socket: SocketContext<S>)
    where
        S: IoStream;
}

pub type PanicHandler = Arc<dyn Fn(SocketAddr, Box<dyn Any + Send>) + Send + Sync>;

/// Generic accept-dispatch server.
///
/// One instance may serve several listeners concurrently; they share the
/// closed flag, the open-work counter, and the base cancellation token.
pub struct Server {
    cancellation: CancellationToken,
    listeners: Mutex<HashMap<u64, CancellationToken>>,
    next_listener_id: AtomicU64,
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
    panic_handler: Option<PanicHandler>,
}

impl Server {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            panic_handler: None,
        }
    }

    /// Replaces the default panic report (`tracing::error!`) with a
    /// caller-supplied callback. The payload is whatever the handler
    /// panicked with.
    pub fn with_panic_handler(mut self, panic_handler: PanicHandler) -> Self {
        self.panic_handler = Some(panic_handler);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Count of live accept loops plus live connection handlers.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn track_listener(&self) -> Option<(u64, CancellationToken)> {
        let mut listeners = self.listeners.lock().unwrap();
        if self.is_closed() {
            return None;
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        listeners.insert(id, stop.clone());
        Some((id, stop))
    }

    fn untrack_listener(&self, id: u64) {
        self.listeners.lock().unwrap().remove(&id);
    }

    /// Accepts connections on `listener` and dispatches each to `handler`
    /// on its own task until the server is closed or accept fails.
    ///
    /// Transient accept errors are retried after a fixed delay. The
    /// listener is owned by this call and unregistered (hence closed, by
    /// drop) on every exit path. Returns [`ServeError::ServerClosed`] if
    /// the server is already closed or gets closed while serving.
    pub async fn serve<L, H>(&self, listener: L, handler: H) -> Result<(), ServeError>
    where
        L: Listen,
        H: ConnHandler + 'static,
    {
        let (id, stop) = self.track_listener().ok_or(ServeError::ServerClosed)?;
        self.open.fetch_add(1, Ordering::SeqCst);
        defer! {
            self.untrack_listener(id);
            self.open.fetch_sub(1, Ordering::SeqCst);
        }

        if let Ok(addr) = listener.local_addr() {
            info!(?addr, "Listening");
        }

        let handler = Arc::new(handler);
        loop {
            let accepted = tokio::select! {
                () = stop.cancelled() => return Err(ServeError::ServerClosed),
                res = listener.accept() => res,
            };
            let (stream, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(?e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    if self.is_closed() {
                        return Err(ServeError::ServerClosed);
                    }
                    return Err(ServeError::Accept(e));
                }
            };

            self.open.fetch_add(1, Ordering::SeqCst);
            let open = Arc::clone(&self.open);
            let handler = Arc::clone(&handler);
            let panic_handler = self.panic_handler.clone();
            let cancellation = self.cancellation.child_token();
            tokio::spawn(async move {
                let socket = SocketContext::new(stream, peer_addr, cancellation);
                let res = std::panic::AssertUnwindSafe(handler.handle_conn(socket))
                    .catch_unwind()
                    .await;
                if let Err(payload) = res {
                    match &panic_handler {
                        Some(on_panic) => on_panic(peer_addr, payload),
                        None => error!(?peer_addr, "Connection handler panicked"),
                    }
                }
                open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Marks the server closed and stops every tracked listener.
    /// Idempotent. New `serve` calls fail with
    /// [`ServeError::ServerClosed`]; in-flight connection handlers keep
    /// running.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut listeners = self.listeners.lock().unwrap();
        for (_, stop) in listeners.drain() {
            stop.cancel();
        }
    }

    /// Closes the server, then waits for all accept loops and connection
    /// handlers to finish, polling the open-work counter with a capped
    /// exponential backoff and no overall limit. Returns
    /// [`ShutdownError::DeadlineExceeded`] if `deadline` fires first.
    pub async fn shutdown(&self, deadline: CancellationToken) -> Result<(), ShutdownError> {
        self.close();

        let mut interval = SHUTDOWN_POLL_INITIAL;
        loop {
            if self.open.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            tokio::select! {
                () = deadline.cancelled() => return Err(ShutdownError::DeadlineExceeded),
                () = tokio::time::sleep(interval) => {}
            }
            interval = interval.mul_f64(SHUTDOWN_POLL_MULTIPLIER).min(SHUTDOWN_POLL_MAX);
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Server closed")]
    ServerClosed,
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown deadline exceeded")]
    DeadlineExceeded,
}
