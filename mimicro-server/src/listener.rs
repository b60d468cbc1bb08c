//! HTTP accept loop shared by mock servers and the management API

use crate::response::{text_response, ResponseBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::future::Future;
use std::io::{self, ErrorKind, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Maximum time to read request headers, to produce a response and to
/// write it out
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before accepting again after a listener-level accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum time in-flight requests get to finish once shutdown starts
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Shutdown signal: flips to `true` once, when the process is going down
pub type Shutdown = watch::Receiver<bool>;

/// Resolve once shutdown was requested or the sending side is gone
pub async fn wait_for_shutdown(shutdown: &mut Shutdown) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve connections from `listener` with `handler` until `shutdown` fires,
/// then drain open connections for at most [`GRACE_PERIOD`].
pub async fn serve<H, F>(listener: TcpListener, label: Arc<str>, mut shutdown: Shutdown, handler: H)
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<ResponseBody>> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[{}] Failed to accept connection: {}", label, e);
                    if let Some(backoff) = accept_backoff(&e) {
                        tokio::select! {
                            _ = wait_for_shutdown(&mut shutdown) => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    continue;
                }
            },
        };
        debug!("[{}] Connection from {}", label, remote_addr);

        let io = TokioIo::new(WriteTimeout::new(stream, REQUEST_TIMEOUT));
        let handler = handler.clone();
        let mut shutdown = shutdown.clone();
        let label = label.clone();

        connections.spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                let label = label.clone();
                async move { Ok::<_, Infallible>(with_timeout(&label, handler(req)).await) }
            });

            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(REQUEST_TIMEOUT)
                .serve_connection(io, service);
            tokio::pin!(conn);

            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(err) = result {
                            debug!("Connection error: {:?}", err);
                        }
                        break;
                    }
                    _ = wait_for_shutdown(&mut shutdown), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        });

        // Reap finished connections so the set does not grow unbounded.
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    info!("[{}] Stopping...", label);

    let drained = tokio::time::timeout(GRACE_PERIOD, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "[{}] Shutdown error: {} connections still open after {:?}, closing them",
            label,
            connections.len(),
            GRACE_PERIOD
        );
        connections.abort_all();
    }

    info!("[{}] Stopped", label);
}

/// Errors of a single aborted connection are retried at once. Anything else
/// (e.g. running out of file descriptors) keeps failing, so back off.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn with_timeout<F>(label: &str, response: F) -> Response<ResponseBody>
where
    F: Future<Output = Response<ResponseBody>>,
{
    match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
        Ok(response) => response,
        Err(_) => {
            warn!("[{}] Request not handled within {:?}", label, REQUEST_TIMEOUT);
            text_response(StatusCode::SERVICE_UNAVAILABLE, "request timed out\n")
        }
    }
}

/// Stream whose writes fail with [`ErrorKind::TimedOut`] once the peer has
/// not accepted any data for `timeout`
pub struct WriteTimeout<S> {
    inner: S,
    timeout: Duration,
    stalled: Option<Pin<Box<Sleep>>>,
}

impl<S> WriteTimeout<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            stalled: None,
        }
    }

    fn poll_progress<T>(
        &mut self,
        cx: &mut Context<'_>,
        poll: Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if poll.is_ready() {
            self.stalled = None;
            return poll;
        }

        let timeout = self.timeout;
        let stalled = self
            .stalled
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match stalled.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                ErrorKind::TimedOut,
                "response not written within the request timeout",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WriteTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WriteTimeout<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        self.poll_progress(cx, poll)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        self.poll_progress(cx, poll)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_flush(cx);
        self.poll_progress(cx, poll)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
