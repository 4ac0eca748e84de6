//! Single-port connection multiplexer
//!
//! One TCP listener feeds several virtual listeners. Each accepted connection
//! is sniffed (see [`matcher`]) and handed to the first virtual listener whose
//! [`Matcher`] accepts it, with every sniffed byte replayed. The gateway uses
//! two: gRPC traffic goes to the tonic engine and everything else to axum.
//!
//! Connection lifecycle: accepted, classifying, then routed or rejected.
//! Rejected connections (unmatched, timed out, read failure) are closed.

pub mod conn;
pub mod matcher;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use conn::MuxConn;
pub use matcher::{HTTP2_PREFACE, MAX_SNIFF_BYTES, Matcher, Sniffed, sniff};

/// Multiplexer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOptions {
    /// Time a new connection gets to identify itself
    pub classify_timeout: Duration,

    /// Classified connections queued per virtual listener
    pub backlog: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            classify_timeout: Duration::from_secs(10),
            backlog: 128,
        }
    }
}

struct Accepted {
    conn: MuxConn<TcpStream>,
    remote_addr: SocketAddr,
}

struct Route {
    matcher: Matcher,
    tx: mpsc::Sender<Accepted>,
}

/// Splits one TCP listener into matcher-selected virtual listeners
pub struct ConnectionMux {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: Vec<Route>,
    options: MuxOptions,
}

impl ConnectionMux {
    /// Wrap a bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the listener's local address cannot be read
    pub fn new(listener: TcpListener, options: MuxOptions) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            routes: Vec::new(),
            options,
        })
    }

    /// Address of the underlying listener
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a virtual listener
    ///
    /// Matchers are tried in the order they were added; put catch-all
    /// matchers last.
    pub fn match_with(&mut self, matcher: Matcher) -> MuxListener {
        let (tx, rx) = mpsc::channel(self.options.backlog.max(1));
        self.routes.push(Route { matcher, tx });
        MuxListener {
            rx,
            local_addr: self.local_addr,
        }
    }

    /// Accept and classify connections until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails for a reason other than a connection
    /// being reset before it was accepted
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let dispatcher = Arc::new(Dispatcher {
            send_settings: self.routes.iter().any(|r| r.matcher.sends_settings()),
            routes: self.routes,
            classify_timeout: self.options.classify_timeout,
        });

        tracing::debug!(addr = %self.local_addr, "connection multiplexer running");

        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) if is_accept_error(&e) => {
                    tracing::debug!(error = %e, "connection failed before accept");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return Err(Error::Server(format!("accept failed: {e}")));
                }
            };

            tracing::debug!(peer = %remote_addr, "connection accepted");
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(stream, remote_addr).await });
        }

        tracing::debug!("connection multiplexer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMux")
            .field("local_addr", &self.local_addr)
            .field("listeners", &self.routes.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct Dispatcher {
    routes: Vec<Route>,
    send_settings: bool,
    classify_timeout: Duration,
}

impl Dispatcher {
    async fn dispatch(&self, mut stream: TcpStream, remote_addr: SocketAddr) {
        let sniffed = match tokio::time::timeout(
            self.classify_timeout,
            sniff(&mut stream, self.send_settings),
        )
        .await
        {
            Ok(Ok(sniffed)) => sniffed,
            Ok(Err(e)) => {
                tracing::debug!(
                    peer = %remote_addr,
                    error = %e,
                    "connection rejected: read failed"
                );
                return;
            }
            Err(_) => {
                tracing::debug!(
                    peer = %remote_addr,
                    "connection rejected: classification timed out"
                );
                return;
            }
        };

        let Some((index, route)) = self
            .routes
            .iter()
            .enumerate()
            .find(|(_, route)| route.matcher.matches(&sniffed))
        else {
            tracing::debug!(peer = %remote_addr, "connection rejected: no matching listener");
            return;
        };

        tracing::debug!(
            peer = %remote_addr,
            listener = index,
            http2 = sniffed.is_http2(),
            "connection routed"
        );

        let accepted = Accepted {
            conn: MuxConn::new(stream, sniffed),
            remote_addr,
        };
        if route.tx.send(accepted).await.is_err() {
            tracing::debug!(
                peer = %remote_addr,
                listener = index,
                "listener closed, dropping connection"
            );
        }
    }
}

/// Connection errors that only affect the connection being accepted
fn is_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Virtual listener fed by a [`ConnectionMux`]
///
/// Usable as a tonic incoming stream and as an axum listener.
#[derive(Debug)]
pub struct MuxListener {
    rx: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl MuxListener {
    /// Wait for the next routed connection; `None` once the multiplexer stops
    pub async fn next_conn(&mut self) -> Option<(MuxConn<TcpStream>, SocketAddr)> {
        self.rx
            .recv()
            .await
            .map(|accepted| (accepted.conn, accepted.remote_addr))
    }
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Stream for MuxListener {
    type Item = io::Result<MuxConn<TcpStream>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|accepted| accepted.map(|a| Ok(a.conn)))
    }
}

impl axum::serve::Listener for MuxListener {
    type Io = MuxConn<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.next_conn().await {
            Some(conn) => conn,
            // The engine is stopped through graceful shutdown, not by the
            // listener running dry
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
