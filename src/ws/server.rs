//! Shared WebSocket listener.
//!
//! One [`Server`] exists per listen address. Loops subscribe to it and
//! accepted connections are handed to subscribers round-robin.
//!
//! # Accept Flow
//!
//! 1. Bind the TCP listener (`:port` binds all interfaces)
//! 2. Accept until the stop signal fires or the listener fails
//! 3. Upgrade each socket, checking `Origin` and adding configured headers
//! 4. Hand the connection (or upgrade error) to the next subscriber
//! 5. On exit notify every subscriber, then run deferred hooks

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, ORIGIN};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, trace, warn};

use crate::config::normalize_listen_addr;
use crate::error::{Error, Result};
use crate::sync::Signal;

use super::connection::Connection;
use super::origin::OriginPattern;

// ============================================================================
// Constants
// ============================================================================

/// Pause after a failed `accept` before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);

// ============================================================================
// Types
// ============================================================================

/// Receives accepted connections, upgrade errors and the final listener
/// error.
pub type Subscriber = Arc<dyn Fn(Result<Connection>) + Send + Sync>;

type Deferred = Box<dyn FnOnce() + Send>;

// ============================================================================
// ServerConfig
// ============================================================================

/// Listener settings. Two listens on one address must agree on all fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address, e.g. `:9001`.
    pub addr: String,
    /// Glob the `Origin` header must match.
    pub origin: Option<String>,
    /// Headers added to every handshake response.
    pub headers: HeaderMap,
}

impl ServerConfig {
    /// Creates a config for `addr` without origin check or extra headers.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            origin: None,
            headers: HeaderMap::new(),
        }
    }

    /// Sets the origin glob.
    #[inline]
    #[must_use]
    pub fn with_origin(mut self, pattern: impl Into<String>) -> Self {
        self.origin = Some(pattern.into());
        self
    }

    /// Sets response headers.
    #[inline]
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

// ============================================================================
// Server
// ============================================================================

struct ServerInner {
    config: ServerConfig,
    origin: Option<OriginPattern>,
    subscribers: Mutex<Vec<Subscriber>>,
    next: AtomicUsize,
    deferred: Mutex<Option<Vec<Deferred>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    listening: AtomicBool,
    finished: AtomicBool,
}

/// WebSocket listener shared by every loop listening on its address.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates an idle server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrigin`] if the origin glob does not compile.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let origin = config
            .origin
            .as_deref()
            .map(OriginPattern::new)
            .transpose()?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                origin,
                subscribers: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
                deferred: Mutex::new(Some(Vec::new())),
                local_addr: Mutex::new(None),
                listening: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the bound address once listening.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Returns `true` if both handles refer to the same listener.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `true` while the accept loop runs.
    #[inline]
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Returns `true` once the listener has ended.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Adds a subscriber. Returns `false` if the listener already ended.
    pub fn subscribe(&self, subscriber: Subscriber) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        if self.is_finished() {
            return false;
        }
        subscribers.push(subscriber);
        true
    }

    /// Registers a hook run once when the listener ends.
    ///
    /// Returns `false`, dropping `f`, if the hooks already ran.
    pub fn defer<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner.deferred.lock().as_mut() {
            Some(deferred) => {
                deferred.push(Box::new(f));
                true
            }
            None => false,
        }
    }

    /// Starts binding and accepting in the background until `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside a tokio runtime.
    pub fn listen(&self, stop: Signal) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|_| Error::config("Server::listen requires a tokio runtime"))?;

        let server = self.clone();
        handle.spawn(async move { server.serve(stop).await });
        Ok(())
    }

    async fn serve(self, stop: Signal) {
        let addr = normalize_listen_addr(&self.inner.config.addr);

        let reason = match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let bound = listener.local_addr().ok();
                *self.inner.local_addr.lock() = bound;
                self.inner.listening.store(true, Ordering::Release);
                info!(addr = %self.inner.config.addr, ?bound, "WebSocket server listening");

                self.accept_loop(listener, stop).await
            }
            Err(e) => {
                warn!(addr = %self.inner.config.addr, error = %e, "Bind failed");
                e.to_string()
            }
        };

        self.finish(&reason);
    }

    async fn accept_loop(&self, listener: TcpListener, stop: Signal) -> String {
        loop {
            tokio::select! {
                () = stop.wait() => return "listener stopped".to_string(),
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        trace!(?peer, "TCP connection accepted");
                        let server = self.clone();
                        tokio::spawn(async move { server.upgrade(tcp, peer).await });
                    }
                    Err(e) => {
                        warn!(addr = %self.inner.config.addr, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    async fn upgrade(self, tcp: TcpStream, peer: SocketAddr) {
        let origin = self.inner.origin.clone();
        let headers = self.inner.config.headers.clone();

        let check = move |request: &Request, mut response: Response| {
            if let Some(pattern) = &origin {
                let got = request
                    .headers()
                    .get(ORIGIN)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();

                if !pattern.matches(got) {
                    debug!(origin = got, %pattern, "Origin rejected");
                    let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
                    *rejection.status_mut() = StatusCode::FORBIDDEN;
                    return Err(rejection);
                }
            }

            for (name, value) in &headers {
                response.headers_mut().append(name.clone(), value.clone());
            }
            Ok(response)
        };

        let result = accept_hdr_async(tcp, check)
            .await
            .map(|stream| Connection::new(stream, Some(peer)))
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")));

        if let Ok(ref conn) = result {
            debug!(conn_id = %conn.id(), ?peer, "WebSocket connection established");
        }
        self.dispatch(result);
    }

    fn dispatch(&self, result: Result<Connection>) {
        let subscriber = {
            let subscribers = self.inner.subscribers.lock();
            if subscribers.is_empty() {
                None
            } else {
                let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % subscribers.len();
                Some(Arc::clone(&subscribers[index]))
            }
        };

        match (subscriber, result) {
            (Some(subscriber), result) => subscriber(result),
            (None, Ok(conn)) => {
                let _ = conn.close();
            }
            (None, Err(_)) => {}
        }
    }

    fn finish(&self, reason: &str) {
        self.inner.listening.store(false, Ordering::Release);
        info!(addr = %self.inner.config.addr, reason, "WebSocket server stopped");

        let subscribers = {
            let mut subscribers = self.inner.subscribers.lock();
            self.inner.finished.store(true, Ordering::Release);
            std::mem::take(&mut *subscribers)
        };
        for subscriber in subscribers {
            subscriber(Err(Error::listen(&self.inner.config.addr, reason)));
        }

        let deferred = self.inner.deferred.lock().take().unwrap_or_default();
        for f in deferred {
            f();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.config.addr)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    use crate::ws::Message;

    const WAIT: Duration = Duration::from_secs(2);

    fn channel_subscriber() -> (Subscriber, mpsc::UnboundedReceiver<Result<Connection>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber: Subscriber = Arc::new(move |result| {
            let _ = tx.send(result);
        });
        (subscriber, rx)
    }

    async fn started(config: ServerConfig) -> (Server, Signal, SocketAddr) {
        let server = Server::new(config).unwrap();
        let stop = Signal::new();
        server.listen(stop.clone()).unwrap();

        timeout(WAIT, async {
            while server.local_addr().is_none() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        let addr = server.local_addr().unwrap();
        (server, stop, addr)
    }

    #[test]
    fn test_invalid_origin_rejected_upfront() {
        let err = Server::new(ServerConfig::new(":0").with_origin("{a")).unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_accept_and_exchange() {
        let (server, stop, addr) = started(ServerConfig::new("127.0.0.1:0")).await;
        let (subscriber, mut accepted) = channel_subscriber();
        server.subscribe(subscriber);

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let client = Connection::new(ws, Some(addr));
        client.send(Message::text("ping")).await.unwrap();

        let conn = timeout(WAIT, accepted.recv()).await.unwrap().unwrap().unwrap();
        let message = timeout(WAIT, conn.receive()).await.unwrap().unwrap();
        assert_eq!(message.as_text(), Some("ping"));

        stop.fire();
    }

    #[tokio::test]
    async fn test_response_headers_added() {
        let mut headers = HeaderMap::new();
        headers.insert("x-server", HeaderValue::from_static("wsev"));
        let (server, stop, addr) =
            started(ServerConfig::new("127.0.0.1:0").with_headers(headers)).await;
        let (subscriber, _accepted) = channel_subscriber();
        server.subscribe(subscriber);

        let (_ws, response) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-server"], "wsev");

        stop.fire();
    }

    #[tokio::test]
    async fn test_origin_mismatch_is_forbidden() {
        let (server, stop, addr) =
            started(ServerConfig::new("127.0.0.1:0").with_origin("http://*.good.io")).await;
        let (subscriber, mut accepted) = channel_subscriber();
        server.subscribe(subscriber);

        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static("http://evil.io"));

        let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
        assert!(matches!(
            err,
            tokio_tungstenite::tungstenite::Error::Http(ref response)
                if response.status() == StatusCode::FORBIDDEN
        ));

        let upgrade = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert!(upgrade.is_err());

        stop.fire();
    }

    #[tokio::test]
    async fn test_round_robin_between_subscribers() {
        let (server, stop, addr) = started(ServerConfig::new("127.0.0.1:0")).await;
        let (first, mut first_rx) = channel_subscriber();
        let (second, mut second_rx) = channel_subscriber();
        server.subscribe(first);
        server.subscribe(second);

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
                .await
                .unwrap();
            clients.push(ws);
        }

        assert!(timeout(WAIT, first_rx.recv()).await.unwrap().unwrap().is_ok());
        assert!(timeout(WAIT, second_rx.recv()).await.unwrap().unwrap().is_ok());

        stop.fire();
    }

    #[tokio::test]
    async fn test_stop_runs_deferred_and_notifies() {
        let (server, stop, _addr) = started(ServerConfig::new("127.0.0.1:0")).await;
        let (subscriber, mut accepted) = channel_subscriber();
        server.subscribe(subscriber);

        let deferred = Signal::new();
        let hook = deferred.clone();
        server.defer(move || {
            hook.fire();
        });

        stop.fire();

        let result = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Listen { .. })));
        timeout(WAIT, deferred.wait()).await.unwrap();
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_bind_failure_notifies() {
        let (_first, stop, addr) = started(ServerConfig::new("127.0.0.1:0")).await;

        let second = Server::new(ServerConfig::new(addr.to_string())).unwrap();
        let (subscriber, mut accepted) = channel_subscriber();
        second.subscribe(subscriber);
        second.listen(Signal::new()).unwrap();

        let result = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(err.is_connection_error());

        stop.fire();
    }
}
