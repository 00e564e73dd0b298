//! WebSocket client handler: connect, send and receive.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::config::DialConfig;
use crate::error::{Error, Result};
use crate::ev::{Callback, Connect, Handler, Loop, Outcome, Outgoing, PendingGuard, Receive, Request};
use crate::sync::Signal;
use crate::ws::dial;

// ============================================================================
// ClientHandler
// ============================================================================

/// Services [`Request::Connect`], [`Request::Send`] and [`Request::Receive`].
///
/// Every operation runs on its own tokio task and reports back through
/// [`Loop::call`]. A handler may be registered in one loop only.
pub struct ClientHandler {
    dial: DialConfig,
    pending: Arc<AtomicUsize>,
    registered: AtomicBool,
    stop: Signal,
}

impl ClientHandler {
    /// Creates a handler dialing with `dial`.
    #[must_use]
    pub fn new(dial: DialConfig) -> Self {
        Self {
            dial,
            pending: Arc::new(AtomicUsize::new(0)),
            registered: AtomicBool::new(false),
            stop: Signal::new(),
        }
    }

    /// Returns the number of in-flight operations.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn connect(&self, ev: &Loop, request: Connect, callback: Callback) {
        let guard = PendingGuard::new(&self.pending, ev);
        let stop = self.stop.clone();
        let done = ev.done_signal();
        let config = self.dial.clone();
        let ev = ev.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let result = tokio::select! {
                () = stop.wait() => return,
                () = done.wait() => return,
                result = dial(&request.url, &request.headers, &config) => result,
            };

            if let Err(ref e) = result {
                debug!(url = %request.url, error = %e, "Connect failed");
            }
            ev.call(move || callback.invoke(result.map(Outcome::Connected)));
        });
    }

    fn send(&self, ev: &Loop, request: Outgoing, callback: Callback) {
        let guard = PendingGuard::new(&self.pending, ev);
        let stop = self.stop.clone();
        // Queued here so writes keep dispatch order.
        let reply = request.conn.send_async(request.message);
        let ev = ev.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let result = tokio::select! {
                () = stop.wait() => return,
                reply = reply => reply.unwrap_or(Err(Error::ConnectionClosed)),
            };
            ev.call(move || callback.invoke(result.map(|()| Outcome::Sent)));
        });
    }

    fn receive(&self, ev: &Loop, request: Receive, callback: Callback) {
        let guard = PendingGuard::new(&self.pending, ev);
        let stop = self.stop.clone();
        let done = ev.done_signal();
        let ev = ev.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let conn = request.connection().clone();
            let closed = conn.done_signal();
            let cancel = request.cancel_signal().clone();

            loop {
                let next = conn.receive_async();
                let result = tokio::select! {
                    () = stop.wait() => return,
                    () = done.wait() => return,
                    () = closed.wait() => return,
                    () = cancel.wait() => return,
                    next = next => next.unwrap_or(Err(Error::ConnectionClosed)),
                };

                match result {
                    Ok(message) => {
                        trace!(conn_id = %conn.id(), kind = %message.kind, "Delivering message");
                        let callback = callback.clone();
                        ev.call(move || callback.invoke(Ok(Outcome::Message(message))));
                    }
                    Err(e) => {
                        debug!(conn_id = %conn.id(), error = %e, "Receive ended");
                        ev.call(move || callback.invoke(Err(e)));
                        return;
                    }
                }
            }
        });
    }
}

impl Default for ClientHandler {
    fn default() -> Self {
        Self::new(DialConfig::default())
    }
}

impl Handler for ClientHandler {
    fn name(&self) -> &'static str {
        "ws-client"
    }

    fn init(&self, _ev: &Loop) -> Result<()> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(Error::HandlerAlreadyRegistered {
                handler: self.name(),
            });
        }
        Ok(())
    }

    fn handle(&self, ev: &Loop, request: Request, callback: Callback) -> Result<()> {
        match request {
            Request::Connect(connect) => self.connect(ev, connect, callback),
            Request::Send(outgoing) => self.send(ev, outgoing, callback),
            Request::Receive(receive) => self.receive(ev, receive, callback),
            other => return Err(Error::unsupported_request(self.name(), other.name())),
        }
        Ok(())
    }

    fn is_active(&self, _ev: &Loop) -> bool {
        self.pending() > 0
    }

    fn stop(&self) {
        self.stop.fire();
    }
}

impl fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandler")
            .field("pending", &self.pending())
            .field("stopped", &self.stop.is_fired())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::ev::RequestKind;
    use crate::ws::{Connection, Message, Responder, respond};

    const WAIT: Duration = Duration::from_secs(3);

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, peer)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        let _ = respond(&Connection::new(ws, Some(peer)), Responder::Echo).await;
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn test_single_loop_only() {
        let handler = Arc::new(ClientHandler::default());
        Loop::new()
            .register(RequestKind::WS_CLIENT, handler.clone())
            .unwrap();

        let err = Loop::new()
            .register(RequestKind::WS_CLIENT, handler)
            .unwrap_err();
        assert!(err.is_programming_error());
    }

    #[test]
    fn test_rejects_foreign_payload() {
        let handler = ClientHandler::default();
        let err = handler
            .handle(&Loop::new(), Request::Value(json!(1)), Callback::noop())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedRequest { request: "value", .. }));
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let url = echo_server().await;
        let ev = Loop::new();
        ev.register(RequestKind::WS_CLIENT, Arc::new(ClientHandler::default()))
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let inner_ev = ev.clone();

        ev.request(
            RequestKind::WS_CLIENT,
            Request::Connect(Connect::new(url)),
            Callback::new(move |result| {
                let conn = result.unwrap().into_connection().unwrap();
                let receive = Receive::new(conn.clone());
                let stopper = receive.clone();
                let sink = Arc::clone(&sink);

                inner_ev.request(
                    RequestKind::WS_CLIENT,
                    Request::Receive(receive),
                    Callback::new(move |result| {
                        if let Ok(Outcome::Message(message)) = result {
                            sink.lock().push(message.into_text().unwrap_or_default());
                            stopper.cancel();
                        }
                    }),
                );
                inner_ev.request(
                    RequestKind::WS_CLIENT,
                    Request::Send(Outgoing::new(conn, Message::text("ping"))),
                    Callback::new(|result| assert!(matches!(result, Ok(Outcome::Sent)))),
                );
            }),
        );

        ev.run().unwrap();
        timeout(WAIT, ev.done()).await.unwrap();

        assert_eq!(*received.lock(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ev = Loop::new();
        ev.register(RequestKind::WS_CLIENT, Arc::new(ClientHandler::default()))
            .unwrap();

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        ev.request(
            RequestKind::WS_CLIENT,
            Request::Connect(Connect::new(format!("ws://{addr}"))),
            Callback::new(move |result| {
                if let Err(e) = result {
                    assert!(e.is_connection_error());
                    flag.store(true, Ordering::SeqCst);
                }
            }),
        );

        ev.run().unwrap();
        timeout(WAIT, ev.done()).await.unwrap();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_abandons_receive() {
        let url = echo_server().await;
        let conn = dial(&url, &Default::default(), &DialConfig::new())
            .await
            .unwrap();

        let ev = Loop::new();
        let handler = Arc::new(ClientHandler::default());
        ev.register(RequestKind::WS_CLIENT, handler.clone()).unwrap();
        ev.request(
            RequestKind::WS_CLIENT,
            Request::Receive(Receive::new(conn)),
            Callback::noop(),
        );

        ev.run().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.pending(), 1);

        ev.stop();
        timeout(WAIT, ev.done()).await.unwrap();
        assert_eq!(handler.pending(), 0);
    }
}
