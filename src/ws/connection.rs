//! Duplex WebSocket connection with serialized concurrent access.
//!
//! A [`Connection`] owns one writer task and one reader task. Callers
//! submit request envelopes over private channels, each carrying its own
//! oneshot reply, so any number of tasks may `send` and `receive`
//! concurrently while the socket sees exactly one writer and one reader.
//!
//! # Worker lifecycle
//!
//! Workers start at most once, either explicitly via
//! [`Connection::init_workers`] or lazily on first use. [`Connection::close`]
//! fires the `done` signal, which stops both workers and fails every caller
//! still waiting for a reply.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::sync::Signal;

use super::message::{Message, MessageKind};

// ============================================================================
// Types
// ============================================================================

type WsSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send>>;

/// Envelope for one write.
struct WriteRequest {
    message: Message,
    reply: oneshot::Sender<Result<()>>,
}

/// Envelope for one read.
struct ReadRequest {
    reply: oneshot::Sender<Result<Message>>,
}

/// Socket halves and queues, held until the workers take them.
struct Workers {
    sink: WsSink,
    source: WsSource,
    writes: mpsc::UnboundedReceiver<WriteRequest>,
    reads: mpsc::UnboundedReceiver<ReadRequest>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    read_tx: mpsc::UnboundedSender<ReadRequest>,
    workers: Mutex<Option<Workers>>,
    running: AtomicBool,
    done: Signal,
}

// ============================================================================
// Connection
// ============================================================================

/// WebSocket connection shared between handlers and scripts.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wraps an established WebSocket stream.
    ///
    /// Workers are not started until first use.
    pub fn new<S>(stream: WebSocketStream<S>, peer_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (write_tx, writes) = mpsc::unbounded_channel();
        let (read_tx, reads) = mpsc::unbounded_channel();

        let workers = Workers {
            sink: Box::pin(sink),
            source: Box::pin(source),
            writes,
            reads,
        };

        let id = ConnectionId::next();
        trace!(conn_id = %id, ?peer_addr, "Connection created");

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer_addr,
                write_tx,
                read_tx,
                workers: Mutex::new(Some(workers)),
                running: AtomicBool::new(false),
                done: Signal::new(),
            }),
        }
    }

    /// Returns the connection identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the remote address, when known.
    #[inline]
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Returns `true` once the I/O workers have started.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Returns `true` once [`Connection::close`] has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_fired()
    }

    /// Starts the reader and writer tasks. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside a tokio runtime.
    pub fn init_workers(&self) -> Result<()> {
        let mut slot = self.inner.workers.lock();
        if slot.is_none() {
            return Ok(());
        }

        let handle = Handle::try_current()
            .map_err(|_| Error::config("Connection workers require a tokio runtime"))?;

        let Some(workers) = slot.take() else {
            return Ok(());
        };

        let id = self.inner.id;
        handle.spawn(write_loop(id, workers.sink, workers.writes, self.inner.done.clone()));
        handle.spawn(read_loop(id, workers.source, workers.reads, self.inner.done.clone()));

        self.inner.running.store(true, Ordering::Release);
        debug!(conn_id = %id, "Connection workers started");
        Ok(())
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Queues `message` and returns the receiver of its write result.
    pub fn send_async(&self, message: Message) -> oneshot::Receiver<Result<()>> {
        let (reply, rx) = oneshot::channel();

        if self.is_closed() {
            let _ = reply.send(Err(Error::ConnectionClosed));
            return rx;
        }
        if let Err(e) = self.init_workers() {
            let _ = reply.send(Err(e));
            return rx;
        }
        if let Err(mpsc::error::SendError(request)) =
            self.inner.write_tx.send(WriteRequest { message, reply })
        {
            let _ = request.reply.send(Err(Error::ConnectionClosed));
        }

        rx
    }

    /// Writes `message`, waiting until the write completes.
    ///
    /// Blocks only the calling task.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is or becomes closed
    /// - [`Error::WebSocket`] if the write fails
    pub async fn send(&self, message: Message) -> Result<()> {
        self.send_async(message)
            .await
            .unwrap_or(Err(Error::ConnectionClosed))
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Queues a read and returns the receiver of the next message.
    pub fn receive_async(&self) -> oneshot::Receiver<Result<Message>> {
        let (reply, rx) = oneshot::channel();

        if self.is_closed() {
            let _ = reply.send(Err(Error::ConnectionClosed));
            return rx;
        }
        if let Err(e) = self.init_workers() {
            let _ = reply.send(Err(e));
            return rx;
        }
        if let Err(mpsc::error::SendError(request)) =
            self.inner.read_tx.send(ReadRequest { reply })
        {
            let _ = request.reply.send(Err(Error::ConnectionClosed));
        }

        rx
    }

    /// Waits for the next text or binary message.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] when the peer closed or the connection
    ///   was closed locally
    /// - [`Error::WebSocket`] on a read failure
    pub async fn receive(&self) -> Result<Message> {
        self.receive_async()
            .await
            .unwrap_or(Err(Error::ConnectionClosed))
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Closes the connection and releases every waiting caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] on the second call.
    pub fn close(&self) -> Result<()> {
        if !self.inner.done.fire() {
            return Err(Error::AlreadyClosed);
        }

        // The writer closes the socket itself; unstarted halves are closed here.
        if let Some(workers) = self.inner.workers.lock().take() {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let mut sink = workers.sink;
                        let _ = sink.close().await;
                    });
                }
                Err(_) => drop(workers),
            }
        }

        debug!(conn_id = %self.inner.id, "Connection closed");
        Ok(())
    }

    /// Waits until the connection is closed.
    pub async fn done(&self) {
        self.inner.done.wait().await;
    }

    /// Returns the signal fired on close.
    #[inline]
    #[must_use]
    pub fn done_signal(&self) -> Signal {
        self.inner.done.clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn write_loop(
    id: ConnectionId,
    mut sink: WsSink,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    done: Signal,
) {
    loop {
        let request = tokio::select! {
            () = done.wait() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let kind = request.message.kind;
        let result = sink.send(request.message.into_ws()).await.map_err(Error::from);
        if let Err(ref e) = result {
            warn!(conn_id = %id, error = %e, "Write failed");
        } else {
            trace!(conn_id = %id, %kind, "Message written");
        }
        let _ = request.reply.send(result);
    }

    let _ = sink.close().await;
    trace!(conn_id = %id, "Writer stopped");
}

async fn read_loop(
    id: ConnectionId,
    mut source: WsSource,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    done: Signal,
) {
    // A read whose caller went away is handed to the next caller.
    let mut carried: Option<Result<Message>> = None;

    loop {
        let request = tokio::select! {
            () = done.wait() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        if request.reply.is_closed() {
            continue;
        }

        let result = match carried.take() {
            Some(result) => result,
            None => {
                let result = tokio::select! {
                    () = done.wait() => break,
                    result = next_message(&mut source) => result,
                };
                if let Ok(ref message) = result {
                    trace!(conn_id = %id, kind = %message.kind, len = message.len(), "Message read");
                }
                result
            }
        };

        if let Err(result) = request.reply.send(result) {
            trace!(conn_id = %id, "Receiver gone, keeping read for next caller");
            carried = Some(result);
        }
    }

    trace!(conn_id = %id, "Reader stopped");
}

/// Reads until a data message, skipping control frames.
async fn next_message(source: &mut WsSource) -> Result<Message> {
    loop {
        match source.next().await {
            None => return Err(Error::ConnectionClosed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(frame)) => match Message::from_ws(frame) {
                Some(message) if message.kind == MessageKind::Close => {
                    return Err(Error::ConnectionClosed);
                }
                Some(message) if matches!(message.kind, MessageKind::Text | MessageKind::Binary) => {
                    return Ok(message);
                }
                _ => {}
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, peer) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            Connection::new(ws, Some(peer))
        });

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let client = Connection::new(ws, Some(addr));
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_send_receive() {
        let (client, server) = pair().await;
        assert!(!client.is_running());

        client.send(Message::text("ping")).await.unwrap();
        assert!(client.is_running());

        let message = timeout(WAIT, server.receive()).await.unwrap().unwrap();
        assert_eq!(message.data, b"ping");
        assert_eq!(message.kind, MessageKind::Text);
    }

    #[tokio::test]
    async fn test_init_workers_idempotent() {
        let (client, _server) = pair().await;
        client.init_workers().unwrap();
        client.init_workers().unwrap();
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_sends() {
        let (client, server) = pair().await;

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let conn = client.clone();
                tokio::spawn(async move { conn.send(Message::text(format!("msg-{i}"))).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let message = timeout(WAIT, server.receive()).await.unwrap().unwrap();
            seen.insert(message.into_text().unwrap());
        }

        let expected: HashSet<String> = (0..20).map(|i| format!("msg-{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_double_close() {
        let (client, _server) = pair().await;
        client.close().unwrap();
        assert!(client.is_closed());
        assert!(matches!(client.close(), Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_close_releases_pending_receive() {
        let (client, _server) = pair().await;

        let pending = {
            let conn = client.clone();
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.close().unwrap();
        let result = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_abandoned_receive_keeps_message() {
        let (client, server) = pair().await;

        drop(client.receive_async());
        server.send(Message::text("first")).await.unwrap();
        server.send(Message::text("second")).await.unwrap();

        let first = timeout(WAIT, client.receive()).await.unwrap().unwrap();
        let second = timeout(WAIT, client.receive()).await.unwrap().unwrap();
        assert_eq!(first.data, b"first");
        assert_eq!(second.data, b"second");
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (client, _server) = pair().await;
        client.close().unwrap();
        let err = client.send(Message::text("late")).await.unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let (client, server) = pair().await;
        server.init_workers().unwrap();
        client.close().unwrap();

        let err = timeout(WAIT, server.receive()).await.unwrap().unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_done_resolves_on_close() {
        let (client, _server) = pair().await;
        let waiter = {
            let conn = client.clone();
            tokio::spawn(async move { conn.done().await })
        };
        client.close().unwrap();
        timeout(WAIT, waiter).await.unwrap().unwrap();
    }
}
