//! WebSocket server handler: listen.
//!
//! One handler instance is shared by every loop of a runtime, so several
//! loops can listen on the same address and split its connections. A
//! second listen on a bound address must carry an identical
//! [`ServerConfig`], and a loop may subscribe to an address only once.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ev::{Callback, Handler, Loop, Outcome, Request};
use crate::identifiers::LoopId;
use crate::sync::Signal;
use crate::ws::{Connection, Server, ServerConfig};

// ============================================================================
// Types
// ============================================================================

struct ServerEntry {
    config: ServerConfig,
    server: Server,
    loops: Vec<LoopId>,
}

#[derive(Default)]
struct ServerState {
    servers: FxHashMap<String, ServerEntry>,
    pending: FxHashMap<LoopId, usize>,
}

// ============================================================================
// ServerHandler
// ============================================================================

/// Services [`Request::Listen`].
pub struct ServerHandler {
    state: Arc<Mutex<ServerState>>,
    stop: Signal,
}

impl ServerHandler {
    /// Creates a handler with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            stop: Signal::new(),
        }
    }

    /// Subscribes `ev` to connections accepted on `config.addr`, starting
    /// the listener if this is the first subscription.
    ///
    /// `callback` receives [`Outcome::Accepted`] per connection and a final
    /// error when the listener ends.
    ///
    /// # Errors
    ///
    /// - [`Error::ListenConflict`] if the address is bound with a different
    ///   configuration
    /// - [`Error::AlreadyListening`] if `ev` already listens there
    /// - [`Error::InvalidOrigin`] if the origin glob does not compile
    /// - [`Error::Listen`] if the shared listener ended while joining
    pub fn listen(&self, ev: &Loop, config: ServerConfig, callback: Callback) -> Result<()> {
        let loop_id = ev.id();

        let (server, fresh) = {
            let mut state = self.state.lock();

            let joinable = state
                .servers
                .get(&config.addr)
                .filter(|entry| !entry.server.is_finished());

            let (server, fresh) = match joinable {
                Some(entry) => {
                    if entry.config != config {
                        return Err(Error::listen_conflict(&config.addr));
                    }
                    if entry.loops.contains(&loop_id) {
                        return Err(Error::already_listening(&config.addr));
                    }
                    let server = entry.server.clone();
                    if let Some(entry) = state.servers.get_mut(&config.addr) {
                        entry.loops.push(loop_id);
                    }
                    (server, false)
                }
                None => {
                    let server = Server::new(config.clone())?;
                    state.servers.insert(
                        config.addr.clone(),
                        ServerEntry {
                            config: config.clone(),
                            server: server.clone(),
                            loops: vec![loop_id],
                        },
                    );
                    (server, true)
                }
            };

            *state.pending.entry(loop_id).or_default() += 1;
            (server, fresh)
        };

        let weak = ev.downgrade();
        let subscribed = server.subscribe(Arc::new(move |result: Result<Connection>| {
            match weak.upgrade() {
                Some(ev) => {
                    let callback = callback.clone();
                    ev.call(move || callback.invoke(result.map(Outcome::Accepted)));
                }
                None => {
                    if let Ok(conn) = result {
                        let _ = conn.close();
                    }
                }
            }
        }));

        let unsubscribe = {
            let state = Arc::clone(&self.state);
            let weak = ev.downgrade();
            let addr = config.addr.clone();
            let owner = server.clone();
            move || {
                release(&state, loop_id, &addr, &owner);
                if let Some(ev) = weak.upgrade() {
                    ev.wake();
                }
            }
        };

        if !subscribed {
            unsubscribe();
            return Err(Error::listen(&config.addr, "listener stopped"));
        }
        if !server.defer(unsubscribe.clone()) {
            // Hooks already ran; the subscriber was notified of the end.
            unsubscribe();
            return Ok(());
        }

        if fresh {
            server.listen(self.stop.clone())?;
            info!(addr = %config.addr, %loop_id, "Listening");
        } else {
            debug!(addr = %config.addr, %loop_id, "Joined existing listener");
        }
        Ok(())
    }

    /// Returns the number of active listen subscriptions of `ev`.
    #[must_use]
    pub fn pending(&self, ev: &Loop) -> usize {
        self.state.lock().pending.get(&ev.id()).copied().unwrap_or(0)
    }

    /// Returns the listener bound to `addr`, if any.
    #[must_use]
    pub fn server(&self, addr: &str) -> Option<Server> {
        self.state
            .lock()
            .servers
            .get(addr)
            .map(|entry| entry.server.clone())
    }
}

/// Drops one subscription of `loop_id`, and the registry entry if it still
/// points at `owner`.
fn release(state: &Mutex<ServerState>, loop_id: LoopId, addr: &str, owner: &Server) {
    let mut state = state.lock();
    if let Some(count) = state.pending.get_mut(&loop_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.pending.remove(&loop_id);
        }
    }
    if state
        .servers
        .get(addr)
        .is_some_and(|entry| entry.server.ptr_eq(owner))
    {
        state.servers.remove(addr);
    }
}

impl Default for ServerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ServerHandler {
    fn name(&self) -> &'static str {
        "ws-server"
    }

    fn handle(&self, ev: &Loop, request: Request, callback: Callback) -> Result<()> {
        match request {
            Request::Listen(config) => self.listen(ev, config, callback),
            other => Err(Error::unsupported_request(self.name(), other.name())),
        }
    }

    fn is_active(&self, ev: &Loop) -> bool {
        self.pending(ev) > 0
    }

    fn stop(&self) {
        self.stop.fire();
    }
}

impl fmt::Debug for ServerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerHandler")
            .field("servers", &state.servers.keys().collect::<Vec<_>>())
            .field("stopped", &self.stop.is_fired())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};

    use crate::ev::RequestKind;

    const WAIT: Duration = Duration::from_secs(3);

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn wait_listening(handler: &ServerHandler, addr: &str) {
        timeout(WAIT, async {
            while !handler.server(addr).is_some_and(|s| s.is_listening()) {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_config_rejected() {
        let handler = ServerHandler::new();
        let addr = free_addr();
        let first = Loop::new();
        let second = Loop::new();

        handler
            .listen(&first, ServerConfig::new(&addr), Callback::noop())
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-other", HeaderValue::from_static("1"));
        let err = handler
            .listen(&second, ServerConfig::new(&addr).with_headers(headers), Callback::noop())
            .unwrap_err();
        assert!(matches!(err, Error::ListenConflict { .. }));
        assert!(err.is_config_error());

        handler.stop();
    }

    #[tokio::test]
    async fn test_same_loop_twice_rejected() {
        let handler = ServerHandler::new();
        let addr = free_addr();
        let ev = Loop::new();

        handler
            .listen(&ev, ServerConfig::new(&addr), Callback::noop())
            .unwrap();
        let err = handler
            .listen(&ev, ServerConfig::new(&addr), Callback::noop())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyListening { .. }));
        assert_eq!(handler.pending(&ev), 1);

        handler.stop();
    }

    #[tokio::test]
    async fn test_two_loops_share_listener() {
        let handler = ServerHandler::new();
        let addr = free_addr();
        let first = Loop::new();
        let second = Loop::new();

        handler
            .listen(&first, ServerConfig::new(&addr), Callback::noop())
            .unwrap();
        handler
            .listen(&second, ServerConfig::new(&addr), Callback::noop())
            .unwrap();
        assert!(handler.is_active(&first));
        assert!(handler.is_active(&second));

        handler.stop();
        timeout(WAIT, async {
            while handler.is_active(&first) || handler.is_active(&second) {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(handler.server(&addr).is_none());
    }

    #[tokio::test]
    async fn test_accepted_connection_reaches_loop() {
        let handler = Arc::new(ServerHandler::new());
        let addr = free_addr();
        let ev = Loop::new();
        ev.register(RequestKind::WS_SERVER, handler.clone()).unwrap();

        let accepted = Signal::new();
        let flag = accepted.clone();
        let inner_ev = ev.clone();
        ev.request(
            RequestKind::WS_SERVER,
            Request::Listen(ServerConfig::new(&addr)),
            Callback::new(move |result| {
                if let Ok(Outcome::Accepted(_conn)) = result {
                    flag.fire();
                    inner_ev.stop();
                }
            }),
        );
        ev.run().unwrap();

        wait_listening(&handler, &addr).await;
        let _client = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        timeout(WAIT, ev.done()).await.unwrap();
        assert!(accepted.is_fired());
    }

    #[tokio::test]
    async fn test_handle_reports_conflict_on_callback() {
        let handler = Arc::new(ServerHandler::new());
        let addr = free_addr();
        let other = Loop::new();
        handler
            .listen(&other, ServerConfig::new(&addr), Callback::noop())
            .unwrap();

        let ev = Loop::new();
        ev.register(RequestKind::WS_SERVER, handler.clone()).unwrap();

        let conflict = Signal::new();
        let flag = conflict.clone();
        ev.request(
            RequestKind::WS_SERVER,
            Request::Listen(ServerConfig::new(&addr).with_origin("*")),
            Callback::new(move |result| {
                if matches!(result, Err(Error::ListenConflict { .. })) {
                    flag.fire();
                }
            }),
        );
        ev.run().unwrap();

        timeout(WAIT, ev.done()).await.unwrap();
        assert!(conflict.is_fired());
        handler.stop();
    }
}
