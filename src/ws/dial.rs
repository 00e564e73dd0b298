//! Client-side dialing.

// ============================================================================
// Imports
// ============================================================================

use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::{MaybeTlsStream, connect_async_with_config};
use tracing::debug;

use crate::config::DialConfig;
use crate::error::{Error, Result};

use super::connection::Connection;

// ============================================================================
// dial
// ============================================================================

/// Connects to `url`, sending `headers` with the upgrade request.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if the handshake exceeds
///   `config.connect_timeout`
/// - [`Error::WebSocket`] if the URL is invalid or the handshake fails
/// - [`Error::Io`] if the TCP connect fails
pub async fn dial(url: &str, headers: &HeaderMap, config: &DialConfig) -> Result<Connection> {
    let mut request = url.into_client_request()?;
    for (name, value) in headers {
        request.headers_mut().append(name.clone(), value.clone());
    }

    let timeout_ms = u64::try_from(config.connect_timeout.as_millis()).unwrap_or(u64::MAX);
    let (stream, response) = timeout(
        config.connect_timeout,
        connect_async_with_config(request, None, config.nodelay),
    )
    .await
    .map_err(|_| Error::connection_timeout(timeout_ms))??;

    let peer_addr = match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };

    debug!(url, status = %response.status(), ?peer_addr, "WebSocket dialed");
    Ok(Connection::new(stream, peer_addr))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[tokio::test]
    async fn test_dial_sends_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let _ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                 response| {
                    seen = request.headers().get("x-token").cloned();
                    Ok(response)
                },
            )
            .await
            .unwrap();
            seen
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-token", HeaderValue::from_static("abc"));
        let conn = dial(&format!("ws://{addr}"), &headers, &DialConfig::new())
            .await
            .unwrap();

        assert_eq!(conn.peer_addr(), Some(addr));
        assert_eq!(server.await.unwrap().unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = DialConfig::new().with_connect_timeout(Duration::from_secs(2));
        let err = dial(&format!("ws://{addr}"), &HeaderMap::new(), &config)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_dial_invalid_url() {
        let err = dial("not a url", &HeaderMap::new(), &DialConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebSocket(_)));
    }
}
