//! Configuration and parsing helpers.
//!
//! A [`Config`] is built once at startup and passed by reference to the
//! runtime, loops and handlers.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wsev::config::{Config, parse_headers};
//!
//! let config = Config::new()
//!     .with_url("localhost:9001/chat")
//!     .with_headers(parse_headers("X-Token: abc; X-Client: bench").unwrap())
//!     .with_grace(Duration::from_secs(2));
//!
//! assert!(config.validate().is_ok());
//! let (url, headers) = config.dial_target().unwrap();
//! assert_eq!(url.as_str(), "ws://localhost:9001/chat");
//! assert_eq!(headers["origin"], "http://localhost:9001");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio_tungstenite::tungstenite::http::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default dial target.
pub const DEFAULT_URL: &str = ":3000";

/// Default listen address.
pub const DEFAULT_LISTEN: &str = ":3000";

/// Default time between soft and hard shutdown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(4);

/// Default statistics reporting interval.
pub const DEFAULT_STAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Separator between header pairs in [`parse_headers`].
pub const HEADER_SEPARATOR: char = ';';

/// Separator between header name and value.
pub const HEADER_ASSIGNMENT: char = ':';

// ============================================================================
// DialConfig
// ============================================================================

/// Client dial options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialConfig {
    /// Upper bound on TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on the socket.
    pub nodelay: bool,
}

impl DialConfig {
    /// Creates dial options with defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    /// Sets the dial timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets `TCP_NODELAY`.
    #[inline]
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Config
// ============================================================================

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Dial target; the `ws://` scheme is implied when missing.
    pub url: String,

    /// Listen address, e.g. `:3000` or `127.0.0.1:9001`.
    pub listen: String,

    /// Headers sent on dial and echoed on accept.
    pub headers: HeaderMap,

    /// Client dial options.
    pub dial: DialConfig,

    /// Time between soft and hard shutdown.
    pub grace: Duration,

    /// Scheduler idle re-check interval.
    pub idle_recheck: Duration,

    /// Statistics reporting interval.
    pub stat_interval: Duration,
}

impl Config {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            listen: DEFAULT_LISTEN.to_string(),
            headers: HeaderMap::new(),
            dial: DialConfig::new(),
            grace: DEFAULT_GRACE,
            idle_recheck: crate::ev::DEFAULT_IDLE_RECHECK,
            stat_interval: DEFAULT_STAT_INTERVAL,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl Config {
    /// Sets the dial target.
    #[inline]
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn with_listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = addr.into();
        self
    }

    /// Replaces the header set.
    #[inline]
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Appends one header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets dial options.
    #[inline]
    #[must_use]
    pub fn with_dial(mut self, dial: DialConfig) -> Self {
        self.dial = dial;
        self
    }

    /// Sets the shutdown grace window.
    #[inline]
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets the scheduler idle re-check interval.
    #[inline]
    #[must_use]
    pub fn with_idle_recheck(mut self, interval: Duration) -> Self {
        self.idle_recheck = interval;
        self
    }

    /// Sets the statistics interval.
    #[inline]
    #[must_use]
    pub fn with_stat_interval(mut self, interval: Duration) -> Self {
        self.stat_interval = interval;
        self
    }
}

// ============================================================================
// Validation and Accessors
// ============================================================================

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unparsable URL, an empty listen
    /// address, or a zero interval.
    pub fn validate(&self) -> Result<()> {
        parse_url(&self.url)?;

        if self.listen.trim().is_empty() {
            return Err(Error::config("Listen address must not be empty"));
        }
        if self.idle_recheck.is_zero() {
            return Err(Error::config("Idle re-check interval must be greater than zero"));
        }
        if self.stat_interval.is_zero() {
            return Err(Error::config("Statistics interval must be greater than zero"));
        }
        if self.dial.connect_timeout.is_zero() {
            return Err(Error::config("Connect timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the normalized dial URL and the headers to send, with
    /// `Origin` filled in when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL cannot be parsed.
    pub fn dial_target(&self) -> Result<(Url, HeaderMap)> {
        let url = parse_url(&self.url)?;
        let mut headers = self.headers.clone();
        fill_origin_header(&mut headers, &url);
        Ok((url, headers))
    }

    /// Returns the listen address in bindable form.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        normalize_listen_addr(&self.listen)
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a duration such as `300ms`, `1.5h` or `2h45m`.
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0`
/// is accepted.
///
/// # Errors
///
/// Returns [`Error::InvalidDuration`] for malformed input or overflow.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::invalid_duration(input);

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let (number, tail) = rest.split_at(number_end);

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let nanos_per_unit: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(invalid());
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut value = whole.checked_mul(nanos_per_unit).ok_or_else(invalid)?;

        if !fraction.is_empty() {
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            let scale = u32::try_from(fraction.len())
                .ok()
                .and_then(|len| 10u128.checked_pow(len))
                .ok_or_else(invalid)?;
            let part = digits.checked_mul(nanos_per_unit).ok_or_else(invalid)? / scale;
            value = value.checked_add(part).ok_or_else(invalid)?;
        }

        total = total.checked_add(value).ok_or_else(invalid)?;
        rest = next;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}

/// Parses one `name: value` header.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] when the separator is missing or the
/// name or value is not valid HTTP.
pub fn parse_header(input: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = input
        .split_once(HEADER_ASSIGNMENT)
        .ok_or_else(|| Error::invalid_header(format!("missing '{HEADER_ASSIGNMENT}' in {input:?}")))?;

    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| Error::invalid_header(format!("{input:?}: {e}")))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| Error::invalid_header(format!("{input:?}: {e}")))?;

    Ok((name, value))
}

/// Parses `name: value` pairs separated by `;`.
///
/// Repeated names accumulate values. An empty string yields no headers.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] for any malformed pair.
pub fn parse_headers(input: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if input.is_empty() {
        return Ok(headers);
    }

    for pair in input.split(HEADER_SEPARATOR) {
        let (name, value) = parse_header(pair)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Normalizes a dial target into a WebSocket URL.
///
/// Adds `ws://` when no scheme is present; an empty host becomes
/// `localhost`, so `:3000` dials `ws://localhost:3000/`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the result is not a valid URL.
pub fn parse_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };

    let with_host = match with_scheme.split_once("://") {
        Some((scheme, rest)) if rest.starts_with(':') => format!("{scheme}://localhost{rest}"),
        _ => with_scheme,
    };

    Url::parse(&with_host).map_err(|e| Error::config(format!("Invalid URL {raw:?}: {e}")))
}

/// Sets `Origin` to the target's HTTP origin unless already present.
///
/// `wss` targets get an `https` origin, everything else `http`.
pub fn fill_origin_header(headers: &mut HeaderMap, url: &Url) {
    if headers.contains_key(ORIGIN) {
        return;
    }

    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    let host = url.host_str().unwrap_or_default();
    let origin = match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };

    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(ORIGIN, value);
    }
}

/// Turns `:port` into `0.0.0.0:port`; other addresses pass through.
#[must_use]
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.url, ":3000");
        assert_eq!(config.grace, Duration::from_secs(4));
        assert!(config.dial.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config::new().with_stat_interval(Duration::ZERO);
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration(".5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5ns").unwrap(), Duration::from_nanos(5));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for input in ["", "10", "ms", "1x", "1..2s", "-1s", "."] {
            let err = parse_duration(input).unwrap_err();
            assert!(
                matches!(err, Error::InvalidDuration { .. }),
                "expected error for {input:?}"
            );
        }
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers("X-A: 1; X-B : two ;X-A:3").unwrap();
        let values: Vec<_> = headers.get_all("x-a").iter().collect();
        assert_eq!(values, vec!["1", "3"]);
        assert_eq!(headers["x-b"], "two");
    }

    #[test]
    fn test_parse_headers_malformed() {
        assert!(parse_headers("").unwrap().is_empty());
        assert!(matches!(
            parse_headers("X-A 1").unwrap_err(),
            Error::InvalidHeader { .. }
        ));
        assert!(parse_header("bad name: v").is_err());
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(parse_url(":3000").unwrap().as_str(), "ws://localhost:3000/");
        assert_eq!(
            parse_url("example.com/path").unwrap().as_str(),
            "ws://example.com/path"
        );
        assert_eq!(parse_url("wss://a.b:8443").unwrap().scheme(), "wss");
        assert!(parse_url("ws://").is_err());
    }

    #[test]
    fn test_fill_origin_header() {
        let mut headers = HeaderMap::new();
        fill_origin_header(&mut headers, &parse_url("wss://a.b:8443/x").unwrap());
        assert_eq!(headers[ORIGIN], "https://a.b:8443");

        let mut custom = parse_headers("Origin: http://other").unwrap();
        fill_origin_header(&mut custom, &parse_url("ws://a.b").unwrap());
        assert_eq!(custom[ORIGIN], "http://other");
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":9001"), "0.0.0.0:9001");
        assert_eq!(normalize_listen_addr("127.0.0.1:9001"), "127.0.0.1:9001");
    }
}
