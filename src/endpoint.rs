//! Node endpoint pair and stream-URL derivation.
//!
//! A node exposes its request/response API over HTTP and its event stream
//! over a websocket on a separate well-known port. The stream URL is derived
//! from the HTTP URL with a pure string transform so deployments only need to
//! configure one address.

use thiserror::Error;

/// Well-known port the event stream listens on when none is configured.
pub const DEFAULT_STREAM_PORT: u16 = 9001;

/// Immutable pair of request/response URL and stream URL for one node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    rpc_url: String,
    stream_url: String,
}

impl Endpoint {
    /// Creates an endpoint whose stream URL is derived from `rpc_url`.
    ///
    /// `stream_port` overrides [`DEFAULT_STREAM_PORT`] when set.
    pub fn new(rpc_url: impl Into<String>, stream_port: Option<u16>) -> Result<Self, EndpointError> {
        let rpc_url = rpc_url.into();
        let stream_url = derive_stream_url(&rpc_url, stream_port)?;
        Ok(Self {
            rpc_url,
            stream_url,
        })
    }

    /// Creates an endpoint with an explicit stream URL.
    ///
    /// The override takes precedence over derivation and is not validated
    /// beyond trimming trailing whitespace.
    pub fn with_stream_url(
        rpc_url: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        let stream_url = stream_url.into();
        Self {
            rpc_url: rpc_url.into(),
            stream_url: stream_url.trim_end().to_string(),
        }
    }

    /// Request/response URL.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Stream URL.
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
}

/// Errors produced when deriving a stream URL.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum EndpointError {
    /// URL has no `scheme://` separator.
    #[error("url {0:?} has no scheme")]
    MissingScheme(String),

    /// URL scheme is not `http` or `https`.
    #[error("url scheme {0:?} is not http or https")]
    UnsupportedScheme(String),

    /// URL has an empty host component.
    #[error("url {0:?} has no host")]
    MissingHost(String),
}

/// Derives the websocket stream URL for an HTTP request/response URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; any explicit `:port` on the
/// host is stripped and replaced with `port`, defaulting to
/// [`DEFAULT_STREAM_PORT`]. The path, if any, is preserved.
pub fn derive_stream_url(rpc_url: &str, port: Option<u16>) -> Result<String, EndpointError> {
    let (scheme, rest) = rpc_url
        .split_once("://")
        .ok_or_else(|| EndpointError::MissingScheme(rpc_url.to_string()))?;

    let ws_scheme = match scheme {
        "http" => "ws",
        "https" => "wss",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };

    let host = strip_port(authority);
    if host.is_empty() {
        return Err(EndpointError::MissingHost(rpc_url.to_string()));
    }

    let port = port.unwrap_or(DEFAULT_STREAM_PORT);
    Ok(match path {
        Some(path) if !path.is_empty() => format!("{ws_scheme}://{host}:{port}/{path}"),
        _ => format!("{ws_scheme}://{host}:{port}"),
    })
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_stream_url, Endpoint, EndpointError, DEFAULT_STREAM_PORT};

    #[test]
    fn derivation_replaces_scheme_and_appends_default_port() {
        assert_eq!(
            derive_stream_url("http://node:443", None).expect("derive"),
            format!("ws://node:{DEFAULT_STREAM_PORT}")
        );
    }

    #[test]
    fn derivation_uses_explicit_port_over_default() {
        assert_eq!(
            derive_stream_url("https://node", Some(7000)).expect("derive"),
            "wss://node:7000"
        );
    }

    #[test]
    fn derivation_preserves_path() {
        assert_eq!(
            derive_stream_url("https://node.example:8080/rpc/v1", None).expect("derive"),
            format!("wss://node.example:{DEFAULT_STREAM_PORT}/rpc/v1")
        );
    }

    #[test]
    fn derivation_rejects_non_http_scheme() {
        assert_eq!(
            derive_stream_url("ftp://node", None),
            Err(EndpointError::UnsupportedScheme("ftp".to_string()))
        );
    }

    #[test]
    fn derivation_rejects_missing_scheme() {
        assert!(matches!(
            derive_stream_url("node:443", None),
            Err(EndpointError::MissingScheme(_))
        ));
    }

    #[test]
    fn derivation_rejects_empty_host() {
        assert!(matches!(
            derive_stream_url("http://:443", None),
            Err(EndpointError::MissingHost(_))
        ));
    }

    #[test]
    fn endpoint_pairs_rpc_and_derived_stream_urls() {
        let endpoint = Endpoint::new("https://fullnode.example", None).expect("endpoint");
        assert_eq!(endpoint.rpc_url(), "https://fullnode.example");
        assert_eq!(
            endpoint.stream_url(),
            format!("wss://fullnode.example:{DEFAULT_STREAM_PORT}")
        );
    }

    #[test]
    fn endpoint_stream_override_takes_precedence() {
        let endpoint =
            Endpoint::with_stream_url("https://fullnode.example", "wss://stream.example/ws \n");
        assert_eq!(endpoint.stream_url(), "wss://stream.example/ws");
    }
}
