//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. Nothing else in the crate touches
//! `tokio-tungstenite` directly.
//!
//! # Architecture
//!
//! [`connect`] handles URL→request building, header insertion and TLS
//! negotiation, returning a ([`WsWriter`], [`WsReader`]) pair. [`WsDialer`]
//! plugs that pair into the channel layer through the
//! [`Dialer`](crate::channel::Dialer) seam, attaching the session cookie and
//! browser origin headers the chat service expects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::channel::{ConnectOptions, Dialer, Endpoint, FrameSink, FrameSource, Link};
use crate::config::Config;

/// Origin the service checks on the upgrade request.
const ORIGIN: &str = "https://character.ai";

/// Referer sent alongside [`ORIGIN`].
const REFERER: &str = "https://character.ai/";

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(data))
            .await
            .context("WebSocket send_binary failed")
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Flush pending writes and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        WsWriter::send_text(self, text).await
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        WsWriter::send_binary(self, data).await
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        WsWriter::send_pong(self, data).await
    }

    async fn close(&mut self) -> Result<()> {
        WsWriter::close(self).await
    }
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        WsReader::recv(self).await
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the session cookie carried on the upgrade request.
#[must_use]
pub fn session_cookie(options: &ConnectOptions) -> String {
    format!(
        "HTTP_AUTHORIZATION=\"Token {}\"; edge_rollout={};",
        options.credential(),
        options.edge_rollout()
    )
}

/// Production [`Dialer`] that opens real WebSocket connections.
#[derive(Debug, Clone)]
pub struct WsDialer {
    primary_url: String,
    group_url: String,
}

impl WsDialer {
    /// Create a dialer for the given endpoint URLs.
    #[must_use]
    pub fn new(primary_url: impl Into<String>, group_url: impl Into<String>) -> Self {
        Self {
            primary_url: primary_url.into(),
            group_url: group_url.into(),
        }
    }

    /// Create a dialer from the configured endpoint URLs.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.primary_ws_url, &config.group_ws_url)
    }

    /// URL dialed for `endpoint`.
    #[must_use]
    pub fn url_for(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Primary => &self.primary_url,
            Endpoint::Group => &self.group_url,
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, endpoint: Endpoint, options: &ConnectOptions) -> Result<Link> {
        let cookie = session_cookie(options);
        let (writer, reader) = connect(
            self.url_for(endpoint),
            &[("Cookie", &cookie), ("Origin", ORIGIN), ("Referer", REFERER)],
        )
        .await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_format() {
        let options = ConnectOptions::new("abc123", "60");
        assert_eq!(
            session_cookie(&options),
            "HTTP_AUTHORIZATION=\"Token abc123\"; edge_rollout=60;"
        );
    }

    #[test]
    fn test_dialer_routes_endpoints() {
        let dialer = WsDialer::new("wss://primary.test/ws/", "wss://group.test/ws/");
        assert_eq!(dialer.url_for(Endpoint::Primary), "wss://primary.test/ws/");
        assert_eq!(dialer.url_for(Endpoint::Group), "wss://group.test/ws/");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/invalid", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_unreachable_endpoint_returns_error() {
        let dialer = WsDialer::new("ws://127.0.0.1:1/ws/", "ws://127.0.0.1:1/group/");
        let options = ConnectOptions::new("token", "60");
        assert!(dialer.dial(Endpoint::Group, &options).await.is_err());
    }
}
