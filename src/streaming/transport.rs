//! Duplex frame transport
//!
//! The session talks to the service through two halves: a [`FrameSink`] for
//! outbound frames and a [`FrameStream`] for inbound ones. The WebSocket
//! implementation wraps the split halves of a `tokio-tungstenite` stream.
//!
//! # Retry Strategy
//!
//! The initial handshake retries 3 times with exponential backoff (1s, 2s).
//! Mid-session disconnects do NOT reconnect - the session ends.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::StreamingError;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum attempts for the initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

static CRYPTO_PROVIDER: Once = Once::new();

/// One discrete message on the duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Outbound half of the channel.
///
/// At most one send is in flight at a time; the session serializes callers.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), StreamingError>> + Send;

    /// Send a close frame and release the outbound half
    fn close(
        &mut self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), StreamingError>> + Send;
}

/// Inbound half of the channel. `None` means the stream ended.
pub trait FrameStream: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, StreamingError>>> + Send;
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a WebSocket connection
pub struct WsSink {
    inner: SplitSink<Socket, Message>,
}

/// Read half of a WebSocket connection
pub struct WsStream {
    inner: SplitStream<Socket>,
}

/// Classify a tungstenite error: a closed channel is a disconnect, anything
/// else is a (possibly transient) transport failure
fn map_ws_error(err: tungstenite::Error) -> StreamingError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            StreamingError::Disconnected(err.to_string())
        }
        tungstenite::Error::Io(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            StreamingError::Disconnected(err.to_string())
        }
        other => StreamingError::TransportError(other.to_string()),
    }
}

impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), StreamingError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason),
            })),
        };
        self.inner.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), StreamingError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(map_ws_error)
    }
}

impl FrameStream for WsStream {
    async fn recv(&mut self) -> Option<Result<Frame, StreamingError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(map_ws_error(e))),
            };

            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Close(close) => {
                    let (code, reason) = close
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NORMAL_CLOSURE, String::new()));
                    Frame::Close { code, reason }
                }
                // Ping/pong are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

/// Build the endpoint URL with the API key attached.
///
/// Fails if the base is not a `ws://` or `wss://` URL or the key is empty.
pub fn endpoint_url(base: &str, api_key: &str) -> Result<Url, StreamingError> {
    if api_key.is_empty() {
        return Err(StreamingError::MissingApiKey);
    }

    let mut url = Url::parse(base)
        .map_err(|e| StreamingError::ConnectionFailed(format!("invalid URL {:?}: {}", base, e)))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(StreamingError::ConnectionFailed(format!(
            "unsupported URL scheme {:?}",
            url.scheme()
        )));
    }

    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

/// Open a WebSocket to `url` (with retries) and split it into halves
pub async fn open_websocket(url: &Url) -> Result<(WsSink, WsStream), StreamingError> {
    CRYPTO_PROVIDER.call_once(|| {
        // Both ring and aws-lc may be compiled in; pin one
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            log::info!(
                "Retrying WebSocket connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                MAX_RETRIES
            );
            tokio::time::sleep(delay).await;
        }

        match try_open(url).await {
            Ok(socket) => {
                let (write, read) = socket.split();
                return Ok((WsSink { inner: write }, WsStream { inner: read }));
            }
            Err(e) => {
                log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| StreamingError::ConnectionFailed("Max retries exceeded".to_string())))
}

/// Single connection attempt (no retries)
async fn try_open(url: &Url) -> Result<Socket, StreamingError> {
    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    // Never log the query string: it carries the key
    log::info!(
        "Connecting to {}{}...",
        url.host_str().unwrap_or("<no host>"),
        url.path()
    );

    let (socket, _response) = timeout(
        CONNECTION_TIMEOUT,
        connect_async_with_config(request, None, true),
    )
    .await
    .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    log::info!("WebSocket connected");
    Ok(socket)
}
