//! WebSocket transport: the only module that knows frames travel over
//! `tokio-tungstenite`.
//!
//! ```text
//!   connect(url, token) ── GET + Cookie: Authorization=<token> ──▶ accept(stream, auth)
//!                                                                 │ 401 Unauthorized
//!   FrameWriter ── Binary(bincode SyncMessage) ──────────────────▶ FrameReader
//! ```
//!
//! Non-binary frames (ping/pong/text) are skipped by [`FrameReader`];
//! tungstenite answers WebSocket pings on its own.

use crate::auth::{Authenticator, Identity};
use crate::error::SyncError;
use crate::protocol::SyncMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const COOKIE_NAME: &str = "Authorization";

/// Client side of an established connection.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Token carried by a handshake: `Authorization: Bearer <t>` first, then
/// the `Authorization=<t>` cookie.
pub fn handshake_credentials(request: &Request) -> Option<String> {
    let headers = request.headers();

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, token)| token.to_string())
}

/// Server side of the handshake. Rejected credentials get a plain
/// `401 Unauthorized` response and never reach the WebSocket layer.
pub async fn accept(
    stream: TcpStream,
    authenticator: &dyn Authenticator,
) -> Result<(WebSocketStream<TcpStream>, Identity), SyncError> {
    let mut identity = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match authenticator.authenticate(handshake_credentials(request).as_deref()) {
            Ok(id) => {
                identity = Some(id);
                Ok(response)
            }
            Err(_) => {
                let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    let result = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    match (result, identity) {
        (Ok(ws), Some(identity)) => Ok((ws, identity)),
        (Ok(_), None) | (Err(_), None) => Err(SyncError::Unauthorized),
        (Err(e), Some(_)) => Err(e.into()),
    }
}

/// Dial `url`, presenting `token` as the `Authorization` cookie.
pub async fn connect(url: &str, token: Option<&str>, timeout: Duration) -> Result<ClientStream, SyncError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        let cookie = HeaderValue::from_str(&format!("{COOKIE_NAME}={token}")).map_err(|_| SyncError::Unauthorized)?;
        request.headers_mut().insert(COOKIE, cookie);
    }

    let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| SyncError::TransportTimeout)??;
    Ok(stream)
}

/// Sending half of a connection.
pub struct FrameWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send(&mut self, msg: &SyncMessage) -> Result<(), SyncError> {
        let bytes = msg.encode()?;
        self.sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), SyncError> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Receiving half of a connection.
pub struct FrameReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next protocol message. `None` once the peer closed the connection.
    pub async fn recv(&mut self) -> Option<Result<SyncMessage, SyncError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(SyncMessage::decode(&data)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Split a connection into independently owned halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (FrameWriter<S>, FrameReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (FrameWriter { sink }, FrameReader { stream })
}

/// Reconnect delay policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised in both directions (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with a cap and jitter. Never gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.config.multiplier.powi(self.attempt.min(32) as i32);
        let capped = (self.config.initial.as_secs_f64() * exp).min(self.config.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let spread = self.config.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - spread + 2.0 * spread * rand::random::<f64>();
        Duration::from_secs_f64((capped * factor).min(self.config.max.as_secs_f64()))
    }

    /// Base delay without jitter, for short fixed retries.
    pub fn base_delay(&self) -> Duration {
        self.config.initial
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use tokio::net::TcpListener;

    fn request(header: (&str, &str)) -> Request {
        Request::builder()
            .uri("ws://localhost/")
            .header(header.0, header.1)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_cookie_credentials() {
        let req = request(("cookie", "theme=dark; Authorization=tok123; lang=en"));
        assert_eq!(handshake_credentials(&req).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_bearer_credentials() {
        let req = request(("authorization", "Bearer abc"));
        assert_eq!(handshake_credentials(&req).as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_credentials() {
        let req = request(("cookie", "theme=dark"));
        assert_eq!(handshake_credentials(&req), None);
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::for_testing()
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = Backoff::new(config.clone()).next_delay();
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    async fn serve_once(auth: StaticTokens) -> (String, tokio::task::JoinHandle<Result<Identity, SyncError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (ws, identity) = accept(stream, &auth).await?;
            let (mut writer, mut reader) = split(ws);
            if let Some(Ok(SyncMessage::Ping)) = reader.recv().await {
                writer.send(&SyncMessage::Pong).await?;
            }
            Ok(identity)
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_authenticated_round_trip() {
        let (url, server) = serve_once(StaticTokens::new().with_token("good", "alice")).await;

        let ws = connect(&url, Some("good"), Duration::from_secs(2)).await.unwrap();
        let (mut writer, mut reader) = split(ws);
        writer.send(&SyncMessage::Ping).await.unwrap();
        assert!(matches!(reader.recv().await, Some(Ok(SyncMessage::Pong))));

        assert_eq!(server.await.unwrap().unwrap(), Identity("alice".into()));
    }

    #[tokio::test]
    async fn test_bad_token_gets_401() {
        let (url, server) = serve_once(StaticTokens::new().with_token("good", "alice")).await;

        let err = connect(&url, Some("bad"), Duration::from_secs(2)).await.err().unwrap();
        assert!(matches!(err, SyncError::Unauthorized));
        assert!(matches!(server.await.unwrap(), Err(SyncError::Unauthorized)));
    }
}
