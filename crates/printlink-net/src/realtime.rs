// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Realtime channel to an OctoPrint server.
//
// The server exposes a raw SockJS websocket at `<base>/sockjs/websocket`.
// The upgrade request carries the API key (and basic-auth credentials for
// servers behind a reverse proxy).  Frames are JSON text; ping/pong is
// answered by tungstenite itself.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument};
use url::Url;

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{Credential, PrinterTarget};

/// Opens realtime channels. One call per connection attempt.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn open(&self, target: &PrinterTarget) -> Result<Box<dyn RealtimeStream>>;
}

/// An open realtime channel.
#[async_trait]
pub trait RealtimeStream: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame, or `Ok(None)` once the server has closed the channel.
    async fn next_text(&mut self) -> Result<Option<String>>;

    /// Best-effort close handshake.
    async fn close(&mut self);
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Only used to encode basic-auth headers; never sends anything.
    encoder: reqwest::Client,
}

impl WsConnector {
    pub fn new() -> Result<Self> {
        let encoder = reqwest::Client::builder()
            .build()
            .map_err(|e| PrintlinkError::Network(format!("http client: {e}")))?;
        Ok(Self { encoder })
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    #[instrument(skip(self, target), fields(target_id = %target.id, host = %target.host))]
    async fn open(&self, target: &PrinterTarget) -> Result<Box<dyn RealtimeStream>> {
        let url = socket_url(&target.host)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PrintlinkError::Network(format!("invalid url '{url}': {e}")))?;

        let headers = request.headers_mut();
        headers.insert("X-Api-Key", header_value(&target.credential.api_key)?);
        if let Some(authorization) = basic_authorization(&self.encoder, &target.credential)? {
            headers.insert("Authorization", authorization);
        }

        debug!(%url, "opening realtime channel");
        let (stream, _response) = connect_async(request).await.map_err(map_ws_error)?;
        info!("realtime channel open");
        Ok(Box::new(WsChannel { inner: stream }))
    }
}

struct WsChannel {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeStream for WsChannel {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PrintlinkError::Network(format!("send: {e}")))
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PrintlinkError::Network(format!("read: {e}"))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            debug!(error = %e, "close handshake failed");
        }
    }
}

/// `http://octopi.local/prefix` -> `ws://octopi.local/prefix/sockjs/websocket`.
pub fn socket_url(host: &str) -> Result<Url> {
    let mut url = Url::parse(host)
        .map_err(|e| PrintlinkError::Network(format!("invalid url '{host}': {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(PrintlinkError::Network(format!(
                "invalid url '{host}': unsupported scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| PrintlinkError::Network(format!("invalid url '{host}'")))?;
    let path = format!("{}/sockjs/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| PrintlinkError::Auth("credential contains invalid characters".into()))
}

/// Reuse reqwest's basic-auth encoding so the socket and REST paths send
/// identical headers.  The request is built, never sent.
fn basic_authorization(
    encoder: &reqwest::Client,
    credential: &Credential,
) -> Result<Option<HeaderValue>> {
    let Some(username) = credential.username.as_deref().filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let request = encoder
        .get("http://localhost/")
        .basic_auth(username, credential.password.as_deref())
        .build()
        .map_err(|e| PrintlinkError::Auth(format!("basic auth: {e}")))?;
    match request.headers().get(reqwest::header::AUTHORIZATION) {
        Some(value) => HeaderValue::from_bytes(value.as_bytes())
            .map(Some)
            .map_err(|_| PrintlinkError::Auth("basic auth header is invalid".into())),
        None => Ok(None),
    }
}

fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> PrintlinkError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match &err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            PrintlinkError::Auth(format!("server rejected the API key ({})", response.status()))
        }
        WsError::Http(response) => {
            PrintlinkError::Network(format!("upgrade failed with {}", response.status()))
        }
        WsError::Url(e) => PrintlinkError::Network(format!("invalid url: {e}")),
        _ => PrintlinkError::Network(format!("connect: {err}")),
    }
}
