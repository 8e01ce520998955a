//! The session's websocket, reduced to a pair of text channels.
//!
//! A [`Connector`] opens a [`Connection`]; the session only ever sees
//! text frames going out and coming in. Dropping the connection closes
//! the socket. [`WsConnector`] is the real implementation; [`channel`]
//! builds an in-memory pair for hosts and tests that drive the session
//! themselves.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::ConnectionError;

/// An open socket as seen by the session.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// Wrap a pair of channels: frames written to `outgoing` go to the
    /// server, frames from the server arrive on `incoming`.
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// Queue a text frame. Returns `false` if the socket is gone.
    pub fn send(&self, text: String) -> bool {
        self.outgoing.send(text).is_ok()
    }

    /// Next text frame from the server; `None` once the socket closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }
}

/// The far end of an in-memory [`Connection`].
#[derive(Debug)]
pub struct Peer {
    /// Frames sent to the client.
    pub to_client: mpsc::UnboundedSender<String>,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// An in-memory connection and its peer. Dropping `to_client` closes the
/// connection from the server side.
pub fn channel() -> (Connection, Peer) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    (
        Connection::new(to_server, from_server),
        Peer {
            to_client,
            from_client,
        },
    )
}

/// Opens websocket connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one connection to `url`.
    async fn connect(&self, url: &Url) -> Result<Connection, ConnectionError>;
}

/// [`Connector`] over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Bound each handshake by `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, ConnectionError> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outbox) = mpsc::unbounded_channel::<String>();
        let (inbox, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbox.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbox.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(url = %url, "websocket open");
        Ok(Connection::new(outgoing, incoming))
    }
}

/// Socket URL for `page`: `ws(s)://<host>/<page>/ws`.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidUrl`] if the page URL's scheme has no
/// websocket counterpart.
pub fn socket_url(page_url: &Url, page: &str) -> Result<Url, ConnectionError> {
    let scheme = match page_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme `{other}` in {page_url}"
            )));
        }
    };
    let mut url = page_url.clone();
    url.set_scheme(scheme)
        .map_err(|()| ConnectionError::InvalidUrl(page_url.to_string()))?;
    let page = page.trim_matches('/');
    if page.is_empty() {
        url.set_path("/ws");
    } else {
        url.set_path(&format!("/{page}/ws"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
