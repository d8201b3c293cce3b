use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Credential,
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{http::StatusCode, Error as WsError, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConnectionError;

/// One opened transport. Closing of `inbound` means the transport dropped;
/// dropping `outbound` closes it from our side.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, credential: &Credential) -> Result<SocketLink, ConnectionError>;
}

pub struct WsConnector {
    ws_url: Url,
}

impl WsConnector {
    pub fn new(server_url: &str, ws_path: &str) -> Result<Self, ConnectionError> {
        let ws_base = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ConnectionError::Transport(
                "server_url must start with http:// or https://".into(),
            ));
        };
        let ws_url = Url::parse(&ws_base)
            .and_then(|base| base.join(ws_path))
            .map_err(|err| ConnectionError::Transport(format!("invalid websocket url: {err}")))?;
        Ok(Self { ws_url })
    }

    /// The credential travels as a handshake parameter so the server can
    /// validate it before any event flows.
    pub fn handshake_url(&self, credential: &Credential) -> Url {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut()
            .append_pair("access_token", &credential.access_token);
        url
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn open(&self, credential: &Credential) -> Result<SocketLink, ConnectionError> {
        let url = self.handshake_url(credential);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| handshake_error(&self.ws_url, err))?;
        info!(url = %self.ws_url, "ws: transport opened");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("ws: invalid server event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("ws: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("ws: reader finished");
        });

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("ws: failed to encode client request: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(json)).await {
                    warn!("ws: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
            debug!("ws: writer finished");
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// A 401/403 on the upgrade means the server refused the credential.
fn handshake_error(ws_url: &Url, err: WsError) -> ConnectionError {
    if let WsError::Http(response) = &err {
        let code = match response.status() {
            StatusCode::UNAUTHORIZED => Some(ErrorCode::Unauthorized),
            StatusCode::FORBIDDEN => Some(ErrorCode::Forbidden),
            _ => None,
        };
        if let Some(code) = code {
            return ConnectionError::Rejected(ApiError::new(
                code,
                format!("websocket handshake refused with {}", response.status()),
            ));
        }
    }
    ConnectionError::Transport(format!("failed to connect websocket {ws_url}: {err}"))
}
