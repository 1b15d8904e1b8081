//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::realtime::transport::{ConnectRequest, ConnectionHandle, Transport, TransportEvent};

/// Connects with `connect_async`. The token, when set, is sent as an
/// `Authorization: Bearer` header on the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectionHandle> {
        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        if let Some(token) = &request.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|_| SyncError::Config("realtime token is not a valid header value".to_string()))?;
            upgrade.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url = %request.url, token = ?request.token, "opening websocket");
        let (stream, _) = connect_async(upgrade)
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        info!(url = %request.url, "websocket open");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text.as_str().to_owned()),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                        writer.abort();
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    break;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed);
            writer.abort();
        });

        Ok(ConnectionHandle { outbound, inbound })
    }
}
