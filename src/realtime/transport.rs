//! The seam between the sync manager and the wire.
//!
//! A transport turns a [`ConnectRequest`] into a pair of channels: text
//! frames out, [`TransportEvent`]s in. Closing is signalled by
//! [`TransportEvent::Closed`] or by the inbound channel ending; dropping
//! the outbound sender asks the transport to close.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::mask::Masked;
use crate::realtime::SyncEvent;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub token: Option<Masked<String>>,
}

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    Closed,
}

/// Both directions of one open connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection. An `Err` takes the same path as a close.
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectionHandle>;
}

/// In-process transport. Each successful connect creates a [`ChannelPeer`]
/// playing the server side.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    peer: Mutex<Option<ChannelPeer>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect calls so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Server side of the most recent successful connection.
    pub fn peer(&self) -> Option<ChannelPeer> {
        self.inner.peer.lock().clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectionHandle> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Connection(format!("{} refused the connection", request.url)));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        *self.inner.peer.lock() = Some(ChannelPeer {
            to_client,
            from_client: Arc::new(Mutex::new(from_client)),
            token: request.token.clone(),
        });
        Ok(ConnectionHandle { outbound, inbound })
    }
}

/// Server end of a [`ChannelTransport`] connection.
#[derive(Clone)]
pub struct ChannelPeer {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    token: Option<Masked<String>>,
}

impl ChannelPeer {
    /// Send a raw text frame.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Message(text.into())).is_ok()
    }

    pub fn push_event(&self, event: &SyncEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.push(text),
            Err(_) => false,
        }
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Error(message.into())).is_ok()
    }

    pub fn close(&self) -> bool {
        self.to_client.send(TransportEvent::Closed).is_ok()
    }

    /// Frames the client has sent since the last call.
    pub fn received(&self) -> Vec<String> {
        let mut rx = self.from_client.lock();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    /// Stop accepting client frames, as a server going away would.
    pub fn stop_receiving(&self) {
        self.from_client.lock().close();
    }

    /// True once the client dropped its end.
    pub fn is_client_closed(&self) -> bool {
        self.to_client.is_closed()
    }

    pub fn token(&self) -> Option<&Masked<String>> {
        self.token.as_ref()
    }
}
