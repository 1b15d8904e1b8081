//! Realtime synchronization: a persistent connection whose pushed events
//! invalidate the query cache.

mod event;
mod manager;
mod state;
mod transport;
mod websocket;

pub use event::{EventStream, SyncEvent, SyncEventType};
pub use manager::{reconnect_delay, RealtimeSync};
pub use state::ConnectionState;
pub use transport::{
    ChannelPeer, ChannelTransport, ConnectRequest, ConnectionHandle, Transport, TransportEvent,
};
pub use websocket::WebSocketTransport;
