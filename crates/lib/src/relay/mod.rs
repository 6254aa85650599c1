//! Relay: HTTP + WebSocket endpoint partitioned into channels by path.
//!
//! Each channel routes between at most one server connection and any number of
//! client connections. Requests go to the server, responses go back to the
//! client that asked, notifications fan out to clients.

mod channel;
mod connection;
mod registry;
mod server;

pub use channel::{
    ChannelHandle, ChannelSettings, ChannelStats, ConnectionId, Outbound, Peer, PeerOutbox, Role,
};
pub use registry::ChannelRegistry;
pub use server::{normalize_path, router, run_relay, serve, ConnectQuery, RelayState};
