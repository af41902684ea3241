//! # ez-rtmp
//!
//! An embeddable RTMP session core. Transports deliver decoded packets; this
//! crate runs everything above them:
//!
//! - **Connections**: handshake timeout, connect authorisation, keep-alive
//!   pings, channel and stream id bookkeeping, remote calls with replies
//! - **Shared objects**: versioned key-value stores replicated to every
//!   subscribed client, with optional persistence
//! - **Streams**: publishing, and a subscriber play engine serving live and
//!   recorded items with frame dropping, buffer gating, pause and seek
//! - **Playlists**: subscriber streams that move through a list of items
//!
//! Nothing is global. A [`server::RtmpServer`] owns its worker pool, timer
//! thread and [`context::ServerContext`]; connections and streams borrow
//! from that context explicitly.
//!
//! ```rust,ignore
//! use ez_rtmp::config::ServerConfig;
//! use ez_rtmp::server::RtmpServer;
//!
//! let server = RtmpServer::new(ServerConfig::default().set_ping_interval(5000))
//!     .start()?;
//! let connection = server.accept(transport)?;
//! // ... feed packets with connection.handle_message_received(packet)
//! server.stop();
//! ```

pub mod application;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod rtmp;
pub mod server;
pub mod so;
pub mod stream;
pub mod util;

#[cfg(test)]
mod tests;
