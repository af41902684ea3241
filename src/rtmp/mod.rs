//! The **RTMP** module holds the per-client session core of the server.
//!
//! A transport hands decoded packets to an [`RtmpConnection`]; everything
//! below the message level (chunking, handshake bytes, sockets) lives behind
//! the [`Transport`] seam.
//!
//! ## Key Components
//!
//! - `RtmpConnection`: session state machine, channels, stream ids, pending
//!   calls and the keep-alive ping
//! - `StreamDispatcher`: ordered, single-flight delivery of a stream's media
//!   onto the worker pool
//! - `RtmpHandler`: routing of commands, pings and shared object messages
//! - `ConnectionManager`: registry of live connections with stale-token
//!   protection
//! - `WriteQueue`: per-connection outbound queue with video frame dropping
//!
//! ## Receive Path
//!
//! | Step | Thread | Behavior |
//! |------|--------|----------|
//! | Enqueue | transport | Packet stamped with an expiry and queued |
//! | Consume | `rtmp-receive-{session}` | One packet at a time, expired ones dropped |
//! | Handle | `rtmp-worker` pool | Command handled, media handed to the stream dispatcher |
//! | Deliver | `rtmp-worker` pool | Stream media applied in arrival order |
//!
//! ## Channels
//!
//! | Channel | Use |
//! |---------|-----|
//! | 2 | Protocol control: pings, chunk size, bandwidth |
//! | 3 | Connection invokes and shared objects |
//! | `stream_id * 5 - 1` | Data of a stream, followed by its video and audio channels |
//!
//! # Example
//!
//! ```rust,ignore
//! let server = RtmpServer::new(ServerConfig::default()).start()?;
//! let connection = server.accept(transport)?;
//! connection.handshake_complete();
//! connection.handle_message_received(packet);
//! ```

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod manager;
pub mod pending_call;
pub mod status;
pub mod transport;
pub mod write_queue;

pub use channel::{Channel, OutputStream};
pub use connection::{ConnectionState, RtmpConnection};
pub use dispatcher::{StreamDispatcher, StreamEventTarget};
pub use event::{Call, CallStatus, Header, Invoke, Notify, Packet, Ping, PingType, RtmpEvent};
pub use handler::{RtmpHandler, ServerHandler};
pub use manager::{ConnectionManager, ConnectionToken};
pub use pending_call::{PendingCall, PendingCallback, PendingCalls};
pub use status::Status;
pub use transport::{QueuedTransport, Transport};
