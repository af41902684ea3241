use crate::stream::state::StreamState;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// A subscriber operation was requested from a state that does not allow it.
    #[error("Cannot {operation} while stream is {state}")]
    IllegalState {
        operation: &'static str,
        state: StreamState,
    },

    #[error("No free stream id left on this connection")]
    StreamIdExhausted,

    #[error("Stream id {0} has not been reserved")]
    InvalidStreamId(u32),

    #[error("Client rejected: {0}")]
    ClientRejected(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Stream name already published: {0}")]
    StreamAlreadyPublished(String),

    #[error("Seek is not supported on push sources")]
    SeekUnsupported,

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Shared object {0} was released without a matching acquire")]
    ReleaseWithoutAcquire(String),

    #[error("Playlist has no playable item")]
    PlaylistExhausted,

    #[error("Server is not running")]
    ServerNotRunning,

    #[error("Worker pool has been shut down")]
    PoolShutdown,

    #[error("Task panicked while running on the worker pool")]
    TaskPanicked,

    #[error("Thread exited")]
    ThreadExited,

    #[error("IO error:{0}")]
    Io(#[from] std::io::Error),
}
