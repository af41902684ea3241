// src/stream/state.rs - Subscriber stream state

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a client stream.
///
/// `Seek`, `Resumed`, `Started` and `End` are transient signals reported to
/// listeners, the stored state never takes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Uninit,
    Stopped,
    Playing,
    Paused,
    Closed,
    Seek,
    Resumed,
    Started,
    End,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Uninit => "uninit",
            StreamState::Stopped => "stopped",
            StreamState::Playing => "playing",
            StreamState::Paused => "paused",
            StreamState::Closed => "closed",
            StreamState::Seek => "seek",
            StreamState::Resumed => "resumed",
            StreamState::Started => "started",
            StreamState::End => "end",
        };
        f.write_str(name)
    }
}

/// Called with `(old, new)`. Listeners run on the thread that changed the
/// state and must not call back into the stream.
pub type StateListener = Arc<dyn Fn(StreamState, StreamState) + Send + Sync>;

pub struct StreamStateHolder {
    state: Mutex<StreamState>,
    listeners: Mutex<Vec<StateListener>>,
}

impl StreamStateHolder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Uninit),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> StreamState {
        *self.state.lock()
    }

    /// Stores a new state and notifies listeners. Returns the previous one.
    pub fn set(&self, state: StreamState) -> StreamState {
        let old = std::mem::replace(&mut *self.state.lock(), state);
        if old != state {
            self.fire(old, state);
        }
        old
    }

    /// Reports a transient signal without storing it.
    pub fn signal(&self, signal: StreamState) {
        let current = self.get();
        self.fire(current, signal);
    }

    pub fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().push(listener);
    }

    fn fire(&self, old: StreamState, new: StreamState) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(old, new);
        }
    }
}

impl Default for StreamStateHolder {
    fn default() -> Self {
        Self::new()
    }
}
