// src/rtmp/manager.rs - Connection registry
//
// Connections live in slab slots. A token carries the slot index together
// with the generation it was handed out under, so a token of a closed
// connection never resolves to whatever reuses the slot.

use crate::rtmp::connection::RtmpConnection;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generation checked handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken {
    pub id: usize,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    connection: Arc<RtmpConnection>,
}

#[derive(Default)]
pub struct ConnectionManager {
    slots: Mutex<Slab<Slot>>,
    sessions: DashMap<String, ConnectionToken>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<RtmpConnection>) -> ConnectionToken {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let session_id = connection.session_id().to_string();
        let id = self.slots.lock().insert(Slot {
            generation,
            connection,
        });
        let token = ConnectionToken { id, generation };
        self.sessions.insert(session_id, token);
        token
    }

    /// Removes the connection the token points at, if it is still the same one.
    pub fn unregister(&self, token: ConnectionToken) -> Option<Arc<RtmpConnection>> {
        let connection = {
            let mut slots = self.slots.lock();
            let current = slots
                .get(token.id)
                .is_some_and(|slot| slot.generation == token.generation);
            if !current {
                return None;
            }
            slots.remove(token.id).connection
        };
        self.sessions.remove(connection.session_id());
        debug!("Unregistered connection {}", connection.session_id());
        Some(connection)
    }

    pub fn get(&self, token: ConnectionToken) -> Option<Arc<RtmpConnection>> {
        self.slots
            .lock()
            .get(token.id)
            .filter(|slot| slot.generation == token.generation)
            .map(|slot| slot.connection.clone())
    }

    pub fn get_by_session(&self, session_id: &str) -> Option<Arc<RtmpConnection>> {
        let token = *self.sessions.get(session_id)?;
        self.get(token)
    }

    pub fn connections(&self) -> Vec<Arc<RtmpConnection>> {
        self.slots
            .lock()
            .iter()
            .map(|(_, slot)| slot.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
