//! Shared objects: server mediated key-value stores replicated to every
//! subscribed client.
//!
//! A [`SharedObject`] batches mutations between `begin_update` and
//! `end_update`; the outermost `end_update` bumps the version once and
//! flushes two ordered event sets. Owner events go back to the client that
//! caused the change, sync events go to every other listener.

pub mod event;
pub mod service;
pub mod shared_object;
pub mod store;

pub use event::{EventData, SharedObjectEvent, SharedObjectEventKind, SharedObjectMessage};
pub use service::SharedObjectService;
pub use shared_object::{SharedObject, SharedObjectListener, SharedObjectStatistics};
pub use store::{MemoryStore, PersistenceStore, StoredObject};
