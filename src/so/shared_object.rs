// src/so/shared_object.rs - Versioned replicated attribute store
//
// Core features:
// - Attribute map behind its own RwLock, bounded wait on single writes
// - begin/end update nesting, one version bump and one flush per batch
// - Owner events go back to the mutating client only
// - Sync events go to every other listener, delivered on the worker pool
// - Reference counting and release of unused transient objects

use crate::error::{Error, Result};
use crate::so::event::{
    EventData, SharedObjectEvent, SharedObjectEventKind, SharedObjectMessage,
};
use crate::so::store::{PersistenceStore, StoredObject};
use crate::util::{Clock, Executor};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A client subscribed to a shared object.
pub trait SharedObjectListener: Send + Sync {
    /// Stable identity, the connection's session id.
    fn listener_id(&self) -> String;

    fn is_connected(&self) -> bool;

    fn send_shared_object(&self, message: SharedObjectMessage);
}

#[derive(Default)]
struct Counters {
    changes: AtomicU64,
    deletes: AtomicU64,
    sends: AtomicU64,
    total_listeners: AtomicU64,
}

/// Point in time view of an object's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedObjectStatistics {
    pub version: u32,
    pub listeners: usize,
    pub total_listeners: u64,
    pub changes: u64,
    pub deletes: u64,
    pub sends: u64,
}

/// Sentinel values that delete an attribute instead of setting it.
fn is_null(value: &Amf0Value) -> bool {
    matches!(value, Amf0Value::Null | Amf0Value::Undefined)
}

pub struct SharedObject {
    name: String,
    path: String,
    persistent: bool,
    attributes: RwLock<HashMap<String, Amf0Value>>,
    version: AtomicU32,
    update_counter: AtomicUsize,
    modified: AtomicBool,
    last_modified: AtomicU64,
    source: Mutex<Option<Arc<dyn SharedObjectListener>>>,
    owner_events: Mutex<BTreeSet<SharedObjectEvent>>,
    sync_events: Mutex<BTreeSet<SharedObjectEvent>>,
    listeners: DashMap<String, Arc<dyn SharedObjectListener>>,
    closed: AtomicBool,
    acquire_count: AtomicUsize,
    counters: Counters,
    store: Option<Arc<dyn PersistenceStore>>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl SharedObject {
    /// Creates an empty object at version 1.
    ///
    /// # Arguments
    /// * `name` - Object name as the client sees it
    /// * `path` - Scope path plus name, unique per server
    /// * `persistent` - Whether the object survives its last listener
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        persistent: bool,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            name: name.into(),
            path: path.into(),
            persistent,
            attributes: RwLock::new(HashMap::new()),
            version: AtomicU32::new(1),
            update_counter: AtomicUsize::new(0),
            modified: AtomicBool::new(false),
            last_modified: AtomicU64::new(now),
            source: Mutex::new(None),
            owner_events: Mutex::new(BTreeSet::new()),
            sync_events: Mutex::new(BTreeSet::new()),
            listeners: DashMap::new(),
            closed: AtomicBool::new(false),
            acquire_count: AtomicUsize::new(0),
            counters: Counters::default(),
            store: None,
            executor,
            clock,
            lock_timeout: Duration::from_millis(100),
        }
    }

    /// Restores a previously saved object.
    pub fn from_stored(
        stored: StoredObject,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let object = Self::new(stored.name, stored.path, true, executor, clock);
        object.version.store(stored.version.max(1), Ordering::Release);
        *object.attributes.write() = stored.attributes;
        object
    }

    pub fn set_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn set_lock_timeout(mut self, lock_timeout: u64) -> Self {
        self.lock_timeout = Duration::from_millis(lock_timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn get_attribute(&self, key: &str) -> Option<Amf0Value> {
        self.attributes.read().get(key).cloned()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.read().contains_key(key)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.read().keys().cloned().collect()
    }

    /// Copy of every attribute.
    pub fn data(&self) -> HashMap<String, Amf0Value> {
        self.attributes.read().clone()
    }

    /// Sets one attribute; a null value deletes it.
    ///
    /// # Returns
    /// * `true` - The stored value changed
    /// * `false` - Unchanged, or the lock could not be taken in time
    pub fn set_attribute(&self, key: &str, value: Amf0Value) -> bool {
        self.begin_update();
        let result = match self.attributes.try_write_for(self.lock_timeout) {
            Some(mut attributes) => self.apply_attribute(&mut attributes, key, value),
            None => {
                warn!("Shared object {}: lock timeout setting '{key}'", self.name);
                false
            }
        };
        self.end_update();
        result
    }

    /// Sets a batch inside one update block. Blocks for the lock.
    ///
    /// Returns `true` only when every entry changed.
    pub fn set_attributes(&self, values: HashMap<String, Amf0Value>) -> bool {
        self.begin_update();
        let mut all_changed = true;
        {
            let mut attributes = self.attributes.write();
            for (key, value) in values {
                all_changed &= self.apply_attribute(&mut attributes, &key, value);
            }
        }
        self.end_update();
        all_changed
    }

    fn apply_attribute(
        &self,
        attributes: &mut HashMap<String, Amf0Value>,
        key: &str,
        value: Amf0Value,
    ) -> bool {
        self.add_owner_event(SharedObjectEvent::keyed(
            SharedObjectEventKind::ClientUpdateAttribute,
            key,
        ));
        if is_null(&value) {
            if attributes.remove(key).is_none() {
                return false;
            }
            self.add_sync_event(SharedObjectEvent::keyed(
                SharedObjectEventKind::ClientDeleteData,
                key,
            ));
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        } else {
            if attributes.get(key) == Some(&value) {
                return false;
            }
            attributes.insert(key.to_string(), value.clone());
            self.add_sync_event(SharedObjectEvent::new(
                SharedObjectEventKind::ClientUpdateData,
                Some(key.to_string()),
                EventData::Value(value),
            ));
            self.counters.changes.fetch_add(1, Ordering::Relaxed);
        }
        self.modified.store(true, Ordering::Release);
        true
    }

    /// Removes one attribute. `false` when it did not exist.
    pub fn remove_attribute(&self, key: &str) -> bool {
        self.begin_update();
        let removed = {
            let mut attributes = self.attributes.write();
            attributes.remove(key).is_some()
        };
        if removed {
            self.add_owner_event(SharedObjectEvent::keyed(
                SharedObjectEventKind::ClientDeleteData,
                key,
            ));
            self.add_sync_event(SharedObjectEvent::keyed(
                SharedObjectEventKind::ClientDeleteData,
                key,
            ));
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            self.modified.store(true, Ordering::Release);
        }
        self.end_update();
        removed
    }

    /// Removes every attribute inside one update block.
    pub fn remove_attributes(&self) {
        self.begin_update();
        for key in self.attribute_names() {
            self.remove_attribute(&key);
        }
        self.end_update();
    }

    /// Drops all attributes with a single clear event. `false` when empty.
    pub fn clear(&self) -> bool {
        self.begin_update();
        let cleared = {
            let mut attributes = self.attributes.write();
            let had_data = !attributes.is_empty();
            attributes.clear();
            had_data
        };
        if cleared {
            self.add_sync_event(SharedObjectEvent::new(
                SharedObjectEventKind::ClientClearData,
                None,
                EventData::Empty,
            ));
            self.modified.store(true, Ordering::Release);
        }
        self.end_update();
        cleared
    }

    /// Broadcasts a handler call to every listener, the caller included.
    pub fn send_message(&self, handler: &str, arguments: Vec<Amf0Value>) {
        self.begin_update();
        let event = SharedObjectEvent::new(
            SharedObjectEventKind::ClientSendMessage,
            Some(handler.to_string()),
            EventData::Arguments(arguments),
        );
        self.add_owner_event(event.clone());
        self.add_sync_event(event);
        self.counters.sends.fetch_add(1, Ordering::Relaxed);
        self.end_update();
    }

    // ========================================================================
    // Update Batching
    // ========================================================================

    pub fn begin_update(&self) {
        self.update_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Starts an update whose owner events go back to `listener`.
    pub fn begin_update_with(&self, listener: Arc<dyn SharedObjectListener>) {
        *self.source.lock() = Some(listener);
        self.begin_update();
    }

    /// Closes one nesting level, flushing when it was the outermost.
    pub fn end_update(&self) {
        let previous = self
            .update_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous <= 1 {
            self.notify_modified();
        }
    }

    pub fn is_updating(&self) -> bool {
        self.update_counter.load(Ordering::Acquire) > 0
    }

    fn notify_modified(&self) {
        if self.is_updating() {
            return;
        }
        if self.modified.swap(false, Ordering::AcqRel) {
            self.version.fetch_add(1, Ordering::AcqRel);
            self.last_modified
                .store(self.clock.now_millis(), Ordering::Release);
            if let Some(store) = &self.store {
                if !store.save(self) {
                    warn!("Could not store shared object {}", self.path);
                }
            }
        }
        self.send_updates();
    }

    fn add_owner_event(&self, event: SharedObjectEvent) {
        self.owner_events.lock().insert(event);
    }

    fn add_sync_event(&self, event: SharedObjectEvent) {
        self.sync_events.lock().insert(event);
    }

    fn send_updates(&self) {
        let version = self.version();
        let owner_events = std::mem::take(&mut *self.owner_events.lock());
        let source = self.source.lock().take();

        if !owner_events.is_empty() {
            if let Some(source) = &source {
                let message = SharedObjectMessage {
                    name: self.name.clone(),
                    version,
                    persistent: self.persistent,
                    events: owner_events.into_iter().collect(),
                };
                self.deliver(source.clone(), message);
            }
        }

        let sync_events = std::mem::take(&mut *self.sync_events.lock());
        if sync_events.is_empty() {
            return;
        }
        let events: Vec<SharedObjectEvent> = sync_events.into_iter().collect();
        let source_id = source.as_ref().map(|s| s.listener_id());
        let recipients: Vec<Arc<dyn SharedObjectListener>> = self
            .listeners
            .iter()
            .filter(|entry| Some(entry.key()) != source_id.as_ref())
            .map(|entry| entry.value().clone())
            .collect();
        for listener in recipients {
            if !listener.is_connected() {
                debug!(
                    "Skipping disconnected listener {} of {}",
                    listener.listener_id(),
                    self.name
                );
                self.listeners.remove(&listener.listener_id());
                continue;
            }
            let message = SharedObjectMessage {
                name: self.name.clone(),
                version,
                persistent: self.persistent,
                events: events.clone(),
            };
            self.deliver(listener, message);
        }
    }

    fn deliver(&self, listener: Arc<dyn SharedObjectListener>, message: SharedObjectMessage) {
        let name = self.name.clone();
        let result = self
            .executor
            .execute(Box::new(move || listener.send_shared_object(message)));
        if let Err(e) = result {
            warn!("Shared object {name}: update not delivered: {e}");
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Subscribes a listener and sends it the current state.
    pub fn register(&self, listener: Arc<dyn SharedObjectListener>) {
        self.begin_update_with(listener.clone());
        self.add_owner_event(SharedObjectEvent::new(
            SharedObjectEventKind::ClientInitialData,
            None,
            EventData::Empty,
        ));
        if !self.persistent {
            self.add_owner_event(SharedObjectEvent::new(
                SharedObjectEventKind::ClientClearData,
                None,
                EventData::Empty,
            ));
        }
        let attributes = self.data();
        if !attributes.is_empty() {
            self.add_owner_event(SharedObjectEvent::new(
                SharedObjectEventKind::ClientUpdateData,
                None,
                EventData::Attributes(attributes),
            ));
        }
        if self
            .listeners
            .insert(listener.listener_id(), listener)
            .is_none()
        {
            self.counters.total_listeners.fetch_add(1, Ordering::Relaxed);
        }
        self.end_update();
    }

    pub fn unregister(&self, listener_id: &str) {
        self.listeners.remove(listener_id);
        self.check_release();
    }

    pub fn is_registered(&self, listener_id: &str) -> bool {
        self.listeners.contains_key(listener_id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ========================================================================
    // Reference Counting
    // ========================================================================

    pub fn acquire(&self) {
        self.acquire_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference.
    ///
    /// # Errors
    /// [`Error::ReleaseWithoutAcquire`] when the count is already zero.
    pub fn release(&self) -> Result<()> {
        self.acquire_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| Error::ReleaseWithoutAcquire(self.name.clone()))?;
        self.check_release();
        Ok(())
    }

    pub fn is_acquired(&self) -> bool {
        self.acquire_count.load(Ordering::Acquire) > 0
    }

    /// Destroys a transient object nobody holds or listens to.
    ///
    /// Returns `true` when the object was closed by this call.
    pub fn check_release(&self) -> bool {
        if self.persistent || !self.listeners.is_empty() || self.is_acquired() {
            return false;
        }
        if let Some(store) = &self.store {
            store.remove(self);
        }
        self.close()
    }

    /// Tears the object down. Only the first call does anything.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("Shared object {} closed", self.path);
        self.attributes.write().clear();
        self.listeners.clear();
        self.owner_events.lock().clear();
        self.sync_events.lock().clear();
        self.source.lock().take();
        true
    }

    pub fn statistics(&self) -> SharedObjectStatistics {
        SharedObjectStatistics {
            version: self.version(),
            listeners: self.listeners.len(),
            total_listeners: self.counters.total_listeners.load(Ordering::Relaxed),
            changes: self.counters.changes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            sends: self.counters.sends.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::so::store::MemoryStore;
    use crate::util::{InlineExecutor, ManualClock};

    /// Listener that records every message it receives.
    pub(crate) struct RecordingListener {
        pub id: String,
        pub connected: AtomicBool,
        pub received: Mutex<Vec<SharedObjectMessage>>,
    }

    impl RecordingListener {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                connected: AtomicBool::new(true),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn messages(&self) -> Vec<SharedObjectMessage> {
            self.received.lock().clone()
        }

        pub fn take(&self) -> Vec<SharedObjectMessage> {
            std::mem::take(&mut *self.received.lock())
        }
    }

    impl SharedObjectListener for RecordingListener {
        fn listener_id(&self) -> String {
            self.id.clone()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        fn send_shared_object(&self, message: SharedObjectMessage) {
            self.received.lock().push(message);
        }
    }

    fn object(persistent: bool) -> SharedObject {
        SharedObject::new(
            "state",
            "app/state",
            persistent,
            Arc::new(InlineExecutor),
            Arc::new(ManualClock::new(0)),
        )
    }

    fn number(n: f64) -> Amf0Value {
        Amf0Value::Number(n)
    }

    #[test]
    fn test_version_bumps_once_per_batch() {
        let so = object(false);
        assert_eq!(so.version(), 1);
        so.begin_update();
        assert!(so.set_attribute("a", number(1.0)));
        assert!(so.set_attribute("b", number(2.0)));
        assert!(so.set_attribute("c", number(3.0)));
        assert_eq!(so.version(), 1);
        so.end_update();
        assert_eq!(so.version(), 2);

        // outside a block every flush bumps once
        so.set_attribute("a", number(10.0));
        so.set_attribute("b", number(20.0));
        assert_eq!(so.version(), 4);
    }

    #[test]
    fn test_unchanged_value_does_not_bump() {
        let so = object(false);
        assert!(so.set_attribute("a", number(1.0)));
        assert!(!so.set_attribute("a", number(1.0)));
        assert_eq!(so.version(), 2);
        assert_eq!(so.statistics().changes, 1);
    }

    #[test]
    fn test_remove_missing_attribute() {
        let so = object(false);
        let listener = RecordingListener::new("l1");
        so.register(listener.clone());
        listener.take();
        let version = so.version();

        assert!(!so.remove_attribute("missing"));
        assert_eq!(so.version(), version);
        assert!(listener.messages().is_empty());
    }

    #[test]
    fn test_null_value_deletes() {
        let so = object(false);
        so.set_attribute("a", number(1.0));
        assert!(so.set_attribute("a", Amf0Value::Null));
        assert!(!so.has_attribute("a"));
        assert!(!so.set_attribute("a", Amf0Value::Undefined));
        assert_eq!(so.statistics().deletes, 1);
    }

    #[test]
    fn test_register_seeds_owner_events() {
        let so = object(false);
        so.set_attribute("a", number(1.0));
        let listener = RecordingListener::new("l1");
        so.register(listener.clone());

        let messages = listener.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].kinds(),
            vec![
                SharedObjectEventKind::ClientInitialData,
                SharedObjectEventKind::ClientClearData,
                SharedObjectEventKind::ClientUpdateData,
            ]
        );
        match &messages[0].events[2].data {
            EventData::Attributes(attributes) => assert_eq!(attributes.get("a"), Some(&number(1.0))),
            other => panic!("unexpected payload {other:?}"),
        }

        let persistent = object(true);
        let listener = RecordingListener::new("l2");
        persistent.register(listener.clone());
        assert_eq!(
            listener.take()[0].kinds(),
            vec![SharedObjectEventKind::ClientInitialData]
        );
    }

    #[test]
    fn test_source_gets_owner_events_others_get_sync() {
        let so = object(false);
        let l1 = RecordingListener::new("l1");
        let l2 = RecordingListener::new("l2");
        so.register(l1.clone());
        so.register(l2.clone());
        l1.take();
        l2.take();

        so.begin_update_with(l1.clone());
        so.set_attribute("x", number(1.0));
        so.end_update();

        let to_source = l1.take();
        assert_eq!(to_source.len(), 1);
        assert_eq!(
            to_source[0].kinds(),
            vec![SharedObjectEventKind::ClientUpdateAttribute]
        );
        let to_other = l2.take();
        assert_eq!(to_other.len(), 1);
        assert_eq!(to_other[0].kinds(), vec![SharedObjectEventKind::ClientUpdateData]);
        assert_eq!(to_other[0].version, so.version());
    }

    #[test]
    fn test_disconnected_listener_is_dropped() {
        let so = object(true);
        let l1 = RecordingListener::new("l1");
        let l2 = RecordingListener::new("l2");
        so.register(l1.clone());
        so.register(l2.clone());
        l2.connected.store(false, Ordering::Release);

        so.set_attribute("x", number(1.0));
        assert!(!so.is_registered("l2"));
        assert!(so.is_registered("l1"));
    }

    #[test]
    fn test_send_message_reaches_everyone() {
        let so = object(false);
        let l1 = RecordingListener::new("l1");
        let l2 = RecordingListener::new("l2");
        so.register(l1.clone());
        so.register(l2.clone());
        l1.take();
        l2.take();

        so.begin_update_with(l1.clone());
        so.send_message("chat", vec![Amf0Value::Utf8String("hi".into())]);
        so.end_update();

        let version = so.version();
        for listener in [&l1, &l2] {
            let messages = listener.take();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].events[0].kind, SharedObjectEventKind::ClientSendMessage);
            assert_eq!(messages[0].events[0].key.as_deref(), Some("chat"));
            assert_eq!(messages[0].version, version);
        }
        assert_eq!(so.statistics().sends, 1);
    }

    #[test]
    fn test_release_without_acquire_fails() {
        let so = object(true);
        assert!(matches!(so.release(), Err(Error::ReleaseWithoutAcquire(_))));
    }

    #[test]
    fn test_acquire_release_balance_closes_transient() {
        let store = Arc::new(MemoryStore::new());
        let so = object(false).set_store(store.clone());
        so.set_attribute("a", number(1.0));
        assert!(store.contains("app/state"));

        so.acquire();
        so.acquire();
        so.release().unwrap();
        assert!(so.is_acquired());
        assert!(!so.is_closed());
        so.release().unwrap();
        assert!(!so.is_acquired());
        assert!(so.is_closed());
        assert!(!store.contains("app/state"));
    }

    #[test]
    fn test_listener_keeps_transient_alive() {
        let so = object(false);
        let listener = RecordingListener::new("l1");
        so.register(listener);
        assert!(!so.check_release());
        so.unregister("l1");
        assert!(so.is_closed());
        assert!(!so.close());
    }

    #[test]
    fn test_set_attributes_reports_partial_change() {
        let so = object(false);
        so.set_attribute("a", number(1.0));
        let mut batch = HashMap::new();
        batch.insert("a".to_string(), number(1.0));
        batch.insert("b".to_string(), number(2.0));
        assert!(!so.set_attributes(batch));
        assert_eq!(so.get_attribute("b"), Some(number(2.0)));
        assert_eq!(so.version(), 3);
    }

    #[test]
    fn test_lock_timeout_returns_false() {
        let so = object(false).set_lock_timeout(5);
        let guard = so.attributes.read();
        assert!(!so.set_attribute("a", number(1.0)));
        drop(guard);
        assert!(so.set_attribute("a", number(1.0)));
    }
}
