// src/so/service.rs - Shared object registry and client message handling

use crate::config::SharedObjectConfig;
use crate::error::Result;
use crate::rtmp::status::{SO_CREATION_FAILED, SO_PERSISTENCE_MISMATCH};
use crate::so::event::{EventData, SharedObjectEvent, SharedObjectEventKind, SharedObjectMessage};
use crate::so::shared_object::{SharedObject, SharedObjectListener};
use crate::so::store::PersistenceStore;
use crate::util::{Clock, Executor};
use dashmap::DashMap;
use log::{debug, warn};
use rml_rtmp::rml_amf0::Amf0Value;
use std::sync::Arc;

/// Every live shared object of a server, keyed by scope path and name.
pub struct SharedObjectService {
    objects: DashMap<String, Arc<SharedObject>>,
    store: Arc<dyn PersistenceStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    config: SharedObjectConfig,
}

fn object_path(scope: &str, name: &str) -> String {
    format!("{scope}/{name}")
}

impl SharedObjectService {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        config: SharedObjectConfig,
    ) -> Self {
        Self {
            objects: DashMap::new(),
            store,
            executor,
            clock,
            config,
        }
    }

    fn create(&self, scope: &str, name: &str, persistent: bool) -> SharedObject {
        let path = object_path(scope, name);
        let object = match self.store.load(&path).filter(|_| persistent) {
            Some(stored) => {
                debug!("Loaded shared object {path} at version {}", stored.version);
                SharedObject::from_stored(stored, self.executor.clone(), self.clock.clone())
            }
            None => SharedObject::new(
                name,
                path,
                persistent,
                self.executor.clone(),
                self.clock.clone(),
            ),
        };
        object
            .set_store(self.store.clone())
            .set_lock_timeout(self.config.lock_timeout)
    }

    /// Looks an object up, creating or loading it when missing.
    pub fn get_or_create(&self, scope: &str, name: &str, persistent: bool) -> Arc<SharedObject> {
        let path = object_path(scope, name);
        let mut entry = self
            .objects
            .entry(path)
            .or_insert_with(|| Arc::new(self.create(scope, name, persistent)));
        if entry.is_closed() {
            *entry = Arc::new(self.create(scope, name, persistent));
        }
        entry.value().clone()
    }

    pub fn get(&self, scope: &str, name: &str) -> Option<Arc<SharedObject>> {
        self.objects
            .get(&object_path(scope, name))
            .map(|entry| entry.value().clone())
            .filter(|object| !object.is_closed())
    }

    pub fn has(&self, scope: &str, name: &str) -> bool {
        self.get(scope, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drops one reference taken with [`SharedObject::acquire`].
    pub fn release(&self, scope: &str, name: &str) -> Result<()> {
        if let Some(object) = self.get(scope, name) {
            object.release()?;
        }
        self.remove_closed();
        Ok(())
    }

    /// Unregisters a disconnecting client from every object it listened to.
    pub fn disconnect(&self, listener_id: &str) {
        let objects: Vec<Arc<SharedObject>> =
            self.objects.iter().map(|entry| entry.value().clone()).collect();
        for object in objects {
            if object.is_registered(listener_id) {
                object.unregister(listener_id);
            }
        }
        self.remove_closed();
    }

    fn remove_closed(&self) {
        self.objects.retain(|_, object| !object.is_closed());
    }

    /// Applies a client's shared object message inside one update block.
    pub fn handle_message(
        &self,
        scope: &str,
        listener: Arc<dyn SharedObjectListener>,
        message: SharedObjectMessage,
    ) {
        let connects = message
            .events
            .iter()
            .any(|e| e.kind == SharedObjectEventKind::ServerConnect);
        let object = match self.get(scope, &message.name) {
            Some(object) => object,
            None if connects => self.get_or_create(scope, &message.name, message.persistent),
            None => {
                warn!(
                    "Shared object {} not found for {}",
                    message.name,
                    listener.listener_id()
                );
                send_status(&*listener, &message.name, SO_CREATION_FAILED);
                return;
            }
        };
        if object.is_persistent() != message.persistent {
            warn!(
                "Shared object {} persistence mismatch for {}",
                message.name,
                listener.listener_id()
            );
            send_status(&*listener, &message.name, SO_PERSISTENCE_MISMATCH);
            return;
        }

        object.begin_update_with(listener.clone());
        for event in message.events {
            match event.kind {
                SharedObjectEventKind::ServerConnect => object.register(listener.clone()),
                SharedObjectEventKind::ServerDisconnect => {
                    object.unregister(&listener.listener_id())
                }
                SharedObjectEventKind::ServerSetAttribute => {
                    if let Some(key) = &event.key {
                        let value = event.value().cloned().unwrap_or(Amf0Value::Null);
                        object.set_attribute(key, value);
                    }
                }
                SharedObjectEventKind::ServerDeleteAttribute => {
                    if let Some(key) = &event.key {
                        object.remove_attribute(key);
                    }
                }
                SharedObjectEventKind::ServerSendMessage => {
                    if let Some(key) = &event.key {
                        object.send_message(key, event.arguments().to_vec());
                    }
                }
                other => warn!("Unsupported shared object event {other:?} on {}", message.name),
            }
        }
        object.end_update();
        self.remove_closed();
    }
}

fn send_status(listener: &dyn SharedObjectListener, name: &str, code: &str) {
    let event = SharedObjectEvent::new(
        SharedObjectEventKind::ClientStatus,
        Some(code.to_string()),
        EventData::Value(Amf0Value::Utf8String("error".to_string())),
    );
    listener.send_shared_object(SharedObjectMessage::new(name, 0, false).add_event(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::so::shared_object::tests::RecordingListener;
    use crate::so::store::MemoryStore;
    use crate::util::{InlineExecutor, ManualClock};

    fn service(store: Arc<MemoryStore>) -> SharedObjectService {
        SharedObjectService::new(
            store,
            Arc::new(InlineExecutor),
            Arc::new(ManualClock::new(0)),
            SharedObjectConfig::default(),
        )
    }

    fn client_message(name: &str, persistent: bool, events: Vec<SharedObjectEvent>) -> SharedObjectMessage {
        SharedObjectMessage {
            name: name.to_string(),
            version: 0,
            persistent,
            events,
        }
    }

    #[test]
    fn test_connect_creates_and_registers() {
        let service = service(Arc::new(MemoryStore::new()));
        let listener = RecordingListener::new("c1");
        service.handle_message(
            "live",
            listener.clone(),
            client_message(
                "room",
                false,
                vec![SharedObjectEvent::new(SharedObjectEventKind::ServerConnect, None, EventData::Empty)],
            ),
        );
        let object = service.get("live", "room").unwrap();
        assert!(object.is_registered("c1"));
        let messages = listener.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].events[0].kind, SharedObjectEventKind::ClientInitialData);
    }

    #[test]
    fn test_set_without_connect_is_rejected() {
        let service = service(Arc::new(MemoryStore::new()));
        let listener = RecordingListener::new("c1");
        service.handle_message(
            "live",
            listener.clone(),
            client_message(
                "room",
                false,
                vec![SharedObjectEvent::new(
                    SharedObjectEventKind::ServerSetAttribute,
                    Some("k".into()),
                    EventData::Value(Amf0Value::Number(1.0)),
                )],
            ),
        );
        assert!(!service.has("live", "room"));
        let messages = listener.take();
        assert_eq!(messages[0].events[0].kind, SharedObjectEventKind::ClientStatus);
        assert_eq!(messages[0].events[0].key.as_deref(), Some(SO_CREATION_FAILED));
    }

    #[test]
    fn test_persistence_mismatch() {
        let service = service(Arc::new(MemoryStore::new()));
        let object = service.get_or_create("live", "room", true);
        object.acquire();
        let listener = RecordingListener::new("c1");
        service.handle_message(
            "live",
            listener.clone(),
            client_message(
                "room",
                false,
                vec![SharedObjectEvent::new(SharedObjectEventKind::ServerConnect, None, EventData::Empty)],
            ),
        );
        assert!(!object.is_registered("c1"));
        assert_eq!(
            listener.take()[0].events[0].key.as_deref(),
            Some(SO_PERSISTENCE_MISMATCH)
        );
    }

    #[test]
    fn test_disconnect_releases_transient_objects() {
        let service = service(Arc::new(MemoryStore::new()));
        let listener = RecordingListener::new("c1");
        let object = service.get_or_create("live", "room", false);
        object.register(listener.clone());
        service.disconnect("c1");
        assert!(object.is_closed());
        assert!(service.is_empty());
    }

    #[test]
    fn test_persistent_object_reloaded_from_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let service = service(store.clone());
            let object = service.get_or_create("live", "scores", true);
            object.set_attribute("top", Amf0Value::Number(99.0));
        }
        let service = service(store);
        let object = service.get_or_create("live", "scores", true);
        assert_eq!(object.get_attribute("top"), Some(Amf0Value::Number(99.0)));
        assert_eq!(object.version(), 2);
    }

    #[test]
    fn test_release_through_service() {
        let service = service(Arc::new(MemoryStore::new()));
        let object = service.get_or_create("live", "room", false);
        assert!(service.release("live", "room").is_err());
        object.acquire();
        service.release("live", "room").unwrap();
        assert!(object.is_closed());
        assert!(!service.has("live", "room"));
    }
}
