// src/context.rs - Server owned resources and services
//
// Core features:
// - One explicitly constructed context per server, no global state
// - Worker pool, timer scheduler and clock injected as trait objects
// - Provider lookup, shared objects, stream commands and the application
// - Connection registry with generation checked tokens

use crate::application::{Application, DefaultApplication};
use crate::codec::CodecFactory;
use crate::config::ServerConfig;
use crate::rtmp::handler::{RtmpHandler, ServerHandler};
use crate::rtmp::manager::ConnectionManager;
use crate::so::service::SharedObjectService;
use crate::so::store::{MemoryStore, PersistenceStore};
use crate::stream::provider::{DefaultProviderService, ProviderService};
use crate::stream::service::StreamService;
use crate::util::{Clock, Executor, Scheduler};
use std::sync::Arc;

/// Runtime resources every connection and stream borrows from.
#[derive(Clone)]
pub struct ServerResources {
    pub executor: Arc<dyn Executor>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

pub struct ServerContext {
    pub config: ServerConfig,
    pub executor: Arc<dyn Executor>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub providers: Arc<dyn ProviderService>,
    pub shared_objects: Arc<SharedObjectService>,
    pub streams: StreamService,
    pub application: Arc<dyn Application>,
    pub handler: Arc<dyn RtmpHandler>,
    pub manager: ConnectionManager,
}

impl ServerContext {
    /// Builds a context with the in-memory defaults: memory backed shared
    /// object store, default provider registry and an accept-all application.
    pub fn new(config: ServerConfig, resources: ServerResources) -> Self {
        let providers: Arc<dyn ProviderService> = Arc::new(DefaultProviderService::new(
            CodecFactory::new(config.playback.buffer_interframes),
        ));
        let shared_objects = Arc::new(SharedObjectService::new(
            Arc::new(MemoryStore::new()),
            resources.executor.clone(),
            resources.clock.clone(),
            config.shared_objects.clone(),
        ));
        Self {
            executor: resources.executor,
            scheduler: resources.scheduler,
            clock: resources.clock,
            providers,
            shared_objects,
            streams: StreamService::new(),
            application: Arc::new(DefaultApplication::new()),
            handler: Arc::new(ServerHandler),
            manager: ConnectionManager::new(),
            config,
        }
    }

    pub fn set_providers(mut self, providers: Arc<dyn ProviderService>) -> Self {
        self.providers = providers;
        self
    }

    /// Replaces the shared object store; objects are loaded from it from now on.
    pub fn set_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.shared_objects = Arc::new(SharedObjectService::new(
            store,
            self.executor.clone(),
            self.clock.clone(),
            self.config.shared_objects.clone(),
        ));
        self
    }

    pub fn set_application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = application;
        self
    }

    pub fn set_handler(mut self, handler: Arc<dyn RtmpHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn resources(&self) -> ServerResources {
        ServerResources {
            executor: self.executor.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::{InlineExecutor, ManualClock, ManualScheduler};

    /// Deterministic context: inline executor, manual clock starting at 1000.
    ///
    /// Returned unwrapped so tests can swap services before sharing it.
    pub fn context_parts(config: ServerConfig) -> (ServerContext, Arc<ManualScheduler>) {
        let clock = Arc::new(ManualClock::new(1000));
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let resources = ServerResources {
            executor: Arc::new(InlineExecutor),
            scheduler: scheduler.clone(),
            clock,
        };
        (ServerContext::new(config, resources), scheduler)
    }

    pub fn test_context_with(config: ServerConfig) -> (Arc<ServerContext>, Arc<ManualScheduler>) {
        let (context, scheduler) = context_parts(config);
        (Arc::new(context), scheduler)
    }

    pub fn test_context() -> (Arc<ServerContext>, Arc<ManualScheduler>) {
        test_context_with(ServerConfig::default())
    }

    #[test]
    fn test_context_defaults() {
        let (context, _scheduler) = test_context();
        assert!(context.manager.is_empty());
        assert!(context.shared_objects.is_empty());
        assert_eq!(context.config.rtmp.max_streams, 320);
        assert_eq!(context.clock.now_millis(), 1000);
    }
}
