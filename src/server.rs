// src/server.rs - Embeddable RTMP server
//
// Core features:
// - Typestate lifecycle: Initialization -> Running -> Ended
// - Owns the worker pool, timer thread and server context
// - Accepts already decoded transport sessions, one connection each
// - Stopping closes every connection before the threads go away

use crate::application::Application;
use crate::config::ServerConfig;
use crate::context::{ServerContext, ServerResources};
use crate::error::{Error, Result};
use crate::rtmp::connection::RtmpConnection;
use crate::rtmp::handler::RtmpHandler;
use crate::rtmp::transport::Transport;
use crate::so::store::PersistenceStore;
use crate::stream::provider::ProviderService;
use crate::util::{SystemClock, ThreadScheduler, WorkerPool};
use log::{debug, info};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Initialization;
#[derive(Clone)]
pub struct Running;
#[derive(Clone)]
pub struct Ended;

#[derive(Clone)]
struct Runtime {
    pool: Arc<WorkerPool>,
    scheduler: Arc<ThreadScheduler>,
    context: Arc<ServerContext>,
}

#[derive(Clone)]
pub struct RtmpServer<S> {
    config: ServerConfig,
    status: Arc<AtomicUsize>,
    application: Option<Arc<dyn Application>>,
    handler: Option<Arc<dyn RtmpHandler>>,
    providers: Option<Arc<dyn ProviderService>>,
    store: Option<Arc<dyn PersistenceStore>>,
    runtime: Option<Runtime>,
    state: PhantomData<S>,
}

const STATUS_INIT: usize = 0;
const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

impl<S: 'static> RtmpServer<S> {
    fn into_state<T>(self) -> RtmpServer<T> {
        RtmpServer {
            config: self.config,
            status: self.status,
            application: self.application,
            handler: self.handler,
            providers: self.providers,
            store: self.store,
            runtime: self.runtime,
            state: Default::default(),
        }
    }

    /// `true` once [`stop`](RtmpServer<Running>::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl RtmpServer<Initialization> {
    /// Creates a server that does nothing until [`start`](RtmpServer<Initialization>::start).
    pub fn new(config: ServerConfig) -> RtmpServer<Initialization> {
        Self {
            config,
            status: Arc::new(AtomicUsize::new(STATUS_INIT)),
            application: None,
            handler: None,
            providers: None,
            store: None,
            runtime: None,
            state: Default::default(),
        }
    }

    /// Application deciding who may connect. Defaults to accepting everyone.
    pub fn set_application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    /// Replaces the default command set.
    pub fn set_handler(mut self, handler: Arc<dyn RtmpHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_providers(mut self, providers: Arc<dyn ProviderService>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Persistence for shared objects. Defaults to memory only.
    pub fn set_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Starts the worker pool and timer thread and builds the server context.
    ///
    /// # Returns
    /// * `Ok(RtmpServer<Running>)` ready to [`accept`](RtmpServer<Running>::accept) sessions
    /// * `Err(Error::ThreadExited)` if a thread could not be spawned
    pub fn start(mut self) -> Result<RtmpServer<Running>> {
        let pool = Arc::new(WorkerPool::new("rtmp-worker", self.config.worker_threads)?);
        let scheduler = match ThreadScheduler::new(pool.clone()) {
            Ok(scheduler) => Arc::new(scheduler),
            Err(e) => {
                pool.shutdown();
                return Err(e);
            }
        };
        let resources = ServerResources {
            executor: pool.clone(),
            scheduler: scheduler.clone(),
            clock: Arc::new(SystemClock),
        };

        let mut context = ServerContext::new(self.config.clone(), resources);
        if let Some(store) = self.store.clone() {
            context = context.set_store(store);
        }
        if let Some(providers) = self.providers.clone() {
            context = context.set_providers(providers);
        }
        if let Some(application) = self.application.clone() {
            context = context.set_application(application);
        }
        if let Some(handler) = self.handler.clone() {
            context = context.set_handler(handler);
        }

        self.runtime = Some(Runtime {
            pool,
            scheduler,
            context: Arc::new(context),
        });
        self.status.store(STATUS_RUN, Ordering::Release);
        info!(
            "Rtmp server started with {} worker threads.",
            self.config.worker_threads
        );
        Ok(self.into_state())
    }
}

impl RtmpServer<Running> {
    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::ServerNotRunning)
    }

    pub fn context(&self) -> Option<&Arc<ServerContext>> {
        self.runtime.as_ref().map(|runtime| &runtime.context)
    }

    /// Opens a connection over an accepted transport session.
    ///
    /// The connection waits for its handshake from here on; it is closed by
    /// the handshake timer if the client never connects to a scope.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Result<Arc<RtmpConnection>> {
        if self.status.load(Ordering::Acquire) != STATUS_RUN {
            return Err(Error::ServerNotRunning);
        }
        let runtime = self.runtime()?;
        let connection = RtmpConnection::new(runtime.context.clone(), transport);
        connection.open()?;
        debug!(
            "Accepted connection {} from {}",
            connection.session_id(),
            connection.remote_address()
        );
        Ok(connection)
    }

    pub fn connections(&self) -> Vec<Arc<RtmpConnection>> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.context.manager.connections())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.runtime
            .as_ref()
            .map_or(0, |runtime| runtime.context.manager.len())
    }

    /// Closes every connection, then stops the timer thread and the pool.
    pub fn stop(self) -> RtmpServer<Ended> {
        self.status.store(STATUS_END, Ordering::Release);
        if let Some(runtime) = self.runtime.as_ref() {
            for connection in runtime.context.manager.connections() {
                connection.close();
            }
            runtime.scheduler.shutdown();
            runtime.pool.shutdown();
        }
        info!("Rtmp server stopped.");
        self.into_state()
    }
}
