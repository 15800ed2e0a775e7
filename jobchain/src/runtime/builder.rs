use std::fmt;
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::SchedulerConfig;
use crate::context::CancellationRegistry;
use crate::events::JobEventBus;
use crate::notify::{OperatorNotifier, TracingNotifier};
use crate::plugin::PluginCatalog;
use crate::registry::OperationRegistry;
use crate::resolver::DependencyResolver;
use crate::service::JobService;
use crate::store::JobStore;
use crate::transport::{ChannelTransport, Transport};

use super::dispatch::Dispatcher;
use super::supervisor::SchedulerRuntime;

/// Builder for a [`SchedulerRuntime`] with explicit dependencies.
///
/// Only the store is required. Without a transport, a [`ChannelTransport`]
/// is created and drained by the runtime's workers.
///
/// ```ignore
/// let registry = Arc::new(OperationRegistry::with_core_operations());
/// registry.register(codes::EDIT_ENTRY, handler_fn(edit_entry))?;
///
/// let config = SchedulerConfig::from_file("scheduler.toml")?;
/// let runtime = SchedulerRuntimeBuilder::new(config)
///     .with_store(Arc::new(InMemoryJobStore::new()))
///     .with_registry(registry)
///     .with_plugins(catalog)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct SchedulerRuntimeBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    registry: Option<Arc<OperationRegistry>>,
    plugins: Option<PluginCatalog>,
    transport: Option<Arc<dyn Transport>>,
    notifier: Option<Arc<dyn OperatorNotifier>>,
    events: Option<JobEventBus>,
}

impl fmt::Debug for SchedulerRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SchedulerRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("registry_set", &self.registry.is_some());
        debug.field("plugins", &self.plugins);
        debug.field("transport_set", &self.transport.is_some());
        debug.field("notifier_set", &self.notifier.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.finish()
    }
}

impl SchedulerRuntimeBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            registry: None,
            plugins: None,
            transport: None,
            notifier: None,
            events: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`OperationRegistry::with_core_operations`].
    pub fn with_registry(mut self, registry: Arc<OperationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Plugins validated against `plugin_ranges` and installed on build.
    pub fn with_plugins(mut self, plugins: PluginCatalog) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Replaces the channel transport. The runtime then starts no workers.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_events(mut self, events: JobEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the configuration, installs plugins and wires the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is missing, the configuration is invalid,
    /// or plugin validation fails.
    pub fn build(self) -> anyhow::Result<SchedulerRuntime> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(OperationRegistry::with_core_operations())
        });
        if let Some(plugins) = &self.plugins {
            registry.install_plugins(plugins, &self.config.plugin_ranges)?;
        }

        let (transport, receiver) = match self.transport {
            Some(transport) => (transport, None),
            None => {
                let (transport, receiver) = ChannelTransport::new();
                (Arc::new(transport) as Arc<dyn Transport>, Some(receiver))
            }
        };
        let notifier =
            self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let events = self.events.unwrap_or_default();
        let cache = ResultCache::new(self.config.cache_dir.clone());
        let timeout = self.config.job_timeout();

        let resolver = Arc::new(DependencyResolver::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&transport),
            events.clone(),
            self.config.dependency.clone(),
            timeout,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&resolver),
            transport,
            notifier,
            events.clone(),
            cache.clone(),
            CancellationRegistry::new(),
        ));
        let service = Arc::new(JobService::new(
            store,
            registry,
            resolver,
            Arc::clone(&dispatcher),
            cache,
            events,
            timeout,
        ));

        Ok(SchedulerRuntime::new(
            self.config,
            service,
            dispatcher,
            receiver,
        ))
    }
}
