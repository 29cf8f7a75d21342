use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::services::content_cache::ContentCache;
use crate::services::http::{HttpDownloader, ReqwestDownloader};
use crate::services::installer::{InstanceInstaller, ModLoaderInstaller};
use crate::services::instance_store::InstanceStore;
use crate::services::progress::{EventSink, NullSink, ProgressTracker};
use crate::services::task_runner::CancellationToken;
use crate::settings::Settings;

/// Explicit bundle of the engine's long-lived collaborators. Constructed
/// once at startup and passed down; nothing in the engine reaches for
/// process-global state.
#[derive(Clone)]
pub struct EngineContext {
    pub settings: Settings,
    pub cache: ContentCache,
    pub store: InstanceStore,
    pub client: Arc<dyn HttpDownloader>,
    pub sink: Arc<dyn EventSink>,
}

impl EngineContext {
    pub fn new(settings: Settings, cache_dir: PathBuf) -> Result<Self> {
        let client = Arc::new(ReqwestDownloader::new(settings.speed_limit)?);
        Ok(Self {
            cache: ContentCache::new(cache_dir)?,
            store: InstanceStore::new(settings.instances_dir.clone()),
            settings,
            client,
            sink: Arc::new(NullSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Evicts expired cache entries off the hot path. Requires a running
    /// tokio runtime.
    pub fn start_cache_maintenance(&self) {
        self.cache
            .start_background_clean(Duration::from_secs(self.settings.cache_life));
    }

    /// Assembles an installer for one run. Each run gets its own tracker
    /// and token; the heavyweight collaborators are shared.
    pub fn installer(
        &self,
        loader_installer: Arc<dyn ModLoaderInstaller>,
        token: CancellationToken,
    ) -> InstanceInstaller {
        InstanceInstaller::new(
            self.store.clone(),
            self.cache.clone(),
            Arc::clone(&self.client),
            loader_installer,
            Arc::new(ProgressTracker::new(Arc::clone(&self.sink))),
            token,
            self.settings.thread_limit,
        )
    }
}
