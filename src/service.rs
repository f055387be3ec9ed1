//! Service wiring: builds the repositories, backend registry, download
//! pipeline and scheduler over a database pool, and owns their lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, ConfigHandle, ReloadBroadcaster};
use crate::database::repositories::{
    SqlxDeviceRepository, SqlxImageRepository, SqlxJobRepository, SqlxSourceRepository,
};
use crate::database::DbPool;
use crate::downloader::Downloader;
use crate::scheduler::Scheduler;
use crate::source::{reddit::Reddit, SourceRegistry};

/// The assembled ingestion service.
///
/// The outer host owns this struct; the scheduler borrows the store through
/// the repository traits, so there is no reference cycle back to the host.
pub struct Claw {
    config: ConfigHandle,
    reload: ReloadBroadcaster,
    scheduler: Arc<Scheduler>,
    registry: Arc<SourceRegistry>,
}

impl Claw {
    pub fn new(pool: DbPool, config: Config, http: reqwest::Client) -> Self {
        let config = ConfigHandle::new(config);
        let reload = ReloadBroadcaster::new();

        let registry = Arc::new(SourceRegistry::new().register(Arc::new(Reddit::new(http.clone()))));

        let images = Arc::new(SqlxImageRepository::new(pool.clone()));
        let downloader = Arc::new(Downloader::new(http, config.clone(), images));

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            reload.clone(),
            Arc::new(SqlxJobRepository::new(pool.clone())),
            Arc::new(SqlxSourceRepository::new(pool.clone())),
            Arc::new(SqlxDeviceRepository::new(pool)),
            Arc::clone(&registry),
            downloader,
        ));

        Self {
            config,
            reload,
            scheduler,
            registry,
        }
    }

    /// Run the scheduler until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        self.scheduler.start(token).await;
    }

    /// Swap in a new configuration and wake every listener.
    pub fn reread_config(&self, config: Config) {
        self.config.replace(config);
        let woken = self.reload.publish();
        info!(listeners = woken, "configuration reloaded");
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }
}
