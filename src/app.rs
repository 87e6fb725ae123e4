//! Application context construction
//!
//! All services are built here, once, from configuration, and handed to each
//! other as explicit parameters. There are no ambient singletons: anything a
//! component needs arrives through its constructor.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{Config, IdentifierStrategy};
use crate::db::Database;
use crate::services::{
    CatalogService, DispatcherSettings, HardlinkService, HttpCatalog, Identifier, LlmClient,
    LlmConfig, LlmFolderClassifier, LlmIdentifier, QueueService, QueueSettings, RegexIdentifier,
    Scanner, ScannerSettings, SourceWatcher, TaskDispatcher, WatcherSettings, WorkerPool,
};

/// Fully wired application services
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub queue: QueueService,
    pub worker_pool: Arc<WorkerPool>,
    pub scanner: Arc<Scanner>,
    pub watcher: Arc<SourceWatcher>,
}

impl AppContext {
    /// Wire every service from configuration and an open database
    pub fn build(config: Arc<Config>, db: Database) -> Result<Self> {
        let db = Arc::new(db);

        let queue = QueueService::new((*db).clone(), QueueSettings::from_config(&config));

        let llm = Arc::new(
            LlmClient::new(LlmConfig {
                url: config.llm_url.clone(),
                model: config.llm_model.clone(),
                api_key: config.llm_api_key.clone(),
                ..LlmConfig::default()
            })
            .context("Failed to create LLM client")?,
        );
        let catalog_search = Arc::new(
            HttpCatalog::new(config.catalog_url.clone(), config.catalog_api_key.clone())
                .context("Failed to create catalog client")?,
        );

        let identifier: Arc<dyn Identifier> = match config.identifier_strategy {
            IdentifierStrategy::Regex => Arc::new(RegexIdentifier::new(catalog_search)),
            IdentifierStrategy::Llm => {
                Arc::new(LlmIdentifier::new(Arc::clone(&llm), catalog_search))
            }
        };
        let classifier = Arc::new(LlmFolderClassifier::new(llm));

        let catalog = Arc::new(CatalogService::new(Arc::clone(&db)));
        let dispatcher = Arc::new(TaskDispatcher::new(
            DispatcherSettings::from_config(&config),
            identifier,
            classifier,
            HardlinkService::new(),
            catalog,
        ));

        let worker_pool = Arc::new(WorkerPool::new(queue.clone(), dispatcher, Arc::clone(&db)));
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&db),
            queue.clone(),
            ScannerSettings::from_config(&config),
        ));
        let watcher = Arc::new(SourceWatcher::new(
            Arc::clone(&db),
            queue.clone(),
            WatcherSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            db,
            queue,
            worker_pool,
            scanner,
            watcher,
        })
    }
}
