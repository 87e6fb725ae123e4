//! Processing services
//!
//! The pipeline, leaves first: queue lifecycle, hardlink materializer,
//! identification, folder classification, the repository gateway, and the
//! dispatcher/worker pool that tie them together. Discovery (scanner and
//! filesystem watcher) feeds the queue from the other side.

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod filename_parser;
pub mod hardlink;
pub mod identifier;
pub mod llm;
pub mod queue;
pub mod scanner;
pub mod special_folder;
pub mod watcher;
pub mod worker_pool;

pub use catalog::CatalogService;
pub use dispatcher::{DispatcherSettings, TaskDispatcher, TaskOutcome};
pub use error::ProcessingError;
pub use hardlink::HardlinkService;
pub use identifier::{HttpCatalog, Identifier, LlmIdentifier, RegexIdentifier};
pub use llm::{LlmClient, LlmConfig};
pub use queue::{QueueService, QueueSettings};
pub use scanner::{Scanner, ScannerSettings};
pub use special_folder::{FolderClassifier, LlmFolderClassifier};
pub use watcher::{SourceWatcher, WatcherSettings};
pub use worker_pool::{ShutdownMode, WorkerPool, WorkerSettings};
