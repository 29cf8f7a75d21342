pub mod cloud_sync;
pub mod content_cache;
pub mod download_task;
pub mod http;
pub mod installer;
pub mod instance_store;
pub mod progress;
pub mod task_runner;
pub mod validation;

pub use cloud_sync::{
    CloudSyncOperation, ObjectMetadata, ObjectStoreClient, SyncDirection, SyncReport,
};
pub use content_cache::{CacheSaveGuard, ContentCache};
pub use download_task::DownloadTask;
pub use http::{BandwidthThrottler, DownloadOutcome, HttpDownloader, ReqwestDownloader};
pub use installer::{
    InstallOperation, InstanceInstaller, ModLoaderInstaller, ModLoaderSpec, OperationType,
};
pub use instance_store::InstanceStore;
pub use progress::{
    EventSink, InstallStage, NullSink, ProgressTracker, ProgressUpdate, TaskProgress,
    TaskProgressAggregator,
};
pub use task_runner::{CancellationToken, ParallelTaskRunner};
pub use validation::{DownloadValidation, FileValidation, HashFunction};
