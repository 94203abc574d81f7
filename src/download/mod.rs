//! Concurrent, rate-limited acquisition pipeline.
//!
//! - `limiter`: token bucket shared across workers
//! - `task`: per-set task records and queue snapshots
//! - `manager`: queue, worker pool, streaming transfer and validation

pub mod limiter;
pub mod manager;
pub mod task;

pub use limiter::RateLimiter;
pub use manager::{DownloadConfig, DownloadManager};
pub use task::{DownloadTask, MetadataHint, QueueSnapshot, TaskStatus};
