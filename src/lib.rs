//! beatsync - hybrid beatmap catalog and download pipeline
//!
//! Maintains a local catalog of owned beatmap set ids reconciled from two
//! independent, untrusted sources (a proprietary binary index file and a
//! filesystem scan of the content root) and drives a concurrent,
//! rate-limited acquisition pipeline for the sets that are missing.
//!
//! # Modules
//!
//! - `index`: binary catalog reader, filesystem scanner, sqlite store, and
//!   the merged [`LibraryIndex`](index::LibraryIndex)
//! - `download`: de-duplicated task queue, fixed worker pool, token-bucket
//!   rate limiter, streaming transfer and archive validation
//! - `events`: best-effort progress broadcast
//! - `config`: settings resolution (env > JSON file > defaults)
//! - `cli`: command-line consumer of the core surface
//!
//! # Usage
//!
//! ```bash
//! # Scan the content root and binary index
//! beatsync scan
//!
//! # Fetch missing sets
//! beatsync download 123456 654321
//! ```

pub mod cli;
pub mod config;
pub mod download;
pub mod events;
pub mod index;

// Re-export the core surface at crate root for convenience
pub use config::Settings;
pub use download::{DownloadConfig, DownloadManager, DownloadTask, MetadataHint, RateLimiter, TaskStatus};
pub use events::EventBus;
pub use index::{LibraryConfig, LibraryIndex, ScanStatus, SetRecord, Store};
