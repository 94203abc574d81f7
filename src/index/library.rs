//! The hybrid library index.
//!
//! Holds the authoritative in-memory view of owned set ids and their
//! metadata, merged from two untrusted sources: the binary catalog file and
//! a filesystem scan of the content root. The merged view lives behind a
//! single short-held mutex; all expensive work (sqlite reads, binary
//! parsing, directory walks) runs on the blocking pool outside the lock.
//!
//! A refresh is single-flight: the background scan task handle is a state
//! token checked-and-set under the same lock that guards the view, so
//! concurrent refresh calls while a scan is running are no-ops.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::EventBus;

use super::binary::read_binary_index;
use super::metadata::SetRecord;
use super::scanner::{scan_content_root, ScanExtensions};
use super::store::{ScanStatus, Store};

/// Configuration for the library index.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Content root walked by the filesystem scanner.
    pub content_root: PathBuf,
    /// Binary catalog path. `None` (or a missing file) degrades to
    /// filesystem-only results.
    pub binary_index_path: Option<PathBuf>,
    /// Extension allow-list for the scanner.
    pub extensions: ScanExtensions,
}

/// Point-in-time counters over the merged view.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub owned_count: usize,
    pub with_metadata_count: usize,
    pub root_exists: bool,
}

/// Mutable state guarded by one mutex: the merged view plus the
/// single-flight scan token.
struct IndexState {
    owned: HashSet<u64>,
    metadata: HashMap<u64, SetRecord>,
    scan_task: Option<JoinHandle<()>>,
    scans_started: u64,
}

/// Merged, concurrently refreshable index of owned sets.
pub struct LibraryIndex {
    config: LibraryConfig,
    store: Arc<Store>,
    state: Mutex<IndexState>,
    // Count of completed scans; waiters watch this instead of consuming
    // the single-flight handle.
    scans_done: watch::Sender<u64>,
    events: EventBus,
}

impl LibraryIndex {
    pub fn new(config: LibraryConfig, store: Arc<Store>, events: EventBus) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(IndexState {
                owned: HashSet::new(),
                metadata: HashMap::new(),
                scan_task: None,
                scans_started: 0,
            }),
            scans_done: watch::channel(0).0,
            events,
        }
    }

    /// O(1) membership test against the last completed merged view.
    pub fn owned(&self, set_id: u64) -> bool {
        self.state
            .lock()
            .expect("index mutex poisoned")
            .owned
            .contains(&set_id)
    }

    /// Metadata for one owned set, if any.
    pub fn record(&self, set_id: u64) -> Option<SetRecord> {
        self.state
            .lock()
            .expect("index mutex poisoned")
            .metadata
            .get(&set_id)
            .cloned()
    }

    /// Counters over the current view.
    pub fn summary(&self) -> IndexSummary {
        let state = self.state.lock().expect("index mutex poisoned");
        IndexSummary {
            owned_count: state.owned.len(),
            with_metadata_count: state.metadata.len(),
            root_exists: self.config.content_root.exists(),
        }
    }

    /// Persisted scan state machine snapshot.
    pub async fn scan_status(&self) -> Result<ScanStatus> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.scan_status())
            .await
            .context("scan status task panicked")?
            .context("failed to read scan status")
    }

    /// Immediately record a freshly acquired set as owned, without waiting
    /// for the next scan. Metadata, when supplied, is persisted as well.
    pub fn mark_owned(&self, set_id: u64, record: Option<SetRecord>) {
        {
            let mut state = self.state.lock().expect("index mutex poisoned");
            state.owned.insert(set_id);
            if let Some(record) = record.clone() {
                state.metadata.insert(set_id, record);
            }
        }
        if let Some(record) = record {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = store.upsert(&record, "", 0, 0.0) {
                    warn!(set_id = record.set_id, error = %err, "failed to persist record");
                }
            });
        }
    }

    /// Hybrid reload: swap in the persisted rows for an immediate view, then
    /// launch the background binary + filesystem scan. Single-flight: a
    /// refresh already in progress is not restarted.
    pub async fn refresh(self: &Arc<Self>) -> Result<()> {
        let store = Arc::clone(&self.store);
        let persisted = tokio::task::spawn_blocking(move || store.get_all())
            .await
            .context("store load task panicked")?
            .context("failed to load persisted catalog")?;

        {
            let mut state = self.state.lock().expect("index mutex poisoned");
            state.owned = persisted.keys().copied().collect();
            state.metadata = persisted;

            match &state.scan_task {
                Some(handle) if !handle.is_finished() => {
                    info!("scan already in flight, not restarting");
                    return Ok(());
                }
                _ => {}
            }
            state.scans_started += 1;
            let this = Arc::clone(self);
            state.scan_task = Some(tokio::spawn(async move {
                this.background_scan().await;
            }));
        }

        Ok(())
    }

    /// Await completion of every scan started so far. Used by the CLI's
    /// foreground scan command and by tests. Leaves the single-flight token
    /// in place, so a concurrent `refresh` still joins the running scan.
    pub async fn wait_for_scan(&self) {
        let target = {
            let state = self.state.lock().expect("index mutex poisoned");
            state.scans_started
        };
        let mut done = self.scans_done.subscribe();
        while *done.borrow_and_update() < target {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run the hybrid scan off the cooperative scheduler, then atomically
    /// swap the merged view. A total failure records the error and leaves
    /// the previous view untouched.
    async fn background_scan(self: Arc<Self>) {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let outcome = tokio::task::spawn_blocking(move || run_hybrid_scan(&config, &store)).await;

        match outcome {
            Ok(Ok((owned, metadata))) => {
                let (owned_count, with_metadata) = (owned.len(), metadata.len());
                {
                    let mut state = self.state.lock().expect("index mutex poisoned");
                    state.owned = owned;
                    state.metadata = metadata;
                }
                info!(owned = owned_count, with_metadata, "library scan complete");
            }
            Ok(Err(err)) => {
                warn!(error = %err, "library scan failed");
                let store = Arc::clone(&self.store);
                let message = err.to_string();
                let _ = tokio::task::spawn_blocking(move || store.set_scan_error(&message)).await;
            }
            Err(err) => warn!(error = %err, "library scan task panicked"),
        }

        if let Ok(status) = self.scan_status().await {
            if let Ok(payload) = serde_json::to_value(&status) {
                self.events.publish("scan", payload);
            }
        }

        self.scans_done.send_modify(|done| *done += 1);
    }
}

type MergedView = (HashSet<u64>, HashMap<u64, SetRecord>);

/// Blocking scan body: binary index (optional, degrades on failure) plus the
/// filesystem walk, merged with binary-index precedence.
fn run_hybrid_scan(config: &LibraryConfig, store: &Store) -> Result<MergedView> {
    let binary = match &config.binary_index_path {
        Some(path) if path.exists() => match read_binary_index(path) {
            Ok(index) => Some(index),
            Err(err) => {
                // Corrupt or truncated catalog: never use a partial read.
                warn!(path = %path.display(), error = %err,
                      "binary index unavailable, using filesystem only");
                None
            }
        },
        Some(path) => {
            info!(path = %path.display(), "binary index not found, using filesystem only");
            None
        }
        None => None,
    };

    let scan = scan_content_root(&config.content_root, &config.extensions, store)?;

    let mut owned = scan.owned;
    let mut metadata = scan.metadata;
    if let Some(binary) = binary {
        owned.extend(binary.owned.iter().copied());
        // Binary-index metadata wins over filesystem-derived records.
        for (set_id, record) in binary.metadata {
            metadata.insert(set_id, record);
        }
    }

    Ok((owned, metadata))
}
