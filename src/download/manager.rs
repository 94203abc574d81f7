//! Download queue and worker pool.
//!
//! Enqueue requests are de-duplicated by set id and pulled FIFO by a fixed
//! pool of workers. Each download is admitted through the shared rate
//! limiter, streamed to a temporary file with live progress, validated as a
//! structurally correct archive, renamed deterministically, and finally
//! written back into the library index as owned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use glob::Pattern;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::events::EventBus;
use crate::index::{parse_metadata_text, LibraryIndex, RecordSource, SetRecord};

use super::limiter::RateLimiter;
use super::task::{DownloadTask, MetadataHint, QueueSnapshot, TaskStatus};

/// Extension of stored archives.
const ARCHIVE_EXT: &str = "osz";
/// Content types accepted for an archive response (substring match).
const ACCEPTED_CONTENT_TYPES: [&str; 3] = ["zip", "octet-stream", "osu"];
/// Archives smaller than this are flagged as a likely corrupt mirror.
const SUSPICIOUS_SIZE_BYTES: u64 = 20_000;
/// Minimum interval between progress snapshots on the event bus.
const PUBLISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
/// EMA weight kept from the prior speed estimate.
const SPEED_SMOOTHING: f64 = 0.6;

/// Download pipeline configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory archives are stored into; also checked for pre-existing
    /// archives before any network access.
    pub content_root: PathBuf,
    /// URL template with a `{set_id}` placeholder.
    pub url_template: String,
    /// Fixed worker pool size.
    pub max_concurrency: usize,
    /// Token bucket capacity per rolling minute, shared across workers.
    pub requests_per_minute: u32,
}

struct TaskTable {
    tasks: HashMap<u64, DownloadTask>,
    queue_tx: mpsc::UnboundedSender<u64>,
    workers_started: bool,
}

/// Queue + fixed worker pool executing de-duplicated download tasks.
pub struct DownloadManager {
    config: DownloadConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
    index: Arc<LibraryIndex>,
    events: EventBus,
    table: Mutex<TaskTable>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, index: Arc<LibraryIndex>, events: EventBus) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let limiter = RateLimiter::new(config.requests_per_minute);
        info!(
            content_root = %config.content_root.display(),
            template = %config.url_template,
            max_concurrency = config.max_concurrency,
            rpm = config.requests_per_minute,
            "download manager initialized"
        );
        Self {
            config,
            client: reqwest::Client::new(),
            limiter,
            index,
            events,
            table: Mutex::new(TaskTable {
                tasks: HashMap::new(),
                queue_tx,
                workers_started: false,
            }),
            queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
        }
    }

    /// Enqueue the given set ids, de-duplicated against active tasks. Ids
    /// already `queued` or `running` are silently skipped. Returns the newly
    /// created tasks.
    pub fn enqueue(
        &self,
        set_ids: &[u64],
        hints: Option<&HashMap<u64, MetadataHint>>,
    ) -> Vec<DownloadTask> {
        let mut created = Vec::new();
        {
            let mut table = self.table.lock().expect("task table mutex poisoned");
            for &set_id in set_ids {
                if table
                    .tasks
                    .get(&set_id)
                    .is_some_and(|t| t.status.is_active())
                {
                    continue;
                }
                let url = self.config.url_template.replace("{set_id}", &set_id.to_string());
                let mut task = DownloadTask::new(set_id, url);
                if let Some(hint) = hints.and_then(|h| h.get(&set_id)) {
                    task.apply_hint(hint);
                } else if let Some(record) = self.index.record(set_id) {
                    task.artist = Some(record.artist);
                    task.title = Some(record.title);
                }
                // Replaces any previous terminal task for the same id.
                table.tasks.insert(set_id, task.clone());
                let _ = table.queue_tx.send(set_id);
                created.push(task);
            }
        }
        if !created.is_empty() {
            info!(set_ids = ?created.iter().map(|t| t.set_id).collect::<Vec<_>>(), "enqueued downloads");
            self.publish_status();
        }
        created
    }

    /// Three-bucket snapshot of the task table. Tasks still missing artist
    /// or title are backfilled from the library index at read time.
    pub fn status(&self) -> QueueSnapshot {
        let mut table = self.table.lock().expect("task table mutex poisoned");
        let backfill: Vec<u64> = table
            .tasks
            .values()
            .filter(|t| t.artist.is_none() || t.title.is_none())
            .map(|t| t.set_id)
            .collect();
        for set_id in backfill {
            if let Some(record) = self.index.record(set_id) {
                if let Some(task) = table.tasks.get_mut(&set_id) {
                    if task.artist.is_none() && !record.artist.is_empty() {
                        task.artist = Some(record.artist);
                    }
                    if task.title.is_none() && !record.title.is_empty() {
                        task.title = Some(record.title);
                    }
                }
            }
        }

        let mut snapshot = QueueSnapshot::default();
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Queued => snapshot.queued.push(task.clone()),
                TaskStatus::Running => snapshot.running.push(task.clone()),
                _ => snapshot.done.push(task.clone()),
            }
        }
        snapshot.queued.sort_by_key(|t| t.created_at);
        snapshot.running.sort_by_key(|t| t.created_at);
        snapshot.done.sort_by_key(|t| t.created_at);
        snapshot
    }

    /// Spawn the fixed worker pool. Idempotent; only the first call spawns.
    pub async fn start_workers(self: &Arc<Self>) {
        {
            let mut table = self.table.lock().expect("task table mutex poisoned");
            if table.workers_started {
                return;
            }
            table.workers_started = true;
        }
        let rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("queue receiver already taken");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..self.config.max_concurrency.max(1) {
            let manager = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                manager.worker_loop(worker_id, rx).await;
            });
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<u64>>>,
    ) {
        loop {
            let set_id = {
                let mut rx = rx.lock().await;
                match rx.recv().await {
                    Some(set_id) => set_id,
                    None => return,
                }
            };

            // The id may have been replaced or already handled; only a task
            // still queued moves to running.
            let url = {
                let mut table = self.table.lock().expect("task table mutex poisoned");
                match table.tasks.get_mut(&set_id) {
                    Some(task) if task.status == TaskStatus::Queued => {
                        task.status = TaskStatus::Running;
                        task.progress = Some(0.0);
                        task.bytes_downloaded = 0;
                        task.started_at = Some(Utc::now());
                        task.url.clone()
                    }
                    _ => continue,
                }
            };
            self.publish_status();
            info!(worker_id, set_id, url = %url, "download started");

            match self.download(set_id, &url).await {
                Ok(()) => {
                    self.with_task(set_id, |task| {
                        if !task.status.is_terminal() {
                            task.status = TaskStatus::Completed;
                            task.progress = Some(1.0);
                            task.updated_at = Some(Utc::now());
                        }
                    });
                }
                Err(err) => {
                    error!(set_id, error = %err, "download failed");
                    self.with_task(set_id, |task| {
                        task.status = TaskStatus::Failed;
                        task.message = format!("{err:#}");
                        task.updated_at = Some(Utc::now());
                    });
                }
            }
            self.publish_status();
        }
    }

    /// The per-task pipeline: short-circuit on an existing archive, then
    /// rate-limited streaming fetch, content-type gate, metadata derivation,
    /// deterministic rename, and archive validation.
    async fn download(&self, set_id: u64, url: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.content_root)
            .await
            .context("failed to create content root")?;

        if let Some(existing) = self.find_existing_archive(set_id).await? {
            let size = tokio::fs::metadata(&existing).await.map(|m| m.len()).unwrap_or(0);
            info!(set_id, path = %existing.display(), "archive already present, skipping");
            self.with_task(set_id, |task| {
                task.status = TaskStatus::Skipped;
                task.message = "already exists".to_string();
                task.display_name = existing
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned());
                task.archive_path = Some(existing.clone());
                task.progress = Some(1.0);
                task.total_bytes = Some(size);
                task.bytes_downloaded = size;
                task.updated_at = Some(Utc::now());
            });
            self.index.mark_owned(set_id, None);
            return Ok(());
        }

        self.limiter.acquire().await;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("non-success status")?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !ACCEPTED_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
            // Mirror served an HTML error page or similar; nothing is
            // written to disk.
            bail!("unexpected content-type: {content_type}");
        }

        let total_bytes = resp.content_length();
        self.with_task(set_id, |task| {
            task.total_bytes = total_bytes;
            if total_bytes.is_none() {
                task.progress = None;
            }
        });

        let tmp_path = self.config.content_root.join(format!(
            "{set_id}-{}.part",
            Utc::now().timestamp_millis()
        ));
        let stream_result = self.stream_to_file(set_id, resp, &tmp_path, total_bytes).await;
        if let Err(err) = stream_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let derived = derive_metadata_from_archive(tmp_path.clone()).await;
        if let Some((artist, title)) = &derived {
            self.with_task(set_id, |task| {
                task.artist = Some(artist.clone());
                task.title = Some(title.clone());
            });
        }

        let display_name = self.build_display_name(set_id);
        let archive_path = self
            .config
            .content_root
            .join(format!("{display_name}.{ARCHIVE_EXT}"));
        if archive_path.exists() {
            tokio::fs::remove_file(&archive_path)
                .await
                .context("failed to replace existing archive")?;
        }
        tokio::fs::rename(&tmp_path, &archive_path)
            .await
            .context("failed to move archive into place")?;

        let size = tokio::fs::metadata(&archive_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if !validate_archive(archive_path.clone()).await {
            let _ = tokio::fs::remove_file(&archive_path).await;
            bail!("downloaded file is not a valid archive");
        }
        if size < SUSPICIOUS_SIZE_BYTES {
            // Not fatal; flags a mirror that likely served a stub.
            warn!(set_id, size, "downloaded archive is unusually small");
        }

        info!(set_id, size, path = %archive_path.display(), "download complete");
        self.with_task(set_id, |task| {
            task.display_name = Some(display_name.clone());
            task.archive_path = Some(archive_path.clone());
        });

        let record = derived.map(|(artist, title)| {
            SetRecord::new(set_id, artist, title, String::new())
                .with_source(RecordSource::Filesystem)
        });
        self.index.mark_owned(set_id, record);
        Ok(())
    }

    /// Stream the response body to `path`, updating byte counters, smoothed
    /// speed, and progress, publishing a snapshot at most twice a second.
    async fn stream_to_file(
        &self,
        set_id: u64,
        resp: reqwest::Response,
        path: &Path,
        total_bytes: Option<u64>,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .context("failed to create temp file")?;
        let mut stream = resp.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_chunk_at = std::time::Instant::now();
        let mut last_publish = std::time::Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("stream read failed")?;
            file.write_all(&chunk).await.context("stream write failed")?;
            downloaded += chunk.len() as u64;

            let now = std::time::Instant::now();
            let elapsed = now.duration_since(last_chunk_at).as_secs_f64().max(1e-3);
            let instant_bps = chunk.len() as f64 / elapsed;
            last_chunk_at = now;

            self.with_task(set_id, |task| {
                task.bytes_downloaded = downloaded;
                task.speed_bps = Some(match task.speed_bps {
                    Some(prior) => prior * SPEED_SMOOTHING + instant_bps * (1.0 - SPEED_SMOOTHING),
                    None => instant_bps,
                });
                if let Some(total) = total_bytes {
                    // Capped below 1.0 so "nearly done" is distinguishable
                    // from the terminal state.
                    task.progress = Some((downloaded as f64 / total as f64).min(0.999));
                }
                task.updated_at = Some(Utc::now());
            });

            if now.duration_since(last_publish) >= PUBLISH_INTERVAL {
                last_publish = now;
                self.publish_status();
            }
        }

        file.flush().await.context("flush failed")?;
        Ok(())
    }

    /// Look for an archive already matching the set's naming conventions.
    /// Patterns are tried in order; the first match wins.
    async fn find_existing_archive(&self, set_id: u64) -> Result<Option<PathBuf>> {
        let root = self.config.content_root.clone();
        tokio::task::spawn_blocking(move || {
            let patterns = [
                format!("{set_id} *.{ARCHIVE_EXT}"),
                format!("{set_id}-*.{ARCHIVE_EXT}"),
                format!("{set_id}*.{ARCHIVE_EXT}"),
                format!("({set_id}) *.{ARCHIVE_EXT}"),
                format!("({set_id})*.{ARCHIVE_EXT}"),
            ];
            let patterns: Vec<Pattern> = patterns
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect();

            let entries: Vec<PathBuf> = std::fs::read_dir(&root)
                .map(|dir| {
                    dir.filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_file())
                        .collect()
                })
                .unwrap_or_default();

            for pattern in &patterns {
                for path in &entries {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if pattern.matches(name) {
                        return Some(path.clone());
                    }
                }
            }
            None
        })
        .await
        .context("existing-archive check panicked")
    }

    /// `"{set_id} {artist} - {title}"`, degrading to whichever parts exist.
    fn build_display_name(&self, set_id: u64) -> String {
        let (artist, title) = {
            let table = self.table.lock().expect("task table mutex poisoned");
            let task = table.tasks.get(&set_id);
            (
                task.and_then(|t| t.artist.clone()).unwrap_or_default(),
                task.and_then(|t| t.title.clone()).unwrap_or_default(),
            )
        };
        let artist = sanitize_filename(&artist);
        let title = sanitize_filename(&title);
        if !artist.is_empty() && !title.is_empty() {
            format!("{set_id} {artist} - {title}")
        } else if !artist.is_empty() || !title.is_empty() {
            format!("{set_id} {}{}", artist, title)
        } else {
            set_id.to_string()
        }
    }

    fn with_task<F: FnOnce(&mut DownloadTask)>(&self, set_id: u64, f: F) {
        let mut table = self.table.lock().expect("task table mutex poisoned");
        if let Some(task) = table.tasks.get_mut(&set_id) {
            f(task);
        }
    }

    fn publish_status(&self) {
        let snapshot = self.status();
        if let Ok(payload) = serde_json::to_value(&snapshot) {
            self.events.publish("queue", payload);
        }
    }
}

/// Replace characters illegal in filenames with underscores.
fn sanitize_filename(value: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    value
        .chars()
        .map(|c| if INVALID.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Scan the archive for a metadata-bearing member and recover artist/title.
/// Returns `None` for unreadable archives or ones without usable metadata.
async fn derive_metadata_from_archive(path: PathBuf) -> Option<(String, String)> {
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path).ok()?;
        let mut archive = zip::ZipArchive::new(file).ok()?;
        for i in 0..archive.len() {
            let mut member = archive.by_index(i).ok()?;
            if !member.name().to_ascii_lowercase().ends_with(".osu") {
                continue;
            }
            let mut content = String::new();
            use std::io::Read;
            if member.read_to_string(&mut content).is_err() {
                continue;
            }
            let parsed = parse_metadata_text(&content);
            if !parsed.artist.is_empty() || !parsed.title.is_empty() {
                return Some((parsed.artist, parsed.title));
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}

/// Structural validation: the file must open as an archive container.
async fn validate_archive(path: PathBuf) -> bool {
    tokio::task::spawn_blocking(move || {
        std::fs::File::open(&path)
            .ok()
            .and_then(|f| zip::ZipArchive::new(f).ok())
            .is_some()
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_illegal_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d?e"), "a_b_c_d_e");
        assert_eq!(sanitize_filename("  trimmed  "), "trimmed");
        assert_eq!(sanitize_filename("日本語 ok"), "日本語 ok");
    }
}
