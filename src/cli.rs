//! Command-line interface.
//!
//! A thin consumer of the core surface: `refresh`, `owned`, `summary`,
//! `scan_status`, `enqueue`, `status`.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::download::{DownloadConfig, DownloadManager, TaskStatus};
use crate::events::EventBus;
use crate::index::{LibraryConfig, LibraryIndex, ScanExtensions, Store};

/// beatsync - hybrid beatmap catalog and download pipeline
#[derive(Parser, Debug)]
#[command(name = "beatsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a full library scan and wait for it to finish
    Scan,

    /// Show owned/metadata counters for the current view
    Summary,

    /// Show the persisted scan status
    ScanStatus,

    /// Check whether a set id is owned
    Owned {
        /// Set id to check
        set_id: u64,
    },

    /// Download one or more sets by id
    Download {
        /// Set ids to fetch
        set_ids: Vec<u64>,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load()?;

        match self.command {
            Commands::Config => {
                println!("settings file:   {}", settings.settings_path.display());
                println!("content root:    {}", settings.content_root.display());
                println!(
                    "binary index:    {}",
                    settings
                        .binary_index_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "(not configured)".to_string())
                );
                println!("url template:    {}", settings.download_url_template);
                println!("concurrency:     {}", settings.max_concurrency);
                println!("requests/minute: {}", settings.requests_per_minute);
                return Ok(());
            }
            command => {
                let index = build_index(&settings)?;
                run_command(command, settings, index).await
            }
        }
    }
}

fn build_index(settings: &Settings) -> Result<Arc<LibraryIndex>> {
    let store = Arc::new(Store::open(&settings.database_path)?);
    Ok(Arc::new(LibraryIndex::new(
        LibraryConfig {
            content_root: settings.content_root.clone(),
            binary_index_path: settings.binary_index_path.clone(),
            extensions: ScanExtensions::default(),
        },
        store,
        EventBus::default(),
    )))
}

async fn run_command(command: Commands, settings: Settings, index: Arc<LibraryIndex>) -> Result<()> {
    match command {
        Commands::Scan => {
            index.refresh().await?;
            index.wait_for_scan().await;
            let summary = index.summary();
            println!(
                "owned: {}  with metadata: {}  root exists: {}",
                summary.owned_count, summary.with_metadata_count, summary.root_exists
            );
        }
        Commands::Summary => {
            index.refresh().await?;
            let summary = index.summary();
            println!(
                "owned: {}  with metadata: {}  root exists: {}",
                summary.owned_count, summary.with_metadata_count, summary.root_exists
            );
        }
        Commands::ScanStatus => {
            let status = index.scan_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Owned { set_id } => {
            index.refresh().await?;
            index.wait_for_scan().await;
            println!("{set_id}: {}", if index.owned(set_id) { "owned" } else { "missing" });
        }
        Commands::Download { set_ids } => {
            if set_ids.is_empty() {
                anyhow::bail!("no set ids given");
            }
            index.refresh().await?;
            index.wait_for_scan().await;

            let manager = Arc::new(DownloadManager::new(
                DownloadConfig {
                    content_root: settings.content_root.clone(),
                    url_template: settings.download_url_template.clone(),
                    max_concurrency: settings.max_concurrency,
                    requests_per_minute: settings.requests_per_minute,
                },
                Arc::clone(&index),
                EventBus::default(),
            ));
            manager.start_workers().await;
            manager.enqueue(&set_ids, None);

            // Poll until every task reaches a terminal state.
            loop {
                let snapshot = manager.status();
                if snapshot.queued.is_empty() && snapshot.running.is_empty() {
                    for task in &snapshot.done {
                        let label = match task.status {
                            TaskStatus::Completed => "completed",
                            TaskStatus::Skipped => "skipped",
                            TaskStatus::Failed => "failed",
                            _ => "pending",
                        };
                        let detail = task
                            .display_name
                            .clone()
                            .or_else(|| (!task.message.is_empty()).then(|| task.message.clone()))
                            .unwrap_or_default();
                        println!("{}: {label} {detail}", task.set_id);
                    }
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        }
        Commands::Config => unreachable!("handled before index construction"),
    }
    Ok(())
}
