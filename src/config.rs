//! Settings resolution.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`BEATSYNC_*`)
//! 2. JSON settings file (`~/.config/beatsync/settings.json` by default,
//!    directory overridable with `BEATSYNC_CONFIG_DIR`)
//! 3. Built-in defaults
//!
//! On first run, or when the file is missing keys, the defaults are merged
//! in and the file rewritten so users have a complete file to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// On-disk settings file schema. Every field optional so partial files load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    pub content_root: Option<String>,
    pub binary_index_path: Option<String>,
    pub download_url_template: Option<String>,
    pub max_concurrency: Option<usize>,
    pub requests_per_minute: Option<u32>,
}

/// Resolved settings with every value populated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub content_root: PathBuf,
    pub binary_index_path: Option<PathBuf>,
    pub database_path: PathBuf,
    pub download_url_template: String,
    pub max_concurrency: usize,
    pub requests_per_minute: u32,
    /// Where the settings file lives (for `config` output).
    pub settings_path: PathBuf,
}

impl Settings {
    /// Load settings from env + file + defaults, writing back filled-in
    /// defaults when the file was missing or incomplete.
    pub fn load() -> Result<Self> {
        let dir = config_dir()?;
        Self::load_from_dir(&dir)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let settings_path = dir.join("settings.json");
        let mut file = read_settings_file(&settings_path);

        let defaults = default_file();
        let mut updated = false;
        macro_rules! fill {
            ($field:ident) => {
                if file.$field.is_none() {
                    file.$field = defaults.$field.clone();
                    updated = true;
                }
            };
        }
        fill!(content_root);
        fill!(download_url_template);
        fill!(max_concurrency);
        fill!(requests_per_minute);
        // binary_index_path stays absent unless configured; absence degrades
        // to filesystem-only scanning.

        if updated || !settings_path.exists() {
            if let Err(err) = write_settings_file(&settings_path, &file) {
                warn!(path = %settings_path.display(), error = %err,
                      "could not write settings file");
            }
        }

        let content_root = env_var("BEATSYNC_CONTENT_ROOT")
            .or(file.content_root)
            .unwrap_or_else(|| default_content_root().display().to_string());
        let binary_index_path = env_var("BEATSYNC_BINARY_INDEX").or(file.binary_index_path);
        let download_url_template = env_var("BEATSYNC_URL_TEMPLATE")
            .or(file.download_url_template)
            .unwrap_or_else(default_url_template);
        let max_concurrency = env_var("BEATSYNC_CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .or(file.max_concurrency)
            .unwrap_or(3);
        let requests_per_minute = env_var("BEATSYNC_RPM")
            .and_then(|v| v.parse().ok())
            .or(file.requests_per_minute)
            .unwrap_or(60);

        Ok(Self {
            content_root: PathBuf::from(content_root),
            binary_index_path: binary_index_path.map(PathBuf::from),
            database_path: dir.join("catalog.db"),
            download_url_template,
            max_concurrency,
            requests_per_minute,
            settings_path,
        })
    }

    /// Merge a partial update into the settings file and re-resolve.
    pub fn persist(&self, update: SettingsFile) -> Result<Self> {
        let mut file = read_settings_file(&self.settings_path);
        if update.content_root.is_some() {
            file.content_root = update.content_root;
        }
        if update.binary_index_path.is_some() {
            file.binary_index_path = update.binary_index_path;
        }
        if update.download_url_template.is_some() {
            file.download_url_template = update.download_url_template;
        }
        if update.max_concurrency.is_some() {
            file.max_concurrency = update.max_concurrency;
        }
        if update.requests_per_minute.is_some() {
            file.requests_per_minute = update.requests_per_minute;
        }
        write_settings_file(&self.settings_path, &file)?;
        let dir = self
            .settings_path
            .parent()
            .context("settings path has no parent")?;
        Self::load_from_dir(dir)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = env_var("BEATSYNC_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::config_dir().context("could not determine config directory")?;
    Ok(base.join("beatsync"))
}

fn default_content_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beatsync")
        .join("songs")
}

fn default_url_template() -> String {
    // Mirror that serves archives without cookies.
    "https://api.nerinyan.moe/d/{set_id}".to_string()
}

fn default_file() -> SettingsFile {
    SettingsFile {
        content_root: Some(default_content_root().display().to_string()),
        binary_index_path: None,
        download_url_template: Some(default_url_template()),
        max_concurrency: Some(3),
        requests_per_minute: Some(60),
    }
}

fn read_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "settings file unparseable, using defaults");
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

fn write_settings_file(path: &Path, file: &SettingsFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(file)?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write settings: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load_from_dir(temp.path()).unwrap();
        assert_eq!(settings.max_concurrency, 3);
        assert_eq!(settings.requests_per_minute, 60);
        assert!(settings.binary_index_path.is_none());
        assert!(temp.path().join("settings.json").exists());
    }

    #[test]
    fn file_values_are_used() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("settings.json"),
            r#"{"content_root": "/songs", "max_concurrency": 7}"#,
        )
        .unwrap();

        let settings = Settings::load_from_dir(temp.path()).unwrap();
        assert_eq!(settings.content_root, PathBuf::from("/songs"));
        assert_eq!(settings.max_concurrency, 7);
        // Missing keys were filled with defaults.
        assert_eq!(settings.requests_per_minute, 60);
    }

    #[test]
    fn persist_merges_partial_updates() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load_from_dir(temp.path()).unwrap();
        let updated = settings
            .persist(SettingsFile {
                requests_per_minute: Some(30),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.requests_per_minute, 30);
        // Untouched keys survive the rewrite.
        assert_eq!(updated.max_concurrency, 3);
    }
}
