//! Set records and the `[Metadata]` section grammar.
//!
//! Both `.osu` files on disk and `.osu` members inside downloaded archives
//! carry the same line-oriented metadata section. The parser here is shared
//! by the filesystem scanner and the download pipeline's back-derivation
//! step.

use serde::{Deserialize, Serialize};

/// Where a record's metadata came from during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// Parsed from the binary catalog file.
    BinaryIndex,
    /// Derived from files under the content root.
    Filesystem,
}

/// Metadata for one owned beatmap set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRecord {
    pub set_id: u64,
    pub artist: String,
    pub title: String,
    pub creator: String,
    pub source: RecordSource,
}

impl SetRecord {
    pub fn new(set_id: u64, artist: String, title: String, creator: String) -> Self {
        Self {
            set_id,
            artist,
            title,
            creator,
            source: RecordSource::Filesystem,
        }
    }

    pub fn with_source(mut self, source: RecordSource) -> Self {
        self.source = source;
        self
    }
}

/// Fields recovered from a `[Metadata]` section.
///
/// All fields are first-non-empty-wins; unicode variants take priority over
/// the plain ASCII ones when both appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMetadata {
    pub set_id: Option<u64>,
    pub artist: String,
    pub title: String,
    pub creator: String,
}

impl ParsedMetadata {
    /// True once every semantic field is populated; lets callers stop early.
    fn is_complete(&self) -> bool {
        self.set_id.is_some()
            && !self.artist.is_empty()
            && !self.title.is_empty()
            && !self.creator.is_empty()
    }
}

/// Parse the `[Metadata]` section out of `.osu` file text.
///
/// Tracks the current `[section]` header case-insensitively; only lines under
/// `[Metadata]` are interpreted as `key:value` pairs. Unrecognized keys and
/// malformed lines are ignored. Stops early once all fields are populated.
pub fn parse_metadata_text(content: &str) -> ParsedMetadata {
    let mut parsed = ParsedMetadata::default();
    let mut in_metadata = false;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_metadata = line.eq_ignore_ascii_case("[metadata]");
            continue;
        }
        if !in_metadata {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "beatmapsetid" => {
                if parsed.set_id.is_none() {
                    parsed.set_id = value.parse::<u64>().ok().filter(|id| *id > 0);
                }
            }
            // Unicode variants sort before the plain keys in practice, but
            // ordering in the file is not guaranteed, so first-wins per
            // semantic field is applied over both spellings.
            "artistunicode" | "artist" => {
                if parsed.artist.is_empty() {
                    parsed.artist = value.to_string();
                }
            }
            "titleunicode" | "title" => {
                if parsed.title.is_empty() {
                    parsed.title = value.to_string();
                }
            }
            "creator" => {
                if parsed.creator.is_empty() {
                    parsed.creator = value.to_string();
                }
            }
            _ => {}
        }

        if parsed.is_complete() {
            break;
        }
    }

    parsed
}

/// Extract the leading run of decimal digits from a name as a set id.
///
/// `"123456 Artist - Title.osz"` yields `Some(123456)`; names without leading
/// digits (or an id of zero) cannot be attributed and yield `None`.
pub fn leading_set_id(name: &str) -> Option<u64> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u64>().ok().filter(|id| *id > 0)
}

/// Derive a record from an archive file stem like `"123456 Artist - Title"`.
///
/// The remainder after the id splits on the first `" - "` into artist and
/// title; without the separator the entire remainder becomes the title and
/// the artist stays empty.
pub fn record_from_archive_stem(stem: &str) -> Option<SetRecord> {
    let set_id = leading_set_id(stem)?;
    let remainder = stem
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches(['-', '_'])
        .trim();

    let (artist, title) = match remainder.split_once(" - ") {
        Some((artist, title)) => (artist.trim().to_string(), title.trim().to_string()),
        None => (String::new(), remainder.to_string()),
    };
    Some(SetRecord::new(set_id, artist, title, String::new()))
}
