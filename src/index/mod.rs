//! Hybrid catalog of owned beatmap sets.
//!
//! Two untrusted sources feed one authoritative view:
//!
//! 1. **Binary catalog** (`binary`): the proprietary fixed-layout index file
//!    enumerating installed sets; authoritative for metadata.
//! 2. **Filesystem scan** (`scanner`): a walk of the content root, filling
//!    in sets the binary catalog lacks.
//!
//! `library` merges the two under concurrent background refresh, and
//! `store` persists the filesystem-visible rows for fast restart.

pub mod binary;
pub mod library;
pub mod metadata;
pub mod scanner;
pub mod store;

pub use binary::{read_binary_index, BinaryIndex, BinaryIndexError};
pub use library::{IndexSummary, LibraryConfig, LibraryIndex};
pub use metadata::{leading_set_id, parse_metadata_text, ParsedMetadata, RecordSource, SetRecord};
pub use scanner::{scan_content_root, ScanExtensions, ScanResult};
pub use store::{ScanState, ScanStatus, Store, StoreError};
