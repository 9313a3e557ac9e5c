//! Layered tiger archive storage
//!
//! This crate manages a folder of tiger archives as one overlay: base game
//! archives underneath, enabled mod archives on top in priority order. When
//! the overlay changes, resource references stored inside collections are
//! re-linked so every collection points at the highest-priority copy of each
//! resource it uses.
//!
//! # Components
//!
//! - [`Archive`]: one indexed container (index part plus content parts)
//! - [`ArchiveMetaData`]: side file with the enable flag and priority fields
//! - [`ArchiveSet`]: folder-wide overlay, lookups and the re-link pass
//! - [`ResourceUsageCache`]: reverse index from resources to collections
//!
//! # Example
//!
//! ```no_run
//! use tiger_formats::CdcGame;
//! use tiger_storage::{ArchiveSet, ArchiveSetConfig, CancellationToken, NoProgress};
//!
//! # fn main() -> tiger_storage::Result<()> {
//! let config = ArchiveSetConfig::new("/games/sottr", CdcGame::Shadow);
//! let set = ArchiveSet::open(config, &CancellationToken::new(), &NoProgress)?;
//! for archive in set.sorted_archives() {
//!     println!("{} {} {}", archive.id, archive.sub_id, archive.path.display());
//! }
//! # Ok(())
//! # }
//! ```

#![allow(clippy::cast_possible_truncation)] // Index and slot arithmetic
#![allow(clippy::cast_precision_loss)] // Progress fractions
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod archive_set;
pub mod config;
pub mod file_map;
pub mod metadata;
pub mod progress;
pub mod usage_cache;

pub use archive::{Archive, ResourceData, ResourceStream, WriteOptions};
pub use archive_set::{ArchiveInfo, ArchiveSet, PriorityKey, RelinkReport, sort_by_priority};
pub use config::ArchiveSetConfig;
pub use file_map::FileMap;
pub use metadata::ArchiveMetaData;
pub use progress::{CancellationToken, NoProgress, Progress};
pub use usage_cache::{ResourceUsage, ResourceUsageCache, SoundUsage};

use thiserror::Error;
use tiger_formats::FormatError;

/// Errors produced by archive storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structure could not be decoded or encoded
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Binary layout error in a storage side file
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// Metadata side file could not be read or written
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Archive belongs to a different game or format version
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// All file record slots of an archive are in use
    #[error("Archive capacity exceeded: all {capacity} file slots are in use")]
    CapacityExceeded {
        /// Number of slots the archive was created with
        capacity: usize,
    },

    /// Caller passed a reference that does not belong to the target
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested archive or file does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another structural operation holds the archive set lock
    #[error("Archive set is busy: {0}")]
    Busy(String),

    /// Operation stopped at a file boundary on request
    #[error("Operation cancelled")]
    Cancelled,

    /// Archive level failure
    #[error("Archive error: {0}")]
    Archive(String),
}

impl StorageError {
    /// Cancellation is a distinct outcome, not a failure
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors that retrying the same operation cannot fix
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnsupportedFormat(_)
            | Self::CapacityExceeded { .. }
            | Self::InvalidArgument(_) => true,
            Self::Format(err) => err.is_unsupported_version() || err.is_contract_violation(),
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(StorageError::Cancelled.is_cancelled());
        assert!(!StorageError::Cancelled.is_fatal());
        assert!(StorageError::CapacityExceeded { capacity: 2 }.is_fatal());
        assert!(!StorageError::Busy("install".into()).is_fatal());

        let version = StorageError::from(FormatError::UnsupportedVersion {
            structure: "archive",
            expected: 5,
            found: 4,
        });
        assert!(version.is_fatal());
    }
}
