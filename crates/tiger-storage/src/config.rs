//! Configuration for an archive set

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tiger_formats::cdrm::DEFAULT_CHUNK_SIZE;
use tiger_formats::{ALL_LOCALES, CdcGame, GameFormat};

/// Default name of the persisted usage cache
pub const DEFAULT_USAGE_CACHE_FILE: &str = "resourceusage.bin";

/// Configuration for an archive set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSetConfig {
    /// Folder holding the `.tiger` files
    pub folder: PathBuf,

    /// Game whose archive format the folder uses
    pub game: CdcGame,

    /// Locales whose resource usages are indexed
    pub locale_mask: u64,

    /// File name of the base usage cache inside `folder`
    pub usage_cache_file: String,

    /// DEFLATE level for new resources (0-9)
    pub compression_level: u32,

    /// Uncompressed bytes per CDRM chunk
    pub chunk_size: usize,
}

impl Default for ArchiveSetConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("."),
            game: CdcGame::Shadow,
            locale_mask: ALL_LOCALES,
            usage_cache_file: DEFAULT_USAGE_CACHE_FILE.to_string(),
            compression_level: 6,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ArchiveSetConfig {
    /// Configuration for `folder` of `game`
    pub fn new<P: AsRef<Path>>(folder: P, game: CdcGame) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            game,
            ..Default::default()
        }
    }

    /// Set the locale mask
    #[must_use]
    pub const fn with_locale_mask(mut self, mask: u64) -> Self {
        self.locale_mask = mask;
        self
    }

    /// Set the usage cache file name
    #[must_use]
    pub fn with_usage_cache_file(mut self, name: impl Into<String>) -> Self {
        self.usage_cache_file = name.into();
        self
    }

    /// Set the compression level, clamped to 9
    #[must_use]
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Set the CDRM chunk size
    #[must_use]
    pub const fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Format table of the configured game
    pub const fn format(&self) -> GameFormat {
        GameFormat::for_game(self.game)
    }

    /// Full path of the base usage cache
    pub fn usage_cache_path(&self) -> PathBuf {
        self.folder.join(&self.usage_cache_file)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods() {
        let config = ArchiveSetConfig::new("/tmp/game", CdcGame::Rise)
            .with_locale_mask(0x3)
            .with_compression_level(42)
            .with_chunk_size(0x1000)
            .with_usage_cache_file("usage.bin");

        assert_eq!(config.game, CdcGame::Rise);
        assert_eq!(config.locale_mask, 0x3);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.chunk_size, 0x1000);
        assert_eq!(config.usage_cache_path(), PathBuf::from("/tmp/game/usage.bin"));
        assert_eq!(config.format().header_version, 4);
    }

    #[test]
    fn serde_round_trip() {
        let config = ArchiveSetConfig::new("/games/tr", CdcGame::Tr2013);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"tr2013\""));
        let back: ArchiveSetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.folder, config.folder);
        assert_eq!(back.game, CdcGame::Tr2013);
    }
}
