//! Per-game numeric layout tables
//!
//! The three supported games share one archive engine. Everything that differs
//! between them is a constant in [`GameFormat`], selected once from a
//! [`CdcGame`] and handed to every parser and builder.

use crate::reference::{ResourceKey, resource_type};
use serde::{Deserialize, Serialize};

/// Game whose archive folder is being managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcGame {
    /// Tomb Raider (2013)
    Tr2013,
    /// Rise of the Tomb Raider
    Rise,
    /// Shadow of the Tomb Raider
    Shadow,
}

impl std::fmt::Display for CdcGame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tr2013 => "Tomb Raider (2013)",
            Self::Rise => "Rise of the Tomb Raider",
            Self::Shadow => "Shadow of the Tomb Raider",
        };
        f.write_str(name)
    }
}

/// Shape of an archive index file record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRecordLayout {
    /// 16 bytes, 32-bit hash and locale, part packed into the offset
    Narrow,
    /// 32 bytes, 64-bit hash and locale, explicit archive id and sub id
    Wide,
}

impl FileRecordLayout {
    /// Record size in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Narrow => 16,
            Self::Wide => 32,
        }
    }
}

/// Shape of a collection location record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationLayout {
    /// 16 bytes, 16-bit archive id and 8-bit part and sub id
    Compact,
    /// 24 bytes, all fields 32-bit
    Extended,
}

impl LocationLayout {
    /// Record size in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Compact => 16,
            Self::Extended => 24,
        }
    }
}

/// Direction of an id renumbering step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenumberDirection {
    /// Stored form to canonical form
    Load,
    /// Canonical form to stored form
    Store,
}

/// Archive-local id transform applied to resource keys
pub type RenumberHook = fn(u32, ResourceKey, RenumberDirection) -> ResourceKey;

/// Archive header magic, "TAFS" read little-endian
pub const ARCHIVE_MAGIC: u32 = 0x5346_4154;

/// Size of the platform tag following the archive header fields
pub const PLATFORM_TAG_SIZE: usize = 0x20;

/// Languages recognised in Tr2013 archive file name suffixes, in sub id order
pub const LANGUAGE_SUFFIXES: &[&str] = &[
    "english",
    "french",
    "german",
    "italian",
    "spanish",
    "japanese",
    "portuguese",
    "polish",
    "russian",
    "dutch",
    "arabic",
    "korean",
    "chinese",
    "mexican",
];

const RISE_LEGACY_ID_SHIFT: u32 = 0x4000_0000;

/// Layout parameters of one game's archive family
#[derive(Debug, Clone, Copy)]
pub struct GameFormat {
    /// Which game this table describes
    pub game: CdcGame,
    /// Archive header version field
    pub header_version: u32,
    /// Whether the header carries an explicit sub id
    pub supports_sub_id: bool,
    /// Index record shape
    pub file_record: FileRecordLayout,
    /// Alignment of file content appended with `add_file`
    pub content_alignment: u64,
    /// Resource collection version field
    pub collection_version: u32,
    /// Width of collection and dependency locale fields (0, 4 or 8)
    pub collection_locale_size: usize,
    /// Whether identification records hold a 64-bit locale
    pub wide_identification_locale: bool,
    /// Location record shape
    pub location: LocationLayout,
    /// Stride of wide external ref-definition entries
    pub wide_external_ref_size: usize,
    /// Platform tag written after the archive header
    pub platform: &'static str,
    /// Archive ids that always sort ahead of every other archive
    pub builtin_archive_ids: &'static [u32],
    /// Archive-local resource id transform
    pub renumber: RenumberHook,
}

impl GameFormat {
    /// Layout table for `game`
    pub const fn for_game(game: CdcGame) -> Self {
        match game {
            CdcGame::Tr2013 => Self {
                game,
                header_version: 3,
                supports_sub_id: false,
                file_record: FileRecordLayout::Narrow,
                content_alignment: 0x800,
                collection_version: 22,
                collection_locale_size: 0,
                wide_identification_locale: false,
                location: LocationLayout::Compact,
                wide_external_ref_size: 8,
                platform: "pc-w",
                builtin_archive_ids: &[],
                renumber: identity_renumber,
            },
            CdcGame::Rise => Self {
                game,
                header_version: 4,
                supports_sub_id: true,
                file_record: FileRecordLayout::Wide,
                content_alignment: 0x10,
                collection_version: 23,
                collection_locale_size: 4,
                wide_identification_locale: false,
                location: LocationLayout::Extended,
                wide_external_ref_size: 8,
                platform: "pcx64-w",
                builtin_archive_ids: &[0, 1],
                renumber: rise_legacy_renumber,
            },
            CdcGame::Shadow => Self {
                game,
                header_version: 5,
                supports_sub_id: true,
                file_record: FileRecordLayout::Wide,
                content_alignment: 0x10,
                collection_version: 24,
                collection_locale_size: 8,
                wide_identification_locale: true,
                location: LocationLayout::Extended,
                wide_external_ref_size: 16,
                platform: "pcx64-w",
                builtin_archive_ids: &[],
                renumber: identity_renumber,
            },
        }
    }

    /// Size of the archive header including the platform tag
    pub const fn header_size(&self) -> usize {
        let fields = if self.supports_sub_id { 24 } else { 20 };
        fields + PLATFORM_TAG_SIZE
    }

    /// Size of one index record
    pub const fn file_record_size(&self) -> usize {
        self.file_record.size()
    }

    /// Size of one collection identification record
    pub const fn identification_size(&self) -> usize {
        if self.wide_identification_locale { 24 } else { 20 }
    }

    /// Size of one collection location record
    pub const fn location_size(&self) -> usize {
        self.location.size()
    }

    /// Whether `archive_id` is one of the game's built-in archives
    pub fn is_builtin_archive(&self, archive_id: u32) -> bool {
        self.builtin_archive_ids.contains(&archive_id)
    }

    /// Convert a key read from `archive_id` into canonical form
    pub fn load_key(&self, archive_id: u32, key: ResourceKey) -> ResourceKey {
        (self.renumber)(archive_id, key, RenumberDirection::Load)
    }

    /// Convert a canonical key into the form stored in `archive_id`
    pub fn store_key(&self, archive_id: u32, key: ResourceKey) -> ResourceKey {
        (self.renumber)(archive_id, key, RenumberDirection::Store)
    }

    /// Sub id encoded in a Tr2013 style file name such as `title_french.000.tiger`.
    ///
    /// Returns 0 when the name carries no recognised language suffix.
    pub fn sub_id_from_file_name(file_name: &str) -> u32 {
        let stem = file_name
            .split('.')
            .next()
            .unwrap_or(file_name)
            .to_ascii_lowercase();
        let Some((_, suffix)) = stem.rsplit_once('_') else {
            return 0;
        };
        LANGUAGE_SUFFIXES
            .iter()
            .position(|language| *language == suffix)
            .map_or(0, |index| index as u32 + 1)
    }
}

/// Renumber hook for games that store ids unchanged
pub fn identity_renumber(_archive_id: u32, key: ResourceKey, _: RenumberDirection) -> ResourceKey {
    key
}

/// Rise stores material and shader library ids of its two built-in archives
/// in a shifted range.
pub fn rise_legacy_renumber(
    archive_id: u32,
    key: ResourceKey,
    direction: RenumberDirection,
) -> ResourceKey {
    if archive_id >= 2
        || !matches!(
            key.resource_type,
            resource_type::MATERIAL | resource_type::SHADERLIB
        )
    {
        return key;
    }
    let id = match direction {
        RenumberDirection::Load => key.id.wrapping_sub(RISE_LEGACY_ID_SHIFT),
        RenumberDirection::Store => key.id.wrapping_add(RISE_LEGACY_ID_SHIFT),
    };
    ResourceKey::new(key.resource_type, key.sub_type, id)
}
