//! Identity and location types shared by archives and collections

use crate::error::{FormatError, Result};
use std::hash::{Hash, Hasher};

/// Locale value meaning "valid for every locale".
pub const ALL_LOCALES: u64 = u64::MAX;

/// Resource type codes that the storage layer inspects.
pub mod resource_type {
    /// Texture
    pub const TEXTURE: u8 = 5;
    /// Sound bank or stream
    pub const SOUND: u8 = 6;
    /// DTP data blob
    pub const DTP: u8 = 7;
    /// Script
    pub const SCRIPT: u8 = 8;
    /// Shader library
    pub const SHADERLIB: u8 = 9;
    /// Material
    pub const MATERIAL: u8 = 10;
    /// Global content reference
    pub const GLOBAL_CONTENT_REFERENCE: u8 = 11;
    /// Render model
    pub const MODEL: u8 = 12;
    /// Collision mesh
    pub const COLLISION_MESH: u8 = 13;
    /// Object reference
    pub const OBJECT_REFERENCE: u8 = 14;
}

/// Location of a contiguous byte range inside one archive part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlobReference {
    /// Owning archive id
    pub archive_id: u32,
    /// Sub id distinguishing language or DLC variants of the same id
    pub archive_sub_id: u32,
    /// Part index; part 0 is the index part
    pub archive_part: u32,
    /// Byte offset inside the part
    pub offset: u64,
    /// Length in bytes
    pub length: u32,
}

/// Identity of a file stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ArchiveFileKey {
    /// Hash of the file path
    pub name_hash: u64,
    /// Locale bit mask, or [`ALL_LOCALES`]
    pub locale: u64,
}

impl ArchiveFileKey {
    /// Create a key from a name hash and locale mask
    pub const fn new(name_hash: u64, locale: u64) -> Self {
        Self { name_hash, locale }
    }

    /// True when this key applies to every locale
    pub const fn is_locale_agnostic(&self) -> bool {
        self.locale == ALL_LOCALES
    }

    /// The locale-agnostic key with the same name hash
    pub const fn unlocalized(self) -> Self {
        Self::new(self.name_hash, ALL_LOCALES)
    }
}

/// A file slot read from an archive index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveFileReference {
    /// Where the file bytes live
    pub blob: BlobReference,
    /// Hash of the file path
    pub name_hash: u64,
    /// Locale bit mask
    pub locale: u64,
}

impl ArchiveFileReference {
    /// Identity of this file
    pub const fn key(&self) -> ArchiveFileKey {
        ArchiveFileKey::new(self.name_hash, self.locale)
    }
}

/// Resource identity used for override tracking and usage lookups.
///
/// Equality and hashing only consider `resource_type` and `id`. Two keys that
/// differ only in `sub_type` compare equal, so the first one inserted into a
/// hash map is the one that is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceKey {
    /// Resource type code, see [`resource_type`]
    pub resource_type: u8,
    /// Resource sub type
    pub sub_type: u8,
    /// Resource id
    pub id: u32,
}

impl ResourceKey {
    /// Create a key
    pub const fn new(resource_type: u8, sub_type: u8, id: u32) -> Self {
        Self {
            resource_type,
            sub_type,
            id,
        }
    }

    /// Sort key used when deterministic output order is needed
    pub const fn sort_key(&self) -> (u8, u32, u8) {
        (self.resource_type, self.id, self.sub_type)
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.resource_type == other.resource_type && self.id == other.id
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource_type.hash(state);
        self.id.hash(state);
    }
}

/// A resource entry of a collection, resolved to the blob that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceReference {
    /// Where the stored (possibly CDRM framed) resource lives
    pub blob: BlobReference,
    /// Resource type code
    pub resource_type: u8,
    /// Resource sub type
    pub sub_type: u8,
    /// Resource id
    pub id: u32,
    /// Locale bit mask
    pub locale: u64,
    /// Offset of this resource inside its decoded batch
    pub offset_in_batch: u32,
    /// Size of the ref-definition table, `None` when unknown
    pub ref_definitions_size: Option<u32>,
    /// Size of the resource body following the ref-definition table
    pub body_size: u32,
}

impl ResourceReference {
    /// Identity of this resource
    pub const fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.sub_type, self.id)
    }

    /// Ref-definition size plus body size
    pub fn total_size(&self) -> Result<u32> {
        self.ref_definitions_size
            .unwrap_or(0)
            .checked_add(self.body_size)
            .ok_or_else(|| {
                FormatError::InvalidFormat(format!(
                    "resource {:#x} size {:?} + {} overflows 32 bits",
                    self.id, self.ref_definitions_size, self.body_size
                ))
            })
    }

    /// True when both references point at the same stored bytes
    pub fn same_location(&self, other: &Self) -> bool {
        self.blob == other.blob
            && self.offset_in_batch == other.offset_in_batch
            && self.ref_definitions_size == other.ref_definitions_size
            && self.body_size == other.body_size
    }
}
