//! Ref-definition tables
//!
//! Resource payloads that link to other data start with a relocation table:
//!
//! ```text
//! counts: internal, wide_external, int_patch, short_patch, packed_external (5 x i32)
//! internal entries         { offset: i32, target: i32 }    8 bytes each
//! wide external entries    opaque                          8 or 16 bytes each
//! int patches              i32                             4 bytes each
//! short patches            { i32, i32 }                    8 bytes each
//! packed external entries  type << 25 | offset / 4         4 bytes each
//! ```
//!
//! Offsets in the tables are relative to the end of the table, so a patch
//! site position is `size + offset`. Positions exposed by this module are
//! relative to the start of the table.

use crate::error::{FormatError, Result};
use crate::game::GameFormat;
use crate::reference::{ResourceKey, ResourceReference};
use binrw::{BinReaderExt, BinWriterExt};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of the counts header
pub const COUNTS_SIZE: u64 = 20;

const INTERNAL_STRIDE: u64 = 8;
const INT_PATCH_STRIDE: u64 = 4;
const SHORT_PATCH_STRIDE: u64 = 8;
const PACKED_EXTERNAL_STRIDE: u64 = 4;

const PACKED_OFFSET_MASK: u32 = 0x01FF_FFFF;
const PACKED_TYPE_SHIFT: u32 = 25;
const REF_SITE_ID_MASK: u32 = 0x7FFF_FFFF;

/// Entry counts of a ref-definition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefDefinitionCounts {
    /// Internal offset fixups
    pub internal: i32,
    /// Wide external references
    pub wide_external: i32,
    /// Int patches
    pub int_patches: i32,
    /// Short patches
    pub short_patches: i32,
    /// Packed external references
    pub packed_external: i32,
}

impl RefDefinitionCounts {
    /// Decode the counts header
    pub fn from_bytes(bytes: &[u8; COUNTS_SIZE as usize]) -> Self {
        let field = |index: usize| {
            let start = index * 4;
            i32::from_le_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };
        Self {
            internal: field(0),
            wide_external: field(1),
            int_patches: field(2),
            short_patches: field(3),
            packed_external: field(4),
        }
    }

    /// Encode the counts header
    pub fn to_bytes(&self) -> [u8; COUNTS_SIZE as usize] {
        let mut out = [0u8; COUNTS_SIZE as usize];
        for (index, value) in [
            self.internal,
            self.wide_external,
            self.int_patches,
            self.short_patches,
            self.packed_external,
        ]
        .into_iter()
        .enumerate()
        {
            out[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Total table size including the counts header
    pub fn table_size(&self, format: &GameFormat) -> Result<u64> {
        let count = |value: i32, name: &str| {
            u64::try_from(value).map_err(|_| {
                FormatError::MalformedRefDefinitions(format!("negative {name} count {value}"))
            })
        };
        Ok(COUNTS_SIZE
            + count(self.internal, "internal")? * INTERNAL_STRIDE
            + count(self.wide_external, "wide external")? * format.wide_external_ref_size as u64
            + count(self.int_patches, "int patch")? * INT_PATCH_STRIDE
            + count(self.short_patches, "short patch")? * SHORT_PATCH_STRIDE
            + count(self.packed_external, "packed external")? * PACKED_EXTERNAL_STRIDE)
    }
}

/// Read the counts header and return the total table size.
///
/// Only the 20 header bytes are consumed; the stream need not be seekable.
pub fn read_header_and_get_size<R: Read>(reader: &mut R, format: &GameFormat) -> Result<u64> {
    let mut header = [0u8; COUNTS_SIZE as usize];
    reader.read_exact(&mut header)?;
    RefDefinitionCounts::from_bytes(&header).table_size(format)
}

#[derive(Debug, Clone, Copy)]
struct InternalRef {
    table_position: u64,
    target: u64,
}

#[derive(Debug, Clone, Copy)]
struct PackedExternalRef {
    table_position: u64,
    packed: u32,
}

/// Indexed view over the ref-definition table of one resource payload
pub struct ResourceRefDefinitions<S> {
    stream: S,
    base: u64,
    size: u64,
    archive_id: u32,
    format: GameFormat,
    counts: RefDefinitionCounts,
    internal: BTreeMap<u64, InternalRef>,
    external: BTreeMap<u64, PackedExternalRef>,
}

impl<S: Read + Seek> ResourceRefDefinitions<S> {
    /// Index the table at the current position of `stream`.
    ///
    /// `reference` names the resource the payload belongs to; its archive id
    /// keys the game's id renumbering.
    pub fn create(
        reference: &ResourceReference,
        mut stream: S,
        format: &GameFormat,
    ) -> Result<Self> {
        let base = stream.stream_position()?;
        let mut header = [0u8; COUNTS_SIZE as usize];
        stream.read_exact(&mut header)?;
        let counts = RefDefinitionCounts::from_bytes(&header);
        let size = counts.table_size(format)?;

        let mut internal = BTreeMap::new();
        for index in 0..counts.internal {
            let table_position = stream.stream_position()? - base;
            let offset: i32 = stream.read_le()?;
            let target: i32 = stream.read_le()?;
            let ref_position = relative_position(size, offset, "internal", index)?;
            let target = relative_position(size, target, "internal target", index)?;
            internal.insert(
                ref_position,
                InternalRef {
                    table_position,
                    target,
                },
            );
        }

        let skipped = counts.wide_external as u64 * format.wide_external_ref_size as u64
            + counts.int_patches as u64 * INT_PATCH_STRIDE
            + counts.short_patches as u64 * SHORT_PATCH_STRIDE;
        stream.seek(SeekFrom::Current(skipped as i64))?;

        let mut external = BTreeMap::new();
        for _ in 0..counts.packed_external {
            let table_position = stream.stream_position()? - base;
            let packed: u32 = stream.read_le()?;
            let ref_position = size + u64::from(packed & PACKED_OFFSET_MASK) * 4;
            external.insert(
                ref_position,
                PackedExternalRef {
                    table_position,
                    packed,
                },
            );
        }

        Ok(Self {
            stream,
            base,
            size,
            archive_id: reference.blob.archive_id,
            format: *format,
            counts,
            internal,
            external,
        })
    }

    /// Total table size including the counts header
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Counts header
    pub const fn counts(&self) -> RefDefinitionCounts {
        self.counts
    }

    /// `(ref_position, target_position)` of every internal fixup
    pub fn internal_refs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.internal
            .iter()
            .map(|(&position, entry)| (position, entry.target))
    }

    /// Patch-site positions of every packed external reference
    pub fn external_ref_positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.external.keys().copied()
    }

    /// `(ref_position, key)` of every packed external reference
    pub fn external_refs(&mut self) -> Result<Vec<(u64, ResourceKey)>> {
        let positions: Vec<u64> = self.external.keys().copied().collect();
        positions
            .into_iter()
            .map(|position| Ok((position, self.get_external_ref_target(position)?)))
            .collect()
    }

    /// Resolve the external reference patched at `ref_position`.
    ///
    /// The type comes from the table entry, the id from the patch site
    /// itself with its top bit masked off.
    pub fn get_external_ref_target(&mut self, ref_position: u64) -> Result<ResourceKey> {
        let entry = self.external_entry(ref_position)?;
        self.stream.seek(SeekFrom::Start(self.base + ref_position))?;
        let raw: u32 = self.stream.read_le()?;
        let stored = ResourceKey::new(
            (entry.packed >> PACKED_TYPE_SHIFT) as u8,
            0,
            raw & REF_SITE_ID_MASK,
        );
        Ok(self.format.load_key(self.archive_id, stored))
    }

    /// Release the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn external_entry(&self, ref_position: u64) -> Result<PackedExternalRef> {
        self.external.get(&ref_position).copied().ok_or_else(|| {
            FormatError::InvalidArgument(format!(
                "no external reference is patched at {ref_position:#x}"
            ))
        })
    }
}

impl<S: Read + Write + Seek> ResourceRefDefinitions<S> {
    /// Point the internal fixup at `ref_position` to `target_position`
    pub fn set_internal_ref_target(
        &mut self,
        ref_position: u64,
        target_position: u64,
    ) -> Result<()> {
        let Some(entry) = self.internal.get(&ref_position).copied() else {
            return Err(FormatError::InvalidArgument(format!(
                "no internal reference is patched at {ref_position:#x}"
            )));
        };
        let relative = i64::try_from(target_position)
            .ok()
            .and_then(|target| target.checked_sub(self.size as i64))
            .and_then(|relative| i32::try_from(relative).ok())
            .ok_or_else(|| {
                FormatError::InvalidArgument(format!(
                    "target {target_position:#x} is not representable relative to the table end"
                ))
            })?;

        self.stream
            .seek(SeekFrom::Start(self.base + entry.table_position + 4))?;
        self.stream.write_le(&relative)?;
        self.internal.insert(
            ref_position,
            InternalRef {
                table_position: entry.table_position,
                target: target_position,
            },
        );
        Ok(())
    }

    /// Point the external reference at `ref_position` to `key`.
    ///
    /// The patch site's top bit is preserved.
    pub fn set_external_ref_target(&mut self, ref_position: u64, key: ResourceKey) -> Result<()> {
        let entry = self.external_entry(ref_position)?;
        let stored = self.format.store_key(self.archive_id, key);
        if stored.id > REF_SITE_ID_MASK {
            return Err(FormatError::InvalidArgument(format!(
                "resource id {:#x} exceeds 31 bits",
                stored.id
            )));
        }
        if u32::from(stored.resource_type) >= 1 << (32 - PACKED_TYPE_SHIFT) {
            return Err(FormatError::InvalidArgument(format!(
                "resource type {} exceeds 7 bits",
                stored.resource_type
            )));
        }

        let packed = (u32::from(stored.resource_type) << PACKED_TYPE_SHIFT)
            | (entry.packed & PACKED_OFFSET_MASK);
        if packed != entry.packed {
            self.stream
                .seek(SeekFrom::Start(self.base + entry.table_position))?;
            self.stream.write_le(&packed)?;
            self.external.insert(
                ref_position,
                PackedExternalRef {
                    table_position: entry.table_position,
                    packed,
                },
            );
        }

        let site = SeekFrom::Start(self.base + ref_position);
        self.stream.seek(site)?;
        let raw: u32 = self.stream.read_le()?;
        self.stream.seek(site)?;
        self.stream.write_le(&((raw & !REF_SITE_ID_MASK) | stored.id))?;
        Ok(())
    }
}

fn relative_position(size: u64, offset: i32, what: &str, index: i32) -> Result<u64> {
    u64::try_from(size as i64 + i64::from(offset)).map_err(|_| {
        FormatError::MalformedRefDefinitions(format!(
            "{what} entry {index} points before the start of the payload"
        ))
    })
}
