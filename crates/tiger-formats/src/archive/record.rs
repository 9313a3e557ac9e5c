//! Archive index file records

use crate::error::{FormatError, Result};
use crate::game::{FileRecordLayout, GameFormat};
use crate::reference::{ALL_LOCALES, ArchiveFileReference, BlobReference};
use binrw::{BinRead, BinWrite};
use std::io::{Read, Seek, Write};

/// Narrow record, part index packed into the low bits of the offset
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct NarrowFileRecord {
    name_hash: u32,
    locale: u32,
    size: u32,
    packed_location: u32,
}

const NARROW_PART_MASK: u32 = 0xF;

/// Wide record with explicit archive id and sub id
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct WideFileRecord {
    name_hash: u64,
    locale: u64,
    size: u32,
    reserved: u32,
    part: u8,
    sub_id: u8,
    archive_id: u16,
    offset: u32,
    pad: u32,
}

/// Read one file record.
///
/// Narrow records do not store archive identity, so `archive_id` and
/// `archive_sub_id` of the owning archive are filled in.
pub fn read_file_record<R: Read + Seek>(
    reader: &mut R,
    format: &GameFormat,
    archive_id: u32,
    archive_sub_id: u32,
) -> Result<ArchiveFileReference> {
    match format.file_record {
        FileRecordLayout::Narrow => {
            let record = NarrowFileRecord::read(reader)?;
            let locale = if record.locale == u32::MAX {
                ALL_LOCALES
            } else {
                u64::from(record.locale)
            };
            Ok(ArchiveFileReference {
                blob: BlobReference {
                    archive_id,
                    archive_sub_id,
                    archive_part: record.packed_location & NARROW_PART_MASK,
                    offset: u64::from(record.packed_location & !NARROW_PART_MASK),
                    length: record.size,
                },
                name_hash: u64::from(record.name_hash),
                locale,
            })
        }
        FileRecordLayout::Wide => {
            let record = WideFileRecord::read(reader)?;
            Ok(ArchiveFileReference {
                blob: BlobReference {
                    archive_id: u32::from(record.archive_id),
                    archive_sub_id: u32::from(record.sub_id),
                    archive_part: u32::from(record.part),
                    offset: u64::from(record.offset),
                    length: record.size,
                },
                name_hash: record.name_hash,
                locale: record.locale,
            })
        }
    }
}

/// Write one file record.
///
/// Fails with [`FormatError::InvalidArgument`] when the reference cannot be
/// represented in the game's record layout.
pub fn write_file_record<W: Write + Seek>(
    writer: &mut W,
    format: &GameFormat,
    file: &ArchiveFileReference,
) -> Result<()> {
    let blob = &file.blob;
    let offset = u32::try_from(blob.offset).map_err(|_| {
        FormatError::InvalidArgument(format!("offset {:#x} exceeds 32 bits", blob.offset))
    })?;

    match format.file_record {
        FileRecordLayout::Narrow => {
            if offset & NARROW_PART_MASK != 0 || blob.archive_part > NARROW_PART_MASK {
                return Err(FormatError::InvalidArgument(format!(
                    "offset {offset:#x} part {} cannot be packed into a narrow record",
                    blob.archive_part
                )));
            }
            let name_hash = narrow(file.name_hash, "name hash")?;
            let locale = if file.locale == ALL_LOCALES {
                u32::MAX
            } else {
                narrow(file.locale, "locale")?
            };
            NarrowFileRecord {
                name_hash,
                locale,
                size: blob.length,
                packed_location: offset | blob.archive_part,
            }
            .write(writer)?;
        }
        FileRecordLayout::Wide => {
            let part = u8::try_from(blob.archive_part)
                .map_err(|_| FormatError::InvalidArgument("part index exceeds 8 bits".into()))?;
            let sub_id = u8::try_from(blob.archive_sub_id)
                .map_err(|_| FormatError::InvalidArgument("sub id exceeds 8 bits".into()))?;
            let archive_id = u16::try_from(blob.archive_id)
                .map_err(|_| FormatError::InvalidArgument("archive id exceeds 16 bits".into()))?;
            WideFileRecord {
                name_hash: file.name_hash,
                locale: file.locale,
                size: blob.length,
                reserved: 0,
                part,
                sub_id,
                archive_id,
                offset,
                pad: 0,
            }
            .write(writer)?;
        }
    }
    Ok(())
}

fn narrow(value: u64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FormatError::InvalidArgument(format!("{field} {value:#x} exceeds 32 bits")))
}
