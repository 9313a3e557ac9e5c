//! Fixed records of a resource collection

use crate::error::{FormatError, Result};
use crate::game::{GameFormat, LocationLayout};
use crate::reference::ALL_LOCALES;
use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use std::io::{Read, Seek, Write};

/// Collection header, 32 bytes
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct CollectionHeader {
    /// Format version, fixed per game
    pub version: u32,
    /// Byte length of the dependency blob
    pub dependencies_length: u32,
    /// Byte length of the include blob
    pub includes_length: u32,
    /// Preserved verbatim
    pub reserved0: u32,
    /// Preserved verbatim
    pub reserved1: u32,
    /// Collection flags, preserved verbatim
    pub flags: u32,
    /// Number of identification and location records
    pub resource_count: u32,
    /// Index of the root resource
    pub root_index: u32,
}

impl CollectionHeader {
    /// Serialized size
    pub const SIZE: usize = 32;

    /// Header of an empty collection
    pub const fn new(version: u32) -> Self {
        Self {
            version,
            dependencies_length: 0,
            includes_length: 0,
            reserved0: 0,
            reserved1: 0,
            flags: 0,
            resource_count: 0,
            root_index: 0,
        }
    }
}

const REF_DEFINITIONS_SIZE_MAX: u32 = 0x00FF_FFFF;
const SUB_TYPE_MAX: u8 = 0x7F;

/// Identity half of a collection entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceIdentification {
    /// Body size excluding the ref-definition table
    pub body_size: u32,
    /// Resource type code
    pub resource_type: u8,
    /// Resource flags, preserved verbatim
    pub flags: u8,
    /// Resource version, preserved verbatim
    pub version: u16,
    /// `ref_definitions_size << 8 | sub_type << 1 | bit0`
    pub packed: u32,
    /// Resource id as stored
    pub id: u32,
    /// Locale mask
    pub locale: u64,
}

impl ResourceIdentification {
    /// Size of the ref-definition table
    pub const fn ref_definitions_size(&self) -> u32 {
        self.packed >> 8
    }

    /// Resource sub type
    pub const fn sub_type(&self) -> u8 {
        ((self.packed >> 1) & SUB_TYPE_MAX as u32) as u8
    }

    /// Store a new ref-definition size, keeping sub type and flag bit
    pub fn set_ref_definitions_size(&mut self, size: u32) -> Result<()> {
        if size > REF_DEFINITIONS_SIZE_MAX {
            return Err(FormatError::InvalidArgument(format!(
                "ref definitions size {size:#x} exceeds 24 bits"
            )));
        }
        self.packed = (size << 8) | (self.packed & 0xFF);
        Ok(())
    }

    /// Store a new sub type, keeping the other packed fields
    pub fn set_sub_type(&mut self, sub_type: u8) -> Result<()> {
        if sub_type > SUB_TYPE_MAX {
            return Err(FormatError::InvalidArgument(format!(
                "sub type {sub_type} exceeds 7 bits"
            )));
        }
        self.packed = (self.packed & !0xFE) | (u32::from(sub_type) << 1);
        Ok(())
    }

    pub(crate) fn read<R: Read + Seek>(reader: &mut R, format: &GameFormat) -> Result<Self> {
        let body_size = reader.read_le()?;
        let resource_type = reader.read_le()?;
        let flags = reader.read_le()?;
        let version = reader.read_le()?;
        let packed = reader.read_le()?;
        let id = reader.read_le()?;
        let locale = if format.wide_identification_locale {
            reader.read_le::<u64>()?
        } else {
            widen_locale(reader.read_le::<u32>()?)
        };
        Ok(Self {
            body_size,
            resource_type,
            flags,
            version,
            packed,
            id,
            locale,
        })
    }

    pub(crate) fn write<W: Write + Seek>(&self, writer: &mut W, format: &GameFormat) -> Result<()> {
        writer.write_le(&self.body_size)?;
        writer.write_le(&self.resource_type)?;
        writer.write_le(&self.flags)?;
        writer.write_le(&self.version)?;
        writer.write_le(&self.packed)?;
        writer.write_le(&self.id)?;
        if format.wide_identification_locale {
            writer.write_le(&self.locale)?;
        } else {
            writer.write_le(&narrow_locale(self.locale)?)?;
        }
        Ok(())
    }
}

/// Location half of a collection entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLocation {
    /// Archive holding the blob
    pub archive_id: u32,
    /// Sub id of that archive
    pub archive_sub_id: u32,
    /// Part index inside the archive
    pub archive_part: u32,
    /// Blob offset inside the part
    pub offset: u32,
    /// Blob length
    pub size: u32,
    /// Offset of the resource inside the decoded blob
    pub offset_in_batch: u32,
}

impl ResourceLocation {
    pub(crate) fn read<R: Read + Seek>(reader: &mut R, format: &GameFormat) -> Result<Self> {
        match format.location {
            LocationLayout::Compact => {
                let archive_id = u32::from(reader.read_le::<u16>()?);
                let archive_part = u32::from(reader.read_le::<u8>()?);
                let archive_sub_id = u32::from(reader.read_le::<u8>()?);
                Ok(Self {
                    archive_id,
                    archive_sub_id,
                    archive_part,
                    offset: reader.read_le()?,
                    size: reader.read_le()?,
                    offset_in_batch: reader.read_le()?,
                })
            }
            LocationLayout::Extended => Ok(Self {
                archive_id: reader.read_le()?,
                archive_sub_id: reader.read_le()?,
                archive_part: reader.read_le()?,
                offset: reader.read_le()?,
                size: reader.read_le()?,
                offset_in_batch: reader.read_le()?,
            }),
        }
    }

    pub(crate) fn write<W: Write + Seek>(&self, writer: &mut W, format: &GameFormat) -> Result<()> {
        match format.location {
            LocationLayout::Compact => {
                let archive_id = u16::try_from(self.archive_id).map_err(|_| {
                    FormatError::InvalidArgument(format!(
                        "archive id {} exceeds 16 bits",
                        self.archive_id
                    ))
                })?;
                let part = u8::try_from(self.archive_part)
                    .map_err(|_| FormatError::InvalidArgument("part index exceeds 8 bits".into()))?;
                let sub_id = u8::try_from(self.archive_sub_id)
                    .map_err(|_| FormatError::InvalidArgument("sub id exceeds 8 bits".into()))?;
                writer.write_le(&archive_id)?;
                writer.write_le(&part)?;
                writer.write_le(&sub_id)?;
            }
            LocationLayout::Extended => {
                writer.write_le(&self.archive_id)?;
                writer.write_le(&self.archive_sub_id)?;
                writer.write_le(&self.archive_part)?;
            }
        }
        writer.write_le(&self.offset)?;
        writer.write_le(&self.size)?;
        writer.write_le(&self.offset_in_batch)?;
        Ok(())
    }
}

/// One `(locale, path)` entry of a dependency or include blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    /// Locale mask, [`ALL_LOCALES`] for games without a locale field
    pub locale: u64,
    /// Path as stored, without platform prefix
    pub path: String,
}

impl DependencyEntry {
    /// Create an entry
    pub fn new(locale: u64, path: impl Into<String>) -> Self {
        Self {
            locale,
            path: path.into(),
        }
    }
}

pub(crate) fn parse_dependency_blob(
    blob: &[u8],
    locale_size: usize,
) -> Result<Vec<DependencyEntry>> {
    let mut entries = Vec::new();
    let mut rest = blob;
    while !rest.is_empty() {
        if rest.len() < locale_size {
            return Err(FormatError::InvalidFormat(
                "dependency entry truncated in locale field".into(),
            ));
        }
        let (locale_bytes, tail) = rest.split_at(locale_size);
        let locale = match locale_size {
            0 => ALL_LOCALES,
            4 => widen_locale(u32::from_le_bytes(array(locale_bytes)?)),
            8 => u64::from_le_bytes(array(locale_bytes)?),
            other => {
                return Err(FormatError::InvalidFormat(format!(
                    "unsupported locale width {other}"
                )));
            }
        };

        let Some(end) = tail.iter().position(|&b| b == 0) else {
            return Err(FormatError::InvalidFormat(
                "dependency path is not zero terminated".into(),
            ));
        };
        let path = std::str::from_utf8(&tail[..end])
            .map_err(|e| FormatError::InvalidFormat(format!("dependency path: {e}")))?;
        entries.push(DependencyEntry::new(locale, path));
        rest = &tail[end + 1..];
    }
    Ok(entries)
}

pub(crate) fn build_dependency_blob(
    entries: &[DependencyEntry],
    locale_size: usize,
) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    for entry in entries {
        match locale_size {
            0 => {}
            4 => blob.extend_from_slice(&narrow_locale(entry.locale)?.to_le_bytes()),
            8 => blob.extend_from_slice(&entry.locale.to_le_bytes()),
            other => {
                return Err(FormatError::InvalidArgument(format!(
                    "unsupported locale width {other}"
                )));
            }
        }
        if entry.path.as_bytes().contains(&0) {
            return Err(FormatError::InvalidArgument(format!(
                "dependency path {:?} contains a zero byte",
                entry.path
            )));
        }
        blob.extend_from_slice(entry.path.as_bytes());
        blob.push(0);
    }
    Ok(blob)
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| FormatError::InvalidFormat("short locale field".into()))
}

pub(crate) const fn widen_locale(locale: u32) -> u64 {
    if locale == u32::MAX {
        ALL_LOCALES
    } else {
        locale as u64
    }
}

pub(crate) fn narrow_locale(locale: u64) -> Result<u32> {
    if locale == ALL_LOCALES {
        return Ok(u32::MAX);
    }
    u32::try_from(locale)
        .map_err(|_| FormatError::InvalidArgument(format!("locale {locale:#x} exceeds 32 bits")))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn packed_fields() {
        let mut ident = ResourceIdentification {
            packed: 0x0000_0101 | (5 << 1),
            ..Default::default()
        };
        assert_eq!(ident.ref_definitions_size(), 1);
        assert_eq!(ident.sub_type(), 5);

        ident.set_ref_definitions_size(0x40).unwrap();
        assert_eq!(ident.ref_definitions_size(), 0x40);
        assert_eq!(ident.sub_type(), 5);
        assert_eq!(ident.packed & 1, 1);

        ident.set_sub_type(9).unwrap();
        assert_eq!(ident.sub_type(), 9);
        assert_eq!(ident.ref_definitions_size(), 0x40);

        assert!(ident.set_ref_definitions_size(0x0100_0000).is_err());
        assert!(ident.set_sub_type(0x80).is_err());
    }

    #[test]
    fn dependency_blob_with_wide_locale() {
        let entries = vec![
            DependencyEntry::new(ALL_LOCALES, "levels\\a.drm"),
            DependencyEntry::new(4, "levels\\b"),
        ];
        let blob = build_dependency_blob(&entries, 8).unwrap();
        assert_eq!(blob.len(), 8 + 13 + 8 + 9);
        assert_eq!(parse_dependency_blob(&blob, 8).unwrap(), entries);
    }

    #[test]
    fn dependency_blob_without_locale() {
        let entries = vec![DependencyEntry::new(ALL_LOCALES, "x")];
        let blob = build_dependency_blob(&entries, 0).unwrap();
        assert_eq!(blob, b"x\0");
        assert_eq!(parse_dependency_blob(&blob, 0).unwrap(), entries);
    }

    #[test]
    fn unterminated_dependency_is_rejected() {
        assert!(parse_dependency_blob(b"abc", 0).is_err());
    }
}
