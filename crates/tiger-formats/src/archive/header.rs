//! Archive header parsing and building

use crate::error::{FormatError, Result};
use crate::game::{ARCHIVE_MAGIC, GameFormat, PLATFORM_TAG_SIZE};
use binrw::{BinReaderExt, BinWriterExt};
use std::io::{Read, Seek, Write};

/// Byte offset of the `numParts` field
pub const NUM_PARTS_OFFSET: u64 = 8;

/// Byte offset of the `numFiles` field
pub const NUM_FILES_OFFSET: u64 = 12;

/// Fixed header at the start of every archive index part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Format version, fixed per game
    pub version: u32,
    /// Number of part files including the index part
    pub num_parts: u32,
    /// Number of used file record slots
    pub num_files: u32,
    /// Archive id
    pub id: u32,
    /// Explicit sub id, only present when the game supports it
    pub sub_id: Option<u32>,
    /// Zero padded platform tag
    pub platform: [u8; PLATFORM_TAG_SIZE],
}

impl ArchiveHeader {
    /// Header of a freshly created, empty archive
    pub fn new(format: &GameFormat, id: u32, sub_id: u32) -> Self {
        let mut platform = [0u8; PLATFORM_TAG_SIZE];
        let tag = format.platform.as_bytes();
        let len = tag.len().min(PLATFORM_TAG_SIZE);
        platform[..len].copy_from_slice(&tag[..len]);

        Self {
            version: format.header_version,
            num_parts: 1,
            num_files: 0,
            id,
            sub_id: format.supports_sub_id.then_some(sub_id),
            platform,
        }
    }

    /// Parse and validate a header for `format`
    pub fn read<R: Read + Seek>(reader: &mut R, format: &GameFormat) -> Result<Self> {
        let magic: u32 = reader.read_le()?;
        if magic != ARCHIVE_MAGIC {
            return Err(FormatError::InvalidMagic {
                expected: ARCHIVE_MAGIC,
                found: magic,
            });
        }

        let version: u32 = reader.read_le()?;
        if version != format.header_version {
            return Err(FormatError::UnsupportedVersion {
                structure: "archive",
                expected: format.header_version,
                found: version,
            });
        }

        let num_parts: u32 = reader.read_le()?;
        let num_files: u32 = reader.read_le()?;
        let id: u32 = reader.read_le()?;
        let sub_id = if format.supports_sub_id {
            Some(reader.read_le::<u32>()?)
        } else {
            None
        };
        let platform: [u8; PLATFORM_TAG_SIZE] = reader.read_le()?;

        if num_parts == 0 {
            return Err(FormatError::InvalidFormat(
                "archive header reports zero parts".into(),
            ));
        }

        Ok(Self {
            version,
            num_parts,
            num_files,
            id,
            sub_id,
            platform,
        })
    }

    /// Serialize the header
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        writer.write_le(&ARCHIVE_MAGIC)?;
        writer.write_le(&self.version)?;
        writer.write_le(&self.num_parts)?;
        writer.write_le(&self.num_files)?;
        writer.write_le(&self.id)?;
        if let Some(sub_id) = self.sub_id {
            writer.write_le(&sub_id)?;
        }
        writer.write_le(&self.platform)?;
        Ok(())
    }

    /// Platform tag without trailing zero padding
    pub fn platform_tag(&self) -> String {
        let end = self
            .platform
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PLATFORM_TAG_SIZE);
        String::from_utf8_lossy(&self.platform[..end]).into_owned()
    }
}
