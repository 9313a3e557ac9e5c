//! CDRM chunked DEFLATE resource framing
//!
//! Resources appended to archive content parts are stored as a CDRM blob:
//!
//! ```text
//! +--------------------------------------+
//! | magic "CDRM" | type=2 | count | pad   |  16 bytes
//! +--------------------------------------+
//! | count x { uncompressed<<8|flag, size }|  padded to 16
//! +--------------------------------------+
//! | chunk 0: 78 DA + deflate + 00000000  |  padded to 16
//! | chunk 1 ...                          |
//! +--------------------------------------+
//! ```
//!
//! Every blob in a part is followed by a 16 byte [`NextMarker`]. The markers
//! form a forward linked list through the part.

use crate::align_up;
use crate::error::{FormatError, Result};
use binrw::{BinRead, BinWrite};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Cursor, Read, Write};

/// "CDRM" read little-endian
pub const CDRM_MAGIC: u32 = 0x4D52_4443;

/// Frame type written by this implementation
pub const CDRM_TYPE: u32 = 2;

/// "NEXT" read little-endian
pub const NEXT_MAGIC: u32 = 0x5458_454E;

/// Size of a NEXT marker record
pub const NEXT_MARKER_SIZE: u64 = 16;

/// Uncompressed bytes per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 0x40000;

/// Chunk payload is stored uncompressed
pub const CHUNK_STORED: u8 = 1;

/// Chunk payload is zlib-prefixed raw DEFLATE
pub const CHUNK_DEFLATE: u8 = 2;

const ZLIB_PREFIX: [u8; 2] = [0x78, 0xDA];
const CHUNK_TRAILER: [u8; 4] = [0; 4];
const FRAME_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct CdrmHeader {
    magic: u32,
    frame_type: u32,
    chunk_count: u32,
    pad: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct ChunkEntry {
    packed: u32,
    compressed_size: u32,
}

impl ChunkEntry {
    const fn uncompressed_size(self) -> usize {
        (self.packed >> 8) as usize
    }

    const fn flag(self) -> u8 {
        (self.packed & 0xFF) as u8
    }
}

/// Forward link record written after every resource blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NextMarker {
    /// Always [`NEXT_MAGIC`]
    pub magic: u32,
    /// Distance from this marker to the next blob, 0 while there is none
    pub offset_to_next: u32,
    /// Reserved
    pub reserved: u64,
}

impl NextMarker {
    /// Marker of a blob with no successor yet
    pub const fn terminal() -> Self {
        Self {
            magic: NEXT_MAGIC,
            offset_to_next: 0,
            reserved: 0,
        }
    }

    /// Serialize to 16 bytes
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset_to_next.to_le_bytes());
        out[8..].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// Parse 16 bytes, returning `None` when they are not a marker
    pub fn from_bytes(bytes: &[u8; 16]) -> Option<Self> {
        let marker = Self::read(&mut Cursor::new(bytes)).ok()?;
        (marker.magic == NEXT_MAGIC).then_some(marker)
    }

    /// True for a marker still waiting for its successor
    pub const fn is_open(&self) -> bool {
        self.offset_to_next == 0
    }
}

/// Whether `blob` starts with a CDRM header
pub fn is_cdrm(blob: &[u8]) -> bool {
    blob.len() >= 4 && blob[..4] == CDRM_MAGIC.to_le_bytes()
}

/// Frame `payload` as a CDRM blob.
///
/// Chunks that do not shrink under compression are stored.
pub fn encode(payload: &[u8], chunk_size: usize, level: u32) -> Result<Vec<u8>> {
    if chunk_size == 0 || chunk_size > 0x00FF_FFFF {
        return Err(FormatError::InvalidArgument(format!(
            "chunk size {chunk_size} is not representable"
        )));
    }

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };

    let mut entries = Vec::with_capacity(chunks.len());
    let mut bodies = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut encoder =
            DeflateEncoder::new(Vec::with_capacity(chunk.len()), Compression::new(level));
        encoder.write_all(chunk)?;
        let deflated = encoder.finish()?;

        let framed_len = ZLIB_PREFIX.len() + deflated.len() + CHUNK_TRAILER.len();
        let (flag, body) = if framed_len < chunk.len() {
            let mut body = Vec::with_capacity(framed_len);
            body.extend_from_slice(&ZLIB_PREFIX);
            body.extend_from_slice(&deflated);
            body.extend_from_slice(&CHUNK_TRAILER);
            (CHUNK_DEFLATE, body)
        } else {
            (CHUNK_STORED, chunk.to_vec())
        };

        entries.push(ChunkEntry {
            packed: ((chunk.len() as u32) << 8) | u32::from(flag),
            compressed_size: body.len() as u32,
        });
        bodies.push(body);
    }

    let mut out = Cursor::new(Vec::new());
    CdrmHeader {
        magic: CDRM_MAGIC,
        frame_type: CDRM_TYPE,
        chunk_count: entries.len() as u32,
        pad: 0,
    }
    .write(&mut out)?;
    for entry in &entries {
        entry.write(&mut out)?;
    }
    let mut out = out.into_inner();
    pad_to(&mut out, FRAME_ALIGNMENT);

    for body in bodies {
        out.extend_from_slice(&body);
        pad_to(&mut out, FRAME_ALIGNMENT);
    }
    Ok(out)
}

/// Decode a CDRM blob into its payload
pub fn decode(blob: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(blob);
    let header = CdrmHeader::read(&mut cursor)?;
    if header.magic != CDRM_MAGIC {
        return Err(FormatError::InvalidMagic {
            expected: CDRM_MAGIC,
            found: header.magic,
        });
    }

    let count = header.chunk_count as usize;
    let table_end = 16 + count.checked_mul(8).ok_or_else(|| {
        FormatError::InvalidFormat("chunk count overflows".into())
    })?;
    if table_end > blob.len() {
        return Err(FormatError::InvalidFormat(format!(
            "chunk table of {count} entries exceeds blob of {} bytes",
            blob.len()
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(ChunkEntry::read(&mut cursor)?);
    }

    let mut position = align_up(table_end as u64, FRAME_ALIGNMENT) as usize;
    let mut payload = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let size = entry.compressed_size as usize;
        let end = position
            .checked_add(size)
            .filter(|&end| end <= blob.len())
            .ok_or_else(|| {
                FormatError::InvalidFormat(format!("chunk {index} runs past the end of the blob"))
            })?;
        let body = &blob[position..end];

        match entry.flag() {
            CHUNK_STORED => payload.extend_from_slice(body),
            CHUNK_DEFLATE => {
                if body.len() < ZLIB_PREFIX.len() + CHUNK_TRAILER.len() {
                    return Err(FormatError::Compression(format!(
                        "chunk {index} is too short"
                    )));
                }
                let deflated = &body[ZLIB_PREFIX.len()..body.len() - CHUNK_TRAILER.len()];
                let mut decoder = DeflateDecoder::new(deflated);
                let before = payload.len();
                decoder
                    .read_to_end(&mut payload)
                    .map_err(|e| FormatError::Compression(format!("chunk {index}: {e}")))?;
                let produced = payload.len() - before;
                if produced != entry.uncompressed_size() {
                    return Err(FormatError::Compression(format!(
                        "chunk {index} inflated to {produced} bytes, expected {}",
                        entry.uncompressed_size()
                    )));
                }
            }
            other => {
                return Err(FormatError::InvalidFormat(format!(
                    "chunk {index} has unknown flag {other}"
                )));
            }
        }
        position = align_up(end as u64, FRAME_ALIGNMENT) as usize;
    }
    Ok(payload)
}

fn pad_to(buffer: &mut Vec<u8>, alignment: u64) {
    let target = align_up(buffer.len() as u64, alignment) as usize;
    buffer.resize(target, 0);
}
