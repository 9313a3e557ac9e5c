//! Physical archive access
//!
//! An archive is an index part `<name>.000.tiger` holding the header and a
//! pre-allocated table of file record slots, plus content parts
//! `<name>.001.tiger`, `<name>.002.tiger`, ... that data is appended to.
//! Existing content is never moved.

use crate::metadata::ArchiveMetaData;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tiger_formats::archive::{ArchiveHeader, NUM_PARTS_OFFSET, read_file_record, write_file_record};
use tiger_formats::cdrm::{self, NEXT_MARKER_SIZE, NextMarker};
use tiger_formats::{
    ArchiveFileKey, ArchiveFileReference, BlobReference, GameFormat, ResourceCollection,
    ResourceReference, WindowReader, align_up,
};
use tracing::{debug, info, warn};

/// Suffix of an archive index part
pub const INDEX_SUFFIX: &str = ".000.tiger";

const RESOURCE_ALIGNMENT: u64 = 16;

/// Bytes read per step when searching a part for its open NEXT marker
const MARKER_SCAN_BLOCK: u64 = 0x10000;

/// Settings applied to resources framed by [`Archive::add_resource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// DEFLATE level (0-9)
    pub compression_level: u32,
    /// Uncompressed bytes per chunk
    pub chunk_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression_level: 6,
            chunk_size: cdrm::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Source of a resource appended with [`Archive::add_resource`]
pub enum ResourceData<'a> {
    /// Raw payload, framed as CDRM on write
    Payload(&'a [u8]),
    /// Resource read from another archive, copied verbatim
    PassThrough(&'a ResourceStream),
}

/// Decoded resource payload read from an archive.
///
/// Reads, writes and seeks operate on the payload of the one resource the
/// stream was opened for. The stored blob is kept for pass-through copies;
/// once the payload is written to, a copy is re-framed from the new bytes.
#[derive(Debug, Clone)]
pub struct ResourceStream {
    source: ResourceReference,
    raw: Vec<u8>,
    payload: Cursor<Vec<u8>>,
    modified: bool,
}

impl ResourceStream {
    /// Reference the stream was opened for
    pub const fn source(&self) -> &ResourceReference {
        &self.source
    }

    /// Blob bytes exactly as stored in the archive
    pub fn raw_blob(&self) -> &[u8] {
        &self.raw
    }

    /// Current payload bytes
    pub fn payload(&self) -> &[u8] {
        self.payload.get_ref()
    }

    /// Take the payload bytes
    pub fn into_payload(self) -> Vec<u8> {
        self.payload.into_inner()
    }

    /// Whether the payload was written to since the stream was opened
    pub const fn is_modified(&self) -> bool {
        self.modified
    }

    /// Stored blob with the current payload spliced back into its batch
    fn framed_blob(&self, options: WriteOptions) -> Result<Vec<u8>> {
        if !self.modified {
            return Ok(self.raw.clone());
        }
        let framed = cdrm::is_cdrm(&self.raw);
        let batch = if framed {
            cdrm::decode(&self.raw)?
        } else {
            self.raw.clone()
        };

        let start = self.source.offset_in_batch as usize;
        let end = start + self.source.total_size()? as usize;
        let payload = self.payload.get_ref();
        if end > batch.len() {
            return Err(StorageError::Archive(format!(
                "resource {:#x} spans {start}..{end} of a {} byte batch",
                self.source.id,
                batch.len()
            )));
        }
        if payload.len() != end - start && (start != 0 || end != batch.len()) {
            return Err(StorageError::InvalidArgument(format!(
                "resource {:#x} changed size from {} to {} bytes inside a shared batch",
                self.source.id,
                end - start,
                payload.len()
            )));
        }
        let mut spliced = Vec::with_capacity(batch.len() - (end - start) + payload.len());
        spliced.extend_from_slice(&batch[..start]);
        spliced.extend_from_slice(payload);
        spliced.extend_from_slice(&batch[end..]);

        if framed {
            Ok(cdrm::encode(&spliced, options.chunk_size, options.compression_level)?)
        } else {
            Ok(spliced)
        }
    }
}

impl Read for ResourceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.payload.read(buf)
    }
}

impl Write for ResourceStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.modified = true;
        }
        self.payload.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ResourceStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.payload.seek(pos)
    }
}

/// One indexed container
pub struct Archive {
    path: PathBuf,
    format: GameFormat,
    header: ArchiveHeader,
    sub_id: u32,
    capacity: usize,
    files: Vec<ArchiveFileReference>,
    metadata: Option<ArchiveMetaData>,
    options: WriteOptions,
    /// Position of the open NEXT marker per content part, once known
    open_markers: HashMap<u32, Option<u64>>,
    /// Lazily opened part handles, index = part number
    parts: Mutex<Vec<Option<File>>>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("id", &self.header.id)
            .field("sub_id", &self.sub_id)
            .field("files", &self.files.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Archive {
    /// Create an empty archive with `max_files` pre-zeroed slots.
    ///
    /// Fails if the index part already exists. `metadata`, when given, is
    /// saved next to the archive.
    pub fn create(
        path: impl AsRef<Path>,
        format: GameFormat,
        id: u32,
        sub_id: u32,
        metadata: Option<ArchiveMetaData>,
        max_files: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = index_file_name(&path)?;
        if !format.supports_sub_id {
            let derived = GameFormat::sub_id_from_file_name(file_name);
            if derived != sub_id {
                return Err(StorageError::InvalidArgument(format!(
                    "sub id {sub_id} does not match file name {file_name} (sub id {derived})"
                )));
            }
        }

        let header = ArchiveHeader::new(&format, id, sub_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let written = (|| -> Result<()> {
            let mut writer = BufWriter::new(&file);
            header.write(&mut writer)?;
            writer.write_all(&vec![0u8; max_files * format.file_record_size()])?;
            writer.flush()?;
            if let Some(metadata) = &metadata {
                metadata.save()?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            drop(file);
            if let Err(remove) = fs::remove_file(&path) {
                warn!("failed to remove partial archive {}: {remove}", path.display());
            }
            return Err(e);
        }

        info!(
            "created archive {} (id={id}, sub_id={sub_id}, slots={max_files})",
            path.display()
        );

        Ok(Self {
            path,
            format,
            header,
            sub_id,
            capacity: max_files,
            files: Vec::new(),
            metadata,
            options: WriteOptions::default(),
            open_markers: HashMap::new(),
            parts: Mutex::new(vec![Some(file)]),
        })
    }

    /// Open an existing archive from its index part.
    ///
    /// A header from a different game or version is
    /// [`StorageError::UnsupportedFormat`].
    pub fn open(
        path: impl AsRef<Path>,
        format: GameFormat,
        metadata: Option<ArchiveMetaData>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = index_file_name(&path)?.to_string();
        let file = open_part_file(&path)?;
        let len = file.metadata()?.len();

        let mut reader = BufReader::new(&file);
        let header = ArchiveHeader::read(&mut reader, &format).map_err(|e| {
            if e.is_unsupported_version() {
                StorageError::UnsupportedFormat(format!("{}: {e}", path.display()))
            } else {
                StorageError::Format(e)
            }
        })?;

        let capacity =
            (len.saturating_sub(format.header_size() as u64) / format.file_record_size() as u64)
                as usize;
        if header.num_files as usize > capacity {
            return Err(StorageError::Archive(format!(
                "{} claims {} files but has room for {capacity}",
                path.display(),
                header.num_files
            )));
        }

        let sub_id = header
            .sub_id
            .unwrap_or_else(|| GameFormat::sub_id_from_file_name(&file_name));

        let mut files = Vec::with_capacity(header.num_files as usize);
        for _ in 0..header.num_files {
            files.push(read_file_record(&mut reader, &format, header.id, sub_id)?);
        }
        drop(reader);

        // Slots may not run into file data stored in the index part
        let capacity = first_index_data(&files)
            .map_or(capacity, |offset| capacity.min(slots_before(&format, offset)));
        if header.num_files as usize > capacity {
            return Err(StorageError::Archive(format!(
                "{} has {} file records overlapping file data in the index part",
                path.display(),
                header.num_files
            )));
        }

        debug!(
            "opened archive {} (id={}, sub_id={sub_id}, files={}/{capacity}, parts={})",
            path.display(),
            header.id,
            files.len(),
            header.num_parts
        );

        Ok(Self {
            path,
            format,
            header,
            sub_id,
            capacity,
            files,
            metadata,
            options: WriteOptions::default(),
            open_markers: HashMap::new(),
            parts: Mutex::new(vec![Some(file)]),
        })
    }

    /// Archive id
    pub const fn id(&self) -> u32 {
        self.header.id
    }

    /// Archive sub id
    pub const fn sub_id(&self) -> u32 {
        self.sub_id
    }

    /// Path of the index part
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Game format of this archive
    pub const fn format(&self) -> &GameFormat {
        &self.format
    }

    /// Parsed header
    pub const fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Number of part files including the index part
    pub const fn num_parts(&self) -> u32 {
        self.header.num_parts
    }

    /// Number of file record slots
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Used file record slots in slot order
    pub fn files(&self) -> &[ArchiveFileReference] {
        &self.files
    }

    /// File with `key`, if this archive holds one
    pub fn file(&self, key: ArchiveFileKey) -> Option<&ArchiveFileReference> {
        self.files.iter().find(|file| file.key() == key)
    }

    /// Side metadata, `None` for base game archives
    pub const fn metadata(&self) -> Option<&ArchiveMetaData> {
        self.metadata.as_ref()
    }

    /// Mutable side metadata
    pub fn metadata_mut(&mut self) -> Option<&mut ArchiveMetaData> {
        self.metadata.as_mut()
    }

    /// Replace the side metadata
    pub fn set_metadata(&mut self, metadata: Option<ArchiveMetaData>) {
        self.metadata = metadata;
    }

    /// Whether this is a mod archive (it has side metadata)
    pub const fn is_mod(&self) -> bool {
        self.metadata.is_some()
    }

    /// Whether the archive takes part in the overlay
    pub fn is_enabled(&self) -> bool {
        self.metadata.as_ref().is_none_or(|m| m.enabled)
    }

    /// Settings used for new resources
    pub const fn write_options(&self) -> WriteOptions {
        self.options
    }

    /// Change the settings used for new resources
    pub fn set_write_options(&mut self, options: WriteOptions) {
        self.options = options;
    }

    /// Path of content part `part`
    pub fn part_path(&self, part: u32) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(INDEX_SUFFIX))
            .unwrap_or_default();
        self.path.with_file_name(format!("{name}.{part:03}.tiger"))
    }

    /// Append a file, returning its reference.
    ///
    /// Fails with [`StorageError::CapacityExceeded`] once every slot is used
    /// or the next slot would run into file data stored in the index part.
    pub fn add_file(
        &mut self,
        name_hash: u64,
        locale: u64,
        data: &[u8],
    ) -> Result<ArchiveFileReference> {
        let slot = self.files.len();
        let slot_end =
            (self.format.header_size() + (slot + 1) * self.format.file_record_size()) as u64;
        let overlaps = first_index_data(&self.files).is_some_and(|offset| slot_end > offset);
        if slot >= self.capacity || overlaps {
            return Err(StorageError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let length = u32::try_from(data.len()).map_err(|_| {
            StorageError::InvalidArgument(format!("file of {} bytes exceeds 32 bits", data.len()))
        })?;

        let part = self.content_part();
        let alignment = self.format.content_alignment;
        let end = self.part_len(part)?;
        let offset = align_up(end, alignment);

        let reference = ArchiveFileReference {
            blob: BlobReference {
                archive_id: self.id(),
                archive_sub_id: self.sub_id,
                archive_part: part,
                offset,
                length,
            },
            name_hash,
            locale,
        };

        // Encode the slot before touching content so layout errors leave the
        // archive unchanged.
        let mut record = Cursor::new(Vec::with_capacity(self.format.file_record_size()));
        write_file_record(&mut record, &self.format, &reference)?;
        let record = record.into_inner();

        self.with_part(part, true, |file| {
            file.seek(SeekFrom::Start(end))?;
            file.write_all(&vec![0u8; (offset - end) as usize])?;
            file.write_all(data)?;
            Ok(())
        })?;

        let slot_offset =
            (self.format.header_size() + slot * self.format.file_record_size()) as u64;
        self.with_part(0, false, |file| {
            file.seek(SeekFrom::Start(slot_offset))?;
            file.write_all(&record)?;
            Ok(())
        })?;

        self.files.push(reference);
        self.header.num_files = self.files.len() as u32;
        self.write_counts()?;

        debug!(
            "added file {name_hash:#018x} to archive {} at part {part} offset {offset:#x} \
             ({length} bytes)",
            self.id()
        );
        Ok(reference)
    }

    /// Append a resource blob, returning where it was stored.
    ///
    /// Payloads are framed as CDRM; pass-through sources are copied
    /// verbatim. The blob is followed by an open NEXT marker and the
    /// previous open marker of the part, if any, is pointed at it.
    pub fn add_resource(&mut self, data: ResourceData<'_>) -> Result<BlobReference> {
        let blob = match data {
            ResourceData::Payload(payload) => {
                cdrm::encode(payload, self.options.chunk_size, self.options.compression_level)?
            }
            ResourceData::PassThrough(stream) => stream.framed_blob(self.options)?,
        };
        let length = u32::try_from(blob.len()).map_err(|_| {
            StorageError::InvalidArgument(format!(
                "resource of {} bytes exceeds 32 bits",
                blob.len()
            ))
        })?;

        let part = self.content_part();
        let alignment = self.format.content_alignment.max(RESOURCE_ALIGNMENT);
        let prior = self.open_marker(part)?;
        let (offset, marker) = self.with_part(part, true, |file| {
            let end = file.seek(SeekFrom::End(0))?;
            let offset = align_up(end, alignment);
            let blob_end = offset + blob.len() as u64;
            let marker = align_up(blob_end, RESOURCE_ALIGNMENT);

            file.seek(SeekFrom::Start(end))?;
            file.write_all(&vec![0u8; (offset - end) as usize])?;
            file.write_all(&blob)?;
            file.write_all(&vec![0u8; (marker - blob_end) as usize])?;
            file.write_all(&NextMarker::terminal().to_bytes())?;

            if let Some(prior) = prior {
                let distance = u32::try_from(offset - prior).map_err(|_| {
                    StorageError::Archive("NEXT marker distance exceeds 32 bits".into())
                })?;
                file.seek(SeekFrom::Start(prior + 4))?;
                file.write_all(&distance.to_le_bytes())?;
            }
            Ok((offset, marker))
        })?;
        self.open_markers.insert(part, Some(marker));
        self.write_counts()?;

        debug!(
            "added resource to archive {} at part {part} offset {offset:#x} ({length} bytes)",
            self.id()
        );
        Ok(BlobReference {
            archive_id: self.id(),
            archive_sub_id: self.sub_id,
            archive_part: part,
            offset,
            length,
        })
    }

    /// Read the stored bytes of `blob`
    pub fn read_blob(&self, blob: &BlobReference) -> Result<Vec<u8>> {
        self.check_owner(blob)?;
        self.with_part(blob.archive_part, false, |file| {
            file.seek(SeekFrom::Start(blob.offset))?;
            let mut buffer = vec![0u8; blob.length as usize];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
    }

    /// Read a whole file
    pub fn read_file(&self, file: &ArchiveFileReference) -> Result<Vec<u8>> {
        self.read_blob(&file.blob)
    }

    /// Bounded stream over a file, on its own OS handle
    pub fn open_file(&self, file: &ArchiveFileReference) -> Result<WindowReader<File>> {
        self.check_owner(&file.blob)?;
        let handle = File::open(self.part_path(file.blob.archive_part))?;
        Ok(WindowReader::new(
            handle,
            file.blob.offset,
            u64::from(file.blob.length),
        ))
    }

    /// Decode the payload of one resource
    pub fn open_resource(&self, resource: &ResourceReference) -> Result<ResourceStream> {
        let raw = self.read_blob(&resource.blob)?;
        let decoded = if cdrm::is_cdrm(&raw) {
            cdrm::decode(&raw)?
        } else {
            raw.clone()
        };

        let start = resource.offset_in_batch as usize;
        let end = start + resource.total_size()? as usize;
        let Some(payload) = decoded.get(start..end) else {
            return Err(StorageError::Archive(format!(
                "resource {:#x} spans {start}..{end} of a {} byte batch",
                resource.id,
                decoded.len()
            )));
        };

        Ok(ResourceStream {
            source: *resource,
            payload: Cursor::new(payload.to_vec()),
            raw,
            modified: false,
        })
    }

    /// Parse a file as a resource collection.
    ///
    /// Files that are not collections yield `Ok(None)`.
    pub fn get_resource_collection(
        &self,
        file: &ArchiveFileReference,
    ) -> Result<Option<ResourceCollection>> {
        let mut reader = BufReader::new(self.open_file(file)?);
        match ResourceCollection::parse(&mut reader, self.format, file.key()) {
            Ok(collection) => Ok(Some(collection)),
            Err(e) => {
                debug!("file {:#018x} is not a collection: {e}", file.name_hash);
                Ok(None)
            }
        }
    }

    /// Overwrite a file in place.
    ///
    /// `data` may not be longer than the file; bytes past its end are left
    /// as they are.
    pub fn rewrite_file(&self, file: &ArchiveFileReference, data: &[u8]) -> Result<()> {
        self.check_owner(&file.blob)?;
        if !self.files.contains(file) {
            return Err(StorageError::InvalidArgument(format!(
                "file {:#018x} is not stored in archive {}",
                file.name_hash,
                self.id()
            )));
        }
        if data.len() > file.blob.length as usize {
            return Err(StorageError::InvalidArgument(format!(
                "rewrite of {} bytes does not fit file of {} bytes",
                data.len(),
                file.blob.length
            )));
        }
        self.with_part(file.blob.archive_part, false, |handle| {
            handle.seek(SeekFrom::Start(file.blob.offset))?;
            handle.write_all(data)?;
            handle.flush()?;
            Ok(())
        })
    }

    /// Release every cached part handle
    pub fn close_streams(&self) {
        let mut parts = self.parts.lock();
        for part in parts.iter_mut() {
            *part = None;
        }
    }

    /// Remove every part file and the side metadata
    pub fn delete(self) -> Result<()> {
        self.close_streams();
        let mut part = 0;
        loop {
            let path = self.part_path(part);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound && part >= self.header.num_parts => {
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            part += 1;
        }
        if let Some(metadata) = &self.metadata {
            metadata.delete()?;
        }
        info!(
            "deleted archive {} (id={}, sub_id={})",
            self.path.display(),
            self.id(),
            self.sub_id
        );
        Ok(())
    }

    /// Open NEXT marker of `part`, searched for once per part.
    ///
    /// The search walks the part backwards and skips positions inside
    /// indexed files, so the hit is the marker of the last resource.
    fn open_marker(&mut self, part: u32) -> Result<Option<u64>> {
        if let Some(known) = self.open_markers.get(&part) {
            return Ok(*known);
        }
        let occupied: Vec<(u64, u64)> = self
            .files
            .iter()
            .filter(|f| f.blob.archive_part == part)
            .map(|f| (f.blob.offset, f.blob.offset + u64::from(f.blob.length)))
            .collect();
        let found = self.with_part(part, true, |file| find_open_marker(file, &occupied))?;
        if let Some(position) = found {
            debug!("found open NEXT marker of part {part} at {position:#x}");
        }
        self.open_markers.insert(part, found);
        Ok(found)
    }

    fn check_owner(&self, blob: &BlobReference) -> Result<()> {
        if blob.archive_id != self.id() || blob.archive_sub_id != self.sub_id {
            return Err(StorageError::InvalidArgument(format!(
                "reference to archive {}/{} passed to archive {}/{}",
                blob.archive_id,
                blob.archive_sub_id,
                self.id(),
                self.sub_id
            )));
        }
        if blob.archive_part >= self.header.num_parts {
            return Err(StorageError::InvalidArgument(format!(
                "part {} out of range for archive {} with {} parts",
                blob.archive_part,
                self.id(),
                self.header.num_parts
            )));
        }
        Ok(())
    }

    /// Last content part, adding part 1 when only the index part exists
    fn content_part(&mut self) -> u32 {
        if self.header.num_parts < 2 {
            self.header.num_parts = 2;
        }
        self.header.num_parts - 1
    }

    fn part_len(&self, part: u32) -> Result<u64> {
        self.with_part(part, true, |file| Ok(file.seek(SeekFrom::End(0))?))
    }

    fn write_counts(&self) -> Result<()> {
        let (num_parts, num_files) = (self.header.num_parts, self.header.num_files);
        self.with_part(0, false, |file| {
            file.seek(SeekFrom::Start(NUM_PARTS_OFFSET))?;
            file.write_all(&num_parts.to_le_bytes())?;
            file.write_all(&num_files.to_le_bytes())?;
            Ok(())
        })
    }

    fn with_part<T>(
        &self,
        part: u32,
        create: bool,
        f: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let mut parts = self.parts.lock();
        let index = part as usize;
        if parts.len() <= index {
            parts.resize_with(index + 1, || None);
        }
        let slot = &mut parts[index];
        if slot.is_none() {
            let path = if part == 0 {
                self.path.clone()
            } else {
                self.part_path(part)
            };
            let file = if create {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?
            } else {
                open_part_file(&path)?
            };
            debug!("opened {}", path.display());
            *slot = Some(file);
        }
        let Some(file) = slot.as_mut() else {
            return Err(StorageError::Archive(format!("part {part} handle unavailable")));
        };
        f(file)
    }
}

/// Lowest offset of file data stored in the index part
fn first_index_data(files: &[ArchiveFileReference]) -> Option<u64> {
    files
        .iter()
        .filter(|f| f.blob.archive_part == 0 && f.blob.length > 0)
        .map(|f| f.blob.offset)
        .min()
}

/// Number of whole record slots that fit between the header and `offset`
fn slots_before(format: &GameFormat, offset: u64) -> usize {
    (offset.saturating_sub(format.header_size() as u64) / format.file_record_size() as u64) as usize
}

fn find_open_marker(file: &mut File, occupied: &[(u64, u64)]) -> Result<Option<u64>> {
    let len = file.seek(SeekFrom::End(0))?;
    let mut end = len - len % NEXT_MARKER_SIZE;
    let record = NEXT_MARKER_SIZE as usize;
    while end >= NEXT_MARKER_SIZE {
        let start = end.saturating_sub(MARKER_SCAN_BLOCK);
        let mut block = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;

        for (index, bytes) in block.chunks_exact(record).enumerate().rev() {
            let position = start + (index * record) as u64;
            let Ok(bytes) = <[u8; 16]>::try_from(bytes) else {
                continue;
            };
            let open = NextMarker::from_bytes(&bytes).is_some_and(|m| m.is_open());
            if open && !occupied.iter().any(|&(s, e)| (s..e).contains(&position)) {
                return Ok(Some(position));
            }
        }
        end = start;
    }
    Ok(None)
}

fn index_file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| n.ends_with(INDEX_SUFFIX))
        .ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "{} is not an archive index part ({INDEX_SUFFIX})",
                path.display()
            ))
        })
}

fn open_part_file(path: &Path) -> Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("opening {} read-only", path.display());
            Ok(File::open(path)?)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tiger_formats::archive::NUM_FILES_OFFSET;
    use tiger_formats::{ALL_LOCALES, CdcGame, resource_type};

    fn shadow() -> GameFormat {
        GameFormat::for_game(CdcGame::Shadow)
    }

    fn new_archive(dir: &TempDir, max_files: usize) -> Archive {
        Archive::create(dir.path().join("mod.000.tiger"), shadow(), 100, 0, None, max_files)
            .unwrap()
    }

    #[test]
    fn create_then_open() {
        let dir = TempDir::new().unwrap();
        let archive = new_archive(&dir, 8);
        assert_eq!(archive.capacity(), 8);
        assert!(archive.files().is_empty());

        let len = std::fs::metadata(archive.path()).unwrap().len();
        assert_eq!(len, (shadow().header_size() + 8 * 32) as u64);
        drop(archive);

        let reopened = Archive::open(dir.path().join("mod.000.tiger"), shadow(), None).unwrap();
        assert_eq!(reopened.id(), 100);
        assert_eq!(reopened.capacity(), 8);
        assert_eq!(reopened.num_parts(), 1);
    }

    #[test]
    fn slots_stop_at_file_data_in_index_part() {
        let dir = TempDir::new().unwrap();
        let archive = new_archive(&dir, 4);
        let path = archive.path().to_path_buf();
        let data_offset = (shadow().header_size() + 2 * shadow().file_record_size()) as u64;
        drop(archive);

        // Slot 0 points at bytes inside slot 2 of the index part
        let inline = ArchiveFileReference {
            blob: BlobReference {
                archive_id: 100,
                archive_sub_id: 0,
                archive_part: 0,
                offset: data_offset,
                length: 16,
            },
            name_hash: 0x77,
            locale: ALL_LOCALES,
        };
        let mut index = OpenOptions::new().write(true).open(&path).unwrap();
        index.seek(SeekFrom::Start(shadow().header_size() as u64)).unwrap();
        write_file_record(&mut index, &shadow(), &inline).unwrap();
        index.seek(SeekFrom::Start(NUM_FILES_OFFSET)).unwrap();
        index.write_all(&1u32.to_le_bytes()).unwrap();
        drop(index);

        let mut reopened = Archive::open(&path, shadow(), None).unwrap();
        assert_eq!(reopened.capacity(), 2);
        reopened.add_file(0x78, ALL_LOCALES, b"fits").unwrap();
        let err = reopened.add_file(0x79, ALL_LOCALES, b"overlaps").unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { capacity: 2 }));
        assert_eq!(reopened.read_file(&inline).unwrap(), vec![0; 16]);
    }

    #[test]
    fn create_refuses_existing_path() {
        let dir = TempDir::new().unwrap();
        let _archive = new_archive(&dir, 1);
        let err =
            Archive::create(dir.path().join("mod.000.tiger"), shadow(), 1, 0, None, 1).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn index_name_is_required() {
        let dir = TempDir::new().unwrap();
        let err =
            Archive::create(dir.path().join("mod.tiger"), shadow(), 1, 0, None, 1).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn open_rejects_other_game() {
        let dir = TempDir::new().unwrap();
        drop(new_archive(&dir, 1));
        let err = Archive::open(
            dir.path().join("mod.000.tiger"),
            GameFormat::for_game(CdcGame::Rise),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFormat(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn add_file_appends_aligned_content() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 4);

        let first = archive.add_file(1, ALL_LOCALES, b"hello").unwrap();
        let second = archive.add_file(2, ALL_LOCALES, b"world!").unwrap();

        assert_eq!(first.blob.archive_part, 1);
        assert_eq!(first.blob.offset, 0);
        assert_eq!(second.blob.offset, 16);
        assert_eq!(archive.num_parts(), 2);
        assert!(archive.part_path(1).ends_with("mod.001.tiger"));

        assert_eq!(archive.read_file(&first).unwrap(), b"hello");
        assert_eq!(archive.read_file(&second).unwrap(), b"world!");
    }

    #[test]
    fn tr2013_uses_file_name_sub_id_and_large_alignment() {
        let dir = TempDir::new().unwrap();
        let format = GameFormat::for_game(CdcGame::Tr2013);
        let path = dir.path().join("patch_german.000.tiger");

        assert!(Archive::create(&path, format, 3, 0, None, 2).is_err());
        let mut archive = Archive::create(&path, format, 3, 3, None, 2).unwrap();
        archive.add_file(0x10, ALL_LOCALES, &[1; 20]).unwrap();
        let second = archive.add_file(0x11, 1, &[2; 20]).unwrap();
        assert_eq!(second.blob.offset, 0x800);
        drop(archive);

        let reopened = Archive::open(&path, format, None).unwrap();
        assert_eq!(reopened.sub_id(), 3);
        assert_eq!(reopened.files()[1], second);
        assert_eq!(reopened.read_file(&second).unwrap(), vec![2; 20]);
    }

    #[test]
    fn foreign_reference_is_contract_violation() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);
        let mut file = archive.add_file(1, ALL_LOCALES, b"abc").unwrap();
        file.blob.archive_id = 7;

        let err = archive.read_file(&file).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(archive.open_file(&file).is_err());
    }

    #[test]
    fn resources_thread_next_markers() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);

        let first = archive.add_resource(ResourceData::Payload(&[7u8; 1000])).unwrap();
        let second = archive.add_resource(ResourceData::Payload(&[9u8; 300])).unwrap();
        assert_eq!(first.offset % 16, 0);
        assert_eq!(second.offset % 16, 0);

        let part = std::fs::read(archive.part_path(1)).unwrap();
        let marker_at = align_up(first.offset + u64::from(first.length), 16) as usize;
        let marker: [u8; 16] = part[marker_at..marker_at + 16].try_into().unwrap();
        let marker = NextMarker::from_bytes(&marker).unwrap();
        assert_eq!(u64::from(marker.offset_to_next), second.offset - marker_at as u64);

        let tail: [u8; 16] = part[part.len() - 16..].try_into().unwrap();
        assert!(NextMarker::from_bytes(&tail).unwrap().is_open());
    }

    #[test]
    fn resource_round_trip_and_pass_through() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
        let blob = archive.add_resource(ResourceData::Payload(&payload)).unwrap();

        let reference = ResourceReference {
            blob,
            resource_type: resource_type::TEXTURE,
            sub_type: 0,
            id: 4,
            locale: ALL_LOCALES,
            offset_in_batch: 0,
            ref_definitions_size: Some(0),
            body_size: payload.len() as u32,
        };
        let stream = archive.open_resource(&reference).unwrap();
        assert_eq!(stream.payload(), payload.as_slice());

        let copy = archive.add_resource(ResourceData::PassThrough(&stream)).unwrap();
        assert_eq!(copy.length, blob.length);
        assert_eq!(archive.read_blob(&copy).unwrap(), archive.read_blob(&blob).unwrap());
    }

    #[test]
    fn non_collection_file_is_none() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);
        let file = archive.add_file(1, ALL_LOCALES, b"plain text file").unwrap();
        assert!(archive.get_resource_collection(&file).unwrap().is_none());
    }

    #[test]
    fn collection_rewrite_in_place() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);
        let key = ArchiveFileKey::new(0x77, ALL_LOCALES);
        let mut collection = ResourceCollection::new(shadow(), key);
        let reference = ResourceReference {
            blob: BlobReference {
                archive_id: 100,
                archive_sub_id: 0,
                archive_part: 1,
                offset: 0x40,
                length: 0x20,
            },
            resource_type: resource_type::MATERIAL,
            sub_type: 0,
            id: 1,
            locale: ALL_LOCALES,
            offset_in_batch: 0,
            ref_definitions_size: Some(0),
            body_size: 0x20,
        };
        collection.add_resource_reference(&reference).unwrap();
        let file = archive
            .add_file(key.name_hash, key.locale, &collection.to_bytes().unwrap())
            .unwrap();

        let mut parsed = archive.get_resource_collection(&file).unwrap().unwrap();
        let mut moved = reference;
        moved.blob.offset = 0x80;
        parsed.update_resource_reference(0, &moved).unwrap();
        archive.rewrite_file(&file, &parsed.to_bytes().unwrap()).unwrap();

        let reread = archive.get_resource_collection(&file).unwrap().unwrap();
        assert_eq!(reread.resource_references()[0].blob.offset, 0x80);

        let too_long = vec![0u8; file.blob.length as usize + 1];
        assert!(archive.rewrite_file(&file, &too_long).is_err());
    }

    #[test]
    fn close_streams_reopens_lazily() {
        let dir = TempDir::new().unwrap();
        let mut archive = new_archive(&dir, 2);
        let file = archive.add_file(1, ALL_LOCALES, b"abc").unwrap();
        archive.close_streams();
        assert_eq!(archive.read_file(&file).unwrap(), b"abc");
        let second = archive.add_file(2, ALL_LOCALES, b"def").unwrap();
        assert_eq!(archive.read_file(&second).unwrap(), b"def");
    }

    #[test]
    fn delete_removes_parts_and_metadata() {
        let dir = TempDir::new().unwrap();
        let metadata = ArchiveMetaData::new(dir.path(), 100);
        let path = dir.path().join("mod.000.tiger");
        let mut archive = Archive::create(path, shadow(), 100, 0, Some(metadata), 2).unwrap();
        archive.add_file(1, ALL_LOCALES, b"abc").unwrap();
        let part1 = archive.part_path(1);
        assert!(part1.exists());
        assert!(ArchiveMetaData::path_for(dir.path(), 100).exists());

        archive.delete().unwrap();
        assert!(!part1.exists());
        assert!(!dir.path().join("mod.000.tiger").exists());
        assert!(!ArchiveMetaData::path_for(dir.path(), 100).exists());
    }
}
