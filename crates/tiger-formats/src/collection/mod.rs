//! Resource collections
//!
//! A collection (`.drm` file) lists the resources a level or object needs.
//! Its layout is
//!
//! ```text
//! header (32 bytes)
//! locale (0, 4 or 8 bytes)
//! identification records  x resource_count
//! dependency blob         (dependencies_length bytes)
//! include blob            (includes_length bytes)
//! location records        x resource_count
//! ```
//!
//! Identification and location records are index aligned. Mutation goes
//! through [`ResourceCollection::add_resource_reference`] and
//! [`ResourceCollection::update_resource_reference`], which keep both tables
//! the same length.

mod records;

pub use records::{CollectionHeader, DependencyEntry, ResourceIdentification, ResourceLocation};

use crate::error::{FormatError, Result};
use crate::game::GameFormat;
use crate::reference::{ArchiveFileKey, BlobReference, ResourceKey, ResourceReference};
use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use records::{build_dependency_blob, narrow_locale, parse_dependency_blob, widen_locale};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Default extension given to dependency paths that have none
pub const COLLECTION_EXTENSION: &str = ".drm";

/// Parsed resource collection
#[derive(Debug, Clone)]
pub struct ResourceCollection {
    format: GameFormat,
    key: ArchiveFileKey,
    header: CollectionHeader,
    locale: Option<u64>,
    identifications: Vec<ResourceIdentification>,
    locations: Vec<ResourceLocation>,
    dependencies: Vec<DependencyEntry>,
    includes: Vec<DependencyEntry>,
}

impl ResourceCollection {
    /// Empty collection for `format`, identified by `key`
    pub fn new(format: GameFormat, key: ArchiveFileKey) -> Self {
        let locale = (format.collection_locale_size > 0).then_some(key.locale);
        Self {
            header: CollectionHeader::new(format.collection_version),
            format,
            key,
            locale,
            identifications: Vec::new(),
            locations: Vec::new(),
            dependencies: Vec::new(),
            includes: Vec::new(),
        }
    }

    /// Parse a collection from a stream positioned at its first byte
    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        format: GameFormat,
        key: ArchiveFileKey,
    ) -> Result<Self> {
        let header = CollectionHeader::read(reader)?;
        if header.version != format.collection_version {
            return Err(FormatError::UnsupportedVersion {
                structure: "collection",
                expected: format.collection_version,
                found: header.version,
            });
        }

        let locale = match format.collection_locale_size {
            0 => None,
            4 => Some(widen_locale(reader.read_le::<u32>()?)),
            _ => Some(reader.read_le::<u64>()?),
        };

        // Counts come from untrusted data; let reads fail rather than
        // reserving memory up front.
        let count = header.resource_count as usize;
        let mut identifications = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            identifications.push(ResourceIdentification::read(reader, &format)?);
        }

        let dependencies_blob = read_blob(reader, header.dependencies_length)?;
        let includes_blob = read_blob(reader, header.includes_length)?;
        let dependencies =
            parse_dependency_blob(&dependencies_blob, format.collection_locale_size)?;
        let includes = parse_dependency_blob(&includes_blob, format.collection_locale_size)?;

        let mut locations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            locations.push(ResourceLocation::read(reader, &format)?);
        }

        Ok(Self {
            format,
            key,
            header,
            locale,
            identifications,
            locations,
            dependencies,
            includes,
        })
    }

    /// Parse a collection held in memory
    pub fn from_bytes(data: &[u8], format: GameFormat, key: ArchiveFileKey) -> Result<Self> {
        Self::parse(&mut Cursor::new(data), format, key)
    }

    /// Serialize the whole collection.
    ///
    /// Resource count and blob lengths are recomputed from the current lists.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        let dependencies =
            build_dependency_blob(&self.dependencies, self.format.collection_locale_size)?;
        let includes = build_dependency_blob(&self.includes, self.format.collection_locale_size)?;

        let mut header = self.header.clone();
        header.resource_count = self.identifications.len() as u32;
        header.dependencies_length = dependencies.len() as u32;
        header.includes_length = includes.len() as u32;
        header.write(writer)?;

        if let Some(locale) = self.locale {
            match self.format.collection_locale_size {
                4 => writer.write_le(&narrow_locale(locale)?)?,
                _ => writer.write_le(&locale)?,
            }
        }
        for ident in &self.identifications {
            ident.write(writer, &self.format)?;
        }
        writer.write_all(&dependencies)?;
        writer.write_all(&includes)?;
        for location in &self.locations {
            location.write(writer, &self.format)?;
        }
        Ok(())
    }

    /// Serialize into a new buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Identity of the file this collection was read from
    pub const fn key(&self) -> ArchiveFileKey {
        self.key
    }

    /// Game format of this collection
    pub const fn format(&self) -> &GameFormat {
        &self.format
    }

    /// Parsed header as last read or written
    pub const fn header(&self) -> &CollectionHeader {
        &self.header
    }

    /// Number of resource entries
    pub fn len(&self) -> usize {
        self.identifications.len()
    }

    /// True when the collection holds no resources
    pub fn is_empty(&self) -> bool {
        self.identifications.is_empty()
    }

    /// Raw identification records
    pub fn identifications(&self) -> &[ResourceIdentification] {
        &self.identifications
    }

    /// Raw location records
    pub fn locations(&self) -> &[ResourceLocation] {
        &self.locations
    }

    /// All entries combined into resource references
    pub fn resource_references(&self) -> Vec<ResourceReference> {
        (0..self.identifications.len())
            .filter_map(|index| self.resource_reference(index))
            .collect()
    }

    /// Entry `index` combined into a resource reference
    pub fn resource_reference(&self, index: usize) -> Option<ResourceReference> {
        let ident = self.identifications.get(index)?;
        let location = self.locations.get(index)?;
        let stored = ResourceKey::new(ident.resource_type, ident.sub_type(), ident.id);
        let key = self.format.load_key(location.archive_id, stored);
        Some(ResourceReference {
            blob: BlobReference {
                archive_id: location.archive_id,
                archive_sub_id: location.archive_sub_id,
                archive_part: location.archive_part,
                offset: u64::from(location.offset),
                length: location.size,
            },
            resource_type: key.resource_type,
            sub_type: key.sub_type,
            id: key.id,
            locale: ident.locale,
            offset_in_batch: location.offset_in_batch,
            ref_definitions_size: Some(ident.ref_definitions_size()),
            body_size: ident.body_size,
        })
    }

    /// Copy entry `index` of `other` verbatim, returning the new index
    pub fn add_resource_reference_from(&mut self, other: &Self, index: usize) -> Result<usize> {
        if other.format.game != self.format.game {
            return Err(FormatError::InvalidArgument(format!(
                "cannot import a {} resource into a {} collection",
                other.format.game, self.format.game
            )));
        }
        let (Some(ident), Some(location)) =
            (other.identifications.get(index), other.locations.get(index))
        else {
            return Err(FormatError::InvalidArgument(format!(
                "resource index {index} out of range for {} entries",
                other.len()
            )));
        };
        self.identifications.push(*ident);
        self.locations.push(*location);
        Ok(self.identifications.len() - 1)
    }

    /// Append an entry built from `reference`, returning the new index
    pub fn add_resource_reference(&mut self, reference: &ResourceReference) -> Result<usize> {
        let mut ident = ResourceIdentification::default();
        let mut location = ResourceLocation::default();
        self.fill_entry(&mut ident, &mut location, reference)?;
        self.identifications.push(ident);
        self.locations.push(location);
        Ok(self.identifications.len() - 1)
    }

    /// Refresh entry `index` from `reference`
    pub fn update_resource_reference(
        &mut self,
        index: usize,
        reference: &ResourceReference,
    ) -> Result<()> {
        let (Some(mut ident), Some(mut location)) =
            (self.identifications.get(index).copied(), self.locations.get(index).copied())
        else {
            return Err(FormatError::InvalidArgument(format!(
                "resource index {index} out of range for {} entries",
                self.len()
            )));
        };
        self.fill_entry(&mut ident, &mut location, reference)?;
        self.identifications[index] = ident;
        self.locations[index] = location;
        Ok(())
    }

    fn fill_entry(
        &self,
        ident: &mut ResourceIdentification,
        location: &mut ResourceLocation,
        reference: &ResourceReference,
    ) -> Result<()> {
        let stored = self.format.store_key(reference.blob.archive_id, reference.key());
        ident.resource_type = stored.resource_type;
        ident.set_sub_type(stored.sub_type)?;
        ident.id = stored.id;
        ident.locale = reference.locale;

        match reference.ref_definitions_size {
            Some(size) => {
                ident.set_ref_definitions_size(size)?;
                ident.body_size = reference.body_size;
            }
            None => {
                let stored_size = ident.ref_definitions_size();
                ident.body_size = reference.body_size.checked_sub(stored_size).ok_or_else(|| {
                    FormatError::InvalidArgument(format!(
                        "body size {} is smaller than the stored ref definitions size \
                         {stored_size}",
                        reference.body_size
                    ))
                })?;
            }
        }

        let blob = &reference.blob;
        location.archive_id = blob.archive_id;
        location.archive_sub_id = blob.archive_sub_id;
        location.archive_part = blob.archive_part;
        location.offset = u32::try_from(blob.offset).map_err(|_| {
            FormatError::InvalidArgument(format!("offset {:#x} exceeds 32 bits", blob.offset))
        })?;
        location.size = blob.length;
        location.offset_in_batch = reference.offset_in_batch;
        Ok(())
    }

    /// Dependency paths as stored
    pub fn dependency_entries(&self) -> &[DependencyEntry] {
        &self.dependencies
    }

    /// Include paths as stored
    pub fn include_entries(&self) -> &[DependencyEntry] {
        &self.includes
    }

    /// Append a dependency path
    pub fn add_dependency(&mut self, entry: DependencyEntry) {
        self.dependencies.push(entry);
    }

    /// Append an include path
    pub fn add_include(&mut self, entry: DependencyEntry) {
        self.includes.push(entry);
    }

    /// Dependency paths resolved to archive file paths
    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.iter().map(|e| self.resolve_path(&e.path)).collect()
    }

    /// Include paths resolved to archive file paths
    pub fn includes(&self) -> Vec<String> {
        self.includes.iter().map(|e| self.resolve_path(&e.path)).collect()
    }

    fn resolve_path(&self, path: &str) -> String {
        let file_name = path.rsplit(['\\', '/']).next().unwrap_or(path);
        let extension = if file_name.contains('.') {
            ""
        } else {
            COLLECTION_EXTENSION
        };
        format!("{}\\{path}{extension}", self.format.platform)
    }
}

fn read_blob<R: Read + Seek>(reader: &mut R, length: u32) -> Result<Vec<u8>> {
    let start = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    if end.saturating_sub(start) < u64::from(length) {
        return Err(FormatError::InvalidFormat(format!(
            "blob of {length} bytes runs past the end of the collection"
        )));
    }
    reader.seek(SeekFrom::Start(start))?;
    let mut blob = vec![0u8; length as usize];
    reader.read_exact(&mut blob)?;
    Ok(blob)
}
