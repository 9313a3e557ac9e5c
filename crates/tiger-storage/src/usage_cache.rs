//! Reverse index from resources to the collections that use them
//!
//! Scanning every collection of a game is slow, so the result is kept in a
//! [`ResourceUsageCache`] and persisted to `resourceusage.bin`. Caches are
//! layered: a mod overlay cache answers lookups from its own entries plus the
//! entries of its base (game) cache that it does not shadow.
//!
//! # File layout
//!
//! ```text
//! version: i32                  (CACHE_LAYOUT_VERSION << 8) | archive header version
//! usage count: i32
//!   type: u8, sub_type: u8, id: u32, collection count: i32
//!     name_hash: u64, locale: u64, index: u32
//! path count: i32
//!   byte length: i32, UTF-8 path, type: u8, sub_type: u8, id: u32
//! sound count: i32
//!   sound id: u32, usage count: i32
//!     bank resource id: u32, ref type: i32, index: i32
//! ```

use crate::archive::Archive;
use crate::progress::{CancellationToken, Progress, ProgressTracker};
use crate::{Result, StorageError};
use binrw::{BinReaderExt, BinWriterExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tiger_formats::{ALL_LOCALES, ArchiveFileKey, GameFormat, ResourceCollection, ResourceKey};
use tracing::{debug, info, warn};

/// Bumped whenever the persisted layout changes
pub const CACHE_LAYOUT_VERSION: i32 = 3;

/// One collection entry that uses a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceUsage {
    /// Collection file holding the entry
    pub collection: ArchiveFileKey,
    /// Entry index inside that collection
    pub index: u32,
}

/// Reference from a sound bank to an embedded sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SoundUsage {
    /// Id of the bank resource embedding the sound
    pub bank_resource_id: u32,
    /// Kind of reference inside the bank
    pub ref_type: i32,
    /// Position of the reference inside the bank
    pub index: i32,
}

/// Layerable reverse index of resource usages
#[derive(Debug, Clone)]
pub struct ResourceUsageCache {
    base: Option<Arc<ResourceUsageCache>>,
    locale_mask: u64,
    usages: HashMap<ResourceKey, BTreeMap<ArchiveFileKey, u32>>,
    /// Collections scanned into this layer and the resources each contributed
    collections: HashMap<ArchiveFileKey, Vec<ResourceKey>>,
    original_file_paths: HashMap<String, ResourceKey>,
    sound_usages: HashMap<u32, BTreeSet<SoundUsage>>,
}

impl ResourceUsageCache {
    /// Empty cache indexing resources whose locale intersects `locale_mask`
    pub fn new(locale_mask: u64) -> Self {
        Self {
            base: None,
            locale_mask,
            usages: HashMap::new(),
            collections: HashMap::new(),
            original_file_paths: HashMap::new(),
            sound_usages: HashMap::new(),
        }
    }

    /// Empty cache layered over `base`
    pub fn with_base(base: Arc<Self>, locale_mask: u64) -> Self {
        Self {
            base: Some(base),
            ..Self::new(locale_mask)
        }
    }

    /// Base layer, if any
    pub fn base(&self) -> Option<&Arc<Self>> {
        self.base.as_ref()
    }

    /// Locale mask applied on insert
    pub const fn locale_mask(&self) -> u64 {
        self.locale_mask
    }

    /// Index `collection`, replacing anything recorded for it before
    pub fn add_resource_collection(&mut self, collection: &ResourceCollection) {
        let key = collection.key();
        self.remove_collection(key);

        let mut used = Vec::new();
        for (index, reference) in collection.resource_references().iter().enumerate() {
            if !self.locale_passes(reference.locale) {
                continue;
            }
            let resource = reference.key();
            if self.insert_usage(resource, key, index as u32) {
                used.push(resource);
            }
        }
        self.collections.insert(key, used);
    }

    /// Forget every usage contributed by `collection` in this layer
    pub fn remove_collection(&mut self, collection: ArchiveFileKey) {
        let Some(resources) = self.collections.remove(&collection) else {
            return;
        };
        for resource in resources {
            if let Some(by_collection) = self.usages.get_mut(&resource) {
                by_collection.remove(&collection);
                if by_collection.is_empty() {
                    self.usages.remove(&resource);
                }
            }
        }
    }

    /// Scan every collection of `archive`.
    ///
    /// Returns the number of collections indexed. Cancellation is checked
    /// before each file.
    pub fn add_archive(
        &mut self,
        archive: &Archive,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<usize> {
        let mut tracker = ProgressTracker::new(progress, archive.files().len());
        let scanned = self.scan_archive(archive, token, &mut tracker)?;
        tracker.finish();
        Ok(scanned)
    }

    /// Scan every collection of `archives`, lowest priority first
    pub fn add_archive_set(
        &mut self,
        archives: &[&Archive],
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<usize> {
        let total = archives.iter().map(|a| a.files().len()).sum();
        let mut tracker = ProgressTracker::new(progress, total);
        let mut scanned = 0;
        for archive in archives {
            scanned += self.scan_archive(archive, token, &mut tracker)?;
        }
        tracker.finish();
        info!(
            "indexed {scanned} collections from {} archives ({} resources)",
            archives.len(),
            self.usages.len()
        );
        Ok(scanned)
    }

    fn scan_archive(
        &mut self,
        archive: &Archive,
        token: &CancellationToken,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<usize> {
        let mut scanned = 0;
        for file in archive.files() {
            token.check()?;
            if let Some(collection) = archive.get_resource_collection(file)? {
                self.add_resource_collection(&collection);
                scanned += 1;
            }
            tracker.step();
        }
        debug!("scanned {scanned} collections in archive {}", archive.id());
        Ok(scanned)
    }

    /// Every usage of `resource`: unshadowed base entries, then own entries
    pub fn get_resource_usages(&self, resource: ResourceKey) -> Vec<ResourceUsage> {
        let mut usages = Vec::new();
        if let Some(base) = &self.base {
            usages.extend(
                base.get_resource_usages(resource)
                    .into_iter()
                    .filter(|usage| !self.shadows(usage.collection)),
            );
        }
        if let Some(by_collection) = self.usages.get(&resource) {
            usages.extend(
                by_collection
                    .iter()
                    .map(|(&collection, &index)| ResourceUsage { collection, index }),
            );
        }
        usages
    }

    /// Whether this layer has scanned `collection` itself
    pub fn contains_collection(&self, collection: ArchiveFileKey) -> bool {
        self.collections.contains_key(&collection)
    }

    /// Number of collections scanned into this layer
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Number of distinct resources with a usage in this layer
    pub fn resource_count(&self) -> usize {
        self.usages.len()
    }

    /// Record the resource built from an original source file
    pub fn add_original_file_path(&mut self, path: impl Into<String>, resource: ResourceKey) {
        self.original_file_paths.insert(path.into(), resource);
    }

    /// Resource built from `path`, searching base layers too
    pub fn resource_for_path(&self, path: &str) -> Option<ResourceKey> {
        self.original_file_paths
            .get(path)
            .copied()
            .or_else(|| self.base.as_ref()?.resource_for_path(path))
    }

    /// Record that a sound bank references `sound_id`
    pub fn add_sound_usage(&mut self, sound_id: u32, usage: SoundUsage) {
        self.sound_usages.entry(sound_id).or_default().insert(usage);
    }

    /// Banks referencing `sound_id`, base layers first
    pub fn sound_usages(&self, sound_id: u32) -> Vec<SoundUsage> {
        let mut usages = self
            .base
            .as_ref()
            .map(|base| base.sound_usages(sound_id))
            .unwrap_or_default();
        if let Some(own) = self.sound_usages.get(&sound_id) {
            for usage in own {
                if !usages.contains(usage) {
                    usages.push(*usage);
                }
            }
        }
        usages
    }

    /// Version written to and expected in the cache file for `format`
    pub const fn persisted_version(format: &GameFormat) -> i32 {
        (CACHE_LAYOUT_VERSION << 8) | format.header_version as i32
    }

    /// Persist this layer's own entries
    pub fn save(&self, path: &Path, format: &GameFormat) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_le(&Self::persisted_version(format))?;

        let mut usages: Vec<_> = self.usages.iter().collect();
        usages.sort_by_key(|(key, _)| key.sort_key());
        writer.write_le(&count(usages.len())?)?;
        for (resource, by_collection) in usages {
            write_key(&mut writer, *resource)?;
            writer.write_le(&count(by_collection.len())?)?;
            for (collection, index) in by_collection {
                writer.write_le(&collection.name_hash)?;
                writer.write_le(&collection.locale)?;
                writer.write_le(index)?;
            }
        }

        let mut paths: Vec<_> = self.original_file_paths.iter().collect();
        paths.sort_by(|a, b| a.0.cmp(b.0));
        writer.write_le(&count(paths.len())?)?;
        for (path, resource) in paths {
            writer.write_le(&count(path.len())?)?;
            writer.write_all(path.as_bytes())?;
            write_key(&mut writer, *resource)?;
        }

        let mut sounds: Vec<_> = self.sound_usages.iter().collect();
        sounds.sort_by_key(|(id, _)| **id);
        writer.write_le(&count(sounds.len())?)?;
        for (sound_id, usages) in sounds {
            writer.write_le(sound_id)?;
            writer.write_le(&count(usages.len())?)?;
            for usage in usages {
                writer.write_le(&usage.bank_resource_id)?;
                writer.write_le(&usage.ref_type)?;
                writer.write_le(&usage.index)?;
            }
        }
        writer.flush()?;

        debug!(
            "saved usage cache to {} ({} resources, {} paths, {} sounds)",
            path.display(),
            self.usages.len(),
            self.original_file_paths.len(),
            self.sound_usages.len()
        );
        Ok(())
    }

    /// Load a persisted cache.
    ///
    /// A missing, stale or unreadable file yields `Ok(None)` so the caller
    /// rebuilds from a full scan.
    pub fn load(path: &Path, format: &GameFormat, locale_mask: u64) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(path)?);

        let version: i32 = match reader.read_le() {
            Ok(version) => version,
            Err(e) => {
                warn!("usage cache {} unreadable, ignoring: {e}", path.display());
                return Ok(None);
            }
        };
        let expected = Self::persisted_version(format);
        if version != expected {
            warn!("usage cache version {version:#x} != {expected:#x}, ignoring");
            return Ok(None);
        }

        match Self::read_sections(&mut reader, locale_mask) {
            Ok(cache) => {
                debug!(
                    "loaded usage cache from {} ({} collections)",
                    path.display(),
                    cache.collections.len()
                );
                Ok(Some(cache))
            }
            Err(e) => {
                warn!("usage cache {} is corrupt, ignoring: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn read_sections<R: Read + Seek>(reader: &mut R, locale_mask: u64) -> Result<Self> {
        let mut cache = Self::new(locale_mask);

        for _ in 0..read_count(reader)? {
            let resource = read_key(reader)?;
            let mut by_collection = BTreeMap::new();
            for _ in 0..read_count(reader)? {
                let name_hash: u64 = reader.read_le()?;
                let locale: u64 = reader.read_le()?;
                let index: u32 = reader.read_le()?;
                let collection = ArchiveFileKey::new(name_hash, locale);
                by_collection.insert(collection, index);
                cache.collections.entry(collection).or_default().push(resource);
            }
            cache.usages.insert(resource, by_collection);
        }

        for _ in 0..read_count(reader)? {
            let bytes = read_bytes(reader)?;
            let path = String::from_utf8(bytes)
                .map_err(|e| StorageError::Archive(format!("usage cache path: {e}")))?;
            let resource = read_key(reader)?;
            cache.original_file_paths.insert(path, resource);
        }

        for _ in 0..read_count(reader)? {
            let sound_id: u32 = reader.read_le()?;
            let usages = cache.sound_usages.entry(sound_id).or_default();
            for _ in 0..read_count(reader)? {
                usages.insert(SoundUsage {
                    bank_resource_id: reader.read_le()?,
                    ref_type: reader.read_le()?,
                    index: reader.read_le()?,
                });
            }
        }
        Ok(cache)
    }

    fn locale_passes(&self, locale: u64) -> bool {
        locale == ALL_LOCALES || locale & self.locale_mask != 0
    }

    /// A locale-agnostic usage replaces locale-specific usages of the same
    /// collection name; a locale-specific usage is ignored while a
    /// locale-agnostic one exists.
    fn insert_usage(
        &mut self,
        resource: ResourceKey,
        collection: ArchiveFileKey,
        index: u32,
    ) -> bool {
        let agnostic = collection.is_locale_agnostic();
        if !agnostic
            && self
                .usages
                .get(&resource)
                .is_some_and(|existing| existing.contains_key(&collection.unlocalized()))
        {
            return false;
        }
        let by_collection = self.usages.entry(resource).or_default();
        if agnostic {
            by_collection.retain(|existing, _| existing.name_hash != collection.name_hash);
        }
        by_collection.insert(collection, index);
        true
    }

    /// Whether a base usage from `collection` is hidden by this layer
    fn shadows(&self, collection: ArchiveFileKey) -> bool {
        self.collections.contains_key(&collection)
            || self.collections.contains_key(&collection.unlocalized())
    }
}

fn count(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| {
            StorageError::Archive(format!("usage cache section of {len} entries is too large"))
        })
}

fn read_count<R: Read + Seek>(reader: &mut R) -> Result<usize> {
    let value: i32 = reader.read_le()?;
    usize::try_from(value)
        .map_err(|_| StorageError::Archive(format!("negative usage cache count {value}")))
}

/// Length-prefixed bytes, refusing lengths past the end of the stream
fn read_bytes<R: Read + Seek>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_count(reader)?;
    let position = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(position))?;
    if len as u64 > end.saturating_sub(position) {
        return Err(StorageError::Archive(format!(
            "usage cache string of {len} bytes at {position:#x} runs past the end ({end:#x})"
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn write_key<W: Write + Seek>(writer: &mut W, key: ResourceKey) -> Result<()> {
    writer.write_le(&key.resource_type)?;
    writer.write_le(&key.sub_type)?;
    writer.write_le(&key.id)?;
    Ok(())
}

fn read_key<R: Read + Seek>(reader: &mut R) -> Result<ResourceKey> {
    let resource_type: u8 = reader.read_le()?;
    let sub_type: u8 = reader.read_le()?;
    let id: u32 = reader.read_le()?;
    Ok(ResourceKey::new(resource_type, sub_type, id))
}
