//! Folder-wide overlay of base and mod archives
//!
//! An [`ArchiveSet`] owns every archive found in one folder. Base game
//! archives sit at the bottom, enabled mod archives are stacked on top in
//! priority order. Structural changes (add, enable, disable, delete,
//! install) re-link the collections of every archive at or above the
//! changed position so each resource reference points at the
//! highest-priority copy of that resource.

use crate::archive::{Archive, INDEX_SUFFIX, ResourceStream, WriteOptions};
use crate::config::ArchiveSetConfig;
use crate::file_map::FileMap;
use crate::metadata::ArchiveMetaData;
use crate::progress::{CancellationToken, NoProgress, Progress, ProgressTracker, ScaledProgress};
use crate::usage_cache::{ResourceUsage, ResourceUsageCache};
use crate::{Result, StorageError};
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiger_formats::{
    ArchiveFileKey, ArchiveFileReference, GameFormat, NameResolver, ResourceCollection, ResourceKey,
    ResourceReference,
};
use tracing::{debug, info, warn};

/// Fields that decide where an archive sits in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriorityKey {
    /// Archive id
    pub id: u32,
    /// Archive sub id
    pub sub_id: u32,
    /// Base game archives sort below every mod archive
    pub is_mod: bool,
    /// Metadata version
    pub version: u32,
    /// Metadata required flag
    pub required: bool,
    /// Metadata package id
    pub package_id: u32,
    /// Metadata chunk id
    pub chunk_id: u32,
}

impl PriorityKey {
    /// Priority fields of `archive`; base archives use zeroes
    pub fn of(archive: &Archive) -> Self {
        let metadata = archive.metadata();
        Self {
            id: archive.id(),
            sub_id: archive.sub_id(),
            is_mod: metadata.is_some(),
            version: metadata.map_or(0, |m| m.version),
            required: metadata.is_some_and(|m| m.required),
            package_id: metadata.map_or(0, |m| m.package_id),
            chunk_id: metadata.map_or(0, |m| m.chunk_id),
        }
    }

    /// Order two keys, lowest priority first.
    ///
    /// Built-in archives of the game come first and keep their relative
    /// order. Everything else sorts by base-before-mod, version, required
    /// (non-required first), package, chunk, sub id and finally id.
    pub fn compare(&self, other: &Self, format: &GameFormat) -> Ordering {
        let builtin_a = format.is_builtin_archive(self.id);
        let builtin_b = format.is_builtin_archive(other.id);
        match (builtin_a, builtin_b) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self
                .is_mod
                .cmp(&other.is_mod)
                .then(self.version.cmp(&other.version))
                .then(self.required.cmp(&other.required))
                .then(self.package_id.cmp(&other.package_id))
                .then(self.chunk_id.cmp(&other.chunk_id))
                .then(self.sub_id.cmp(&other.sub_id))
                .then(self.id.cmp(&other.id)),
        }
    }
}

/// Stable sort of `keys` into overlay order, lowest priority first
pub fn sort_by_priority(keys: &mut [PriorityKey], format: &GameFormat) {
    keys.sort_by(|a, b| a.compare(b, format));
}

/// Snapshot of one archive of the set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Archive id
    pub id: u32,
    /// Archive sub id
    pub sub_id: u32,
    /// Index part path
    pub path: PathBuf,
    /// Side metadata, `None` for base archives
    pub metadata: Option<ArchiveMetaData>,
    /// Files stored
    pub file_count: usize,
    /// File slots available
    pub capacity: usize,
}

impl ArchiveInfo {
    fn of(archive: &Archive) -> Self {
        Self {
            id: archive.id(),
            sub_id: archive.sub_id(),
            path: archive.path().to_path_buf(),
            metadata: archive.metadata().cloned(),
            file_count: archive.files().len(),
            capacity: archive.capacity(),
        }
    }
}

/// Outcome of a re-link pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelinkReport {
    /// Collections parsed
    pub collections_scanned: usize,
    /// Collections written back because a reference changed
    pub collections_rewritten: usize,
    /// Individual references redirected
    pub references_rewritten: usize,
}

struct SetState {
    archives: Vec<Archive>,
    duplicates: Vec<Archive>,
    files: FileMap,
    base_usage: Arc<ResourceUsageCache>,
    usage: ResourceUsageCache,
}

/// Lookup tables shared by every collection of one re-link pass
struct RelinkContext {
    sorted: Vec<usize>,
    rank: HashMap<usize, usize>,
    active_ids: HashSet<u32>,
    by_location: HashMap<(u32, u32), usize>,
    full_map: FileMap,
}

impl RelinkContext {
    fn new(archives: &[Archive], sorted: Vec<usize>) -> Self {
        let mut full_map = FileMap::new();
        for &index in &sorted {
            full_map.push_layer(archives[index].files());
        }
        Self {
            rank: sorted.iter().enumerate().map(|(rank, &index)| (index, rank)).collect(),
            active_ids: sorted.iter().map(|&index| archives[index].id()).collect(),
            by_location: archives
                .iter()
                .enumerate()
                .map(|(index, archive)| ((archive.id(), archive.sub_id()), index))
                .collect(),
            sorted,
            full_map,
        }
    }
}

impl SetState {
    /// Indices of enabled archives, lowest priority first
    fn sorted(&self, format: &GameFormat) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.archives.len())
            .filter(|&index| self.archives[index].is_enabled())
            .collect();
        indices.sort_by(|&a, &b| {
            PriorityKey::of(&self.archives[a]).compare(&PriorityKey::of(&self.archives[b]), format)
        });
        indices
    }

    fn file_map(&self, sorted: &[usize]) -> FileMap {
        let mut files = FileMap::new();
        for &index in sorted {
            files.push_layer(self.archives[index].files());
        }
        files
    }

    fn archive(&self, archive_id: u32, archive_sub_id: u32) -> Option<&Archive> {
        self.archives
            .iter()
            .find(|a| a.id() == archive_id && a.sub_id() == archive_sub_id)
    }

    fn contains(&self, archive_id: u32, archive_sub_id: u32) -> bool {
        self.archives
            .iter()
            .chain(&self.duplicates)
            .any(|a| a.id() == archive_id && a.sub_id() == archive_sub_id)
    }

    /// Re-link every collection of `sorted[start..]`.
    ///
    /// On failure the file map is rebuilt from the complete new ordering and
    /// the usage cache is left as it was.
    fn relink(
        &mut self,
        sorted: Vec<usize>,
        start: usize,
        locale_mask: u64,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let context = RelinkContext::new(&self.archives, sorted);
        match self.relink_pass(&context, start, locale_mask, token, progress) {
            Ok((files, usage, report)) => {
                self.files = files;
                self.usage = usage;
                info!(
                    "re-linked from position {start}: {} collections scanned, {} rewritten, \
                     {} references redirected",
                    report.collections_scanned,
                    report.collections_rewritten,
                    report.references_rewritten
                );
                Ok(report)
            }
            Err(e) => {
                self.files = context.full_map;
                Err(e)
            }
        }
    }

    fn relink_pass(
        &self,
        context: &RelinkContext,
        start: usize,
        locale_mask: u64,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<(FileMap, ResourceUsageCache, RelinkReport)> {
        let start = start.min(context.sorted.len());
        let (untouched, relinked) = context.sorted.split_at(start);

        let mut files = FileMap::new();
        let mut usage = ResourceUsageCache::with_base(Arc::clone(&self.base_usage), locale_mask);
        for &index in untouched {
            let archive = &self.archives[index];
            files.push_layer(archive.files());
            if archive.is_mod() {
                usage.add_archive(archive, token, &NoProgress)?;
            }
        }

        let total = relinked.iter().map(|&index| self.archives[index].files().len()).sum();
        let mut tracker = ProgressTracker::new(progress, total);
        let mut overrides: HashMap<ResourceKey, ResourceReference> = HashMap::new();
        let mut report = RelinkReport::default();

        for &index in relinked {
            let archive = &self.archives[index];
            files.push_layer(archive.files());

            for file in archive.files() {
                token.check()?;
                let Some(mut collection) = archive.get_resource_collection(file)? else {
                    tracker.step();
                    continue;
                };
                report.collections_scanned += 1;

                let mut redirected = 0;
                for (entry, reference) in collection.resource_references().into_iter().enumerate() {
                    let key = reference.key();
                    if reference.blob.archive_id == archive.id() {
                        overrides.insert(key, reference);
                        continue;
                    }

                    let replacement = if let Some(canonical) = overrides.get(&key) {
                        Some(*canonical)
                    } else if context.active_ids.contains(&reference.blob.archive_id) {
                        None
                    } else {
                        let found = self.resolve_fallback(context, key)?;
                        if found.is_none() {
                            warn!(
                                "collection {:#018x} references resource {key:?} in inactive \
                                 archive {} and no active copy exists",
                                file.name_hash,
                                reference.blob.archive_id
                            );
                        }
                        found
                    };

                    if let Some(mut target) = replacement {
                        if target.same_location(&reference) {
                            continue;
                        }
                        target.sub_type = reference.sub_type;
                        target.locale = reference.locale;
                        collection.update_resource_reference(entry, &target)?;
                        redirected += 1;
                    }
                }

                if redirected > 0 {
                    archive.rewrite_file(file, &collection.to_bytes()?)?;
                    debug!(
                        "rewrote collection {:#018x} in archive {} ({redirected} references)",
                        file.name_hash,
                        archive.id()
                    );
                    report.collections_rewritten += 1;
                    report.references_rewritten += redirected;
                }

                usage.add_resource_collection(&collection);
                tracker.step();
            }
        }

        tracker.finish();
        Ok((files, usage, report))
    }

    /// Highest-priority active copy of `key` reachable through the usage cache
    fn resolve_fallback(
        &self,
        context: &RelinkContext,
        key: ResourceKey,
    ) -> Result<Option<ResourceReference>> {
        let mut best: Option<(usize, ResourceReference)> = None;
        for ResourceUsage { collection, index } in self.usage.get_resource_usages(key) {
            let Some(file) = context.full_map.get(collection) else {
                continue;
            };
            let Some(&owner) = context
                .by_location
                .get(&(file.blob.archive_id, file.blob.archive_sub_id))
            else {
                continue;
            };
            let Some(&rank) = context.rank.get(&owner) else {
                continue;
            };
            if best.as_ref().is_some_and(|(best_rank, _)| *best_rank >= rank) {
                continue;
            }

            let Some(parsed) = self.archives[owner].get_resource_collection(file)? else {
                continue;
            };
            let Some(candidate) = parsed.resource_reference(index as usize) else {
                continue;
            };
            if candidate.key() == key && context.active_ids.contains(&candidate.blob.archive_id) {
                best = Some((rank, candidate));
            }
        }
        Ok(best.map(|(_, reference)| reference))
    }
}

/// Every archive of one folder, stacked into an overlay.
///
/// Lookups take the set lock for the duration of the call. Structural
/// operations take it without waiting and fail with [`StorageError::Busy`]
/// while another one is running. Progress callbacks run with the lock held
/// and must not perform lookups on the same set.
pub struct ArchiveSet {
    config: ArchiveSetConfig,
    format: GameFormat,
    state: Mutex<SetState>,
}

impl std::fmt::Debug for ArchiveSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSet")
            .field("folder", &self.config.folder)
            .field("game", &self.format.game)
            .finish_non_exhaustive()
    }
}

impl ArchiveSet {
    /// Discover and open every archive in the configured folder.
    ///
    /// The base usage cache is loaded from disk, or rebuilt from the base
    /// archives and saved when it is missing or stale.
    pub fn open(
        config: ArchiveSetConfig,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<Self> {
        let format = config.format();
        let options = write_options(&config);

        let mut paths: Vec<PathBuf> = fs::read_dir(&config.folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_index_part(path))
            .collect();
        paths.sort();

        let mut metadata_by_id: HashMap<u32, Option<ArchiveMetaData>> = HashMap::new();
        let mut archives: Vec<Archive> = Vec::new();
        let mut duplicates = Vec::new();

        for path in paths {
            let mut archive = Archive::open(&path, format, None)?;
            let id = archive.id();
            let metadata = if let Some(known) = metadata_by_id.get(&id) {
                known.clone()
            } else {
                let loaded = ArchiveMetaData::load(&ArchiveMetaData::path_for(&config.folder, id))?;
                metadata_by_id.insert(id, loaded.clone());
                loaded
            };
            archive.set_metadata(metadata);
            archive.set_write_options(options);

            if archives
                .iter()
                .any(|a| a.id() == id && a.sub_id() == archive.sub_id())
            {
                warn!(
                    "duplicate archive {} (id={id}, sub_id={}), keeping the first",
                    path.display(),
                    archive.sub_id()
                );
                duplicates.push(archive);
            } else {
                archives.push(archive);
            }
        }

        let mut state = SetState {
            archives,
            duplicates,
            files: FileMap::new(),
            base_usage: Arc::new(ResourceUsageCache::new(config.locale_mask)),
            usage: ResourceUsageCache::new(config.locale_mask),
        };
        let sorted = state.sorted(&format);

        let cache_path = config.usage_cache_path();
        let base_usage = match ResourceUsageCache::load(&cache_path, &format, config.locale_mask)? {
            Some(cache) => cache,
            None => {
                let mut cache = ResourceUsageCache::new(config.locale_mask);
                let base: Vec<&Archive> = state
                    .sorted(&format)
                    .into_iter()
                    .map(|index| &state.archives[index])
                    .filter(|archive| !archive.is_mod())
                    .collect();
                cache.add_archive_set(&base, token, &ScaledProgress::new(progress, 0.0, 0.8))?;
                cache.save(&cache_path, &format)?;
                cache
            }
        };
        state.base_usage = Arc::new(base_usage);

        let mut usage =
            ResourceUsageCache::with_base(Arc::clone(&state.base_usage), config.locale_mask);
        let mods: Vec<&Archive> = sorted
            .iter()
            .map(|&index| &state.archives[index])
            .filter(|archive| archive.is_mod())
            .collect();
        usage.add_archive_set(&mods, token, &ScaledProgress::new(progress, 0.8, 0.2))?;
        state.usage = usage;
        state.files = state.file_map(&sorted);

        info!(
            "opened archive set {} ({} archives, {} enabled, {} duplicates)",
            config.folder.display(),
            state.archives.len(),
            sorted.len(),
            state.duplicates.len()
        );
        progress.report(1.0);

        Ok(Self {
            config,
            format,
            state: Mutex::new(state),
        })
    }

    /// Format of every archive in the set
    pub const fn format(&self) -> &GameFormat {
        &self.format
    }

    /// Configuration the set was opened with
    pub const fn config(&self) -> &ArchiveSetConfig {
        &self.config
    }

    /// Enabled archives, lowest priority first
    pub fn sorted_archives(&self) -> Vec<ArchiveInfo> {
        let state = self.state.lock();
        state
            .sorted(&self.format)
            .into_iter()
            .map(|index| ArchiveInfo::of(&state.archives[index]))
            .collect()
    }

    /// Every archive, enabled or not, in discovery order
    pub fn archives(&self) -> Vec<ArchiveInfo> {
        self.state.lock().archives.iter().map(ArchiveInfo::of).collect()
    }

    /// Archives whose (id, sub id) was already taken
    pub fn duplicates(&self) -> Vec<ArchiveInfo> {
        self.state.lock().duplicates.iter().map(ArchiveInfo::of).collect()
    }

    /// Run `f` against the archive with the given id and sub id
    pub fn with_archive<T>(
        &self,
        id: u32,
        sub_id: u32,
        f: impl FnOnce(&Archive) -> T,
    ) -> Option<T> {
        let state = self.state.lock();
        state.archive(id, sub_id).map(f)
    }

    /// Visible file for `key`
    pub fn file(&self, key: ArchiveFileKey) -> Option<ArchiveFileReference> {
        self.state.lock().files.get(key).copied()
    }

    /// Visible file for a path hashed by `resolver`
    pub fn file_by_path(
        &self,
        resolver: &dyn NameResolver,
        path: &str,
        locale: u64,
    ) -> Option<ArchiveFileReference> {
        self.file(ArchiveFileKey::new(resolver.hash(path), locale))
    }

    /// Contents of `file`
    pub fn read_file(&self, file: &ArchiveFileReference) -> Result<Vec<u8>> {
        let state = self.state.lock();
        owner(&state, file.blob.archive_id, file.blob.archive_sub_id)?.read_file(file)
    }

    /// Visible collection for `key`, `None` if absent or not a collection
    pub fn resource_collection(&self, key: ArchiveFileKey) -> Result<Option<ResourceCollection>> {
        let state = self.state.lock();
        let Some(file) = state.files.get(key).copied() else {
            return Ok(None);
        };
        owner(&state, file.blob.archive_id, file.blob.archive_sub_id)?
            .get_resource_collection(&file)
    }

    /// Decoded resource
    pub fn open_resource(&self, resource: &ResourceReference) -> Result<ResourceStream> {
        let state = self.state.lock();
        owner(&state, resource.blob.archive_id, resource.blob.archive_sub_id)?
            .open_resource(resource)
    }

    /// Collections that reference `resource`, lowest priority first
    pub fn resource_usages(&self, resource: ResourceKey) -> Vec<ResourceUsage> {
        self.state.lock().usage.get_resource_usages(resource)
    }

    /// Add an opened archive to the set.
    ///
    /// An archive whose (id, sub id) is already present is kept as a
    /// duplicate and does not take part in the overlay.
    pub fn add(
        &self,
        archive: Archive,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("add")?;
        self.add_locked(&mut state, archive, token, progress)
    }

    /// Enable every archive with `id` and re-link from its position
    pub fn enable(
        &self,
        id: u32,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("enable")?;
        Self::set_enabled(&mut state, id, true)?;

        let sorted = state.sorted(&self.format);
        let Some(start) = sorted.iter().position(|&index| state.archives[index].id() == id) else {
            return Ok(RelinkReport::default());
        };
        info!("enabled archive {id}");
        state.relink(sorted, start, self.config.locale_mask, token, progress)
    }

    /// Disable every archive with `id`.
    ///
    /// References into the archive are redirected to the next
    /// highest-priority copy found through the usage cache.
    pub fn disable(
        &self,
        id: u32,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("disable")?;
        self.disable_locked(&mut state, id, token, progress)
    }

    /// Disable and then remove every archive with `id`, deleting its files
    pub fn delete(
        &self,
        id: u32,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("delete")?;
        let report = self.disable_locked(&mut state, id, token, progress)?;

        let (removed, kept): (Vec<Archive>, Vec<Archive>) =
            state.archives.drain(..).partition(|archive| archive.id() == id);
        state.archives = kept;
        let (removed_duplicates, kept): (Vec<Archive>, Vec<Archive>) =
            state.duplicates.drain(..).partition(|archive| archive.id() == id);
        state.duplicates = kept;

        for archive in removed.into_iter().chain(removed_duplicates) {
            archive.delete()?;
        }
        ArchiveMetaData::new(&self.config.folder, id).delete()?;

        let sorted = state.sorted(&self.format);
        state.files = state.file_map(&sorted);
        info!("deleted archive {id}");
        Ok(report)
    }

    /// Create a mod archive in the set folder, fill it with `build` and add it.
    ///
    /// The archive is named `<name>.000.tiger`. When `build` or the add
    /// fails, the new archive's files are deleted again and the overlay is
    /// restored.
    #[allow(clippy::too_many_arguments)]
    pub fn install_archive(
        &self,
        name: &str,
        id: u32,
        sub_id: u32,
        metadata: ArchiveMetaData,
        max_files: usize,
        build: impl FnOnce(&mut Archive) -> Result<()>,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("install")?;
        if state.contains(id, sub_id) {
            return Err(StorageError::InvalidArgument(format!(
                "archive id={id} sub_id={sub_id} is already installed"
            )));
        }
        let shares_metadata = state
            .archives
            .iter()
            .chain(&state.duplicates)
            .any(|archive| archive.id() == id);

        let path = self.config.folder.join(format!("{name}{INDEX_SUFFIX}"));
        let metadata = metadata.for_archive(&self.config.folder, id);
        let mut archive =
            Archive::create(&path, self.format, id, sub_id, Some(metadata), max_files)?;
        archive.set_write_options(write_options(&self.config));

        if let Err(e) = build(&mut archive) {
            warn!("building archive {} failed: {e}", path.display());
            discard(archive, shares_metadata);
            return Err(e);
        }

        let position = state.archives.len();
        match self.add_locked(&mut state, archive, token, progress) {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!("adding archive {} failed: {e}", path.display());
                let start = state
                    .sorted(&self.format)
                    .iter()
                    .position(|&index| index == position);
                if position < state.archives.len() {
                    let archive = state.archives.remove(position);
                    discard(archive, shares_metadata);
                }
                let sorted = state.sorted(&self.format);
                let start = start.unwrap_or(sorted.len());
                if let Err(restore) = state.relink(
                    sorted,
                    start,
                    self.config.locale_mask,
                    &CancellationToken::new(),
                    &NoProgress,
                ) {
                    warn!("restoring the overlay after a failed install failed: {restore}");
                }
                Err(e)
            }
        }
    }

    /// Full re-link of every enabled archive
    pub fn update_resource_references(
        &self,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let mut state = self.try_lock("update references")?;
        let sorted = state.sorted(&self.format);
        state.relink(sorted, 0, self.config.locale_mask, token, progress)
    }

    /// Rescan the base archives, replacing and saving the base usage cache
    pub fn rebuild_usage_cache(
        &self,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<()> {
        let mut state = self.try_lock("rebuild usage cache")?;
        let sorted = state.sorted(&self.format);

        let mut base_usage = ResourceUsageCache::new(self.config.locale_mask);
        let base: Vec<&Archive> = sorted
            .iter()
            .map(|&index| &state.archives[index])
            .filter(|archive| !archive.is_mod())
            .collect();
        base_usage.add_archive_set(&base, token, &ScaledProgress::new(progress, 0.0, 0.8))?;
        base_usage.save(&self.config.usage_cache_path(), &self.format)?;

        let base_usage = Arc::new(base_usage);
        let mut usage =
            ResourceUsageCache::with_base(Arc::clone(&base_usage), self.config.locale_mask);
        let mods: Vec<&Archive> = sorted
            .iter()
            .map(|&index| &state.archives[index])
            .filter(|archive| archive.is_mod())
            .collect();
        usage.add_archive_set(&mods, token, &ScaledProgress::new(progress, 0.8, 0.2))?;

        state.base_usage = base_usage;
        state.usage = usage;
        Ok(())
    }

    /// Write the base usage cache to disk
    pub fn save_usage_cache(&self) -> Result<()> {
        let state = self.state.lock();
        state.base_usage.save(&self.config.usage_cache_path(), &self.format)
    }

    /// Release every open part handle
    pub fn close_streams(&self) {
        let state = self.state.lock();
        for archive in state.archives.iter().chain(&state.duplicates) {
            archive.close_streams();
        }
        debug!("closed streams of {} archives", state.archives.len());
    }

    fn try_lock(&self, operation: &str) -> Result<MutexGuard<'_, SetState>> {
        self.state
            .try_lock()
            .ok_or_else(|| {
                StorageError::Busy(format!("{operation}: another operation is in progress"))
            })
    }

    fn add_locked(
        &self,
        state: &mut SetState,
        mut archive: Archive,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        if archive.format().game != self.format.game {
            return Err(StorageError::InvalidArgument(format!(
                "archive {} is a {} archive, the set holds {}",
                archive.path().display(),
                archive.format().game,
                self.format.game
            )));
        }
        archive.set_write_options(write_options(&self.config));

        if state.contains(archive.id(), archive.sub_id()) {
            warn!(
                "archive {} duplicates id={} sub_id={}, not added to the overlay",
                archive.path().display(),
                archive.id(),
                archive.sub_id()
            );
            state.duplicates.push(archive);
            return Ok(RelinkReport::default());
        }

        let enabled = archive.is_enabled();
        info!(
            "adding archive {} (id={}, sub_id={}, enabled={enabled})",
            archive.path().display(),
            archive.id(),
            archive.sub_id()
        );
        state.archives.push(archive);
        if !enabled {
            return Ok(RelinkReport::default());
        }

        let position = state.archives.len() - 1;
        let sorted = state.sorted(&self.format);
        let start = sorted.iter().position(|&index| index == position).unwrap_or(sorted.len());
        state.relink(sorted, start, self.config.locale_mask, token, progress)
    }

    fn disable_locked(
        &self,
        state: &mut SetState,
        id: u32,
        token: &CancellationToken,
        progress: &dyn Progress,
    ) -> Result<RelinkReport> {
        let old = state.sorted(&self.format);
        let start = old.iter().position(|&index| state.archives[index].id() == id);
        Self::set_enabled(state, id, false)?;

        let Some(start) = start else {
            return Ok(RelinkReport::default());
        };
        info!("disabled archive {id}");
        let sorted = state.sorted(&self.format);
        state.relink(sorted, start, self.config.locale_mask, token, progress)
    }

    /// Flip the enable flag of every archive with `id` and save it once
    fn set_enabled(state: &mut SetState, id: u32, enabled: bool) -> Result<()> {
        let mut found = false;
        let mut saved = false;
        for archive in state.archives.iter_mut().chain(state.duplicates.iter_mut()) {
            if archive.id() != id {
                continue;
            }
            found = true;
            let Some(metadata) = archive.metadata_mut() else {
                return Err(StorageError::InvalidArgument(format!(
                    "archive {id} is a base archive and cannot be enabled or disabled"
                )));
            };
            metadata.enabled = enabled;
            if !saved {
                metadata.save()?;
                saved = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("archive {id}")))
        }
    }
}

fn owner(state: &SetState, archive_id: u32, archive_sub_id: u32) -> Result<&Archive> {
    state
        .archive(archive_id, archive_sub_id)
        .ok_or_else(|| {
            StorageError::NotFound(format!("archive id={archive_id} sub_id={archive_sub_id}"))
        })
}

fn write_options(config: &ArchiveSetConfig) -> WriteOptions {
    WriteOptions {
        compression_level: config.compression_level,
        chunk_size: config.chunk_size,
    }
}

fn is_index_part(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(INDEX_SUFFIX))
}

/// Delete a half-installed archive, keeping metadata other sub archives use
fn discard(mut archive: Archive, keep_metadata: bool) {
    if keep_metadata {
        archive.set_metadata(None);
    }
    let path = archive.path().to_path_buf();
    if let Err(e) = archive.delete() {
        warn!("failed to remove archive {}: {e}", path.display());
    }
}
