//! Overlay behaviour of an archive set folder

#![allow(clippy::expect_used, clippy::unwrap_used)]

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;
use tiger_formats::{
    ALL_LOCALES, ArchiveFileKey, ArchiveFileReference, BlobReference, CdcGame, GameFormat,
    NameResolver, ResourceCollection, ResourceKey, ResourceReference, resource_type,
};
use tiger_storage::{
    Archive, ArchiveMetaData, ArchiveSet, ArchiveSetConfig, CancellationToken, NoProgress,
    ResourceData, StorageError,
};

const BASE_ID: u32 = 1;
const LOW_MOD_ID: u32 = 10;
const HIGH_MOD_ID: u32 = 20;

const SHARED_TEXTURE: u32 = 500;
const BASE_COLLECTION: u64 = 0xC1;
const LOW_MOD_COLLECTION: u64 = 0xB0;
const HIGH_MOD_COLLECTION: u64 = 0xA0;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn format() -> GameFormat {
    GameFormat::for_game(CdcGame::Shadow)
}

fn config(dir: &Path) -> ArchiveSetConfig {
    ArchiveSetConfig::new(dir, CdcGame::Shadow)
}

fn texture(archive: &mut Archive, id: u32, payload: &[u8]) -> ResourceReference {
    let blob = archive.add_resource(ResourceData::Payload(payload)).unwrap();
    ResourceReference {
        blob,
        resource_type: resource_type::TEXTURE,
        sub_type: 0,
        id,
        locale: ALL_LOCALES,
        offset_in_batch: 0,
        ref_definitions_size: Some(0),
        body_size: payload.len() as u32,
    }
}

fn add_collection(
    archive: &mut Archive,
    name_hash: u64,
    references: &[ResourceReference],
) -> ArchiveFileReference {
    let key = ArchiveFileKey::new(name_hash, ALL_LOCALES);
    let mut collection = ResourceCollection::new(format(), key);
    for reference in references {
        collection.add_resource_reference(reference).unwrap();
    }
    archive
        .add_file(name_hash, ALL_LOCALES, &collection.to_bytes().unwrap())
        .unwrap()
}

fn mod_metadata(dir: &Path, id: u32, version: u32) -> ArchiveMetaData {
    ArchiveMetaData::new(dir, id).with_version(version)
}

/// Base archive owning the shared texture plus a higher mod that only
/// references it. Returns the base copy of the texture.
fn seed_folder(dir: &Path) -> ResourceReference {
    let mut base =
        Archive::create(dir.join("base.000.tiger"), format(), BASE_ID, 0, None, 4).unwrap();
    let shared = texture(&mut base, SHARED_TEXTURE, &[0x11; 600]);
    add_collection(&mut base, BASE_COLLECTION, &[shared]);

    let mut high = Archive::create(
        dir.join("high.000.tiger"),
        format(),
        HIGH_MOD_ID,
        0,
        Some(mod_metadata(dir, HIGH_MOD_ID, 2)),
        4,
    )
    .unwrap();
    add_collection(&mut high, HIGH_MOD_COLLECTION, &[shared]);

    shared
}

/// Lower mod that ships its own copy of the shared texture
fn low_mod(dir: &Path) -> (Archive, ResourceReference) {
    let mut low = Archive::create(
        dir.join("low.000.tiger"),
        format(),
        LOW_MOD_ID,
        0,
        Some(mod_metadata(dir, LOW_MOD_ID, 1)),
        4,
    )
    .unwrap();
    let replacement = texture(&mut low, SHARED_TEXTURE, &[0x22; 700]);
    add_collection(&mut low, LOW_MOD_COLLECTION, &[replacement]);
    (low, replacement)
}

fn high_mod_target(set: &ArchiveSet) -> BlobReference {
    let collection = set
        .resource_collection(ArchiveFileKey::new(HIGH_MOD_COLLECTION, ALL_LOCALES))
        .unwrap()
        .unwrap();
    collection.resource_references()[0].blob
}

fn sorted_ids(set: &ArchiveSet) -> Vec<u32> {
    set.sorted_archives().iter().map(|a| a.id).collect()
}

#[test]
fn open_discovers_archives_in_priority_order() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());

    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
    assert!(set.duplicates().is_empty());
    assert!(dir.path().join("resourceusage.bin").exists());

    let shared = ResourceKey::new(resource_type::TEXTURE, 0, SHARED_TEXTURE);
    let usages: Vec<u64> = set
        .resource_usages(shared)
        .iter()
        .map(|u| u.collection.name_hash)
        .collect();
    assert_eq!(usages, vec![BASE_COLLECTION, HIGH_MOD_COLLECTION]);
}

#[test]
fn adding_a_mod_relinks_higher_collections() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    assert_eq!(high_mod_target(&set), original.blob);

    let (low, replacement) = low_mod(dir.path());
    let report = set.add(low, &CancellationToken::new(), &NoProgress).unwrap();

    assert_eq!(sorted_ids(&set), vec![BASE_ID, LOW_MOD_ID, HIGH_MOD_ID]);
    assert_eq!(report.collections_scanned, 2);
    assert_eq!(report.collections_rewritten, 1);
    assert_eq!(report.references_rewritten, 1);
    assert_eq!(high_mod_target(&set), replacement.blob);

    // The base collection sits below the new mod and keeps its own copy
    let base = set
        .resource_collection(ArchiveFileKey::new(BASE_COLLECTION, ALL_LOCALES))
        .unwrap()
        .unwrap();
    assert_eq!(base.resource_references()[0].blob, original.blob);
}

#[test]
fn second_full_pass_rewrites_nothing() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    let (low, _) = low_mod(dir.path());
    set.add(low, &CancellationToken::new(), &NoProgress).unwrap();

    set.update_resource_references(&CancellationToken::new(), &NoProgress)
        .unwrap();
    let again = set
        .update_resource_references(&CancellationToken::new(), &NoProgress)
        .unwrap();
    assert_eq!(again.collections_scanned, 3);
    assert_eq!(again.collections_rewritten, 0);
    assert_eq!(again.references_rewritten, 0);
}

#[test]
fn disable_falls_back_and_enable_restores() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    let (low, replacement) = low_mod(dir.path());
    set.add(low, &CancellationToken::new(), &NoProgress).unwrap();

    let report = set
        .disable(LOW_MOD_ID, &CancellationToken::new(), &NoProgress)
        .unwrap();
    assert_eq!(report.references_rewritten, 1);
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
    assert_eq!(high_mod_target(&set), original.blob);
    assert!(
        set.file(ArchiveFileKey::new(LOW_MOD_COLLECTION, ALL_LOCALES))
            .is_none()
    );

    let saved = ArchiveMetaData::load(&ArchiveMetaData::path_for(dir.path(), LOW_MOD_ID))
        .unwrap()
        .unwrap();
    assert!(!saved.enabled);

    set.enable(LOW_MOD_ID, &CancellationToken::new(), &NoProgress)
        .unwrap();
    assert_eq!(high_mod_target(&set), replacement.blob);
}

#[test]
fn disabled_state_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    {
        let set =
            ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
        let (low, _) = low_mod(dir.path());
        set.add(low, &CancellationToken::new(), &NoProgress).unwrap();
        set.disable(LOW_MOD_ID, &CancellationToken::new(), &NoProgress)
            .unwrap();
    }

    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    assert_eq!(set.archives().len(), 3);
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
}

#[test]
fn delete_removes_files_and_falls_back() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    let (low, _) = low_mod(dir.path());
    set.add(low, &CancellationToken::new(), &NoProgress).unwrap();

    set.delete(LOW_MOD_ID, &CancellationToken::new(), &NoProgress)
        .unwrap();

    assert_eq!(set.archives().len(), 2);
    assert!(!dir.path().join("low.000.tiger").exists());
    assert!(!dir.path().join("low.001.tiger").exists());
    assert!(!ArchiveMetaData::path_for(dir.path(), LOW_MOD_ID).exists());
    assert_eq!(high_mod_target(&set), original.blob);

    let err = set
        .delete(LOW_MOD_ID, &CancellationToken::new(), &NoProgress)
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[test]
fn base_archives_cannot_be_toggled() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let err = set
        .disable(BASE_ID, &CancellationToken::new(), &NoProgress)
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    let err = set
        .delete(BASE_ID, &CancellationToken::new(), &NoProgress)
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
}

#[test]
fn install_links_new_archive() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let installed = Mutex::new(None);
    let report = set
        .install_archive(
            "installed",
            LOW_MOD_ID,
            0,
            ArchiveMetaData::new(dir.path(), LOW_MOD_ID)
                .with_version(1)
                .with_name("texture pack"),
            4,
            |archive| {
                let replacement = texture(archive, SHARED_TEXTURE, &[0x33; 128]);
                add_collection(archive, LOW_MOD_COLLECTION, &[replacement]);
                *installed.lock() = Some(replacement);
                Ok(())
            },
            &CancellationToken::new(),
            &NoProgress,
        )
        .unwrap();

    let replacement = installed.lock().unwrap();
    assert_eq!(report.collections_rewritten, 1);
    assert_eq!(sorted_ids(&set), vec![BASE_ID, LOW_MOD_ID, HIGH_MOD_ID]);
    assert_eq!(high_mod_target(&set), replacement.blob);

    let info = set
        .sorted_archives()
        .into_iter()
        .find(|a| a.id == LOW_MOD_ID)
        .unwrap();
    assert_eq!(info.metadata.unwrap().name.as_deref(), Some("texture pack"));
    assert!(dir.path().join("installed.000.tiger").exists());
}

#[test]
fn failed_install_leaves_no_trace() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let err = set
        .install_archive(
            "broken",
            LOW_MOD_ID,
            0,
            ArchiveMetaData::new(dir.path(), LOW_MOD_ID),
            4,
            |archive| {
                archive.add_file(0x99, ALL_LOCALES, b"partial")?;
                Err(StorageError::Archive("package truncated".into()))
            },
            &CancellationToken::new(),
            &NoProgress,
        )
        .unwrap_err();

    assert!(matches!(err, StorageError::Archive(_)));
    assert!(!dir.path().join("broken.000.tiger").exists());
    assert!(!dir.path().join("broken.001.tiger").exists());
    assert!(!ArchiveMetaData::path_for(dir.path(), LOW_MOD_ID).exists());
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
    assert_eq!(high_mod_target(&set), original.blob);
}

#[test]
fn install_rejects_taken_id() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let err = set
        .install_archive(
            "again",
            HIGH_MOD_ID,
            0,
            ArchiveMetaData::new(dir.path(), HIGH_MOD_ID),
            1,
            |_| Ok(()),
            &CancellationToken::new(),
            &NoProgress,
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    assert!(ArchiveMetaData::path_for(dir.path(), HIGH_MOD_ID).exists());
}

#[test]
fn structural_operations_are_exclusive() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let nested = Mutex::new(Vec::new());
    let progress = |_fraction: f32| {
        let outcome = set.disable(HIGH_MOD_ID, &CancellationToken::new(), &NoProgress);
        nested.lock().push(matches!(outcome, Err(StorageError::Busy(_))));
    };
    set.update_resource_references(&CancellationToken::new(), &progress)
        .unwrap();

    let nested = nested.lock();
    assert!(!nested.is_empty());
    assert!(nested.iter().all(|busy| *busy));
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
}

#[test]
fn usage_cache_rebuild_reports_under_the_set_lock() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let nested = Mutex::new(Vec::new());
    let progress = |_fraction: f32| {
        let outcome = set.update_resource_references(&CancellationToken::new(), &NoProgress);
        nested.lock().push(matches!(outcome, Err(StorageError::Busy(_))));
    };
    set.rebuild_usage_cache(&CancellationToken::new(), &progress).unwrap();

    let nested = nested.lock();
    assert!(!nested.is_empty());
    assert!(nested.iter().all(|busy| *busy));
}

#[test]
fn cancelled_pass_keeps_set_usable() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = set.update_resource_references(&token, &NoProgress).unwrap_err();
    assert!(err.is_cancelled());

    assert_eq!(high_mod_target(&set), original.blob);
    let report = set
        .update_resource_references(&CancellationToken::new(), &NoProgress)
        .unwrap();
    assert_eq!(report.collections_scanned, 2);
}

#[test]
fn cancelled_open_fails() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());

    let token = CancellationToken::new();
    token.cancel();
    let err = ArchiveSet::open(config(dir.path()), &token, &NoProgress).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!dir.path().join("resourceusage.bin").exists());
}

#[test]
fn corrupt_usage_cache_is_rebuilt() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    let cache = dir.path().join("resourceusage.bin");
    std::fs::write(&cache, b"not a usage cache").unwrap();

    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    let shared = ResourceKey::new(resource_type::TEXTURE, 0, SHARED_TEXTURE);
    assert_eq!(set.resource_usages(shared).len(), 2);
    assert_ne!(std::fs::read(&cache).unwrap(), b"not a usage cache");
    drop(set);

    let reopened =
        ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    assert_eq!(reopened.resource_usages(shared).len(), 2);
}

#[test]
fn duplicate_archives_stay_out_of_the_overlay() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_folder(dir.path());
    std::fs::copy(
        dir.path().join("base.000.tiger"),
        dir.path().join("base_copy.000.tiger"),
    )
    .unwrap();

    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();
    let duplicates = set.duplicates();
    assert_eq!(duplicates.len(), 1);
    assert!(duplicates[0].path.ends_with("base_copy.000.tiger"));
    assert_eq!(sorted_ids(&set), vec![BASE_ID, HIGH_MOD_ID]);
}

struct TableResolver;

impl NameResolver for TableResolver {
    fn hash(&self, path: &str) -> u64 {
        match path {
            "pc-w\\shared.drm" => HIGH_MOD_COLLECTION,
            _ => 0,
        }
    }

    fn name(&self, name_hash: u64) -> Option<String> {
        (name_hash == HIGH_MOD_COLLECTION).then(|| "pc-w\\shared.drm".to_string())
    }
}

#[test]
fn lookups_by_path_and_reads() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = seed_folder(dir.path());
    let set = ArchiveSet::open(config(dir.path()), &CancellationToken::new(), &NoProgress).unwrap();

    let file = set
        .file_by_path(&TableResolver, "pc-w\\shared.drm", 0x4)
        .unwrap();
    assert_eq!(file.blob.archive_id, HIGH_MOD_ID);
    assert!(set.file_by_path(&TableResolver, "missing.drm", ALL_LOCALES).is_none());
    assert!(!set.read_file(&file).unwrap().is_empty());

    let stream = set.open_resource(&original).unwrap();
    assert_eq!(stream.payload(), &[0x11; 600][..]);

    set.close_streams();
    assert_eq!(set.open_resource(&original).unwrap().payload().len(), 600);
}
