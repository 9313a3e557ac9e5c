//! Flattened file namespace of an overlay

use std::collections::{BTreeMap, HashMap};
use tiger_formats::{ALL_LOCALES, ArchiveFileKey, ArchiveFileReference};

#[derive(Debug, Clone, Copy)]
struct Entry {
    layer: usize,
    file: ArchiveFileReference,
}

/// "What you get if you open this file now" for a stack of archives.
///
/// Layers are inserted lowest priority first. Within one layer a
/// locale-agnostic entry hides locale-specific entries of the same name. A
/// later layer's locale-agnostic entry replaces every earlier entry of that
/// name, while a locale-specific entry only replaces the same locale.
#[derive(Debug, Clone, Default)]
pub struct FileMap {
    entries: HashMap<u64, BTreeMap<u64, Entry>>,
    layers: usize,
}

impl FileMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the files of the next higher-priority archive
    pub fn push_layer(&mut self, files: &[ArchiveFileReference]) {
        let layer = self.layers;
        self.layers += 1;

        for file in files.iter().filter(|f| f.locale == ALL_LOCALES) {
            let by_locale = self.entries.entry(file.name_hash).or_default();
            by_locale.clear();
            by_locale.insert(ALL_LOCALES, Entry { layer, file: *file });
        }

        for file in files.iter().filter(|f| f.locale != ALL_LOCALES) {
            let by_locale = self.entries.entry(file.name_hash).or_default();
            let shadowed = by_locale
                .get(&ALL_LOCALES)
                .is_some_and(|entry| entry.layer == layer);
            if !shadowed {
                by_locale.insert(file.locale, Entry { layer, file: *file });
            }
        }
    }

    /// Resolve `key`: the exact locale first, then the locale-agnostic entry
    pub fn get(&self, key: ArchiveFileKey) -> Option<&ArchiveFileReference> {
        let by_locale = self.entries.get(&key.name_hash)?;
        by_locale
            .get(&key.locale)
            .or_else(|| by_locale.get(&ALL_LOCALES))
            .map(|entry| &entry.file)
    }

    /// Every visible file
    pub fn iter(&self) -> impl Iterator<Item = &ArchiveFileReference> + '_ {
        self.entries
            .values()
            .flat_map(|by_locale| by_locale.values().map(|entry| &entry.file))
    }

    /// Number of visible files
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// True when no file is visible
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiger_formats::BlobReference;

    fn file(archive_id: u32, name_hash: u64, locale: u64) -> ArchiveFileReference {
        ArchiveFileReference {
            blob: BlobReference {
                archive_id,
                ..Default::default()
            },
            name_hash,
            locale,
        }
    }

    #[test]
    fn later_layer_wins() {
        let mut map = FileMap::new();
        map.push_layer(&[file(1, 0xA, ALL_LOCALES)]);
        map.push_layer(&[file(2, 0xA, ALL_LOCALES)]);
        let winner = map.get(ArchiveFileKey::new(0xA, ALL_LOCALES));
        assert_eq!(winner.map(|f| f.blob.archive_id), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn agnostic_entry_shadows_same_layer_locale() {
        let mut map = FileMap::new();
        map.push_layer(&[file(1, 0xA, 0x4), file(1, 0xA, ALL_LOCALES)]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(ArchiveFileKey::new(0xA, 0x4)).map(|f| f.locale), Some(ALL_LOCALES));
    }

    #[test]
    fn locale_entry_overrides_only_its_locale() {
        let mut map = FileMap::new();
        map.push_layer(&[file(1, 0xA, ALL_LOCALES)]);
        map.push_layer(&[file(2, 0xA, 0x4)]);

        assert_eq!(map.get(ArchiveFileKey::new(0xA, 0x4)).map(|f| f.blob.archive_id), Some(2));
        assert_eq!(map.get(ArchiveFileKey::new(0xA, 0x8)).map(|f| f.blob.archive_id), Some(1));

        map.push_layer(&[file(3, 0xA, ALL_LOCALES)]);
        assert_eq!(map.get(ArchiveFileKey::new(0xA, 0x4)).map(|f| f.blob.archive_id), Some(3));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn missing_name() {
        let map = FileMap::new();
        assert!(map.get(ArchiveFileKey::new(1, 1)).is_none());
        assert!(map.is_empty());
    }
}
