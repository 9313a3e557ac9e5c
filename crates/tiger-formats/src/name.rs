//! Name hashing capability
//!
//! Archive files are addressed by a hash of their path. The hash function and
//! any reverse lookup table are game specific and owned by the caller.

/// Maps paths to name hashes and back
pub trait NameResolver: Send + Sync {
    /// Hash of `path` as stored in archive records
    fn hash(&self, path: &str) -> u64;

    /// Path that produced `name_hash`, when known
    fn name(&self, name_hash: u64) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TableResolver(HashMap<u64, String>);

    impl NameResolver for TableResolver {
        fn hash(&self, path: &str) -> u64 {
            path.bytes()
                .fold(0xCBF2_9CE4_8422_2325, |hash, b| {
                    (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01B3)
                })
        }

        fn name(&self, name_hash: u64) -> Option<String> {
            self.0.get(&name_hash).cloned()
        }
    }

    #[test]
    fn resolver_is_object_safe() {
        let mut table = TableResolver(HashMap::new());
        let hash = table.hash("pcx64-w\\lara.drm");
        table.0.insert(hash, "pcx64-w\\lara.drm".into());

        let resolver: &dyn NameResolver = &table;
        assert_eq!(resolver.name(hash).as_deref(), Some("pcx64-w\\lara.drm"));
        assert_eq!(resolver.name(hash ^ 1), None);
    }
}
