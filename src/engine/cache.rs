// src/engine/cache.rs
//
// Bounded cache of decoded previews. Eviction is by insertion order; hits
// hand out deep copies so callers never share a buffer with the cache.

use crate::engine::decoder::{decode, ImageHandle};
use crate::engine::limits::EngineLimits;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub max_dimension: Option<u32>,
}

impl CacheKey {
    /// Paths are made absolute so `a.png` and `./a.png` share an entry.
    pub fn new(path: &Path, max_dimension: Option<u32>) -> Self {
        let path = std::fs::canonicalize(path)
            .or_else(|_| std::path::absolute(path))
            .unwrap_or_else(|_| path.to_path_buf());
        Self {
            path,
            max_dimension,
        }
    }
}

struct Entry {
    image: ImageHandle,
    bytes: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    order: VecDeque<CacheKey>,
    total: u64,
}

pub struct DecodeCache {
    inner: Mutex<Inner>,
    budget: u64,
    entry_limit: u64,
    limits: EngineLimits,
}

impl DecodeCache {
    pub fn new(budget: u64, entry_limit: u64, limits: EngineLimits) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            budget,
            entry_limit,
            limits,
        }
    }

    pub fn from_limits(limits: &EngineLimits) -> Self {
        Self::new(limits.cache_budget, limits.cache_entry_limit, limits.clone())
    }

    /// Decoded image for `path`, from the cache when present.
    ///
    /// Decoding happens outside the lock. Results at or above the per-entry
    /// limit, or larger than the whole budget, are returned without being
    /// cached.
    pub fn get(&self, path: &Path, max_dimension: Option<u32>) -> Result<ImageHandle> {
        let key = CacheKey::new(path, max_dimension);
        if let Some(hit) = self.inner.lock().entries.get(&key).map(|e| e.image.duplicate()) {
            tracing::trace!(path = %key.path.display(), "cache hit");
            return Ok(hit);
        }

        let handle = decode(path, max_dimension, &self.limits)?;
        if handle.estimated_bytes() < self.entry_limit {
            self.admit(key, handle.duplicate());
        } else {
            tracing::debug!(
                path = %path.display(),
                bytes = handle.estimated_bytes(),
                entry_limit = self.entry_limit,
                "decoded image too large to cache"
            );
        }
        Ok(handle)
    }

    /// Insert, evicting oldest entries until the budget holds. Returns false
    /// when the entry is not stored (duplicate key or larger than the budget).
    pub(crate) fn admit(&self, key: CacheKey, image: ImageHandle) -> bool {
        let bytes = image.estimated_bytes();
        if bytes > self.budget {
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            // A concurrent decode of the same key finished first.
            return false;
        }
        while inner.total + bytes > self.budget {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.total -= evicted.bytes;
                tracing::debug!(
                    path = %oldest.path.display(),
                    bytes = evicted.bytes,
                    "evicted cached image"
                );
            }
        }
        inner.total += bytes;
        inner.order.push_back(key.clone());
        inner.entries.insert(key, Entry { image, bytes });
        true
    }

    pub fn contains(&self, path: &Path, max_dimension: Option<u32>) -> bool {
        self.inner
            .lock()
            .entries
            .contains_key(&CacheKey::new(path, max_dimension))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.total = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}

impl std::fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DecodeCache")
            .field("entries", &inner.entries.len())
            .field("total", &inner.total)
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use proptest::prelude::*;

    fn handle(width: u32, height: u32) -> ImageHandle {
        ImageHandle::new(DynamicImage::ImageRgb8(RgbImage::new(width, height)))
    }

    fn key(name: &str) -> CacheKey {
        CacheKey {
            path: PathBuf::from(format!("/virtual/{name}")),
            max_dimension: None,
        }
    }

    #[test]
    fn oldest_inserted_is_evicted_first() {
        // 10x10 RGB = 1200 bytes per entry; room for two.
        let cache = DecodeCache::new(2400, u64::MAX, EngineLimits::default());
        assert!(cache.admit(key("a"), handle(10, 10)));
        assert!(cache.admit(key("b"), handle(10, 10)));
        assert!(cache.admit(key("c"), handle(10, 10)));
        let inner = cache.inner.lock();
        assert!(!inner.entries.contains_key(&key("a")));
        assert!(inner.entries.contains_key(&key("b")));
        assert!(inner.entries.contains_key(&key("c")));
        assert_eq!(inner.total, 2400);
    }

    #[test]
    fn eviction_order_ignores_hits() {
        let cache = DecodeCache::new(2400, u64::MAX, EngineLimits::default());
        cache.admit(key("a"), handle(10, 10));
        cache.admit(key("b"), handle(10, 10));
        // touching "a" does not refresh its position
        let _ = cache.inner.lock().entries.get(&key("a")).map(|e| e.image.duplicate());
        cache.admit(key("c"), handle(10, 10));
        assert!(!cache.inner.lock().entries.contains_key(&key("a")));
    }

    #[test]
    fn oversized_entry_is_not_stored() {
        let cache = DecodeCache::new(1000, u64::MAX, EngineLimits::default());
        assert!(!cache.admit(key("big"), handle(10, 10)));
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn duplicate_key_keeps_first() {
        let cache = DecodeCache::new(10_000, u64::MAX, EngineLimits::default());
        assert!(cache.admit(key("a"), handle(10, 10)));
        assert!(!cache.admit(key("a"), handle(5, 5)));
        assert_eq!(cache.total_bytes(), 1200);
    }

    #[test]
    fn get_decodes_once_and_returns_copies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let cache = DecodeCache::from_limits(&EngineLimits::default());

        let first = cache.get(&path, Some(4)).unwrap();
        assert_eq!((first.width(), first.height()), (4, 4));
        assert!(cache.contains(&path, Some(4)));
        assert!(!cache.contains(&path, None));

        std::fs::remove_file(&path).unwrap();
        let second = cache.get(&path, Some(4)).unwrap();
        assert_eq!(second.image().to_rgb8(), first.image().to_rgb8());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn entry_limit_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        RgbImage::new(8, 8).save_with_format(&path, ImageFormat::Png).unwrap();
        let cache = DecodeCache::new(u64::MAX, 8 * 8 * 3 * 4, EngineLimits::default());
        cache.get(&path, None).unwrap();
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn total_never_exceeds_budget(
            budget in 1_000u64..50_000,
            sizes in prop::collection::vec((1u32..40, 1u32..40), 1..40),
        ) {
            let cache = DecodeCache::new(budget, u64::MAX, EngineLimits::default());
            for (i, (w, h)) in sizes.into_iter().enumerate() {
                cache.admit(key(&i.to_string()), handle(w, h));
                prop_assert!(cache.total_bytes() <= budget);
                let inner = cache.inner.lock();
                let sum: u64 = inner.entries.values().map(|e| e.bytes).sum();
                prop_assert_eq!(sum, inner.total);
                prop_assert_eq!(inner.order.len(), inner.entries.len());
            }
        }
    }
}
