use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::resource::PageResource;
use crate::{PageNumber, RenderImage};

/// Page number → owned page resource for one document session.
///
/// The cache is the only owner of page payloads. Replacing, evicting or
/// clearing an entry releases its handle immediately.
#[derive(Debug, Default)]
pub struct PageCache {
    entries: HashMap<PageNumber, PageResource>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page: PageNumber) -> Option<&PageResource> {
        self.entries.get(&page)
    }

    pub fn image(&self, page: PageNumber) -> Option<Arc<RenderImage>> {
        self.entries.get(&page).map(PageResource::image)
    }

    pub fn has(&self, page: PageNumber) -> bool {
        self.entries.contains_key(&page)
    }

    pub fn put(&mut self, page: PageNumber, resource: PageResource) {
        if let Some(previous) = self.entries.remove(&page) {
            debug!(page, "replacing cached page");
            previous.release();
        }
        self.entries.insert(page, resource);
    }

    /// Evicts one page. Returns whether an entry was present.
    pub fn remove(&mut self, page: PageNumber) -> bool {
        match self.entries.remove(&page) {
            Some(resource) => {
                resource.release();
                true
            }
            None => false,
        }
    }

    /// Releases every held resource. Safe to call repeatedly.
    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        debug!(count = self.entries.len(), "clearing page cache");
        for (_, resource) in self.entries.drain() {
            resource.release();
        }
    }

    /// Keeps the `limit` pages closest to `anchor`, releasing the rest.
    pub fn trim_around(&mut self, anchor: PageNumber, limit: usize) -> usize {
        if self.entries.len() <= limit {
            return 0;
        }
        let mut pages: Vec<_> = self.entries.keys().copied().collect();
        pages.sort_by_key(|&page| (page.abs_diff(anchor), page < anchor));
        let stale: Vec<_> = pages.into_iter().skip(limit).collect();
        for page in &stale {
            self.remove(*page);
        }
        debug!(anchor, evicted = stale.len(), "trimmed page cache");
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pages(&self) -> Vec<PageNumber> {
        let mut pages: Vec<_> = self.entries.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn retained_bytes(&self) -> usize {
        self.entries.values().map(PageResource::retained_bytes).sum()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::resource::ResourceLedger;

    fn resource(ledger: &ResourceLedger, page: PageNumber) -> PageResource {
        PageResource::new(
            ledger,
            page,
            Bytes::from(vec![page as u8; 4]),
            RenderImage {
                width: 1,
                height: 1,
                pixels: vec![page as u8, 0, 0, 255],
            },
        )
    }

    #[test]
    fn put_then_get_returns_same_resource() {
        let ledger = ResourceLedger::new();
        let mut cache = PageCache::new();
        let res = resource(&ledger, 3);
        let id = res.handle_id();
        cache.put(3, res);

        assert!(cache.has(3));
        assert!(!cache.has(4));
        assert_eq!(cache.get(3).map(PageResource::handle_id), Some(id));
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn second_put_releases_first_resource_exactly_once() {
        let ledger = ResourceLedger::new();
        let mut cache = PageCache::new();
        cache.put(5, resource(&ledger, 5));
        let replacement = resource(&ledger, 5);
        let replacement_id = replacement.handle_id();
        cache.put(5, replacement);

        assert_eq!(ledger.acquired(), 2);
        assert_eq!(ledger.released(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(5).unwrap().handle_id(), replacement_id);

        cache.clear();
        assert_eq!(ledger.released(), 2);
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let ledger = ResourceLedger::new();
        let mut cache = PageCache::new();
        for page in 1..=4 {
            cache.put(page, resource(&ledger, page));
        }
        assert_eq!(ledger.live(), 4);
        cache.clear();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(ledger.released(), 4);
        assert_eq!(ledger.retained_bytes(), 0);
    }

    #[test]
    fn trim_keeps_pages_nearest_the_anchor() {
        let ledger = ResourceLedger::new();
        let mut cache = PageCache::new();
        for page in 1..=9 {
            cache.put(page, resource(&ledger, page));
        }
        let evicted = cache.trim_around(5, 4);
        assert_eq!(evicted, 5);
        assert_eq!(cache.pages(), vec![4, 5, 6, 7]);
        assert_eq!(ledger.live(), 4);
    }

    #[test]
    fn dropping_the_cache_releases_entries() {
        let ledger = ResourceLedger::new();
        {
            let mut cache = PageCache::new();
            cache.put(1, resource(&ledger, 1));
            cache.put(2, resource(&ledger, 2));
        }
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn remove_reports_presence() {
        let ledger = ResourceLedger::new();
        let mut cache = PageCache::new();
        cache.put(1, resource(&ledger, 1));
        assert!(cache.remove(1));
        assert!(!cache.remove(1));
        assert_eq!(ledger.live(), 0);
    }
}
