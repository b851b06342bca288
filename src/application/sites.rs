//! Live sitemap shared by the delegate and the cache hierarchy.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::cache::lock::{LockSite, rw_read, rw_write};
use crate::domain::SiteMap;

const SOURCE: &str = "application::sites";

/// Holds the current sitemap; replaced wholesale on configuration reload.
#[derive(Debug, Default)]
pub struct SiteDirectory {
    current: RwLock<Arc<SiteMap>>,
}

impl SiteDirectory {
    pub fn new(sites: SiteMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(sites)),
        }
    }

    pub fn current(&self) -> Arc<SiteMap> {
        rw_read(&self.current, LockSite::new(SOURCE, "sitemap", "current")).clone()
    }

    pub fn replace(&self, sites: SiteMap) {
        let count = sites.len();
        *rw_write(&self.current, LockSite::new(SOURCE, "sitemap", "replace")) = Arc::new(sites);
        info!(sites = count, "Sitemap replaced");
    }

    pub fn len(&self) -> usize {
        rw_read(&self.current, LockSite::new(SOURCE, "sitemap", "len")).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Site-tier capacity: one slot per configured site, never below one.
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.len()).unwrap_or(NonZeroUsize::MIN)
    }
}
