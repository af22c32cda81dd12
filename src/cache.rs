//! Cache-aside layer over the store for upstream PR data.
//!
//! The diff snapshot and the comment blob hit or miss independently. CI
//! status is cached per head SHA once it has settled. Write
//! failures and undecodable cache entries are logged and treated as misses so
//! the read path never fails because of the cache.

use tracing::{debug, warn};

use crate::comments::RemoteComment;
use crate::error::Result;
use crate::pr::{CiStatus, PrKey, PrMetadata, Review};
use crate::store::Store;
use crate::upstream::CodeHost;

/// Whether cached entries may be read. Fetched data is always written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    ReadWrite,
    /// Skip reads and refetch; used for explicit sync.
    WriteOnly,
}

impl CacheMode {
    pub fn for_sync(skip_cache: bool) -> Self {
        if skip_cache {
            CacheMode::WriteOnly
        } else {
            CacheMode::ReadWrite
        }
    }

    pub fn should_read(&self) -> bool {
        matches!(self, CacheMode::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedDiff {
    pub diff: String,
    pub sha: String,
    pub metadata: Option<PrMetadata>,
    pub reviews: Vec<Review>,
}

#[derive(Clone)]
pub struct PrCache {
    store: Store,
}

impl PrCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get_diff(&self, key: &PrKey) -> Option<CachedDiff> {
        let snapshot = match self.store.get_snapshot(key) {
            Ok(s) => s?,
            Err(e) => {
                warn!(pr = %key, error = %e, "failed to read cached diff");
                return None;
            }
        };
        let metadata = if snapshot.metadata_json.is_empty() {
            None
        } else {
            match serde_json::from_str(&snapshot.metadata_json) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(pr = %key, error = %e, "ignoring undecodable cached metadata");
                    return None;
                }
            }
        };
        let reviews = if snapshot.reviews_json.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&snapshot.reviews_json).unwrap_or_else(|e| {
                warn!(pr = %key, error = %e, "ignoring undecodable cached reviews");
                Vec::new()
            })
        };
        Some(CachedDiff {
            diff: snapshot.diff,
            sha: snapshot.latest_sha,
            metadata,
            reviews,
        })
    }

    pub fn put_diff(&self, key: &PrKey, entry: &CachedDiff) {
        let metadata_json = match &entry.metadata {
            Some(m) => serde_json::to_string(m).unwrap_or_default(),
            None => String::new(),
        };
        let reviews_json = serde_json::to_string(&entry.reviews).unwrap_or_default();
        if let Err(e) =
            self.store
                .upsert_snapshot(key, &entry.sha, &entry.diff, &metadata_json, &reviews_json)
        {
            warn!(pr = %key, error = %e, "failed to cache diff");
        }
    }

    pub fn get_comments(&self, key: &PrKey) -> Option<Vec<RemoteComment>> {
        match self.store.get_remote_cached(key) {
            Ok(comments) => comments,
            Err(e) => {
                warn!(pr = %key, error = %e, "ignoring unreadable cached comments");
                None
            }
        }
    }

    pub fn put_comments(&self, key: &PrKey, comments: &[RemoteComment]) {
        if let Err(e) = self.store.put_remote_cached(key, comments) {
            warn!(pr = %key, error = %e, "failed to cache comments");
        }
    }

    /// Cached diff, or fetch metadata, diff and reviews from `host` and store
    /// them. Upstream errors propagate.
    pub fn diff_or_fetch(&self, host: &dyn CodeHost, key: &PrKey, mode: CacheMode) -> Result<CachedDiff> {
        if mode.should_read()
            && let Some(hit) = self.get_diff(key)
        {
            debug!(pr = %key, "diff cache hit");
            return Ok(hit);
        }

        debug!(pr = %key, ?mode, "fetching diff from upstream");
        let mut metadata = host.fetch_metadata(key)?;
        if !metadata.head_sha.is_empty() {
            let ci = self.ci_or_fetch(host, key, &metadata.head_sha, mode);
            metadata.apply_ci(&ci);
        }
        let diff = host.fetch_diff(key)?;
        let reviews = host.fetch_reviews(key)?;
        let entry = CachedDiff {
            diff,
            sha: metadata.head_sha.clone(),
            metadata: Some(metadata),
            reviews,
        };
        self.put_diff(key, &entry);
        Ok(entry)
    }

    /// CI status for `sha`. A failed lookup is logged and reads as no CI, so
    /// it never blocks the diff.
    pub fn ci_or_fetch(&self, host: &dyn CodeHost, key: &PrKey, sha: &str, mode: CacheMode) -> CiStatus {
        if mode.should_read() {
            match self.store.get_ci_status(key, sha) {
                Ok(Some(hit)) => {
                    debug!(pr = %key, sha, "ci status cache hit");
                    return hit;
                }
                Ok(None) => {}
                Err(e) => warn!(pr = %key, sha, error = %e, "ignoring unreadable cached ci status"),
            }
        }

        let ci = match host.fetch_ci_status(key, sha) {
            Ok(ci) => ci,
            Err(e) => {
                warn!(pr = %key, sha, error = %e, "failed to fetch ci status");
                return CiStatus::default();
            }
        };
        if ci.is_settled()
            && let Err(e) = self.store.upsert_ci_status(key, sha, &ci)
        {
            warn!(pr = %key, sha, error = %e, "failed to cache ci status");
        }
        ci
    }

    /// Cached remote comments, or fetch and store them.
    pub fn comments_or_fetch(
        &self,
        host: &dyn CodeHost,
        key: &PrKey,
        mode: CacheMode,
    ) -> Result<Vec<RemoteComment>> {
        if mode.should_read()
            && let Some(hit) = self.get_comments(key)
        {
            debug!(pr = %key, count = hit.len(), "comment cache hit");
            return Ok(hit);
        }

        let comments = host.fetch_comments(key)?;
        self.put_comments(key, &comments);
        Ok(comments)
    }
}
