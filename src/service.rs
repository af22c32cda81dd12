//! Request/reply operations exposed to editor and browser clients.
//!
//! Every operation that changes what a PR looks like returns the freshly
//! rendered view, so clients can redraw without a second round trip.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::annotate::{AnnotatedLine, Annotator, escape_body};
use crate::cache::{CacheMode, PrCache};
use crate::comments::{self, Comment};
use crate::config::{Config, PluginConfig};
use crate::diff::parse_diff;
use crate::error::{Error, Result};
use crate::plugins::{PluginJob, PluginQueue, PluginRunner};
use crate::pr::{PrKey, PrMetadata, Review, ReviewEvent};
use crate::store::{Feedback, PluginStatus, Store};
use crate::upstream::{CodeHost, DraftComment};

/// The outline store of PRs awaiting review. Items are identified as
/// `owner/repo-number`.
pub trait TrackedItems: Send + Sync {
    fn remove(&self, id: &str) -> Result<()>;
}

/// Used when no tracked-item store is attached.
pub struct NoTrackedItems;

impl TrackedItems for NoTrackedItems {
    fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrView {
    pub key: PrKey,
    pub sha: String,
    pub content: String,
    pub metadata: Option<PrMetadata>,
    pub lines: Vec<AnnotatedLine>,
    pub comments: Vec<Comment>,
    pub outdated_comments: Vec<Vec<Comment>>,
    pub reviews: Vec<Review>,
    pub feedback: Option<Feedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginOutput {
    pub result: String,
    pub status: PluginStatus,
}

pub struct ReviewService {
    store: Store,
    cache: PrCache,
    host: Arc<dyn CodeHost>,
    queue: PluginQueue,
    runner: PluginRunner,
    annotator: Annotator,
    username: String,
    tracked: Arc<dyn TrackedItems>,
    requests: AtomicU64,
}

impl ReviewService {
    pub fn new(
        config: &Config,
        store: Store,
        host: Arc<dyn CodeHost>,
        queue: PluginQueue,
    ) -> Result<Self> {
        Ok(Self {
            cache: PrCache::new(store.clone()),
            runner: PluginRunner::new(store.clone(), config.plugins.clone()),
            annotator: Annotator::new(config.excluded_author_patterns()?),
            username: config.github_username.clone(),
            tracked: Arc::new(NoTrackedItems),
            requests: AtomicU64::new(0),
            store,
            host,
            queue,
        })
    }

    pub fn with_tracked_items(mut self, tracked: Arc<dyn TrackedItems>) -> Self {
        self.tracked = tracked;
        self
    }

    pub fn runner(&self) -> &PluginRunner {
        &self.runner
    }

    /// Count one handled request and return the running total.
    pub fn record_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn health(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Render a PR, serving the diff and comments from cache unless
    /// `skip_cache` is set. Also queues a background plugin run.
    pub fn get_pr(&self, key: &PrKey, skip_cache: bool) -> Result<PrView> {
        let mode = CacheMode::for_sync(skip_cache);
        let cached = self.cache.diff_or_fetch(self.host.as_ref(), key, mode)?;
        let remote = self.cache.comments_or_fetch(self.host.as_ref(), key, mode)?;
        let local = self.store.list_local(key)?;
        let feedback = self.store.get_feedback(key)?;

        let parsed = parse_diff(&cached.diff);
        if parsed.is_empty() && !cached.diff.trim().is_empty() {
            warn!(pr = %key, "diff did not parse, rendering without lines");
        }

        self.queue.submit(PluginJob {
            key: key.clone(),
            sha: cached.sha.clone(),
            diff: cached.diff.clone(),
            comments_json: serde_json::to_string(&remote)?,
            metadata_json: serde_json::to_string(&cached.metadata)?,
        });

        let merged = comments::merge(remote, local, &self.username);
        let annotation = self
            .annotator
            .annotate(&parsed, merged, cached.metadata.as_ref());

        let mut content = annotation.text;
        if let Some(fb) = &feedback {
            content.push_str("\nPending review:\n");
            content.push_str(&escape_body(&fb.body));
            content.push('\n');
        }

        debug!(pr = %key, comments = annotation.comments.len(), "rendered pull request");
        Ok(PrView {
            key: key.clone(),
            sha: cached.sha,
            content,
            metadata: cached.metadata,
            lines: annotation.lines,
            comments: annotation.comments,
            outdated_comments: annotation.outdated,
            reviews: cached.reviews,
            feedback,
        })
    }

    pub fn sync_pr(&self, key: &PrKey) -> Result<PrView> {
        info!(pr = %key, "syncing pull request");
        self.get_pr(key, true)
    }

    // -----------------------------------------------------------------------
    // Pending comments and feedback
    // -----------------------------------------------------------------------

    pub fn add_comment(
        &self,
        key: &PrKey,
        filename: &str,
        position: Option<i64>,
        body: &str,
        reply_to: Option<i64>,
    ) -> Result<(i64, PrView)> {
        if filename.trim().is_empty() {
            return Err(Error::InvalidRequest("filename must not be empty".to_string()));
        }
        let id = self.store.add_local(key, filename, position, body, reply_to)?;
        debug!(pr = %key, id, filename, "added pending comment");
        Ok((id, self.get_pr(key, false)?))
    }

    pub fn edit_comment(&self, id: i64, body: &str) -> Result<PrView> {
        let existing = self
            .store
            .get_local(id)?
            .ok_or_else(|| Error::NotFound(format!("local comment {id}")))?;
        self.store.edit_local(id, body)?;
        self.get_pr(&local_key(&existing), false)
    }

    /// Delete a pending comment. Returns `None` when the id does not exist.
    pub fn delete_comment(&self, id: i64) -> Result<Option<PrView>> {
        let Some(existing) = self.store.get_local(id)? else {
            debug!(id, "delete of unknown local comment ignored");
            return Ok(None);
        };
        self.store.delete_local(id)?;
        Ok(Some(self.get_pr(&local_key(&existing), false)?))
    }

    pub fn remove_pr_comments(&self, key: &PrKey) -> Result<PrView> {
        let removed = self.store.delete_all_local(key)?;
        debug!(pr = %key, removed, "removed pending comments");
        self.get_pr(key, false)
    }

    pub fn set_feedback(&self, key: &PrKey, body: &str) -> Result<(i64, PrView)> {
        let id = self.store.set_feedback(key, body)?;
        Ok((id, self.get_pr(key, false)?))
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Send pending replies one by one, then the review carrying the
    /// top-level pending comments. Local state is cleared only when the
    /// review itself succeeds; on failure nothing is cleared, so a retry
    /// sends the replies again.
    pub fn submit_review(
        &self,
        key: &PrKey,
        event: ReviewEvent,
        body: Option<&str>,
    ) -> Result<PrView> {
        let local = self.store.list_local(key)?;
        let (replies, roots): (Vec<_>, Vec<_>) =
            local.into_iter().partition(|c| c.reply_to.is_some());

        let mut replies_sent = 0;
        for reply in &replies {
            let Some(parent) = reply.reply_to else {
                continue;
            };
            if let Err(e) = self.host.submit_reply(key, &reply.body, parent) {
                warn!(pr = %key, id = reply.id, error = %e, "reply submission failed");
                return Err(Error::SubmissionPartial {
                    replies_sent,
                    reason: e.to_string(),
                });
            }
            replies_sent += 1;
        }

        let drafts: Vec<DraftComment> = roots
            .into_iter()
            .map(|c| DraftComment {
                path: c.filename,
                position: c.position.filter(|p| *p > 0),
                body: c.body,
            })
            .collect();
        let review_body = match body {
            Some(b) => b.to_string(),
            None => self
                .store
                .get_feedback(key)?
                .map(|f| f.body)
                .unwrap_or_default(),
        };

        if let Err(e) = self.host.submit_review(key, event, &review_body, &drafts) {
            warn!(pr = %key, replies_sent, error = %e, "review submission failed");
            return Err(Error::SubmissionPartial {
                replies_sent,
                reason: e.to_string(),
            });
        }
        info!(
            pr = %key,
            event = event.as_str(),
            replies = replies_sent,
            comments = drafts.len(),
            "review submitted"
        );

        self.store.delete_all_local(key)?;
        self.store.delete_feedback(key)?;
        if let Err(e) = self.tracked.remove(&key.tracked_id()) {
            warn!(pr = %key, error = %e, "failed to remove tracked item");
        }
        self.get_pr(key, true)
    }

    // -----------------------------------------------------------------------
    // Plugins
    // -----------------------------------------------------------------------

    pub fn list_plugins(&self) -> Vec<PluginConfig> {
        self.runner.plugins().to_vec()
    }

    /// Stored plugin results. When nothing is stored yet a background run is
    /// queued and the empty map returned.
    pub fn get_plugin_output(&self, key: &PrKey) -> Result<BTreeMap<String, PluginOutput>> {
        let stored = self.stored_plugin_output(key)?;
        if stored.is_empty() && !self.runner.plugins().is_empty() {
            self.queue.submit(self.plugin_job(key)?);
        }
        Ok(stored)
    }

    fn stored_plugin_output(&self, key: &PrKey) -> Result<BTreeMap<String, PluginOutput>> {
        Ok(self
            .store
            .list_plugin_results(key)?
            .into_iter()
            .map(|r| {
                (
                    r.plugin,
                    PluginOutput {
                        result: r.result,
                        status: r.status,
                    },
                )
            })
            .collect())
    }

    /// Inputs for a plugin run, read through the cache.
    pub fn plugin_job(&self, key: &PrKey) -> Result<PluginJob> {
        let cached = self
            .cache
            .diff_or_fetch(self.host.as_ref(), key, CacheMode::ReadWrite)?;
        let remote = self
            .cache
            .comments_or_fetch(self.host.as_ref(), key, CacheMode::ReadWrite)?;
        Ok(PluginJob {
            key: key.clone(),
            sha: cached.sha,
            diff: cached.diff,
            comments_json: serde_json::to_string(&remote)?,
            metadata_json: serde_json::to_string(&cached.metadata)?,
        })
    }

    /// Run all plugins for a PR and wait for them to finish.
    pub async fn run_plugins(
        self: Arc<Self>,
        key: PrKey,
    ) -> Result<BTreeMap<String, PluginOutput>> {
        let svc = Arc::clone(&self);
        let job_key = key.clone();
        let job = tokio::task::spawn_blocking(move || svc.plugin_job(&job_key))
            .await
            .map_err(|e| Error::Plugin(format!("failed to prepare plugin run: {e}")))??;
        self.runner.run(job).await;
        self.stored_plugin_output(&key)
    }
}

fn local_key(comment: &comments::LocalComment) -> PrKey {
    PrKey::new(comment.owner.clone(), comment.repo.clone(), comment.number)
}
