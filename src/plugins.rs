//! Concurrent, SHA-gated execution of external plugin commands.
//!
//! Per PR and plugin the stored status moves from unset to `pending` to
//! `success` or `error`. A plugin is skipped when its stored SHA matches the
//! PR's current head SHA, so it only runs again after new commits.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::pr::PrKey;
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::store::{PluginStatus, Store};

/// Everything a plugin run needs about one PR.
#[derive(Debug, Clone)]
pub struct PluginJob {
    pub key: PrKey,
    pub sha: String,
    pub diff: String,
    pub comments_json: String,
    pub metadata_json: String,
}

#[derive(Clone)]
pub struct PluginRunner {
    store: Store,
    plugins: Arc<Vec<PluginConfig>>,
}

impl PluginRunner {
    pub fn new(store: Store, plugins: Vec<PluginConfig>) -> Self {
        Self {
            store,
            plugins: Arc::new(plugins),
        }
    }

    pub fn plugins(&self) -> &[PluginConfig] {
        &self.plugins
    }

    /// Run every configured plugin concurrently and wait for all of them. A
    /// panicking plugin task is logged and does not affect the others.
    pub async fn run(&self, job: PluginJob) {
        if self.plugins.is_empty() {
            return;
        }
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(self.plugins.len());
        for plugin in self.plugins.iter().cloned() {
            let store = self.store.clone();
            let job = Arc::clone(&job);
            let name = plugin.name.clone();
            let handle = tokio::spawn(async move { execute_plugin(&store, &plugin, &job).await });
            handles.push((name, handle));
        }
        join_plugins(&job.key, handles).await;
    }
}

/// Wait for every plugin task. Returns how many ended by panic or
/// cancellation instead of finishing.
async fn join_plugins(key: &PrKey, handles: Vec<(String, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, handle) in handles {
        if let Err(e) = handle.await {
            failed += 1;
            if e.is_panic() {
                error!(plugin = %name, pr = %key, "plugin task panicked");
            } else {
                warn!(plugin = %name, pr = %key, error = %e, "plugin task cancelled");
            }
        }
    }
    failed
}

/// Run a store call on the blocking pool so the connection mutex is never
/// held on an async worker thread.
async fn with_store<T, F>(store: &Store, f: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| Error::Plugin(format!("store task failed: {e}")))?
}

async fn execute_plugin(store: &Store, plugin: &PluginConfig, job: &PluginJob) {
    let key = &job.key;
    let name = plugin.name.as_str();

    let existing = {
        let (key, name) = (key.clone(), name.to_string());
        with_store(store, move |s| s.get_plugin_result(&key, &name)).await
    };
    match existing {
        Ok(Some(existing)) if !existing.sha.is_empty() && existing.sha == job.sha => {
            debug!(plugin = name, pr = %key, sha = %job.sha, "plugin up to date, skipping");
            return;
        }
        Ok(_) => {}
        Err(e) => warn!(plugin = name, pr = %key, error = %e, "failed to read plugin state"),
    }

    if let Err(e) = store_result(store, job, name, String::new(), PluginStatus::Pending).await {
        warn!(plugin = name, pr = %key, error = %e, "failed to mark plugin pending");
    }

    info!(plugin = name, pr = %key, "running plugin");
    let config = ProcessConfig {
        command: plugin.command.clone(),
        args: plugin_args(plugin, job),
        log_prefix: format!("plugin:{name}"),
    };

    let (result, status) = match spawn_and_stream(config).await {
        Ok(output) if output.success() => (output.combined(), PluginStatus::Success),
        Ok(output) => (
            format!(
                "Error: {}\nOutput: {}",
                output.describe_exit(),
                output.combined()
            ),
            PluginStatus::Error,
        ),
        Err(e) => (format!("Error: {e}\nOutput: "), PluginStatus::Error),
    };

    if status == PluginStatus::Error {
        warn!(plugin = name, pr = %key, "plugin failed");
    }
    if let Err(e) = store_result(store, job, name, result, status).await {
        warn!(plugin = name, pr = %key, error = %e, "failed to store plugin result");
    }
}

async fn store_result(
    store: &Store,
    job: &PluginJob,
    name: &str,
    result: String,
    status: PluginStatus,
) -> Result<()> {
    let (key, name, sha) = (job.key.clone(), name.to_string(), job.sha.clone());
    with_store(store, move |s| {
        s.upsert_plugin_result(&key, &name, &result, status, &sha)
    })
    .await
}

/// Configured args, then `--owner --repo --number`, then the optional
/// payload flags.
pub fn plugin_args(plugin: &PluginConfig, job: &PluginJob) -> Vec<String> {
    let mut args = plugin.args.clone();
    args.extend([
        "--owner".to_string(),
        job.key.owner.clone(),
        "--repo".to_string(),
        job.key.repo.clone(),
        "--number".to_string(),
        job.key.number.to_string(),
    ]);
    if plugin.include_diff {
        args.extend(["--diff".to_string(), job.diff.clone()]);
    }
    if plugin.include_comments {
        args.extend(["--comments".to_string(), job.comments_json.clone()]);
    }
    if plugin.include_headers {
        args.extend(["--headers".to_string(), job.metadata_json.clone()]);
    }
    args
}

// ---------------------------------------------------------------------------
// Background submission
// ---------------------------------------------------------------------------

/// Submits plugin runs without waiting for them. There is no channel back to
/// the submitter; results only show up in the store.
#[derive(Clone)]
pub struct PluginQueue {
    tx: mpsc::UnboundedSender<PluginJob>,
}

impl PluginQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PluginJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, job: PluginJob) {
        if let Err(e) = self.tx.send(job) {
            warn!(pr = %e.0.key, "plugin worker is gone, dropping job");
        }
    }
}

/// Drain the queue, starting each job as its own task.
pub fn spawn_worker(runner: PluginRunner, mut rx: mpsc::UnboundedReceiver<PluginJob>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(job).await });
        }
        debug!("plugin queue closed");
    })
}
