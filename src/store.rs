//! SQLite persistence for cached PR data, CI status, pending comments,
//! feedback and plugin results.
//!
//! All access goes through one connection behind a mutex, so writes from
//! concurrent plugin tasks are serialized.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::comments::{LocalComment, RemoteComment};
use crate::error::Result;
use crate::pr::{CiStatus, PrKey};
use crate::schema;

/// Cached upstream state for one pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct PrSnapshot {
    pub key: PrKey,
    pub latest_sha: String,
    pub diff: String,
    pub metadata_json: String,
    pub reviews_json: String,
    pub fetched_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Pending,
    Success,
    Error,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Pending => "pending",
            PluginStatus::Success => "success",
            PluginStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> rusqlite::Result<Self> {
        match s {
            "pending" => Ok(PluginStatus::Pending),
            "success" => Ok(PluginStatus::Success),
            "error" => Ok(PluginStatus::Error),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown plugin status: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResult {
    pub plugin: String,
    pub result: String,
    pub status: PluginStatus,
    pub sha: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub body: String,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, enabling WAL and applying
    /// migrations. Missing parent directories are created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        debug!(path = %path.display(), journal_mode = %journal_mode, "opened store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut conn)?)
    }

    // -----------------------------------------------------------------------
    // PR snapshots
    // -----------------------------------------------------------------------

    pub fn get_snapshot(&self, key: &PrKey) -> Result<Option<PrSnapshot>> {
        self.with_conn(|db| {
            db.query_row(
                "SELECT latest_sha, diff, metadata_json, reviews_json, fetched_at
                 FROM pr_snapshots WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64],
                |r| {
                    Ok(PrSnapshot {
                        key: key.clone(),
                        latest_sha: r.get(0)?,
                        diff: r.get(1)?,
                        metadata_json: r.get(2)?,
                        reviews_json: r.get(3)?,
                        fetched_at: r.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn upsert_snapshot(
        &self,
        key: &PrKey,
        latest_sha: &str,
        diff: &str,
        metadata_json: &str,
        reviews_json: &str,
    ) -> Result<()> {
        self.with_conn(|db| {
            db.execute(
                "INSERT INTO pr_snapshots (owner, repo, number, latest_sha, diff, metadata_json, reviews_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(owner, repo, number) DO UPDATE SET
                     latest_sha = excluded.latest_sha,
                     diff = excluded.diff,
                     metadata_json = excluded.metadata_json,
                     reviews_json = excluded.reviews_json,
                     fetched_at = CURRENT_TIMESTAMP",
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    latest_sha,
                    diff,
                    metadata_json,
                    reviews_json
                ],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Remote comment blob
    // -----------------------------------------------------------------------

    pub fn get_comments_json(&self, key: &PrKey) -> Result<Option<String>> {
        self.with_conn(|db| {
            db.query_row(
                "SELECT comments_json FROM pr_comments
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64],
                |r| r.get(0),
            )
            .optional()
        })
    }

    pub fn upsert_comments_json(&self, key: &PrKey, comments_json: &str) -> Result<()> {
        self.with_conn(|db| {
            db.execute(
                "INSERT INTO pr_comments (owner, repo, number, comments_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner, repo, number) DO UPDATE SET
                     comments_json = excluded.comments_json,
                     fetched_at = CURRENT_TIMESTAMP",
                params![key.owner, key.repo, key.number as i64, comments_json],
            )?;
            Ok(())
        })
    }

    /// Cached remote comments, or `None` when nothing is stored. A stored
    /// blob that fails to decode is an error.
    pub fn get_remote_cached(&self, key: &PrKey) -> Result<Option<Vec<RemoteComment>>> {
        match self.get_comments_json(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Replace the cached remote comments wholesale.
    pub fn put_remote_cached(&self, key: &PrKey, comments: &[RemoteComment]) -> Result<()> {
        let json = serde_json::to_string(comments)?;
        self.upsert_comments_json(key, &json)
    }

    // -----------------------------------------------------------------------
    // CI status
    // -----------------------------------------------------------------------

    pub fn get_ci_status(&self, key: &PrKey, sha: &str) -> Result<Option<CiStatus>> {
        let json: Option<String> = self.with_conn(|db| {
            db.query_row(
                "SELECT status_json FROM ci_status
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND sha = ?4",
                params![key.owner, key.repo, key.number as i64, sha],
                |r| r.get(0),
            )
            .optional()
        })?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_ci_status(&self, key: &PrKey, sha: &str, ci: &CiStatus) -> Result<()> {
        let json = serde_json::to_string(ci)?;
        self.with_conn(|db| {
            db.execute(
                "INSERT INTO ci_status (owner, repo, number, sha, status_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(owner, repo, number, sha) DO UPDATE SET
                     status_json = excluded.status_json,
                     fetched_at = CURRENT_TIMESTAMP",
                params![key.owner, key.repo, key.number as i64, sha, json],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Local comments
    // -----------------------------------------------------------------------

    /// Insert a pending comment. A `reply_to` of 0 is stored as a root
    /// comment, which is how clients without optional fields send one.
    pub fn add_local(
        &self,
        key: &PrKey,
        filename: &str,
        position: Option<i64>,
        body: &str,
        reply_to: Option<i64>,
    ) -> Result<i64> {
        let reply_to = reply_to.filter(|id| *id != 0);
        self.with_conn(|db| {
            db.execute(
                "INSERT INTO local_comments (owner, repo, number, filename, position, body, reply_to_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.owner, key.repo, key.number as i64, filename, position, body, reply_to
                ],
            )?;
            Ok(db.last_insert_rowid())
        })
    }

    /// Replace a comment body. Returns `false` when no comment has that id.
    pub fn edit_local(&self, id: i64, body: &str) -> Result<bool> {
        self.with_conn(|db| {
            let changed = db.execute(
                "UPDATE local_comments SET body = ?1 WHERE id = ?2",
                params![body, id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete one comment. Deleting a missing id is not an error; the return
    /// value tells whether a row was removed.
    pub fn delete_local(&self, id: i64) -> Result<bool> {
        self.with_conn(|db| {
            let changed = db.execute("DELETE FROM local_comments WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }

    pub fn delete_all_local(&self, key: &PrKey) -> Result<usize> {
        self.with_conn(|db| {
            db.execute(
                "DELETE FROM local_comments WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64],
            )
        })
    }

    pub fn get_local(&self, id: i64) -> Result<Option<LocalComment>> {
        self.with_conn(|db| {
            db.query_row(
                "SELECT id, owner, repo, number, filename, position, body, reply_to_id, created_at
                 FROM local_comments WHERE id = ?1",
                params![id],
                local_from_row,
            )
            .optional()
        })
    }

    /// Pending comments for a PR in creation order.
    pub fn list_local(&self, key: &PrKey) -> Result<Vec<LocalComment>> {
        self.with_conn(|db| {
            let mut stmt = db.prepare(
                "SELECT id, owner, repo, number, filename, position, body, reply_to_id, created_at
                 FROM local_comments
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3
                 ORDER BY id",
            )?;
            stmt.query_map(params![key.owner, key.repo, key.number as i64], local_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Store the review body for a PR, replacing any previous one. The row id
    /// stays stable across replacements.
    pub fn set_feedback(&self, key: &PrKey, body: &str) -> Result<i64> {
        self.with_conn(|db| {
            db.query_row(
                "INSERT INTO feedback (owner, repo, number, body)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner, repo, number) DO UPDATE SET body = excluded.body
                 RETURNING id",
                params![key.owner, key.repo, key.number as i64, body],
                |r| r.get(0),
            )
        })
    }

    pub fn get_feedback(&self, key: &PrKey) -> Result<Option<Feedback>> {
        self.with_conn(|db| {
            db.query_row(
                "SELECT id, body FROM feedback WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64],
                |r| {
                    Ok(Feedback {
                        id: r.get(0)?,
                        body: r.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn delete_feedback(&self, key: &PrKey) -> Result<()> {
        self.with_conn(|db| {
            db.execute(
                "DELETE FROM feedback WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Plugin results
    // -----------------------------------------------------------------------

    pub fn get_plugin_result(&self, key: &PrKey, plugin: &str) -> Result<Option<PluginResult>> {
        self.with_conn(|db| {
            db.query_row(
                "SELECT plugin, result, status, sha, updated_at FROM plugin_results
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND plugin = ?4",
                params![key.owner, key.repo, key.number as i64, plugin],
                plugin_from_row,
            )
            .optional()
        })
    }

    pub fn list_plugin_results(&self, key: &PrKey) -> Result<Vec<PluginResult>> {
        self.with_conn(|db| {
            let mut stmt = db.prepare(
                "SELECT plugin, result, status, sha, updated_at FROM plugin_results
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3
                 ORDER BY plugin",
            )?;
            stmt.query_map(params![key.owner, key.repo, key.number as i64], plugin_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn upsert_plugin_result(
        &self,
        key: &PrKey,
        plugin: &str,
        result: &str,
        status: PluginStatus,
        sha: &str,
    ) -> Result<()> {
        self.with_conn(|db| {
            db.execute(
                "INSERT INTO plugin_results (owner, repo, number, plugin, result, status, sha)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(owner, repo, number, plugin) DO UPDATE SET
                     result = excluded.result,
                     status = excluded.status,
                     sha = excluded.sha,
                     updated_at = CURRENT_TIMESTAMP",
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    plugin,
                    result,
                    status.as_str(),
                    sha
                ],
            )?;
            Ok(())
        })
    }
}

fn local_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LocalComment> {
    Ok(LocalComment {
        id: r.get(0)?,
        owner: r.get(1)?,
        repo: r.get(2)?,
        number: r.get::<_, i64>(3)? as u64,
        filename: r.get(4)?,
        position: r.get(5)?,
        body: r.get(6)?,
        reply_to: r.get::<_, Option<i64>>(7)?.filter(|id| *id != 0),
        created_at: r.get(8)?,
    })
}

fn plugin_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PluginResult> {
    let status: String = r.get(2)?;
    Ok(PluginResult {
        plugin: r.get(0)?,
        result: r.get(1)?,
        status: PluginStatus::parse(&status)?,
        sha: r.get(3)?,
        updated_at: r.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PrKey {
        PrKey::new("octo", "widgets", 7)
    }

    #[test]
    fn test_local_comment_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .add_local(&key(), "src/lib.rs", Some(4), "first", None)
            .unwrap();

        let listed = store.list_local(&key()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "first");
        assert_eq!(listed[0].position, Some(4));

        assert!(store.edit_local(id, "second").unwrap());
        assert_eq!(store.get_local(id).unwrap().unwrap().body, "second");

        assert!(store.delete_local(id).unwrap());
        assert!(!store.delete_local(id).unwrap());
        assert!(store.list_local(&key()).unwrap().is_empty());
    }

    #[test]
    fn test_edit_missing_comment_reports_false() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.edit_local(999, "x").unwrap());
    }

    #[test]
    fn test_local_comments_are_scoped_by_pr() {
        let store = Store::open_in_memory().unwrap();
        let other = PrKey::new("octo", "widgets", 8);
        store.add_local(&key(), "a.rs", None, "a", None).unwrap();
        store.add_local(&other, "b.rs", Some(1), "b", Some(12)).unwrap();

        assert_eq!(store.delete_all_local(&key()).unwrap(), 1);
        let remaining = store.list_local(&other).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].reply_to, Some(12));
    }

    #[test]
    fn test_zero_reply_to_is_a_root() {
        let store = Store::open_in_memory().unwrap();
        let id = store.add_local(&key(), "a.rs", Some(1), "root", Some(0)).unwrap();
        assert_eq!(store.get_local(id).unwrap().unwrap().reply_to, None);
    }

    #[test]
    fn test_body_stored_verbatim() {
        let store = Store::open_in_memory().unwrap();
        let body = "* bullet\n\n'quoted' \"text\"\n\n";
        let id = store.add_local(&key(), "a.rs", Some(1), body, None).unwrap();
        assert_eq!(store.get_local(id).unwrap().unwrap().body, body);
    }

    #[test]
    fn test_feedback_replaces_and_keeps_id() {
        let store = Store::open_in_memory().unwrap();
        let first = store.set_feedback(&key(), "looks good").unwrap();
        let second = store.set_feedback(&key(), "needs work").unwrap();
        assert_eq!(first, second);
        let fb = store.get_feedback(&key()).unwrap().unwrap();
        assert_eq!(fb.body, "needs work");
        store.delete_feedback(&key()).unwrap();
        assert!(store.get_feedback(&key()).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_upsert_overwrites() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_snapshot(&key()).unwrap().is_none());
        store
            .upsert_snapshot(&key(), "sha1", "diff1", "{}", "[]")
            .unwrap();
        store
            .upsert_snapshot(&key(), "sha2", "diff2", "{}", "[]")
            .unwrap();
        let snap = store.get_snapshot(&key()).unwrap().unwrap();
        assert_eq!(snap.latest_sha, "sha2");
        assert_eq!(snap.diff, "diff2");
    }

    #[test]
    fn test_remote_cache_roundtrip_and_corruption() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_remote_cached(&key()).unwrap().is_none());
        store.put_remote_cached(&key(), &[]).unwrap();
        assert_eq!(store.get_remote_cached(&key()).unwrap(), Some(vec![]));

        store.upsert_comments_json(&key(), "{not json").unwrap();
        assert!(store.get_remote_cached(&key()).is_err());
    }

    #[test]
    fn test_ci_status_is_kept_per_sha() {
        let store = Store::open_in_memory().unwrap();
        let ci = CiStatus::from_runs(vec![crate::test_helpers::workflow_run(
            "build",
            "completed",
            Some("failure"),
        )]);
        assert!(store.get_ci_status(&key(), "abc").unwrap().is_none());
        store.upsert_ci_status(&key(), "abc", &ci).unwrap();
        assert_eq!(store.get_ci_status(&key(), "abc").unwrap(), Some(ci));
        assert!(store.get_ci_status(&key(), "def").unwrap().is_none());
    }

    #[test]
    fn test_plugin_result_upsert() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_plugin_result(&key(), "lint", "", PluginStatus::Pending, "abc")
            .unwrap();
        store
            .upsert_plugin_result(&key(), "lint", "ok", PluginStatus::Success, "abc")
            .unwrap();
        let r = store.get_plugin_result(&key(), "lint").unwrap().unwrap();
        assert_eq!(r.status, PluginStatus::Success);
        assert_eq!(r.result, "ok");
        assert_eq!(store.list_plugin_results(&key()).unwrap().len(), 1);
        assert!(store.get_plugin_result(&key(), "other").unwrap().is_none());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crs.db");
        let store = Store::open(&path).unwrap();
        store.add_local(&key(), "a.rs", None, "x", None).unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.list_local(&key()).unwrap().len(), 1);
    }
}
