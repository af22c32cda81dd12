/// Version tracking table, created on every open before reading the version.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    );
";

/// Initial schema.
///
/// - `pr_snapshots`: cached diff, head SHA, metadata and reviews per PR.
/// - `pr_comments`: cached remote comments as one JSON blob per PR.
/// - `local_comments`: pending comments not yet submitted.
/// - `feedback`: one pending review body per PR.
/// - `plugin_results`: latest output and status per PR and plugin.
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS pr_snapshots (
        owner         TEXT    NOT NULL,
        repo          TEXT    NOT NULL,
        number        INTEGER NOT NULL,
        latest_sha    TEXT    NOT NULL DEFAULT '',
        diff          TEXT    NOT NULL,
        metadata_json TEXT    NOT NULL DEFAULT '',
        reviews_json  TEXT    NOT NULL DEFAULT '',
        fetched_at    TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (owner, repo, number)
    );

    CREATE TABLE IF NOT EXISTS pr_comments (
        owner         TEXT    NOT NULL,
        repo          TEXT    NOT NULL,
        number        INTEGER NOT NULL,
        comments_json TEXT    NOT NULL,
        fetched_at    TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (owner, repo, number)
    );

    CREATE TABLE IF NOT EXISTS local_comments (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        owner       TEXT    NOT NULL,
        repo        TEXT    NOT NULL,
        number      INTEGER NOT NULL,
        filename    TEXT    NOT NULL,
        position    INTEGER,
        body        TEXT    NOT NULL,
        reply_to_id INTEGER,
        created_at  TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_local_comments_pr
        ON local_comments (owner, repo, number);

    CREATE TABLE IF NOT EXISTS feedback (
        id     INTEGER PRIMARY KEY AUTOINCREMENT,
        owner  TEXT    NOT NULL,
        repo   TEXT    NOT NULL,
        number INTEGER NOT NULL,
        body   TEXT    NOT NULL,
        UNIQUE (owner, repo, number)
    );

    CREATE TABLE IF NOT EXISTS plugin_results (
        owner      TEXT    NOT NULL,
        repo       TEXT    NOT NULL,
        number     INTEGER NOT NULL,
        plugin     TEXT    NOT NULL,
        result     TEXT    NOT NULL DEFAULT '',
        status     TEXT    NOT NULL
                           CHECK(status IN ('pending', 'success', 'error')),
        sha        TEXT    NOT NULL DEFAULT '',
        updated_at TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (owner, repo, number, plugin)
    );
";

/// CI status per commit. Only settled results are stored, so a row never
/// goes stale for its SHA.
pub const SCHEMA_V2_SQL: &str = "
    CREATE TABLE IF NOT EXISTS ci_status (
        owner       TEXT    NOT NULL,
        repo        TEXT    NOT NULL,
        number      INTEGER NOT NULL,
        sha         TEXT    NOT NULL,
        status_json TEXT    NOT NULL,
        fetched_at  TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (owner, repo, number, sha)
    );
";

/// Forward-only migration to the latest schema. Safe to run on every open.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }

    if version < 2 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V2_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut db = rusqlite::Connection::open_in_memory().unwrap();
        migrate(&mut db).unwrap();
        migrate(&mut db).unwrap();
        let rows: i64 = db
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
        let version: i64 = db
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_v1_database_gains_ci_table() {
        let mut db = rusqlite::Connection::open_in_memory().unwrap();
        db.execute_batch(SCHEMA_VERSION_DDL).unwrap();
        db.execute_batch(SCHEMA_V1_SQL).unwrap();
        db.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .unwrap();
        migrate(&mut db).unwrap();
        db.execute(
            "INSERT INTO ci_status (owner, repo, number, sha, status_json)
             VALUES ('o', 'r', 1, 'abc', '{}')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_plugin_status_is_checked() {
        let mut db = rusqlite::Connection::open_in_memory().unwrap();
        migrate(&mut db).unwrap();
        let err = db.execute(
            "INSERT INTO plugin_results (owner, repo, number, plugin, result, status, sha)
             VALUES ('o', 'r', 1, 'p', '', 'running', '')",
            [],
        );
        assert!(err.is_err());
    }
}
