//! Schema migrations and the cross-process migration lock

use super::error::{StoreError, StoreResult};
use crate::core::retry::{retry_blocking, RetryPolicy};
use rusqlite::{params, Connection, OptionalExtension};

/// Locks older than this are assumed to belong to a crashed process
const STALE_LOCK_SECS: i64 = 10 * 60;

/// Ordered schema migrations. Applied versions are recorded in
/// `schema_migrations`; a version is never edited once released.
pub(crate) const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            ssh_url TEXT NOT NULL,
            private INTEGER NOT NULL DEFAULT 0,
            default_branch TEXT NOT NULL,
            cloned INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            failed_fetches INTEGER NOT NULL DEFAULT 0,
            UNIQUE (owner, name)
        );

        CREATE TABLE branches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            credential_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (repository_id, name)
        );

        CREATE TABLE fetches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            changes TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE scans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER REFERENCES repositories(id) ON DELETE SET NULL,
            fetch_id INTEGER REFERENCES fetches(id) ON DELETE SET NULL,
            branch TEXT NOT NULL,
            type TEXT NOT NULL,
            start_sha TEXT NOT NULL,
            stop_sha TEXT,
            rules_version INTEGER NOT NULL,
            scan_start INTEGER NOT NULL,
            scan_end INTEGER
        );
        CREATE INDEX idx_scans_range ON scans(repository_id, start_sha, stop_sha);

        CREATE TABLE credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            owner TEXT NOT NULL,
            repository TEXT NOT NULL,
            sha TEXT NOT NULL,
            path TEXT NOT NULL,
            line_number INTEGER NOT NULL CHECK (line_number >= 1),
            match_start INTEGER NOT NULL,
            match_end INTEGER NOT NULL CHECK (match_end >= match_start),
            private INTEGER NOT NULL,
            method TEXT NOT NULL,
            rules_version INTEGER NOT NULL
        );
        CREATE INDEX idx_credentials_scan ON credentials(scan_id);
        "#,
    ),
    (
        2,
        r#"
        ALTER TABLE repositories ADD COLUMN fetch_interval_secs INTEGER NOT NULL DEFAULT 300;
        ALTER TABLE repositories ADD COLUMN last_fetched_at INTEGER;
        ALTER TABLE repositories ADD COLUMN created_at INTEGER NOT NULL DEFAULT 0;

        CREATE TABLE scanned_commits (
            scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            repository_id INTEGER NOT NULL,
            sha TEXT NOT NULL,
            PRIMARY KEY (repository_id, sha)
        ) WITHOUT ROWID;
        CREATE INDEX idx_scanned_commits_scan ON scanned_commits(scan_id);

        CREATE TABLE message_retries (
            message_id TEXT PRIMARY KEY,
            attempts INTEGER NOT NULL
        ) WITHOUT ROWID;
        "#,
    ),
    (
        3,
        r#"
        ALTER TABLE repositories ADD COLUMN rules_version INTEGER;
        UPDATE repositories SET rules_version = (
            SELECT MAX(rules_version) FROM scans
            WHERE scans.repository_id = repositories.id AND scans.type IN ('init', 'rescan')
        );
        "#,
    ),
];

fn bootstrap(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS migration_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
}

/// Take the single migration lock row, or report who holds it
fn try_acquire(conn: &Connection, holder: &str, now: i64) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM migration_lock WHERE acquired_at < ?1",
        params![now - STALE_LOCK_SECS],
    )?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO migration_lock (id, holder, acquired_at) VALUES (1, ?1, ?2)",
        params![holder, now],
    )?;
    if inserted == 1 {
        return Ok(());
    }
    let current: Option<String> = conn
        .query_row("SELECT holder FROM migration_lock WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Err(StoreError::MigrationLocked {
        holder: current.unwrap_or_else(|| "unknown".to_string()),
    })
}

fn release(conn: &Connection, holder: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM migration_lock WHERE id = 1 AND holder = ?1",
        params![holder],
    )?;
    Ok(())
}

pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
}

fn apply_pending(conn: &mut Connection, now: i64) -> StoreResult<u32> {
    let mut applied = 0;
    for (version, sql) in MIGRATIONS {
        if *version <= current_version(conn)? {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .and_then(|_| {
                tx.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, now],
                )
            })
            .map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;
        tx.commit()?;
        log::info!("Applied schema migration {}", version);
        applied += 1;
    }
    Ok(applied)
}

/// Bring the schema up to date while holding the migration lock.
///
/// Lock acquisition is retried per `policy`; exhausting it returns
/// [`StoreError::MigrationLocked`], which callers treat as fatal.
pub(crate) fn migrate(
    conn: &mut Connection,
    holder: &str,
    policy: &RetryPolicy,
    now: impl Fn() -> i64,
) -> StoreResult<u32> {
    bootstrap(conn)?;
    retry_blocking("acquire migration lock", policy, || {
        try_acquire(conn, holder, now())
    })?;

    let result = apply_pending(conn, now());
    if let Err(e) = release(conn, holder) {
        log::warn!("Failed to release migration lock held by {}: {}", holder, e);
    }
    result
}
