//! SQLite implementation of [`RepositoryStore`]
//!
//! `rusqlite::Connection` is not `Sync`, so connections come from an r2d2
//! pool. Every pooled connection gets the same pragmas (WAL, foreign keys,
//! busy timeout). Helpers take `&Connection` so one operation never holds
//! two pooled connections at once.

use super::error::{StoreError, StoreResult};
use super::schema;
use super::types::*;
use super::RepositoryStore;
use crate::core::retry::RetryPolicy;
use crate::core::time::{SystemTimeProvider, TimeProvider};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const REPOSITORY_COLUMNS: &str = "id, owner, name, path, ssh_url, private, default_branch, \
     cloned, disabled, failed_fetches, fetch_interval_secs, last_fetched_at, created_at, \
     rules_version";

const SCAN_COLUMNS: &str = "id, repository_id, fetch_id, branch, type, start_sha, stop_sha, \
     rules_version, scan_start, scan_end";

fn exec_stmt(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    conn.prepare(sql)?.query([])?.next()?;
    Ok(())
}

fn apply_pragmas(conn: &mut Connection) -> rusqlite::Result<()> {
    exec_stmt(conn, "PRAGMA journal_mode = WAL")?;
    exec_stmt(conn, "PRAGMA synchronous = NORMAL")?;
    exec_stmt(conn, "PRAGMA busy_timeout = 5000")?;
    exec_stmt(conn, "PRAGMA foreign_keys = ON")?;
    Ok(())
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_column<T>(idx: usize, text: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        path: PathBuf::from(row.get::<_, String>(3)?),
        ssh_url: row.get(4)?,
        private: row.get(5)?,
        default_branch: row.get(6)?,
        cloned: row.get(7)?,
        disabled: row.get(8)?,
        failed_fetches: row.get(9)?,
        fetch_interval_secs: row.get::<_, i64>(10)?.max(0) as u64,
        last_fetched_at: row.get::<_, Option<i64>>(11)?.map(timestamp),
        created_at: timestamp(row.get(12)?),
        rules_version: row.get(13)?,
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<Scan> {
    Ok(Scan {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        fetch_id: row.get(2)?,
        branch: row.get(3)?,
        scan_type: parse_column(4, row.get(4)?)?,
        start_sha: row.get(5)?,
        stop_sha: row.get(6)?,
        rules_version: row.get(7)?,
        scan_start: timestamp(row.get(8)?),
        scan_end: row.get::<_, Option<i64>>(9)?.map(timestamp),
    })
}

fn fetch_from_row(row: &Row<'_>) -> rusqlite::Result<Fetch> {
    let changes: String = row.get(3)?;
    let changes: [String; 2] = serde_json::from_str(&changes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Fetch {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        path: row.get(2)?,
        changes,
        created_at: timestamp(row.get(4)?),
    })
}

fn find_by_name(conn: &Connection, owner: &str, name: &str) -> StoreResult<Option<Repository>> {
    let sql = format!(
        "SELECT {} FROM repositories WHERE owner = ?1 AND name = ?2",
        REPOSITORY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![owner, name], repository_from_row)
        .optional()?)
}

fn query_repositories(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> StoreResult<Vec<Repository>> {
    let sql = format!("SELECT {} FROM repositories {}", REPOSITORY_COLUMNS, filter);
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(args, repository_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn ensure_updated(changed: usize, id: RepoId) -> StoreResult<()> {
    if changed == 0 {
        return Err(StoreError::RepositoryNotFound { id });
    }
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> StoreResult<u64> {
    let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(value.max(0) as u64)
}

/// Database handle with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open or create the database file. The schema is not touched until
    /// [`SqliteStore::migrate`] runs.
    pub fn open(path: &Path, pool_size: u32) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(apply_pragmas);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .min_idle(Some(1))
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Migrated in-memory database for tests and dry runs
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(apply_pragmas);
        // A single connection that is never recycled; each in-memory
        // connection would otherwise be its own empty database.
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        let store = Self { pool };
        store.migrate(&RetryPolicy::new(1, Duration::ZERO), &SystemTimeProvider)?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(StoreError::from)
    }

    /// Apply pending migrations under the migration lock. Returns how many
    /// were applied.
    pub fn migrate(&self, policy: &RetryPolicy, clock: &dyn TimeProvider) -> StoreResult<u32> {
        let mut conn = self.conn()?;
        let holder = format!("repowatch-{}", std::process::id());
        schema::migrate(&mut conn, &holder, policy, || clock.now().timestamp())
    }

    /// Applied schema version
    pub fn schema_version(&self) -> StoreResult<u32> {
        let conn = self.conn()?;
        Ok(schema::current_version(&conn)?)
    }
}

impl RepositoryStore for SqliteStore {
    fn insert_repository(
        &self,
        repo: &NewRepository,
        now: DateTime<Utc>,
    ) -> StoreResult<(Repository, bool)> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO repositories
                (owner, name, path, ssh_url, private, default_branch, fetch_interval_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(owner, name) DO NOTHING
            "#,
            params![
                repo.owner,
                repo.name,
                repo.path.to_string_lossy(),
                repo.ssh_url,
                repo.private,
                repo.default_branch,
                repo.fetch_interval_secs as i64,
                now.timestamp(),
            ],
        )?;
        let stored = find_by_name(&conn, &repo.owner, &repo.name)?.ok_or_else(|| {
            StoreError::Corrupt {
                column: "repositories",
                message: format!("{}/{} missing after insert", repo.owner, repo.name),
            }
        })?;
        Ok((stored, inserted == 1))
    }

    fn find_repository(&self, owner: &str, name: &str) -> StoreResult<Option<Repository>> {
        let conn = self.conn()?;
        find_by_name(&conn, owner, name)
    }

    fn repository(&self, id: RepoId) -> StoreResult<Option<Repository>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS);
        Ok(conn.query_row(&sql, params![id], repository_from_row).optional()?)
    }

    fn repositories(&self) -> StoreResult<Vec<Repository>> {
        let conn = self.conn()?;
        query_repositories(&conn, "ORDER BY owner, name", [])
    }

    fn cloned_repositories(&self) -> StoreResult<Vec<Repository>> {
        let conn = self.conn()?;
        query_repositories(
            &conn,
            "WHERE cloned = 1 AND disabled = 0 ORDER BY owner, name",
            [],
        )
    }

    fn repositories_due_for_fetch(&self, now: DateTime<Utc>) -> StoreResult<Vec<Repository>> {
        let conn = self.conn()?;
        query_repositories(
            &conn,
            r#"
            WHERE cloned = 1 AND disabled = 0
              AND (last_fetched_at IS NULL OR last_fetched_at + fetch_interval_secs <= ?1)
            ORDER BY COALESCE(last_fetched_at, 0), id
            "#,
            params![now.timestamp()],
        )
    }

    fn mark_cloned(&self, id: RepoId) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE repositories SET cloned = 1, failed_fetches = 0 WHERE id = ?1",
            params![id],
        )?;
        ensure_updated(changed, id)
    }

    fn mark_uncloned(&self, id: RepoId) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE repositories SET cloned = 0 WHERE id = ?1",
            params![id],
        )?;
        ensure_updated(changed, id)
    }

    fn register_failure(&self, id: RepoId, threshold: u32) -> StoreResult<FailureOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE repositories SET failed_fetches = failed_fetches + 1 WHERE id = ?1",
            params![id],
        )?;
        ensure_updated(changed, id)?;
        let (failures, already_disabled): (u32, bool) = tx.query_row(
            "SELECT failed_fetches, disabled FROM repositories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let disabled = !already_disabled && failures >= threshold;
        if disabled {
            tx.execute(
                "UPDATE repositories SET disabled = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(FailureOutcome { failures, disabled })
    }

    fn reset_failures(&self, id: RepoId) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE repositories SET failed_fetches = 0 WHERE id = ?1",
            params![id],
        )?;
        ensure_updated(changed, id)
    }

    fn record_fetch_check(
        &self,
        id: RepoId,
        at: DateTime<Utc>,
        interval_secs: u64,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE repositories SET last_fetched_at = ?2, fetch_interval_secs = ?3 WHERE id = ?1",
            params![id, at.timestamp(), interval_secs as i64],
        )?;
        ensure_updated(changed, id)
    }

    fn save_fetch(
        &self,
        id: RepoId,
        path: &str,
        changes: [&str; 2],
        at: DateTime<Utc>,
    ) -> StoreResult<Fetch> {
        let conn = self.conn()?;
        let encoded = serde_json::to_string(&changes).map_err(|e| StoreError::Corrupt {
            column: "fetches.changes",
            message: e.to_string(),
        })?;
        conn.execute(
            "INSERT INTO fetches (repository_id, path, changes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, path, encoded, at.timestamp()],
        )?;
        Ok(Fetch {
            id: conn.last_insert_rowid(),
            repository_id: id,
            path: path.to_string(),
            changes: [changes[0].to_string(), changes[1].to_string()],
            created_at: timestamp(at.timestamp()),
        })
    }

    fn save_scan(
        &self,
        scan: &NewScan,
        credentials: &[NewCredential],
        commits: &[String],
    ) -> StoreResult<Scan> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO scans
                (repository_id, fetch_id, branch, type, start_sha, stop_sha,
                 rules_version, scan_start, scan_end)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                scan.repository_id,
                scan.fetch_id,
                scan.branch,
                scan.scan_type.to_string(),
                scan.start_sha,
                scan.stop_sha,
                scan.rules_version,
                scan.scan_start.timestamp(),
                scan.scan_end.timestamp(),
            ],
        )?;
        let scan_id = tx.last_insert_rowid();

        {
            let mut insert_credential = tx.prepare_cached(
                r#"
                INSERT INTO credentials
                    (scan_id, owner, repository, sha, path, line_number, match_start,
                     match_end, private, method, rules_version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for credential in credentials {
                insert_credential.execute(params![
                    scan_id,
                    credential.owner,
                    credential.repository,
                    credential.sha,
                    credential.path,
                    credential.line_number,
                    credential.match_start,
                    credential.match_end,
                    credential.private,
                    credential.method.to_string(),
                    credential.rules_version,
                ])?;
            }

            let mut insert_commit = tx.prepare_cached(
                "INSERT OR IGNORE INTO scanned_commits (scan_id, repository_id, sha) VALUES (?1, ?2, ?3)",
            )?;
            for sha in commits {
                insert_commit.execute(params![scan_id, scan.repository_id, sha])?;
            }
        }

        tx.commit()?;

        Ok(Scan {
            id: scan_id,
            repository_id: Some(scan.repository_id),
            fetch_id: scan.fetch_id,
            branch: scan.branch.clone(),
            scan_type: scan.scan_type,
            start_sha: scan.start_sha.clone(),
            stop_sha: scan.stop_sha.clone(),
            rules_version: scan.rules_version,
            scan_start: timestamp(scan.scan_start.timestamp()),
            scan_end: Some(timestamp(scan.scan_end.timestamp())),
        })
    }

    fn range_scanned(&self, id: RepoId, start: &str, stop: Option<&str>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let exists = conn.query_row(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scans
                WHERE repository_id = ?1 AND start_sha = ?2 AND stop_sha IS ?3
                  AND type IN ('init', 'fetch')
            )
            "#,
            params![id, start, stop],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn covered_commits(&self, id: RepoId, shas: &[String]) -> StoreResult<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM scanned_commits WHERE repository_id = ?1 AND sha = ?2")?;
        let mut covered = HashSet::new();
        for sha in shas {
            if stmt.exists(params![id, sha])? {
                covered.insert(sha.clone());
            }
        }
        Ok(covered)
    }

    fn tree_scan_exists(
        &self,
        id: RepoId,
        branch: &str,
        sha: &str,
        rules_version: u32,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let exists = conn.query_row(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scans
                WHERE repository_id = ?1 AND branch = ?2 AND start_sha = ?3
                  AND rules_version = ?4 AND type = 'rescan'
            )
            "#,
            params![id, branch, sha, rules_version],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn set_rules_version(&self, id: RepoId, rules_version: u32) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE repositories SET rules_version = ?2 WHERE id = ?1",
            params![id, rules_version],
        )?;
        ensure_updated(changed, id)
    }

    fn repositories_behind_rules(&self, rules_version: u32) -> StoreResult<Vec<Repository>> {
        let conn = self.conn()?;
        query_repositories(
            &conn,
            r#"
            WHERE cloned = 1 AND disabled = 0
              AND rules_version IS NOT NULL AND rules_version < ?1
            ORDER BY owner, name
            "#,
            params![rules_version],
        )
    }

    fn upsert_branch(&self, id: RepoId, name: &str, credential_count: u64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO branches (repository_id, name, credential_count)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(repository_id, name) DO UPDATE SET
                credential_count = excluded.credential_count
            "#,
            params![id, name, credential_count as i64],
        )?;
        Ok(())
    }

    fn prune_branches(&self, id: RepoId, keep: &[String]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stale: Vec<String> = {
            let mut stmt = tx.prepare_cached("SELECT name FROM branches WHERE repository_id = ?1")?;
            let names = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names.into_iter().filter(|n| !keep.contains(n)).collect()
        };
        for name in &stale {
            tx.execute(
                "DELETE FROM branches WHERE repository_id = ?1 AND name = ?2",
                params![id, name],
            )?;
        }
        tx.commit()?;
        Ok(stale.len())
    }

    fn branches(&self, id: RepoId) -> StoreResult<Vec<Branch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, repository_id, name, credential_count FROM branches WHERE repository_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Branch {
                    id: row.get(0)?,
                    repository_id: row.get(1)?,
                    name: row.get(2)?,
                    credential_count: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn credentials_for_repository(&self, id: RepoId) -> StoreResult<Vec<Credential>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT c.id, c.scan_id, c.owner, c.repository, c.sha, c.path, c.line_number,
                   c.match_start, c.match_end, c.private, c.method, c.rules_version
            FROM credentials c JOIN scans s ON s.id = c.scan_id
            WHERE s.repository_id = ?1
            ORDER BY c.id
            "#,
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Credential {
                    id: row.get(0)?,
                    scan_id: row.get(1)?,
                    owner: row.get(2)?,
                    repository: row.get(3)?,
                    sha: row.get(4)?,
                    path: row.get(5)?,
                    line_number: row.get(6)?,
                    match_start: row.get(7)?,
                    match_end: row.get(8)?,
                    private: row.get(9)?,
                    method: parse_column(10, row.get(10)?)?,
                    rules_version: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn scans_for_repository(&self, id: RepoId) -> StoreResult<Vec<Scan>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM scans WHERE repository_id = ?1 ORDER BY id",
            SCAN_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![id], scan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetches_for_repository(&self, id: RepoId) -> StoreResult<Vec<Fetch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, repository_id, path, changes, created_at FROM fetches WHERE repository_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![id], fetch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn counts(&self) -> StoreResult<StoreCounts> {
        let conn = self.conn()?;
        Ok(StoreCounts {
            repositories: count(&conn, "SELECT COUNT(*) FROM repositories")?,
            cloned: count(&conn, "SELECT COUNT(*) FROM repositories WHERE cloned = 1")?,
            disabled: count(&conn, "SELECT COUNT(*) FROM repositories WHERE disabled = 1")?,
            failing: count(
                &conn,
                "SELECT COUNT(*) FROM repositories WHERE failed_fetches > 0 AND disabled = 0",
            )?,
            fetches: count(&conn, "SELECT COUNT(*) FROM fetches")?,
            scans: count(&conn, "SELECT COUNT(*) FROM scans")?,
            credentials: count(&conn, "SELECT COUNT(*) FROM credentials")?,
            head_credentials: count(
                &conn,
                "SELECT COALESCE(SUM(credential_count), 0) FROM branches",
            )?,
        })
    }

    fn bump_message_retry(&self, message_id: &str) -> StoreResult<u32> {
        let conn = self.conn()?;
        let attempts = conn.query_row(
            r#"
            INSERT INTO message_retries (message_id, attempts) VALUES (?1, 1)
            ON CONFLICT(message_id) DO UPDATE SET attempts = attempts + 1
            RETURNING attempts
            "#,
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    fn clear_message_retry(&self, message_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM message_retries WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }
}
