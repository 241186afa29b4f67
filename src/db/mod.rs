//! SQLite-backed store for customers, contracts, upload history and holds.
//!
//! The database lives at `~/.agentbook/agentbook.db` unless configured
//! otherwise. One `CrmDb` owns one connection; every component borrows it.
//! Connection behaviour (journal mode, busy timeout, lock retries) is decided
//! once by the `DbOptions` handed to `CrmDb::open_with`.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::hashing::{contract_hashes, customer_stable_hash, match_key, normalize_match_key};
use crate::normalize::{normalize_birth, normalize_name_for_key, normalize_phone, normalize_policy_no};
use crate::types::{ContractDraft, FinancialRecord, PartyType, Policyholder, PrimaryRole};

pub mod types;
pub use types::*;

/// How often to retry taking the write lock, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Connection settings applied by `CrmDb::open_with`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbOptions {
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(30_000),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct CrmDb {
    conn: Connection,
    options: DbOptions,
}

impl CrmDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front; if another connection
    /// holds it the attempt is retried per `DbOptions::retry`. Failures inside
    /// the closure are never retried.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.begin_immediate().map_err(E::from)?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::Sqlite(e)));
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn begin_immediate(&self) -> Result<(), DbError> {
        let policy = self.options.retry;
        let mut attempt = 0;
        loop {
            match self.conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => return Ok(()),
                Err(e) if is_busy_error(&e) && attempt + 1 < policy.attempts.max(1) => {
                    attempt += 1;
                    log::warn!(
                        "Database busy, retrying transaction ({}/{})",
                        attempt,
                        policy.attempts
                    );
                    thread::sleep(policy.backoff * attempt);
                }
                Err(e) => return Err(DbError::Sqlite(e)),
            }
        }
    }

    /// Open (or create) the database at `~/.agentbook/agentbook.db`.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_with(path, DbOptions::default())
    }

    /// Open a database at an explicit path with default options.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        Self::open_with(path, DbOptions::default())
    }

    /// Open a database at `path`, apply connection settings, migrate, and
    /// backfill derived keys on rows written by older versions.
    pub fn open_with(path: PathBuf, options: DbOptions) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
        )?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Legacy rows predate the derived-key columns. Idempotent.
        match Self::backfill_customer_keys(&conn) {
            Ok(0) => {}
            Ok(n) => log::info!("Backfilled identity keys on {} customers", n),
            Err(e) => log::warn!("Customer key backfill failed: {}", e),
        }
        match Self::backfill_contract_hashes(&conn) {
            Ok(0) => {}
            Ok(n) => log::info!("Backfilled hashes on {} contracts", n),
            Err(e) => log::warn!("Contract hash backfill failed: {}", e),
        }

        Ok(Self { conn, options })
    }

    /// Resolve the default database path: `~/.agentbook/agentbook.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".agentbook").join("agentbook.db"))
    }

    /// Path of the main database file, empty for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.conn.path().map(Path::new).filter(|p| !p.as_os_str().is_empty())
    }

    fn backfill_customer_keys(conn: &Connection) -> Result<usize, DbError> {
        let mut stmt = conn.prepare(
            "SELECT id, name, COALESCE(phone, ''), COALESCE(birth_date, '')
             FROM customers
             WHERE name_norm = ''
                OR (phone_norm = '' AND COALESCE(phone, '') <> '')
                OR (birth_norm = '' AND COALESCE(birth_date, '') <> '')",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, name, phone, birth) in &rows {
            conn.execute(
                "UPDATE customers SET
                    name_norm = ?1,
                    phone_norm = ?2,
                    birth_norm = ?3,
                    match_key = CASE WHEN match_key = '' THEN ?4 ELSE match_key END,
                    stable_hash = COALESCE(stable_hash, ?5)
                 WHERE id = ?6",
                params![
                    normalize_name_for_key(name),
                    normalize_phone(phone),
                    normalize_birth(birth),
                    match_key(name, phone),
                    customer_stable_hash(name, phone, birth),
                    id
                ],
            )?;
        }
        Ok(rows.len())
    }

    /// Compute hashes for contracts that have none. A legacy duplicate whose
    /// key collides with an earlier row keeps a NULL key and is left for the
    /// reconciliation engine to find by policy number or stable hash.
    fn backfill_contract_hashes(conn: &Connection) -> Result<usize, DbError> {
        let mut stmt = conn.prepare(
            "SELECT id, customer_id, company, product_name, policy_no, CAST(premium AS TEXT),
                    status, start_date, end_date, insured_name, insured_phone, insured_birth,
                    insured_gender, coverage_summary, policyholder_name, policyholder_phone
             FROM contracts
             WHERE key_hash IS NULL OR key_hash = ''
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let fin = FinancialRecord {
                    company: row.get(2)?,
                    product_name: row.get(3)?,
                    policy_no: row.get(4)?,
                    premium: row.get(5)?,
                    status: row.get(6)?,
                    start_date: row.get(7)?,
                    end_date: row.get(8)?,
                    insured_name: row.get(9)?,
                    insured_phone: row.get(10)?,
                    insured_birth: row.get(11)?,
                    insured_gender: row.get(12)?,
                    coverage_summary: row.get(13)?,
                };
                let holder_name: Option<String> = row.get(14)?;
                let holder_phone: Option<String> = row.get(15)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, fin, holder_name, holder_phone))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut updated = 0;
        for (id, customer_id, fin, holder_name, holder_phone) in rows {
            let holder = Policyholder {
                name: holder_name.unwrap_or_default(),
                phone: holder_phone.unwrap_or_default(),
                party_type: PartyType::Person,
                org_key: String::new(),
            };
            let draft = ContractDraft::new(&fin, holder, PrimaryRole::Policyholder);
            let hashes = contract_hashes(customer_id, &draft);
            let result = conn.execute(
                "UPDATE contracts SET key_hash = ?1, stable_hash = ?2, content_hash = ?3,
                        policy_no_norm = ?4
                 WHERE id = ?5",
                params![
                    hashes.key_hash,
                    hashes.stable_hash,
                    hashes.content_hash,
                    normalize_policy_no(&draft.policy_no),
                    id
                ],
            );
            match result {
                Ok(_) => updated += 1,
                Err(e) if is_constraint_error(&e) => {
                    conn.execute(
                        "UPDATE contracts SET stable_hash = ?1, content_hash = ?2, policy_no_norm = ?3
                         WHERE id = ?4",
                        params![
                            hashes.stable_hash,
                            hashes.content_hash,
                            draft.policy_no_norm,
                            id
                        ],
                    )?;
                    log::warn!("Contract {} duplicates an existing key; key left empty", id);
                    updated += 1;
                }
                Err(e) => return Err(DbError::Sqlite(e)),
            }
        }
        Ok(updated)
    }
}

pub mod contracts;
pub mod customers;
pub mod holds;
pub mod uploads;

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::CrmDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> CrmDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        CrmDb::open_at(path).expect("Failed to open test database")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_applies_pragmas() {
        let db = test_db();
        let fk: i64 = db
            .conn_ref()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
        let mode: String = db
            .conn_ref()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(db.path().is_some());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref()
                .execute("INSERT INTO customers (name) VALUES ('홍길동')", [])?;
            Err(DbError::InvalidInput("abort".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let db = test_db();
        let id = db
            .with_transaction(|tx| -> Result<i64, DbError> {
                tx.conn_ref()
                    .execute("INSERT INTO customers (name) VALUES ('홍길동')", [])?;
                Ok(tx.conn_ref().last_insert_rowid())
            })
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_busy_lock_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let options = DbOptions {
            busy_timeout: Duration::from_millis(0),
            retry: RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
        };
        let holder = CrmDb::open_with(path.clone(), options.clone()).unwrap();
        let contender = CrmDb::open_with(path, options).unwrap();

        holder.conn_ref().execute_batch("BEGIN IMMEDIATE").unwrap();
        let result: Result<(), DbError> = contender.with_transaction(|_| Ok(()));
        let err = result.unwrap_err();
        assert!(err.is_busy(), "expected busy error, got {}", err);
        holder.conn_ref().execute_batch("ROLLBACK").unwrap();

        let result: Result<(), DbError> = contender.with_transaction(|_| Ok(()));
        assert!(result.is_ok());
    }

    #[test]
    fn test_legacy_rows_get_keys_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE customers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    phone TEXT,
                    birth_date TEXT
                );
                CREATE TABLE contracts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    customer_id INTEGER NOT NULL,
                    company TEXT,
                    product_name TEXT,
                    policy_no TEXT,
                    premium INTEGER,
                    status TEXT,
                    start_date TEXT,
                    end_date TEXT
                );
                INSERT INTO customers (name, phone, birth_date)
                    VALUES ('홍길동', '010-1234-5678', '1980-01-15');
                INSERT INTO contracts (customer_id, company, policy_no, premium)
                    VALUES (1, '삼성생명', 'ab-123', 50000);",
            )
            .unwrap();
        }

        let db = CrmDb::open_at(path).unwrap();
        let (phone_norm, key, birth_norm): (String, String, String) = db
            .conn_ref()
            .query_row(
                "SELECT phone_norm, match_key, birth_norm FROM customers WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(phone_norm, "01012345678");
        assert_eq!(key, "홍5678");
        assert_eq!(birth_norm, "19800115");

        let (key_hash, policy_norm): (Option<String>, String) = db
            .conn_ref()
            .query_row(
                "SELECT key_hash, policy_no_norm FROM contracts WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(key_hash.is_some());
        assert_eq!(policy_norm, "AB123");
    }
}
