//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//!
//! Databases written by the earlier spreadsheet tool predate the framework:
//! they have a `customers` table but no `schema_version` rows. For those the
//! bootstrap step adds every column the baseline indexes rely on, after which
//! the baseline (all `IF NOT EXISTS`) completes the schema without touching
//! existing rows.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Columns a legacy database may be missing, per table.
const LEGACY_COLUMNS: &[(&str, &[(&str, &str)])] = &[
    (
        "customers",
        &[
            ("name_norm", "TEXT NOT NULL DEFAULT ''"),
            ("phone_norm", "TEXT NOT NULL DEFAULT ''"),
            ("birth_norm", "TEXT NOT NULL DEFAULT ''"),
            ("gender", "TEXT"),
            ("region", "TEXT"),
            ("address", "TEXT"),
            ("email", "TEXT"),
            ("source", "TEXT"),
            ("memo", "TEXT"),
            ("custom_data", "TEXT"),
            ("match_key", "TEXT NOT NULL DEFAULT ''"),
            ("origin_hash", "TEXT"),
            ("stable_hash", "TEXT"),
            ("created_at", "TEXT NOT NULL DEFAULT ''"),
            ("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    ),
    (
        "contracts",
        &[
            ("policy_no_norm", "TEXT NOT NULL DEFAULT ''"),
            ("coverage_summary", "TEXT"),
            ("insured_name", "TEXT"),
            ("insured_phone", "TEXT"),
            ("insured_birth", "TEXT"),
            ("insured_gender", "TEXT"),
            ("policyholder_name", "TEXT"),
            ("policyholder_type", "TEXT"),
            ("policyholder_norm", "TEXT"),
            ("policyholder_phone", "TEXT"),
            ("primary_role", "TEXT"),
            ("key_hash", "TEXT"),
            ("stable_hash", "TEXT"),
            ("content_hash", "TEXT"),
            ("origin_hash", "TEXT"),
            ("created_at", "TEXT NOT NULL DEFAULT ''"),
            ("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    ),
];

fn ensure_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("schema_version: {}", e))
}

/// Highest applied version; 0 on a blank database.
fn schema_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row("SELECT IFNULL(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
        .map_err(|e| format!("schema_version: {}", e))
}

fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| format!("Failed to inspect {}: {}", table, e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("Failed to inspect {}: {}", table, e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to inspect {}: {}", table, e))
}

/// Add any missing columns to the tables of a pre-framework database.
///
/// Returns true if the database was recognised as legacy.
fn bootstrap_legacy_db(conn: &Connection) -> Result<bool, String> {
    if schema_version(conn)? > 0 || !table_exists(conn, "customers") {
        return Ok(false);
    }

    for (table, columns) in LEGACY_COLUMNS {
        if !table_exists(conn, table) {
            continue;
        }
        let existing = table_columns(conn, table)?;
        for (column, decl) in columns.iter() {
            if existing.iter().any(|c| c == column) {
                continue;
            }
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
                .map_err(|e| format!("Failed to add {}.{}: {}", table, column, e))?;
            log::info!("Migration bootstrap: added {}.{}", table, column);
        }
    }
    Ok(true)
}

/// Hot copy of the file database to `<path>.v<from>.bak` through the online
/// backup API. In-memory databases are left alone.
fn snapshot_before_upgrade(conn: &Connection, from: i32) -> Result<(), String> {
    let path: String = conn
        .query_row("PRAGMA database_list", [], |r| r.get(2))
        .map_err(|e| format!("database_list: {}", e))?;
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    let target = format!("{}.v{}.bak", path, from);
    let mut dest = Connection::open(&target).map_err(|e| format!("{}: {}", target, e))?;
    rusqlite::backup::Backup::new(conn, &mut dest)
        .and_then(|b| b.step(-1).map(|_| ()))
        .map_err(|e| format!("snapshot to {} failed: {}", target, e))?;
    log::info!("Snapshot of schema v{} written to {}", from, target);
    Ok(())
}

/// Bring the schema up to the newest embedded migration. Returns how many
/// migrations ran. A database stamped with a version this build does not
/// know is refused rather than downgraded.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_version_table(conn)?;

    let from = schema_version(conn)?;
    let newest = MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0);
    if from > newest {
        return Err(format!(
            "database is at schema v{} but this agentbook build only knows v{}; upgrade agentbook",
            from, newest
        ));
    }

    let outstanding: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if outstanding.is_empty() {
        return Ok(0);
    }

    snapshot_before_upgrade(conn, from)?;
    if bootstrap_legacy_db(conn)? {
        log::info!("Pre-versioning database detected; columns backfilled");
    }

    for m in &outstanding {
        conn.execute_batch(m.sql)
            .map_err(|e| format!("migration v{}: {}", m.version, e))?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [m.version])
            .map_err(|e| format!("stamping v{}: {}", m.version, e))?;
        log::info!("Schema now at v{}", m.version);
    }
    Ok(outstanding.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(schema_version(&conn).unwrap(), 1);

        for table in [
            "customers",
            "contracts",
            "upload_history",
            "upload_holds",
            "hold_decisions",
            "approval_proofs",
            "audit_logs",
        ] {
            assert!(table_exists(&conn, table), "{} should exist", table);
        }
    }

    #[test]
    fn test_key_hash_is_unique() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute("INSERT INTO customers (name) VALUES ('홍길동')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO contracts (customer_id, key_hash) VALUES (1, 'abc')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO contracts (customer_id, key_hash) VALUES (1, 'abc')",
            [],
        );
        assert!(dup.is_err(), "duplicate key_hash must be rejected");
    }

    #[test]
    fn test_decision_trail_is_append_only() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO upload_holds (file_hash, row_no, reason_code) VALUES ('f', 1, 'HOLD')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO hold_decisions (hold_id, decision) VALUES (1, 'SKIP')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO audit_logs (event_type, ref_table) VALUES ('X', 'upload_holds')",
            [],
        )
        .unwrap();

        let err = conn
            .execute("UPDATE hold_decisions SET decision = 'CREATE_NEW'", [])
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
        assert!(conn.execute("DELETE FROM audit_logs", []).is_err());
    }

    #[test]
    fn test_legacy_db_is_upgraded_in_place() {
        let conn = mem_db();
        conn.execute_batch(
            "CREATE TABLE customers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                phone TEXT,
                birth_date TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
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
                end_date TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO customers (name, phone) VALUES ('홍길동', '010-1234-5678');",
        )
        .unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), 1);

        let columns = table_columns(&conn, "customers").unwrap();
        assert!(columns.iter().any(|c| c == "phone_norm"));
        assert!(columns.iter().any(|c| c == "match_key"));
        let columns = table_columns(&conn, "contracts").unwrap();
        assert!(columns.iter().any(|c| c == "key_hash"));

        let name: String = conn
            .query_row("SELECT name FROM customers WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "홍길동");
    }

    #[test]
    fn test_unknown_newer_schema_is_refused() {
        let conn = mem_db();
        ensure_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (42)", [])
            .unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(err.contains("schema v42"), "{}", err);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_file_db_is_snapshotted_before_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.db");
        let conn = Connection::open(&path).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert!(dir.path().join("book.db.v0.bak").exists());
    }
}
