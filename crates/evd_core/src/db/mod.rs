use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::AppError;

const MIGRATION_0001: (&str, &str) = (
    "0001_init.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0001_init.sql"
    )),
);

const MIGRATION_0002: (&str, &str) = (
    "0002_fulltext_and_semantic.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0002_fulltext_and_semantic.sql"
    )),
);

const MIGRATION_0003: (&str, &str) = (
    "0003_timeline_and_anomalies.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0003_timeline_and_anomalies.sql"
    )),
);

/// How long a writer waits on the database lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![MIGRATION_0001, MIGRATION_0002, MIGRATION_0003]
}

/// Open a file-backed database. WAL mode gives readers a stable snapshot while
/// ingestion writes.
pub fn open(path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(path).map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to open SQLite database")
            .with_details(format!("path={}; err={}", path.display(), e))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to configure busy timeout")
            .with_details(e.to_string())
    })?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to enable WAL journal mode")
            .with_details(e.to_string())
    })?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to enable foreign keys")
            .with_details(e.to_string())
    })?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory().map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to open in-memory SQLite database")
            .with_details(e.to_string())
    })?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to enable foreign keys")
            .with_details(e.to_string())
    })?;
    Ok(conn)
}

pub fn migrate(conn: &mut Connection) -> Result<(), AppError> {
    // Track migrations by name, applying each exactly once, in deterministic order.
    conn.execute_batch(
        r#"
      CREATE TABLE IF NOT EXISTS _migrations (
        name TEXT PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL
      );
    "#,
    )
    .map_err(|e| {
        AppError::new(
            "DB_MIGRATIONS_TABLE_FAILED",
            "Failed to ensure migrations table exists",
        )
        .with_details(e.to_string())
    })?;

    let applied: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT name FROM _migrations").map_err(|e| {
            AppError::new(
                "DB_MIGRATIONS_QUERY_FAILED",
                "Failed to query applied migrations",
            )
            .with_details(e.to_string())
        })?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| {
                AppError::new(
                    "DB_MIGRATIONS_QUERY_FAILED",
                    "Failed to read applied migrations",
                )
                .with_details(e.to_string())
            })?;

        let mut set = HashSet::new();
        for r in rows {
            set.insert(r.map_err(|e| {
                AppError::new(
                    "DB_MIGRATIONS_QUERY_FAILED",
                    "Failed to read applied migration row",
                )
                .with_details(e.to_string())
            })?);
        }
        set
    };

    for (name, sql) in migrations() {
        if applied.contains(name) {
            continue;
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                AppError::new("DB_TX_FAILED", "Failed to start migration transaction")
                    .with_details(e.to_string())
            })?;

        // Another connection may have applied it while we waited for the lock.
        let already: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .map_err(|e| {
                AppError::new("DB_MIGRATIONS_QUERY_FAILED", "Failed to re-check migration")
                    .with_details(e.to_string())
            })?;
        if already > 0 {
            continue;
        }

        tx.execute_batch(sql).map_err(|e| {
            AppError::new("DB_MIGRATION_FAILED", format!("Migration {name} failed"))
                .with_details(e.to_string())
        })?;

        tx.execute(
            "INSERT INTO _migrations(name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
            [name],
        )
        .map_err(|e| {
            AppError::new("DB_MIGRATION_FAILED", format!("Failed to record migration {name}"))
                .with_details(e.to_string())
        })?;

        tx.commit().map_err(|e| {
            AppError::new("DB_TX_FAILED", "Failed to commit migration transaction")
                .with_details(e.to_string())
        })?;
        tracing::debug!(migration = name, "applied migration");
    }

    Ok(())
}
