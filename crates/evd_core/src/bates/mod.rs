use std::fmt;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BatesConfig;
use crate::error::{db_err, AppError};
use crate::normalize::dates::now_rfc3339_utc;

const MAX_PREFIX_LEN: usize = 16;

/// A sequential evidence identifier, rendered as `PREFIX-000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatesNumber {
    pub prefix: String,
    pub seq: u64,
    pub width: u32,
}

impl BatesNumber {
    /// Parse `PREFIX-NNNNNN`. The width is taken from the digit run.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let invalid = || {
            AppError::validation("BATES_INVALID", "Identifier must look like PREFIX-000001")
                .with_details(format!("identifier={raw}"))
        };
        let (prefix, digits) = raw.trim().rsplit_once('-').ok_or_else(invalid)?;
        validate_prefix(prefix).map_err(|_| invalid())?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let seq: u64 = digits.parse().map_err(|_| invalid())?;
        if seq == 0 {
            return Err(invalid());
        }
        Ok(Self {
            prefix: prefix.to_string(),
            seq,
            width: digits.len() as u32,
        })
    }
}

impl fmt::Display for BatesNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:0width$}",
            self.prefix,
            self.seq,
            width = self.width as usize
        )
    }
}

pub fn validate_prefix(prefix: &str) -> Result<(), AppError> {
    let ok = !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX_LEN
        && prefix.starts_with(|c: char| c.is_ascii_uppercase())
        && prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(AppError::validation(
            "BATES_PREFIX_INVALID",
            "Bates prefix must be 1-16 uppercase letters, digits, or underscores, starting with a letter",
        )
        .with_details(format!("prefix={prefix}")));
    }
    Ok(())
}

/// What `BatesAllocator::open` found when reconciling the counter with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterRecovery {
    Initialized,
    Consistent,
    RebuiltFromLedger { next_seq: u64 },
}

/// Issues strictly increasing identifiers from a durable counter.
///
/// The counter row and the append-only ledger are updated in the same write
/// transaction, so concurrent allocators on separate connections serialize on
/// SQLite's write lock and can never hand out the same number twice.
#[derive(Debug, Clone)]
pub struct BatesAllocator {
    prefix: String,
    width: u32,
    recovery: CounterRecovery,
}

fn corrupt(prefix: &str, reason: &str) -> AppError {
    AppError::new(
        "BATES_COUNTER_CORRUPT",
        "Identifier counter is inconsistent with issued identifiers; refusing to allocate",
    )
    .with_details(format!("prefix={prefix}; reason={reason}"))
}

impl BatesAllocator {
    pub fn open(conn: &mut Connection, cfg: &BatesConfig) -> Result<Self, AppError> {
        validate_prefix(&cfg.prefix)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("DB_TX_FAILED", "Failed to start allocator recovery"))?;
        let recovery = reconcile(&tx, cfg)?;
        tx.commit()
            .map_err(db_err("DB_TX_FAILED", "Failed to commit allocator recovery"))?;

        match recovery {
            CounterRecovery::RebuiltFromLedger { next_seq } => {
                warn!(prefix = %cfg.prefix, next_seq, "rebuilt bates counter from ledger")
            }
            CounterRecovery::Initialized => info!(prefix = %cfg.prefix, "initialized bates counter"),
            CounterRecovery::Consistent => {}
        }

        Ok(Self {
            prefix: cfg.prefix.clone(),
            width: cfg.width,
            recovery,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn recovery(&self) -> CounterRecovery {
        self.recovery
    }

    /// Allocate one identifier in its own write transaction.
    pub fn allocate(&self, conn: &mut Connection) -> Result<BatesNumber, AppError> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("DB_TX_FAILED", "Failed to start allocation transaction"))?;
        let n = self.allocate_in(&tx)?;
        tx.commit()
            .map_err(db_err("DB_TX_FAILED", "Failed to commit allocation"))?;
        Ok(n)
    }

    /// Allocate inside a caller-owned write transaction; rolled back with it.
    pub fn allocate_in(&self, tx: &Transaction<'_>) -> Result<BatesNumber, AppError> {
        let next: Option<i64> = tx
            .query_row(
                "SELECT next_seq FROM bates_counter WHERE prefix = ?1",
                [&self.prefix],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("DB_QUERY_FAILED", "Failed to read bates counter"))?;
        let Some(next) = next else {
            return Err(corrupt(&self.prefix, "counter row missing"));
        };
        let seq = u64::try_from(next).map_err(|_| corrupt(&self.prefix, "negative counter"))?;

        let ledger_max: Option<i64> = tx
            .query_row(
                "SELECT MAX(seq) FROM bates_ledger WHERE prefix = ?1",
                [&self.prefix],
                |row| row.get(0),
            )
            .map_err(db_err("DB_QUERY_FAILED", "Failed to read bates ledger"))?;
        if ledger_max.unwrap_or(0) >= next {
            return Err(corrupt(&self.prefix, "counter behind ledger"));
        }

        let capacity = 10u64.saturating_pow(self.width).saturating_sub(1);
        if seq > capacity {
            return Err(AppError::new(
                "BATES_RANGE_EXHAUSTED",
                "Identifier width exhausted for this prefix",
            )
            .with_details(format!("prefix={}; width={}; next_seq={seq}", self.prefix, self.width)));
        }

        let bumped = tx
            .execute(
                "UPDATE bates_counter SET next_seq = ?1 WHERE prefix = ?2 AND next_seq = ?3",
                rusqlite::params![next + 1, &self.prefix, next],
            )
            .map_err(db_err("DB_WRITE_FAILED", "Failed to advance bates counter"))?;
        if bumped != 1 {
            return Err(corrupt(&self.prefix, "counter changed during allocation"));
        }

        let number = BatesNumber {
            prefix: self.prefix.clone(),
            seq,
            width: self.width,
        };
        tx.execute(
            "INSERT INTO bates_ledger(prefix, seq, bates_number, issued_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![&self.prefix, next, number.to_string(), now_rfc3339_utc()],
        )
        .map_err(|e| {
            AppError::new("BATES_LEDGER_WRITE_FAILED", "Failed to record issued identifier")
                .with_details(format!("identifier={number}; err={e}"))
        })?;

        Ok(number)
    }
}

/// Compare the durable counter with the ledger and evidence rows.
///
/// Anything other than `counter == max issued + 1` with a gap-free ledger is fatal,
/// except a missing counter row, which is rebuilt from the ledger maximum. The
/// configured width must match the issued identifiers so rendered identifiers
/// keep sorting in issue order.
fn reconcile(tx: &Transaction<'_>, cfg: &BatesConfig) -> Result<CounterRecovery, AppError> {
    let prefix = cfg.prefix.as_str();
    let counter: Option<i64> = tx
        .query_row(
            "SELECT next_seq FROM bates_counter WHERE prefix = ?1",
            [prefix],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to read bates counter"))?;

    let (ledger_count, ledger_max, ledger_min): (i64, Option<i64>, Option<i64>) = tx
        .query_row(
            "SELECT COUNT(*), MAX(seq), MIN(seq) FROM bates_ledger WHERE prefix = ?1",
            [prefix],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to scan bates ledger"))?;

    let unledgered: i64 = tx
        .query_row(
            r#"
      SELECT COUNT(*) FROM evidence_items e
      WHERE e.bates_prefix = ?1
        AND NOT EXISTS (SELECT 1 FROM bates_ledger l WHERE l.bates_number = e.bates_number)
      "#,
            [prefix],
            |row| row.get(0),
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to cross-check evidence identifiers"))?;
    if unledgered > 0 {
        return Err(corrupt(prefix, "evidence identifiers missing from ledger"));
    }

    let max = ledger_max.unwrap_or(0);
    if ledger_count > 0 && (ledger_min != Some(1) || ledger_count != max) {
        return Err(corrupt(prefix, "ledger has gaps"));
    }

    if max > 0 {
        check_width(tx, cfg)?;
    }

    match counter {
        None => {
            tx.execute(
                "INSERT INTO bates_counter(prefix, next_seq) VALUES (?1, ?2)",
                rusqlite::params![prefix, max + 1],
            )
            .map_err(db_err("DB_WRITE_FAILED", "Failed to initialize bates counter"))?;
            if ledger_count == 0 {
                Ok(CounterRecovery::Initialized)
            } else {
                Ok(CounterRecovery::RebuiltFromLedger {
                    next_seq: (max + 1) as u64,
                })
            }
        }
        Some(n) if n == max + 1 => Ok(CounterRecovery::Consistent),
        Some(n) if n <= max => Err(corrupt(prefix, "counter behind ledger")),
        Some(_) => Err(corrupt(prefix, "counter ahead of ledger")),
    }
}

fn check_width(tx: &Transaction<'_>, cfg: &BatesConfig) -> Result<(), AppError> {
    let first: String = tx
        .query_row(
            "SELECT bates_number FROM bates_ledger WHERE prefix = ?1 AND seq = 1",
            [&cfg.prefix],
            |row| row.get(0),
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to read first issued identifier"))?;
    let issued = BatesNumber::parse(&first)
        .map_err(|_| corrupt(&cfg.prefix, "unparseable ledger identifier"))?;
    if issued.width != cfg.width {
        return Err(AppError::validation(
            "BATES_WIDTH_MISMATCH",
            "Configured identifier width differs from identifiers already issued for this prefix",
        )
        .with_details(format!(
            "prefix={}; issued_width={}; configured_width={}",
            cfg.prefix, issued.width, cfg.width
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> Connection {
        let mut conn = db::open_in_memory().expect("open");
        db::migrate(&mut conn).expect("migrate");
        conn
    }

    #[test]
    fn formats_and_parses_identifiers() {
        let n = BatesNumber {
            prefix: "SEDG".to_string(),
            seq: 42,
            width: 6,
        };
        assert_eq!(n.to_string(), "SEDG-000042");
        assert_eq!(BatesNumber::parse("SEDG-000042").unwrap(), n);
        assert!(BatesNumber::parse("sedg-000042").is_err());
        assert!(BatesNumber::parse("SEDG-0000x2").is_err());
        assert!(BatesNumber::parse("SEDG-000000").is_err());
        assert!(BatesNumber::parse("SEDG").is_err());
    }

    #[test]
    fn allocates_strictly_increasing_numbers() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        assert_eq!(alloc.recovery(), CounterRecovery::Initialized);

        let a = alloc.allocate(&mut conn).unwrap();
        let b = alloc.allocate(&mut conn).unwrap();
        assert_eq!(a.to_string(), "EVD-000001");
        assert_eq!(b.to_string(), "EVD-000002");
    }

    #[test]
    fn reopen_resumes_after_last_issued() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        alloc.allocate(&mut conn).unwrap();
        alloc.allocate(&mut conn).unwrap();

        let again = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        assert_eq!(again.recovery(), CounterRecovery::Consistent);
        assert_eq!(again.allocate(&mut conn).unwrap().seq, 3);
    }

    #[test]
    fn missing_counter_is_rebuilt_from_ledger() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        alloc.allocate(&mut conn).unwrap();
        alloc.allocate(&mut conn).unwrap();
        conn.execute("DELETE FROM bates_counter", []).unwrap();

        let again = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        assert_eq!(
            again.recovery(),
            CounterRecovery::RebuiltFromLedger { next_seq: 3 }
        );
        assert_eq!(again.allocate(&mut conn).unwrap().seq, 3);
    }

    #[test]
    fn rewound_or_skipped_counter_is_fatal() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        alloc.allocate(&mut conn).unwrap();
        alloc.allocate(&mut conn).unwrap();

        conn.execute("UPDATE bates_counter SET next_seq = 2", []).unwrap();
        let err = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap_err();
        assert_eq!(err.code, "BATES_COUNTER_CORRUPT");
        assert!(err.is_fatal());
        let err = alloc.allocate(&mut conn).unwrap_err();
        assert_eq!(err.code, "BATES_COUNTER_CORRUPT");

        conn.execute("UPDATE bates_counter SET next_seq = 9", []).unwrap();
        let err = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap_err();
        assert_eq!(err.code, "BATES_COUNTER_CORRUPT");
    }

    #[test]
    fn width_exhaustion_is_an_error_not_a_wider_number() {
        let mut conn = setup();
        let cfg = BatesConfig {
            prefix: "TINY".to_string(),
            width: 1,
        };
        let alloc = BatesAllocator::open(&mut conn, &cfg).unwrap();
        for _ in 0..9 {
            alloc.allocate(&mut conn).unwrap();
        }
        let err = alloc.allocate(&mut conn).unwrap_err();
        assert_eq!(err.code, "BATES_RANGE_EXHAUSTED");
    }

    #[test]
    fn reopening_with_a_different_width_is_refused() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        alloc.allocate(&mut conn).unwrap();
        alloc.allocate(&mut conn).unwrap();

        let wider = BatesConfig {
            width: 8,
            ..BatesConfig::default()
        };
        let err = BatesAllocator::open(&mut conn, &wider).unwrap_err();
        assert_eq!(err.code, "BATES_WIDTH_MISMATCH");

        // A fresh prefix may use any width.
        let other = BatesConfig {
            prefix: "DEF".to_string(),
            width: 8,
        };
        let def = BatesAllocator::open(&mut conn, &other).unwrap();
        assert_eq!(def.allocate(&mut conn).unwrap().to_string(), "DEF-00000001");
        assert_eq!(
            BatesAllocator::open(&mut conn, &BatesConfig::default())
                .unwrap()
                .allocate(&mut conn)
                .unwrap()
                .to_string(),
            "EVD-000003"
        );
    }

    #[test]
    fn ledger_rows_cannot_be_deleted() {
        let mut conn = setup();
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).unwrap();
        alloc.allocate(&mut conn).unwrap();
        assert!(conn.execute("DELETE FROM bates_ledger", []).is_err());
    }
}
