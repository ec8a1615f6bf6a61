use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::bates::BatesNumber;
use crate::domain::{DateSource, DocumentFormat, EvidenceItem, FailedIngestion, SourcedDate};
use crate::error::{db_err, AppError};
use crate::normalize::dates::{format_date, parse_date_strict};

/// Subset of the corpus a read operates on. Empty filter means everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvidenceFilter {
    pub party: Option<String>,
    pub category: Option<String>,
    pub format: Option<DocumentFormat>,
    /// Explicit identifiers; when set only these items are returned.
    pub bates_numbers: Option<Vec<String>>,
}

const EVIDENCE_COLUMNS: &str = r#"
  id, bates_number, sha256, source_path, format, byte_len, extracted_text,
  declared_date, declared_date_source, observed_date, observed_date_source, ingested_at
"#;

struct EvidenceRow {
    id: i64,
    bates_number: String,
    sha256: String,
    source_path: String,
    format: String,
    byte_len: i64,
    extracted_text: String,
    declared_date: Option<String>,
    declared_date_source: Option<String>,
    observed_date: Option<String>,
    observed_date_source: Option<String>,
    ingested_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<EvidenceRow> {
    Ok(EvidenceRow {
        id: row.get(0)?,
        bates_number: row.get(1)?,
        sha256: row.get(2)?,
        source_path: row.get(3)?,
        format: row.get(4)?,
        byte_len: row.get(5)?,
        extracted_text: row.get(6)?,
        declared_date: row.get(7)?,
        declared_date_source: row.get(8)?,
        observed_date: row.get(9)?,
        observed_date_source: row.get(10)?,
        ingested_at: row.get(11)?,
    })
}

fn sourced_date(
    bates: &str,
    field: &str,
    date: Option<String>,
    source: Option<String>,
) -> Result<Option<SourcedDate>, AppError> {
    let (Some(date), Some(source)) = (date, source) else {
        return Ok(None);
    };
    let date = parse_date_strict(field, &date)?;
    let source = DateSource::parse(&source).ok_or_else(|| {
        AppError::new("DB_ROW_INVALID", "Unknown date source on evidence row")
            .with_details(format!("bates={bates}; field={field}; source={source}"))
    })?;
    Ok(Some(SourcedDate { date, source }))
}

fn load_tags(conn: &Connection, evidence_id: i64, kind: &str) -> Result<Vec<String>, AppError> {
    let mut stmt = conn
        .prepare("SELECT tag FROM evidence_tags WHERE evidence_id = ?1 AND kind = ?2 ORDER BY tag")
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare tag query"))?;
    let rows = stmt
        .query_map(params![evidence_id, kind], |row| row.get::<_, String>(0))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query tags"))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode tag row"))?);
    }
    Ok(out)
}

fn hydrate(conn: &Connection, row: EvidenceRow) -> Result<EvidenceItem, AppError> {
    let format = DocumentFormat::parse(&row.format).ok_or_else(|| {
        AppError::new("DB_ROW_INVALID", "Unknown document format on evidence row")
            .with_details(format!("bates={}; format={}", row.bates_number, row.format))
    })?;
    let declared_date = sourced_date(
        &row.bates_number,
        "declared_date",
        row.declared_date,
        row.declared_date_source,
    )?;
    let observed_date = sourced_date(
        &row.bates_number,
        "observed_date",
        row.observed_date,
        row.observed_date_source,
    )?;
    Ok(EvidenceItem {
        party_tags: load_tags(conn, row.id, "party")?,
        category_tags: load_tags(conn, row.id, "category")?,
        bates_number: row.bates_number,
        sha256: row.sha256,
        source_path: row.source_path,
        format,
        byte_len: u64::try_from(row.byte_len).unwrap_or(0),
        extracted_text: row.extracted_text,
        declared_date,
        observed_date,
        ingested_at: row.ingested_at,
    })
}

/// Persist a new evidence row and its tags inside the allocating transaction.
pub(crate) fn insert_evidence(
    tx: &Transaction<'_>,
    number: &BatesNumber,
    item: &EvidenceItem,
) -> Result<i64, AppError> {
    let date_cols = |d: &Option<SourcedDate>| match d {
        Some(sd) => (Some(format_date(sd.date)), Some(sd.source.as_str())),
        None => (None, None),
    };
    let (declared, declared_src) = date_cols(&item.declared_date);
    let (observed, observed_src) = date_cols(&item.observed_date);

    tx.execute(
        r#"
        INSERT INTO evidence_items(
          bates_prefix, bates_seq, bates_number, sha256, source_path, format, byte_len,
          extracted_text, declared_date, declared_date_source, observed_date,
          observed_date_source, ingested_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            number.prefix,
            number.seq as i64,
            item.bates_number,
            item.sha256,
            item.source_path,
            item.format.as_str(),
            item.byte_len as i64,
            item.extracted_text,
            declared,
            declared_src,
            observed,
            observed_src,
            item.ingested_at,
        ],
    )
    .map_err(|e| {
        AppError::new("DB_WRITE_FAILED", "Failed to insert evidence item").with_details(format!(
            "bates={}; path={}; err={}",
            item.bates_number, item.source_path, e
        ))
    })?;
    let id = tx.last_insert_rowid();

    let mut stmt = tx
        .prepare("INSERT OR IGNORE INTO evidence_tags(evidence_id, kind, tag) VALUES (?1, ?2, ?3)")
        .map_err(db_err("DB_WRITE_FAILED", "Failed to prepare tag insert"))?;
    for (kind, tags) in [("party", &item.party_tags), ("category", &item.category_tags)] {
        for tag in tags {
            stmt.execute(params![id, kind, tag])
                .map_err(db_err("DB_WRITE_FAILED", "Failed to insert evidence tag"))?;
        }
    }
    Ok(id)
}

pub fn get_evidence(conn: &Connection, bates_number: &str) -> Result<EvidenceItem, AppError> {
    let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence_items WHERE bates_number = ?1");
    let row = conn
        .query_row(&sql, [bates_number], read_row)
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to load evidence item"))?
        .ok_or_else(|| {
            AppError::not_found("EVIDENCE_NOT_FOUND", "Evidence item not found")
                .with_details(format!("bates={bates_number}"))
        })?;
    hydrate(conn, row)
}

pub fn find_by_hash(conn: &Connection, sha256: &str) -> Result<Option<EvidenceItem>, AppError> {
    let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence_items WHERE sha256 = ?1");
    let row = conn
        .query_row(&sql, [sha256], read_row)
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to look up evidence by hash"))?;
    row.map(|r| hydrate(conn, r)).transpose()
}

/// Evidence matching `filter`, in identifier order.
pub fn list_evidence(conn: &Connection, filter: &EvidenceFilter) -> Result<Vec<EvidenceItem>, AppError> {
    let sql = format!(
        "SELECT {EVIDENCE_COLUMNS} FROM evidence_items ORDER BY bates_prefix, bates_seq"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare evidence query"))?;
    let rows = stmt
        .query_map([], read_row)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query evidence"))?;

    let mut out = Vec::new();
    for r in rows {
        let row = r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode evidence row"))?;
        if let Some(wanted) = &filter.bates_numbers {
            if !wanted.iter().any(|b| b == &row.bates_number) {
                continue;
            }
        }
        if let Some(format) = filter.format {
            if row.format != format.as_str() {
                continue;
            }
        }
        let item = hydrate(conn, row)?;
        if let Some(party) = &filter.party {
            if !item.party_tags.iter().any(|t| t.eq_ignore_ascii_case(party)) {
                continue;
            }
        }
        if let Some(category) = &filter.category {
            if !item.category_tags.iter().any(|t| t.eq_ignore_ascii_case(category)) {
                continue;
            }
        }
        out.push(item);
    }
    Ok(out)
}

pub fn count_evidence(conn: &Connection) -> Result<i64, AppError> {
    conn.query_row("SELECT COUNT(*) FROM evidence_items", [], |row| row.get(0))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to count evidence items"))
}

pub fn record_failed_ingestion(conn: &Connection, failed: &FailedIngestion) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO failed_ingestions(source_path, sha256, reason_code, details, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            failed.source_path,
            failed.sha256,
            failed.reason_code,
            failed.details,
            failed.recorded_at
        ],
    )
    .map_err(|e| {
        AppError::new("DB_WRITE_FAILED", "Failed to record failed ingestion")
            .with_details(format!("path={}; err={}", failed.source_path, e))
    })?;
    Ok(())
}

pub fn list_failed_ingestions(conn: &Connection) -> Result<Vec<FailedIngestion>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT source_path, sha256, reason_code, details, recorded_at FROM failed_ingestions ORDER BY id",
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare failed-ingestion query"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(FailedIngestion {
                source_path: row.get(0)?,
                sha256: row.get(1)?,
                reason_code: row.get(2)?,
                details: row.get(3)?,
                recorded_at: row.get(4)?,
            })
        })
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query failed ingestions"))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode failed-ingestion row"))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::TransactionBehavior;
    use time::macros::date;

    fn sample(bates: &str, sha: &str) -> EvidenceItem {
        EvidenceItem {
            bates_number: bates.to_string(),
            sha256: sha.to_string(),
            source_path: "/case/memo.txt".to_string(),
            format: DocumentFormat::Plaintext,
            byte_len: 12,
            extracted_text: "denial memo".to_string(),
            declared_date: Some(SourcedDate {
                date: date!(2022 - 01 - 10),
                source: DateSource::Filename,
            }),
            observed_date: None,
            party_tags: vec!["insurer".to_string()],
            category_tags: vec!["denial".to_string(), "plaintext".to_string()],
            ingested_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn evidence_round_trips_and_rows_are_immutable() {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        let item = sample("EVD-000001", &"a".repeat(64));
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        let number = BatesNumber::parse("EVD-000001").unwrap();
        insert_evidence(&tx, &number, &item).unwrap();
        tx.commit().unwrap();

        assert_eq!(get_evidence(&conn, "EVD-000001").unwrap(), item);
        assert_eq!(find_by_hash(&conn, &"a".repeat(64)).unwrap(), Some(item));
        assert_eq!(count_evidence(&conn).unwrap(), 1);

        assert!(conn.execute("DELETE FROM evidence_items", []).is_err());
        assert!(conn
            .execute("UPDATE evidence_items SET extracted_text = 'forged'", [])
            .is_err());
        assert_eq!(
            get_evidence(&conn, "EVD-000009").unwrap_err().code,
            "EVIDENCE_NOT_FOUND"
        );
    }

    #[test]
    fn filter_by_party_and_category() {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        let a = sample("EVD-000001", &"a".repeat(64));
        let mut b = sample("EVD-000002", &"b".repeat(64));
        b.party_tags = vec!["claimant".to_string()];
        insert_evidence(&tx, &BatesNumber::parse("EVD-000001").unwrap(), &a).unwrap();
        insert_evidence(&tx, &BatesNumber::parse("EVD-000002").unwrap(), &b).unwrap();
        tx.commit().unwrap();

        let by_party = list_evidence(
            &conn,
            &EvidenceFilter {
                party: Some("Claimant".to_string()),
                ..EvidenceFilter::default()
            },
        )
        .unwrap();
        assert_eq!(by_party.len(), 1);
        assert_eq!(by_party[0].bates_number, "EVD-000002");
        assert_eq!(list_evidence(&conn, &EvidenceFilter::default()).unwrap().len(), 2);
    }
}
