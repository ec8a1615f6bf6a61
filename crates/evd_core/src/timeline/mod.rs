//! Dated events and their append-only links to evidence.

pub mod correlation;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::info;

use crate::domain::TimelineEvent;
use crate::error::{db_err, AppError};
use crate::normalize::dates::{format_date, now_rfc3339_utc, parse_date, parse_date_strict};

pub use correlation::{
    correlate, proximity, CorrelatedEvent, CorrelationRequest, CorrelationResult, LinkedEvidence,
    ProximityStatistic,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTimelineEvent {
    pub event_date: Date,
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventQuery {
    pub from: Option<Date>,
    pub to: Option<Date>,
    /// Empty means all categories.
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineImportIssue {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineImportSummary {
    pub inserted: usize,
    pub linked: usize,
    pub skipped: Vec<TimelineImportIssue>,
}

pub(crate) fn normalize_category(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn validate_new(new: &NewTimelineEvent) -> Result<(), AppError> {
    if new.title.trim().is_empty() {
        return Err(AppError::validation("TIMELINE_TITLE_REQUIRED", "Event title is required"));
    }
    if normalize_category(&new.category).is_empty() {
        return Err(AppError::validation(
            "TIMELINE_CATEGORY_REQUIRED",
            "Event category is required",
        )
        .with_details(format!("title={}", new.title)));
    }
    Ok(())
}

fn insert_event(conn: &Connection, new: &NewTimelineEvent) -> Result<i64, AppError> {
    conn.execute(
        "INSERT INTO timeline_events(event_date, category, title, description, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            format_date(new.event_date),
            normalize_category(&new.category),
            new.title.trim(),
            new.description,
            now_rfc3339_utc()
        ],
    )
    .map_err(db_err("DB_WRITE_FAILED", "Failed to insert timeline event"))?;
    let id = conn.last_insert_rowid();
    let mut stmt = conn
        .prepare("INSERT OR IGNORE INTO timeline_participants(event_id, participant) VALUES (?1, ?2)")
        .map_err(db_err("DB_WRITE_FAILED", "Failed to prepare participant insert"))?;
    for p in &new.participants {
        let p = p.trim();
        if !p.is_empty() {
            stmt.execute(params![id, p])
                .map_err(db_err("DB_WRITE_FAILED", "Failed to insert event participant"))?;
        }
    }
    Ok(id)
}

pub fn create_event(conn: &mut Connection, new: &NewTimelineEvent) -> Result<TimelineEvent, AppError> {
    validate_new(new)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start event insert"))?;
    let id = insert_event(&tx, new)?;
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit event insert"))?;
    get_event(conn, id)
}

fn ensure_evidence_exists(conn: &Connection, bates_number: &str) -> Result<(), AppError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM evidence_items WHERE bates_number = ?1",
            [bates_number],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to look up evidence item"))?;
    match found {
        Some(_) => Ok(()),
        None => Err(AppError::not_found("EVIDENCE_NOT_FOUND", "Evidence item not found")
            .with_details(format!("bates={bates_number}"))),
    }
}

fn ensure_event_exists(conn: &Connection, event_id: i64) -> Result<(), AppError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM timeline_events WHERE id = ?1", [event_id], |row| row.get(0))
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to look up timeline event"))?;
    match found {
        Some(_) => Ok(()),
        None => Err(AppError::not_found("TIMELINE_EVENT_NOT_FOUND", "Timeline event not found")
            .with_details(format!("event_id={event_id}"))),
    }
}

/// Returns how many links were new.
fn insert_links(conn: &Connection, event_id: i64, bates_numbers: &[String]) -> Result<usize, AppError> {
    ensure_event_exists(conn, event_id)?;
    let mut added = 0;
    for bates in bates_numbers {
        ensure_evidence_exists(conn, bates)?;
        added += conn
            .execute(
                "INSERT OR IGNORE INTO timeline_links(event_id, bates_number, linked_at) VALUES (?1, ?2, ?3)",
                params![event_id, bates, now_rfc3339_utc()],
            )
            .map_err(|e| {
                AppError::new("DB_WRITE_FAILED", "Failed to link evidence to event")
                    .with_details(format!("event_id={event_id}; bates={bates}; err={e}"))
            })?;
    }
    Ok(added)
}

/// Attach evidence to an event. Links are additive; existing links are kept.
pub fn link_evidence(
    conn: &mut Connection,
    event_id: i64,
    bates_numbers: &[String],
) -> Result<TimelineEvent, AppError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start link transaction"))?;
    let added = insert_links(&tx, event_id, bates_numbers)?;
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit evidence links"))?;
    info!(event_id, added, "linked evidence to timeline event");
    get_event(conn, event_id)
}

fn strings(conn: &Connection, sql: &str, event_id: i64) -> Result<Vec<String>, AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare event detail query"))?;
    let rows = stmt
        .query_map([event_id], |row| row.get::<_, String>(0))
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query event details"))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode event detail row"))?);
    }
    Ok(out)
}

type EventRow = (i64, String, String, String, Option<String>, String);

fn hydrate(conn: &Connection, row: EventRow) -> Result<TimelineEvent, AppError> {
    let (id, date, category, title, description, created_at) = row;
    Ok(TimelineEvent {
        id,
        event_date: parse_date_strict("event_date", &date)?,
        category,
        title,
        description,
        participants: strings(
            conn,
            "SELECT participant FROM timeline_participants WHERE event_id = ?1 ORDER BY participant",
            id,
        )?,
        evidence: strings(
            conn,
            "SELECT bates_number FROM timeline_links WHERE event_id = ?1 ORDER BY bates_number",
            id,
        )?,
        created_at,
    })
}

fn read_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

pub fn get_event(conn: &Connection, event_id: i64) -> Result<TimelineEvent, AppError> {
    let row = conn
        .query_row(
            "SELECT id, event_date, category, title, description, created_at FROM timeline_events WHERE id = ?1",
            [event_id],
            read_event_row,
        )
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to load timeline event"))?
        .ok_or_else(|| {
            AppError::not_found("TIMELINE_EVENT_NOT_FOUND", "Timeline event not found")
                .with_details(format!("event_id={event_id}"))
        })?;
    hydrate(conn, row)
}

/// Events in date order (ties by id), optionally bounded and filtered by category.
pub fn list_events(conn: &Connection, q: &EventQuery) -> Result<Vec<TimelineEvent>, AppError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, event_date, category, title, description, created_at
            FROM timeline_events
            WHERE (?1 IS NULL OR event_date >= ?1) AND (?2 IS NULL OR event_date <= ?2)
            ORDER BY event_date, id
            "#,
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare event listing"))?;
    let rows = stmt
        .query_map(
            params![q.from.map(format_date), q.to.map(format_date)],
            read_event_row,
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to list timeline events"))?;

    let wanted: Vec<String> = q.categories.iter().map(|c| normalize_category(c)).collect();
    let mut out = Vec::new();
    for r in rows {
        let row = r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode timeline event"))?;
        if !wanted.is_empty() && !wanted.contains(&row.2) {
            continue;
        }
        out.push(hydrate(conn, row)?);
    }
    Ok(out)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Import events from CSV with headers `date,category,title[,description][,participants][,evidence]`.
/// `participants` and `evidence` are `;`-separated. Bad rows are skipped and reported;
/// the rest are committed together.
pub fn import_timeline_csv(conn: &mut Connection, csv_text: &str) -> Result<TimelineImportSummary, AppError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| {
            AppError::validation("TIMELINE_CSV_HEADERS_FAILED", "Failed to read timeline CSV headers")
                .with_details(e.to_string())
        })?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let (Some(date_idx), Some(category_idx), Some(title_idx)) = (col("date"), col("category"), col("title"))
    else {
        return Err(AppError::validation(
            "TIMELINE_CSV_COLUMNS_MISSING",
            "Timeline CSV needs date, category, and title columns",
        )
        .with_details(format!("headers={}", headers.join(","))));
    };
    let description_idx = col("description");
    let participants_idx = col("participants");
    let evidence_idx = col("evidence");

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start timeline import"))?;
    let mut summary = TimelineImportSummary::default();
    for (i, result) in rdr.records().enumerate() {
        let row_no = i + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                summary.skipped.push(TimelineImportIssue {
                    row: row_no,
                    reason: format!("unparseable row: {e}"),
                });
                continue;
            }
        };
        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("").to_string();

        let raw_date = field(Some(date_idx));
        let Some(event_date) = parse_date(&raw_date) else {
            summary.skipped.push(TimelineImportIssue {
                row: row_no,
                reason: format!("invalid date: {raw_date}"),
            });
            continue;
        };
        let description = field(description_idx);
        let new = NewTimelineEvent {
            event_date,
            category: field(Some(category_idx)),
            title: field(Some(title_idx)),
            description: (!description.is_empty()).then_some(description),
            participants: split_list(&field(participants_idx)),
        };
        if let Err(e) = validate_new(&new) {
            summary.skipped.push(TimelineImportIssue {
                row: row_no,
                reason: e.message,
            });
            continue;
        }
        let evidence = split_list(&field(evidence_idx));
        if let Some(missing) = evidence
            .iter()
            .find(|b| ensure_evidence_exists(&tx, b).is_err())
        {
            summary.skipped.push(TimelineImportIssue {
                row: row_no,
                reason: format!("unknown evidence: {missing}"),
            });
            continue;
        }
        let id = insert_event(&tx, &new)?;
        summary.inserted += 1;
        summary.linked += insert_links(&tx, id, &evidence)?;
    }
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit timeline import"))?;
    info!(
        inserted = summary.inserted,
        linked = summary.linked,
        skipped = summary.skipped.len(),
        "imported timeline CSV"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use pretty_assertions::assert_eq;
    use time::macros::date;

    fn conn_with_evidence(bates: &[&str]) -> Connection {
        let mut conn = db::open_in_memory().unwrap();
        db::migrate(&mut conn).unwrap();
        for (i, b) in bates.iter().enumerate() {
            conn.execute(
                r#"INSERT INTO evidence_items(bates_prefix, bates_seq, bates_number, sha256, source_path,
                   format, byte_len, extracted_text, ingested_at)
                   VALUES ('EVD', ?1, ?2, ?3, 'x.txt', 'plaintext', 1, 'x', '2024-01-01T00:00:00Z')"#,
                params![i as i64 + 1, b, format!("{:064}", i)],
            )
            .unwrap();
        }
        conn
    }

    fn new_event(d: Date, category: &str, title: &str) -> NewTimelineEvent {
        NewTimelineEvent {
            event_date: d,
            category: category.to_string(),
            title: title.to_string(),
            description: None,
            participants: vec!["J. Doe".to_string()],
        }
    }

    #[test]
    fn links_are_additive_and_dates_immutable() {
        let mut conn = conn_with_evidence(&["EVD-000001", "EVD-000002"]);
        let ev = create_event(&mut conn, &new_event(date!(2023 - 02 - 01), "Protected", "Complaint filed"))
            .unwrap();
        assert_eq!(ev.category, "protected");

        link_evidence(&mut conn, ev.id, &["EVD-000002".to_string()]).unwrap();
        let ev = link_evidence(
            &mut conn,
            ev.id,
            &["EVD-000001".to_string(), "EVD-000002".to_string()],
        )
        .unwrap();
        assert_eq!(ev.evidence, vec!["EVD-000001".to_string(), "EVD-000002".to_string()]);

        let err = link_evidence(&mut conn, ev.id, &["EVD-000404".to_string()]).unwrap_err();
        assert_eq!(err.code, "EVIDENCE_NOT_FOUND");
        assert!(conn
            .execute("UPDATE timeline_events SET event_date = '2020-01-01'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM timeline_links", []).is_err());
    }

    #[test]
    fn list_filters_by_range_and_category() {
        let mut conn = conn_with_evidence(&[]);
        create_event(&mut conn, &new_event(date!(2023 - 03 - 01), "adverse", "Denial")).unwrap();
        create_event(&mut conn, &new_event(date!(2023 - 01 - 01), "protected", "Appeal")).unwrap();
        create_event(&mut conn, &new_event(date!(2023 - 05 - 01), "adverse", "Termination")).unwrap();

        let all = list_events(&conn, &EventQuery::default()).unwrap();
        let titles: Vec<&str> = all.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Appeal", "Denial", "Termination"]);

        let q = EventQuery {
            from: Some(date!(2023 - 02 - 01)),
            to: Some(date!(2023 - 04 - 30)),
            categories: vec!["Adverse".to_string()],
        };
        let hits = list_events(&conn, &q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Denial");
    }

    #[test]
    fn csv_import_skips_bad_rows() {
        let mut conn = conn_with_evidence(&["EVD-000001"]);
        let csv_text = "Date,Category,Title,Participants,Evidence\n\
2023-01-10,protected,Appeal filed,J. Doe;Counsel,EVD-000001\n\
not-a-date,adverse,Broken,,\n\
2023-01-20,adverse,Denial issued,,EVD-000099\n\
2023-01-25,adverse,Benefits stopped,,\n";
        let summary = import_timeline_csv(&mut conn, csv_text).unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.linked, 1);
        let rows: Vec<usize> = summary.skipped.iter().map(|s| s.row).collect();
        assert_eq!(rows, vec![3, 4]);

        let events = list_events(&conn, &EventQuery::default()).unwrap();
        assert_eq!(events[0].participants, vec!["Counsel".to_string(), "J. Doe".to_string()]);

        let err = import_timeline_csv(&mut conn, "when,what\n2023-01-01,x\n").unwrap_err();
        assert_eq!(err.code, "TIMELINE_CSV_COLUMNS_MISSING");
    }
}
