//! Batch detection of one-sided declared/observed date discrepancies.
//!
//! Null hypothesis: the direction of each non-zero discrepancy is an
//! independent fair coin flip. The batch p-value is the one-sided binomial
//! probability of seeing at least as many discrepancies in the tested
//! direction as observed. Zero discrepancies are ties and do not enter the test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AnomalyConfig, Direction};
use crate::domain::{AnomalyRecord, EvidenceItem};
use crate::error::{db_err, AppError, ErrorKind};
use crate::normalize::dates::{format_date, now_rfc3339_utc, parse_date_strict};
use crate::repo::{self, EvidenceFilter};
use crate::stats::{sign_test, summarize, MagnitudeSummary};

/// Shared flag checked once per document; cancelling discards the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Ok,
    Indeterminate,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Ok => "ok",
            DetectionStatus::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectionCounts {
    pub later: usize,
    pub earlier: usize,
    pub ties: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyBreakdown {
    pub party: String,
    pub dated: usize,
    pub later: usize,
    pub earlier: usize,
    pub flagged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionReport {
    pub status: DetectionStatus,
    /// Why the status is indeterminate.
    pub reason: Option<String>,
    /// Items carrying both dates.
    pub sample_size: usize,
    pub counts: DirectionCounts,
    /// Direction the sign test was run for.
    pub direction: Option<Direction>,
    pub p_value: Option<f64>,
    pub significance_level: f64,
    pub significant: bool,
    pub materiality_days: i64,
    pub flagged_count: usize,
    /// Signed discrepancies (observed minus declared) of all dated items.
    pub magnitude: Option<MagnitudeSummary>,
    pub party_breakdown: Vec<PartyBreakdown>,
    pub records: Vec<AnomalyRecord>,
    /// Items missing a declared or observed date; reported, not tested.
    pub excluded_undated: Vec<String>,
}

/// Last published run as stored in `anomaly_runs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub status: DetectionStatus,
    pub sample_size: usize,
    pub p_value: Option<f64>,
    pub direction: Option<Direction>,
    pub completed_at: String,
}

fn cancelled(done: usize, total: usize) -> AppError {
    AppError::new("ANOMALY_CANCELLED", "Anomaly detection was cancelled; nothing was published")
        .with_kind(ErrorKind::Transient)
        .with_retryable(true)
        .with_details(format!("processed={done}; total={total}"))
}

fn direction_of(d: i64) -> Option<Direction> {
    match d.signum() {
        1 => Some(Direction::Later),
        -1 => Some(Direction::Earlier),
        _ => None,
    }
}

/// Pure detector over an in-memory corpus. Output depends only on the items and config.
pub fn detect_items(
    items: &[EvidenceItem],
    cfg: &AnomalyConfig,
    cancel: &CancelToken,
) -> Result<DetectionReport, AppError> {
    let mut ordered: Vec<&EvidenceItem> = items.iter().collect();
    ordered.sort_by(|a, b| a.bates_number.cmp(&b.bates_number));

    let mut records: Vec<AnomalyRecord> = Vec::new();
    let mut excluded = Vec::new();
    let mut counts = DirectionCounts::default();
    let mut parties: BTreeMap<&str, PartyBreakdown> = BTreeMap::new();

    for (i, item) in ordered.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(cancelled(i, ordered.len()));
        }
        let (Some(declared), Some(observed)) = (&item.declared_date, &item.observed_date) else {
            excluded.push(item.bates_number.clone());
            continue;
        };
        let d = (observed.date - declared.date).whole_days();
        let direction = direction_of(d);
        let flagged = d.abs() > cfg.materiality_days;
        match direction {
            Some(Direction::Later) => counts.later += 1,
            Some(Direction::Earlier) => counts.earlier += 1,
            None => counts.ties += 1,
        }
        for party in &item.party_tags {
            let e = parties.entry(party.as_str()).or_insert_with(|| PartyBreakdown {
                party: party.clone(),
                ..PartyBreakdown::default()
            });
            e.dated += 1;
            match direction {
                Some(Direction::Later) => e.later += 1,
                Some(Direction::Earlier) => e.earlier += 1,
                None => {}
            }
            if flagged {
                e.flagged += 1;
            }
        }
        records.push(AnomalyRecord {
            bates_number: item.bates_number.clone(),
            declared_date: declared.date,
            observed_date: observed.date,
            discrepancy_days: d,
            direction,
            flagged,
            batch_p_value: None,
        });
    }

    let sample_size = records.len();
    let discrepancies: Vec<i64> = records.iter().map(|r| r.discrepancy_days).collect();
    let flagged_count = records.iter().filter(|r| r.flagged).count();

    let (status, reason, direction, p_value) = if sample_size < cfg.min_sample {
        (
            DetectionStatus::Indeterminate,
            Some(format!(
                "insufficient sample: {sample_size} dated items, minimum {}",
                cfg.min_sample
            )),
            None,
            None,
        )
    } else if counts.later + counts.earlier == 0 {
        (
            DetectionStatus::Indeterminate,
            Some(format!("no directional discrepancies: {} ties", counts.ties)),
            None,
            None,
        )
    } else {
        let direction = cfg.expected_direction.unwrap_or(if counts.later >= counts.earlier {
            Direction::Later
        } else {
            Direction::Earlier
        });
        let k = match direction {
            Direction::Later => counts.later,
            Direction::Earlier => counts.earlier,
        };
        let n = counts.later + counts.earlier;
        (
            DetectionStatus::Ok,
            None,
            Some(direction),
            Some(sign_test(n as u64, k as u64)),
        )
    };
    for r in &mut records {
        r.batch_p_value = p_value;
    }

    Ok(DetectionReport {
        status,
        reason,
        sample_size,
        counts,
        direction,
        p_value,
        significance_level: cfg.significance_level,
        significant: p_value.is_some_and(|p| p < cfg.significance_level),
        materiality_days: cfg.materiality_days,
        flagged_count,
        magnitude: summarize(&discrepancies),
        party_breakdown: parties.into_values().collect(),
        records,
        excluded_undated: excluded,
    })
}

/// Run over a snapshot of the stored corpus and replace the published results.
///
/// Nothing is written unless the whole scan completes; a cancelled run leaves
/// the previous results in place.
pub fn detect(
    conn: &mut Connection,
    filter: &EvidenceFilter,
    cfg: &AnomalyConfig,
    cancel: &CancelToken,
) -> Result<DetectionReport, AppError> {
    let items = {
        let snapshot = conn
            .transaction()
            .map_err(db_err("DB_TX_FAILED", "Failed to open detector snapshot"))?;
        let items = repo::list_evidence(&snapshot, filter)?;
        snapshot
            .commit()
            .map_err(db_err("DB_TX_FAILED", "Failed to close detector snapshot"))?;
        items
    };

    let report = match detect_items(&items, cfg, cancel) {
        Ok(r) => r,
        Err(e) => {
            warn!(code = %e.code, details = ?e.details, "anomaly detection aborted");
            return Err(e);
        }
    };
    if cancel.is_cancelled() {
        return Err(cancelled(items.len(), items.len()));
    }
    publish(conn, &report)?;

    info!(
        status = report.status.as_str(),
        sample_size = report.sample_size,
        p_value = ?report.p_value,
        flagged = report.flagged_count,
        "anomaly detection finished"
    );
    Ok(report)
}

fn publish(conn: &mut Connection, report: &DetectionReport) -> Result<(), AppError> {
    let summary_json = serde_json::to_string(report).map_err(|e| {
        AppError::new("ANOMALY_SERIALIZE_FAILED", "Failed to serialize detector report")
            .with_details(e.to_string())
    })?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("DB_TX_FAILED", "Failed to start detector publish"))?;
    tx.execute("DELETE FROM anomaly_records", [])
        .map_err(db_err("DB_WRITE_FAILED", "Failed to clear anomaly records"))?;
    tx.execute("DELETE FROM anomaly_runs", [])
        .map_err(db_err("DB_WRITE_FAILED", "Failed to clear anomaly run"))?;
    tx.execute(
        r#"
        INSERT INTO anomaly_runs(id, status, sample_size, p_value, direction, summary_json, completed_at)
        VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            report.status.as_str(),
            report.sample_size as i64,
            report.p_value,
            report.direction.map(|d| d.as_str()),
            summary_json,
            now_rfc3339_utc()
        ],
    )
    .map_err(db_err("DB_WRITE_FAILED", "Failed to write anomaly run"))?;
    {
        let mut stmt = tx
            .prepare(
                r#"
                INSERT INTO anomaly_records(
                  bates_number, declared_date, observed_date, discrepancy_days, flagged, batch_p_value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .map_err(db_err("DB_WRITE_FAILED", "Failed to prepare anomaly record insert"))?;
        for r in &report.records {
            stmt.execute(params![
                r.bates_number,
                format_date(r.declared_date),
                format_date(r.observed_date),
                r.discrepancy_days,
                r.flagged,
                r.batch_p_value
            ])
            .map_err(|e| {
                AppError::new("DB_WRITE_FAILED", "Failed to write anomaly record")
                    .with_details(format!("bates={}; err={}", r.bates_number, e))
            })?;
        }
    }
    tx.commit()
        .map_err(db_err("DB_TX_FAILED", "Failed to commit detector results"))
}

pub fn list_anomaly_records(conn: &Connection) -> Result<Vec<AnomalyRecord>, AppError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT bates_number, declared_date, observed_date, discrepancy_days, flagged, batch_p_value
            FROM anomaly_records ORDER BY bates_number
            "#,
        )
        .map_err(db_err("DB_QUERY_FAILED", "Failed to prepare anomaly record query"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<f64>>(5)?,
            ))
        })
        .map_err(db_err("DB_QUERY_FAILED", "Failed to query anomaly records"))?;

    let mut out = Vec::new();
    for r in rows {
        let (bates_number, declared, observed, d, flagged, p) =
            r.map_err(db_err("DB_QUERY_FAILED", "Failed to decode anomaly record"))?;
        out.push(AnomalyRecord {
            declared_date: parse_date_strict("declared_date", &declared)?,
            observed_date: parse_date_strict("observed_date", &observed)?,
            bates_number,
            discrepancy_days: d,
            direction: direction_of(d),
            flagged,
            batch_p_value: p,
        });
    }
    Ok(out)
}

pub fn last_run(conn: &Connection) -> Result<Option<RunSummary>, AppError> {
    let row = conn
        .query_row(
            "SELECT status, sample_size, p_value, direction, completed_at FROM anomaly_runs WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("DB_QUERY_FAILED", "Failed to load anomaly run"))?;
    let Some((status, sample_size, p_value, direction, completed_at)) = row else {
        return Ok(None);
    };
    let status = match status.as_str() {
        "ok" => DetectionStatus::Ok,
        _ => DetectionStatus::Indeterminate,
    };
    let direction = match direction.as_deref() {
        Some("later") => Some(Direction::Later),
        Some("earlier") => Some(Direction::Earlier),
        _ => None,
    };
    Ok(Some(RunSummary {
        status,
        sample_size: usize::try_from(sample_size).unwrap_or(0),
        p_value,
        direction,
        completed_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DateSource, DocumentFormat, SourcedDate};
    use time::macros::date;
    use time::Duration;

    fn item(seq: u32, discrepancy: Option<i64>, party: &str) -> EvidenceItem {
        let declared = date!(2023 - 01 - 01) + Duration::days(seq as i64);
        EvidenceItem {
            bates_number: format!("EVD-{seq:06}"),
            sha256: format!("{seq:064}"),
            source_path: format!("/case/{seq}.txt"),
            format: DocumentFormat::Plaintext,
            byte_len: 1,
            extracted_text: "x".to_string(),
            declared_date: Some(SourcedDate {
                date: declared,
                source: DateSource::EmbeddedMetadata,
            }),
            observed_date: discrepancy.map(|d| SourcedDate {
                date: declared + Duration::days(d),
                source: DateSource::ContainerMetadata,
            }),
            party_tags: vec![party.to_string()],
            category_tags: vec![],
            ingested_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn cfg(materiality_days: i64) -> AnomalyConfig {
        AnomalyConfig {
            materiality_days,
            ..AnomalyConfig::default()
        }
    }

    #[test]
    fn systematic_shift_is_significant_and_flagged() {
        let mut items: Vec<EvidenceItem> = (1..=15).map(|i| item(i, Some(10), "insurer")).collect();
        for (i, d) in [(16, 3), (17, -2), (18, 4), (19, -1), (20, -4)] {
            items.push(item(i, Some(d), "claimant"));
        }
        items.push(item(21, None, "claimant"));

        let report = detect_items(&items, &cfg(5), &CancelToken::new()).unwrap();
        assert_eq!(report.status, DetectionStatus::Ok);
        assert_eq!(report.sample_size, 20);
        assert_eq!(report.direction, Some(Direction::Later));
        assert_eq!(report.counts, DirectionCounts { later: 17, earlier: 3, ties: 0 });
        let p = report.p_value.unwrap();
        assert!(p < 0.05);
        assert!((p - 1351.0 / 1_048_576.0).abs() < 1e-12);
        assert!(report.significant);
        assert_eq!(report.flagged_count, 15);
        assert!(report.records.iter().filter(|r| r.flagged).all(|r| r.discrepancy_days == 10));
        assert_eq!(report.excluded_undated, vec!["EVD-000021".to_string()]);

        let insurer = &report.party_breakdown[1];
        assert_eq!(insurer.party, "insurer");
        assert_eq!((insurer.dated, insurer.flagged), (15, 15));
    }

    #[test]
    fn small_sample_is_indeterminate() {
        let items: Vec<EvidenceItem> = (1..=3).map(|i| item(i, Some(30), "insurer")).collect();
        let report = detect_items(&items, &cfg(0), &CancelToken::new()).unwrap();
        assert_eq!(report.status, DetectionStatus::Indeterminate);
        assert_eq!(report.p_value, None);
        assert!(!report.significant);
        assert!(report.reason.unwrap().contains("insufficient sample"));
    }

    #[test]
    fn expected_direction_and_ties() {
        let mut items: Vec<EvidenceItem> = (1..=6).map(|i| item(i, Some(5), "a")).collect();
        items.push(item(7, Some(0), "a"));
        let cfg = AnomalyConfig {
            expected_direction: Some(Direction::Earlier),
            ..AnomalyConfig::default()
        };
        let report = detect_items(&items, &cfg, &CancelToken::new()).unwrap();
        assert_eq!(report.counts.ties, 1);
        assert_eq!(report.direction, Some(Direction::Earlier));
        assert_eq!(report.p_value, Some(1.0));
    }

    #[test]
    fn all_ties_is_indeterminate_not_clean() {
        let items: Vec<EvidenceItem> = (1..=6).map(|i| item(i, Some(0), "a")).collect();
        let report = detect_items(&items, &cfg(0), &CancelToken::new()).unwrap();
        assert_eq!(report.status, DetectionStatus::Indeterminate);
        assert_eq!(report.sample_size, 6);
        assert_eq!(report.p_value, None);
        assert_eq!(report.flagged_count, 0);
    }

    #[test]
    fn cancelled_run_publishes_nothing() {
        let mut conn = crate::db::open_in_memory().unwrap();
        crate::db::migrate(&mut conn).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = detect(&mut conn, &EvidenceFilter::default(), &cfg(0), &cancel).unwrap_err();
        assert_eq!(err.code, "ANOMALY_CANCELLED");
        assert!(last_run(&conn).unwrap().is_none());
        assert!(list_anomaly_records(&conn).unwrap().is_empty());
    }

    #[test]
    fn rerun_is_bit_identical() {
        let items: Vec<EvidenceItem> = (1..=9)
            .map(|i| item(i, Some(if i % 3 == 0 { -2 } else { 7 }), "p"))
            .collect();
        let a = detect_items(&items, &cfg(1), &CancelToken::new()).unwrap();
        let b = detect_items(&items, &cfg(1), &CancelToken::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.p_value.map(f64::to_bits),
            b.p_value.map(f64::to_bits)
        );
    }
}
