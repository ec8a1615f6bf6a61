//! Temporal proximity between two event categories.
//!
//! An adverse event is a hit when it falls 0..=N days after some protected
//! event. Under the null hypothesis adverse dates are spread uniformly over the
//! observed span, so each is a hit with probability `coverage`, the share of
//! span days inside some protected window. The p-value is the binomial upper
//! tail of the observed hit count.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::Date;

use super::{list_events, normalize_category, EventQuery};
use crate::anomaly::DetectionStatus;
use crate::config::CorrelationConfig;
use crate::domain::{DocumentFormat, TimelineEvent};
use crate::error::AppError;
use crate::repo;
use crate::stats::binomial_upper_tail;

const MAX_WINDOW_DAYS: u32 = 3650;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationRequest {
    pub from: Option<Date>,
    pub to: Option<Date>,
    pub protected_category: Option<String>,
    pub adverse_category: Option<String>,
    /// Overrides the configured proximity window.
    pub window_days: Option<u32>,
}

impl CorrelationRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::validation(
                    "QUERY_RANGE_INVALID",
                    "Range start must not be after its end",
                )
                .with_details(format!("from={from}; to={to}")));
            }
        }
        match (&self.protected_category, &self.adverse_category) {
            (None, None) => {}
            (Some(p), Some(a)) => {
                let (p, a) = (normalize_category(p), normalize_category(a));
                if p.is_empty() || a.is_empty() || p == a {
                    return Err(AppError::validation(
                        "QUERY_CATEGORIES_INVALID",
                        "Correlation needs two distinct, non-empty categories",
                    )
                    .with_details(format!("protected={p}; adverse={a}")));
                }
            }
            _ => {
                return Err(AppError::validation(
                    "QUERY_CATEGORIES_INVALID",
                    "Protected and adverse categories must be given together",
                ))
            }
        }
        if let Some(w) = self.window_days {
            if w == 0 || w > MAX_WINDOW_DAYS {
                return Err(AppError::validation(
                    "QUERY_WINDOW_INVALID",
                    "Proximity window must be between 1 and 3650 days",
                )
                .with_details(format!("window_days={w}")));
            }
        }
        if self.from.is_none() && self.to.is_none() && self.protected_category.is_none() {
            return Err(AppError::validation(
                "QUERY_CORRELATION_EMPTY",
                "Correlation needs a date range or a category pair",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedEvidence {
    pub bates_number: String,
    pub source_path: String,
    pub format: DocumentFormat,
    pub declared_date: Option<Date>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelatedEvent {
    pub event: TimelineEvent,
    pub evidence: Vec<LinkedEvidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProximityStatistic {
    pub protected: String,
    pub adverse: String,
    pub window_days: u32,
    /// Adverse events tested.
    pub sample_size: usize,
    pub hits: usize,
    pub fraction: f64,
    /// Share of the span covered by protected windows; the per-event hit probability under the null.
    pub coverage: f64,
    pub p_value: Option<f64>,
    pub status: DetectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationResult {
    pub events: Vec<CorrelatedEvent>,
    pub statistic: Option<ProximityStatistic>,
}

/// Number of days of `[lo, hi]` covered by the union of `[p, p + window]`.
fn covered_days(protected: &[Date], window: i64, lo: Date, hi: Date) -> i64 {
    let mut starts: Vec<Date> = protected.to_vec();
    starts.sort();
    let mut covered = 0i64;
    let mut cursor: Option<Date> = None;
    for p in starts {
        let start = if p < lo { lo } else { p };
        let end = {
            let e = p + time::Duration::days(window);
            if e > hi {
                hi
            } else {
                e
            }
        };
        let start = match cursor {
            Some(c) if c >= start => c + time::Duration::days(1),
            _ => start,
        };
        if start > end {
            continue;
        }
        covered += (end - start).whole_days() + 1;
        cursor = Some(end);
    }
    covered
}

pub fn proximity(
    protected_category: &str,
    adverse_category: &str,
    protected: &[Date],
    adverse: &[Date],
    window_days: u32,
    min_sample: usize,
) -> ProximityStatistic {
    let window = i64::from(window_days);
    let hits = adverse
        .iter()
        .filter(|a| {
            protected.iter().any(|p| {
                let gap = (**a - *p).whole_days();
                (0..=window).contains(&gap)
            })
        })
        .count();
    let n = adverse.len();
    let fraction = if n == 0 { 0.0 } else { hits as f64 / n as f64 };

    let span = protected.iter().chain(adverse.iter()).copied();
    let coverage = match (span.clone().min(), span.max()) {
        (Some(lo), Some(hi)) if !protected.is_empty() => {
            let total = (hi - lo).whole_days() + 1;
            covered_days(protected, window, lo, hi) as f64 / total as f64
        }
        _ => 0.0,
    };

    let (status, p_value) = if n < min_sample.max(1) || protected.is_empty() {
        (DetectionStatus::Indeterminate, None)
    } else {
        (
            DetectionStatus::Ok,
            Some(binomial_upper_tail(n as u64, hits as u64, coverage)),
        )
    };

    ProximityStatistic {
        protected: protected_category.to_string(),
        adverse: adverse_category.to_string(),
        window_days,
        sample_size: n,
        hits,
        fraction,
        coverage,
        p_value,
        status,
    }
}

fn linked_evidence(conn: &Connection, event: &TimelineEvent) -> Result<Vec<LinkedEvidence>, AppError> {
    event
        .evidence
        .iter()
        .map(|b| {
            let item = repo::get_evidence(conn, b)?;
            Ok(LinkedEvidence {
                bates_number: item.bates_number,
                source_path: item.source_path,
                format: item.format,
                declared_date: item.declared_date.map(|d| d.date),
            })
        })
        .collect()
}

/// Join events against their linked evidence, with the proximity statistic
/// when a category pair is given.
pub fn correlate(
    conn: &Connection,
    req: &CorrelationRequest,
    cfg: &CorrelationConfig,
) -> Result<CorrelationResult, AppError> {
    req.validate()?;
    let pair = match (&req.protected_category, &req.adverse_category) {
        (Some(p), Some(a)) => Some((normalize_category(p), normalize_category(a))),
        _ => None,
    };
    let query = EventQuery {
        from: req.from,
        to: req.to,
        categories: pair
            .as_ref()
            .map(|(p, a)| vec![p.clone(), a.clone()])
            .unwrap_or_default(),
    };
    let events = list_events(conn, &query)?;

    let statistic = pair.map(|(p, a)| {
        let dates_of = |category: &str| -> Vec<Date> {
            events
                .iter()
                .filter(|e| e.category == category)
                .map(|e| e.event_date)
                .collect()
        };
        proximity(
            &p,
            &a,
            &dates_of(&p),
            &dates_of(&a),
            req.window_days.unwrap_or(cfg.window_days),
            cfg.min_sample,
        )
    });

    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let evidence = linked_evidence(conn, &event)?;
        out.push(CorrelatedEvent { event, evidence });
    }
    Ok(CorrelationResult {
        events: out,
        statistic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;
    use time::Duration;

    #[test]
    fn fixed_lag_clustering_has_low_probability() {
        let base = date!(2023 - 01 - 01);
        let protected: Vec<Date> = (0..6).map(|i| base + Duration::days(60 * i)).collect();
        let adverse: Vec<Date> = protected.iter().map(|p| *p + Duration::days(7)).collect();
        let stat = proximity("protected", "adverse", &protected, &adverse, 14, 3);
        assert_eq!(stat.status, DetectionStatus::Ok);
        assert_eq!(stat.hits, 6);
        assert_eq!(stat.fraction, 1.0);
        // 308-day span, 5 full 15-day windows plus 8 days of the last.
        assert!((stat.coverage - 83.0 / 308.0).abs() < 1e-12);
        assert!(stat.p_value.unwrap() < 0.01);
    }

    #[test]
    fn spread_out_events_are_not_significant() {
        let base = date!(2023 - 01 - 01);
        let protected = vec![base, base + Duration::days(100)];
        let adverse: Vec<Date> = [40, 70, 150, 180, 220]
            .iter()
            .map(|d| base + Duration::days(*d))
            .collect();
        let stat = proximity("protected", "adverse", &protected, &adverse, 14, 3);
        assert_eq!(stat.hits, 0);
        assert_eq!(stat.p_value, Some(1.0));
    }

    #[test]
    fn too_few_adverse_events_is_indeterminate() {
        let d = date!(2023 - 01 - 01);
        let stat = proximity("p", "a", &[d], &[d + Duration::days(3)], 14, 3);
        assert_eq!(stat.status, DetectionStatus::Indeterminate);
        assert_eq!(stat.p_value, None);
    }

    #[test]
    fn overlapping_windows_are_counted_once() {
        let d = date!(2023 - 01 - 01);
        let covered = covered_days(&[d, d + Duration::days(5)], 10, d, d + Duration::days(30));
        assert_eq!(covered, 16);
    }

    #[test]
    fn request_validation() {
        assert!(CorrelationRequest::default().validate().is_err());
        let one_sided = CorrelationRequest {
            protected_category: Some("protected".to_string()),
            ..CorrelationRequest::default()
        };
        assert_eq!(one_sided.validate().unwrap_err().code, "QUERY_CATEGORIES_INVALID");
        let inverted = CorrelationRequest {
            from: Some(date!(2023 - 02 - 01)),
            to: Some(date!(2023 - 01 - 01)),
            ..CorrelationRequest::default()
        };
        assert_eq!(inverted.validate().unwrap_err().code, "QUERY_RANGE_INVALID");
    }
}
