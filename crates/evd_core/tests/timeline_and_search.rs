use std::fs;

use evd_core::bates::BatesAllocator;
use evd_core::config::{CaseConfig, CorrelationConfig};
use evd_core::db;
use evd_core::extract::ExtractorSet;
use evd_core::fulltext::{self, MatchMode};
use evd_core::ingest::Ingestor;
use evd_core::store::ContentStore;
use evd_core::timeline::{self, CorrelationRequest, NewTimelineEvent};
use pretty_assertions::assert_eq;
use time::macros::date;
use time::Duration;

fn ingested(root: &std::path::Path, docs: &[(&str, &str)]) -> db::Connection {
    let src = root.join("docs");
    fs::create_dir_all(&src).expect("mkdir");
    for (name, text) in docs {
        fs::write(src.join(name), text).expect("write");
    }
    let mut conn = db::open(&root.join("case.sqlite")).expect("open");
    db::migrate(&mut conn).expect("migrate");
    let cfg = CaseConfig::default();
    let alloc = BatesAllocator::open(&mut conn, &cfg.bates).expect("allocator");
    let store = ContentStore::open(root.join("store")).expect("store");
    Ingestor::new(store, alloc, ExtractorSet::default(), cfg)
        .ingest_path(&mut conn, &src)
        .expect("ingest");
    conn
}

#[test]
fn retaliation_timeline_correlates_with_linked_evidence() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut conn = ingested(
        tmp.path(),
        &[("a_complaint.txt", "formal complaint"), ("b_denial.txt", "denial letter")],
    );

    let base = date!(2023 - 01 - 01);
    for i in 0..6 {
        let protected = timeline::create_event(
            &mut conn,
            &NewTimelineEvent {
                event_date: base + Duration::days(60 * i),
                category: "protected".to_string(),
                title: format!("Complaint {i}"),
                description: None,
                participants: vec![],
            },
        )
        .expect("protected event");
        let adverse = timeline::create_event(
            &mut conn,
            &NewTimelineEvent {
                event_date: base + Duration::days(60 * i + 7),
                category: "adverse".to_string(),
                title: format!("Denial {i}"),
                description: None,
                participants: vec![],
            },
        )
        .expect("adverse event");
        if i == 0 {
            timeline::link_evidence(&mut conn, protected.id, &["EVD-000001".to_string()])
                .expect("link");
            timeline::link_evidence(&mut conn, adverse.id, &["EVD-000002".to_string()])
                .expect("link");
        }
    }

    let result = timeline::correlate(
        &conn,
        &CorrelationRequest {
            protected_category: Some("protected".to_string()),
            adverse_category: Some("adverse".to_string()),
            ..CorrelationRequest::default()
        },
        &CorrelationConfig::default(),
    )
    .expect("correlate");

    assert_eq!(result.events.len(), 12);
    assert_eq!(result.events[0].evidence[0].bates_number, "EVD-000001");
    assert_eq!(result.events[1].evidence[0].bates_number, "EVD-000002");
    let stat = result.statistic.expect("statistic");
    assert_eq!((stat.hits, stat.sample_size), (6, 6));
    assert!(stat.p_value.expect("p") < 0.01);

    let ranged = timeline::correlate(
        &conn,
        &CorrelationRequest {
            from: Some(base),
            to: Some(base + Duration::days(10)),
            ..CorrelationRequest::default()
        },
        &CorrelationConfig::default(),
    )
    .expect("range");
    assert_eq!(ranged.events.len(), 2);
    assert!(ranged.statistic.is_none());
}

#[test]
fn rebuild_from_evidence_reproduces_rankings() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut conn = ingested(
        tmp.path(),
        &[
            ("01.txt", "appeal denied pending review of medical records"),
            ("02.txt", "medical records requested from provider"),
            ("03.txt", "records received; appeal review scheduled"),
            ("04.txt", "benefits terminated after review"),
        ],
    );
    let queries = ["review", "medical records", "appeal", "terminated benefits"];
    let before: Vec<_> = queries
        .iter()
        .map(|q| fulltext::search(&conn, q, MatchMode::Stemmed, 10).expect("search"))
        .collect();

    conn.execute("DELETE FROM fulltext_postings", []).expect("wipe postings");
    conn.execute("DELETE FROM fulltext_docs", []).expect("wipe docs");
    assert!(fulltext::search(&conn, "review", MatchMode::Stemmed, 10).expect("search").is_empty());

    assert_eq!(fulltext::rebuild(&mut conn).expect("rebuild"), 4);
    let after: Vec<_> = queries
        .iter()
        .map(|q| fulltext::search(&conn, q, MatchMode::Stemmed, 10).expect("search"))
        .collect();
    assert_eq!(before, after);
}
