use std::fs;

use evd_core::bates::BatesAllocator;
use evd_core::config::CaseConfig;
use evd_core::db;
use evd_core::domain::{DateSource, DocumentFormat};
use evd_core::extract::ExtractorSet;
use evd_core::fulltext::{self, MatchMode};
use evd_core::ingest::Ingestor;
use evd_core::repo::{self, EvidenceFilter};
use evd_core::store::ContentStore;
use pretty_assertions::assert_eq;

const DENIAL_EMAIL: &str = "Received: from mx.insurer.example by mail.claimant.example; Fri, 02 Jun 2023 08:15:00 +0000\n\
From: Claims Unit <claims@insurer.example>\n\
To: J. Doe <jdoe@claimant.example>\n\
Date: Mon, 01 May 2023 09:00:00 +0000\n\
Subject: Appeal outcome\n\
\n\
After review, the appeal is denied.\n";

fn setup(root: &std::path::Path) -> (db::Connection, Ingestor) {
    let mut conn = db::open(&root.join("case.sqlite")).expect("open");
    db::migrate(&mut conn).expect("migrate");
    let mut cfg = CaseConfig::default();
    cfg.parties
        .insert("insurer".to_string(), vec!["insurer.example".to_string()]);
    cfg.categories
        .insert("appeal".to_string(), vec!["appeal".to_string()]);
    let alloc = BatesAllocator::open(&mut conn, &cfg.bates).expect("allocator");
    let store = ContentStore::open(root.join("store")).expect("store");
    (conn, Ingestor::new(store, alloc, ExtractorSet::default(), cfg))
}

#[test]
fn reingesting_a_directory_is_idempotent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut conn, ingestor) = setup(tmp.path());
    let src = tmp.path().join("production");
    fs::create_dir_all(&src).expect("mkdir");
    fs::write(src.join("appeal_outcome.eml"), DENIAL_EMAIL).expect("write");
    fs::write(src.join("notes.txt"), "call log: claimant phoned twice").expect("write");

    let first = ingestor.ingest_path(&mut conn, &src).expect("first ingest");
    assert_eq!(first.created_count(), 2);
    let second = ingestor.ingest_path(&mut conn, &src).expect("second ingest");
    assert_eq!(second.created_count(), 0);
    assert_eq!(second.existing_count(), 2);
    assert_eq!(repo::count_evidence(&conn).expect("count"), 2);

    let first_ids: Vec<&str> = first.outcomes.iter().map(|o| o.item.bates_number.as_str()).collect();
    let second_ids: Vec<&str> = second.outcomes.iter().map(|o| o.item.bates_number.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}

#[test]
fn email_evidence_carries_dates_parties_and_is_keyword_searchable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut conn, ingestor) = setup(tmp.path());
    let src = tmp.path().join("appeal_outcome.eml");
    fs::write(&src, DENIAL_EMAIL).expect("write");

    let report = ingestor.ingest_path(&mut conn, &src).expect("ingest");
    let item = &report.outcomes[0].item;
    assert_eq!(item.format, DocumentFormat::Email);
    let declared = item.declared_date.clone().expect("declared");
    assert_eq!(declared.source, DateSource::EmbeddedMetadata);
    assert_eq!(declared.date.to_string(), "2023-05-01");
    let observed = item.observed_date.clone().expect("observed");
    assert_eq!(observed.source, DateSource::ContainerMetadata);
    assert_eq!(item.discrepancy_days(), Some(32));
    assert_eq!(
        item.party_tags,
        vec!["insurer".to_string(), "jdoe@claimant.example".to_string()]
    );
    assert_eq!(item.category_tags, vec!["appeal".to_string(), "email".to_string()]);

    // Keyword-searchable as soon as ingestion returns.
    let hits = fulltext::search(&conn, "denied", MatchMode::Exact, 5).expect("search");
    assert_eq!(hits[0].bates_number, item.bates_number);

    let by_party = repo::list_evidence(
        &conn,
        &EvidenceFilter {
            party: Some("insurer".to_string()),
            ..EvidenceFilter::default()
        },
    )
    .expect("list");
    assert_eq!(by_party.len(), 1);
}

#[test]
fn verify_detects_tampered_and_missing_blobs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (mut conn, ingestor) = setup(tmp.path());
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).expect("mkdir");
    fs::write(src.join("a.txt"), "original letter A").expect("write");
    fs::write(src.join("b.txt"), "original letter B").expect("write");
    fs::write(src.join("c.txt"), "original letter C").expect("write");
    let report = ingestor.ingest_path(&mut conn, &src).expect("ingest");
    let store = ingestor.store();

    let clean = store.verify(&conn).expect("verify");
    assert!(clean.is_clean());
    assert_eq!(clean.ok.len(), 3);

    let a = &report.outcomes[0].item;
    let c = &report.outcomes[2].item;
    fs::write(store.blob_path(&a.sha256).expect("path"), "forged letter A").expect("tamper");
    fs::remove_file(store.blob_path(&c.sha256).expect("path")).expect("remove");

    let dirty = store.verify(&conn).expect("verify");
    assert!(!dirty.is_clean());
    assert_eq!(dirty.mismatched.len(), 1);
    assert_eq!(dirty.mismatched[0].bates_number, a.bates_number);
    assert_eq!(dirty.missing, vec![c.bates_number.clone()]);
}
