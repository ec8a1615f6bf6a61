use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::thread;

use evd_core::bates::{BatesAllocator, BatesNumber};
use evd_core::config::{BatesConfig, CaseConfig};
use evd_core::db;
use evd_core::extract::ExtractorSet;
use evd_core::ingest::Ingestor;
use evd_core::repo::{self, EvidenceFilter};
use evd_core::store::ContentStore;

fn migrated(path: &Path) {
    let mut conn = db::open(path).expect("open");
    db::migrate(&mut conn).expect("migrate");
}

#[test]
fn concurrent_allocators_never_collide() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db_path = tmp.path().join("case.sqlite");
    migrated(&db_path);

    let threads = 8;
    let per_thread = 25;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db_path = db_path.clone();
            thread::spawn(move || {
                let mut conn = db::open(&db_path).expect("open");
                let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).expect("allocator");
                (0..per_thread)
                    .map(|_| alloc.allocate(&mut conn).expect("allocate").seq)
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        let seqs = h.join().expect("join");
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "per-worker sequence must increase");
        all.extend(seqs);
    }
    let unique: BTreeSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread);
    let expected: BTreeSet<u64> = (1..=(threads * per_thread) as u64).collect();
    assert_eq!(unique, expected);
}

#[test]
fn concurrent_ingestors_issue_unique_identifiers() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db_path = tmp.path().join("case.sqlite");
    migrated(&db_path);

    let workers = 4;
    let files_per_worker = 10;
    for w in 0..workers {
        let dir = tmp.path().join(format!("batch{w}"));
        fs::create_dir_all(&dir).expect("mkdir");
        for f in 0..files_per_worker {
            fs::write(dir.join(format!("note_{f:02}.txt")), format!("worker {w} note {f}"))
                .expect("write");
        }
    }

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let root = tmp.path().to_path_buf();
            let db_path = db_path.clone();
            thread::spawn(move || {
                let mut conn = db::open(&db_path).expect("open");
                let cfg = CaseConfig::default();
                let alloc = BatesAllocator::open(&mut conn, &cfg.bates).expect("allocator");
                let store = ContentStore::open(root.join("store")).expect("store");
                let ingestor = Ingestor::new(store, alloc, ExtractorSet::default(), cfg);
                let report = ingestor
                    .ingest_path(&mut conn, &root.join(format!("batch{w}")))
                    .expect("ingest");
                report
                    .outcomes
                    .into_iter()
                    .map(|o| o.item.bates_number)
                    .collect::<Vec<String>>()
            })
        })
        .collect();

    let mut issued = Vec::new();
    for h in handles {
        let ids = h.join().expect("join");
        let seqs: Vec<u64> = ids
            .iter()
            .map(|b| BatesNumber::parse(b).expect("bates").seq)
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        issued.extend(ids);
    }
    let unique: BTreeSet<&String> = issued.iter().collect();
    assert_eq!(unique.len(), workers * files_per_worker);

    let conn = db::open(&db_path).expect("open");
    let stored = repo::list_evidence(&conn, &EvidenceFilter::default()).expect("list");
    assert_eq!(stored.len(), workers * files_per_worker);
    assert_eq!(stored.last().expect("last").bates_number, "EVD-000040");
}

#[test]
fn restart_resumes_without_reuse() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db_path = tmp.path().join("case.sqlite");
    migrated(&db_path);
    {
        let mut conn = db::open(&db_path).expect("open");
        let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).expect("allocator");
        alloc.allocate(&mut conn).expect("allocate");
        alloc.allocate(&mut conn).expect("allocate");
    }
    let mut conn = db::open(&db_path).expect("reopen");
    let alloc = BatesAllocator::open(&mut conn, &BatesConfig::default()).expect("allocator");
    assert_eq!(alloc.allocate(&mut conn).expect("allocate").to_string(), "EVD-000003");
}
