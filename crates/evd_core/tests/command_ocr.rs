//! Exercises the external OCR command with a stand-in shell script.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use evd_core::bates::BatesAllocator;
use evd_core::config::CaseConfig;
use evd_core::db;
use evd_core::domain::DocumentFormat;
use evd_core::extract::{CommandOcr, ExtractorSet, OcrEngine};
use evd_core::ingest::{IngestResult, Ingestor};
use evd_core::store::ContentStore;
use pretty_assertions::assert_eq;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

// One test per binary: spawning a freshly written script from several test
// threads at once can fail with ETXTBSY.
#[test]
fn command_ocr_reads_byte_streams_and_enforces_its_deadline() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let bin = tmp.path().join("bin");
    fs::create_dir_all(&bin).expect("mkdir");

    // Prints everything after the 8-byte PNG signature of its input file.
    let echo = script(&bin, "fake-ocr", r#"tail -c +9 "$1""#);
    let slow = script(&bin, "slow-ocr", "sleep 5");

    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(b"termination memo dated 2022-03-01");

    // The logical path does not exist on disk; only the bytes do.
    let logical = Path::new("upload/scan.png");
    assert!(!logical.exists());

    let ocr = CommandOcr::new(echo.display().to_string());
    assert_eq!(
        ocr.recognize(logical, &bytes).expect("recognize"),
        "termination memo dated 2022-03-01"
    );

    let mut conn = db::open(&tmp.path().join("case.sqlite")).expect("open");
    db::migrate(&mut conn).expect("migrate");
    let cfg = CaseConfig::default();
    let allocator = BatesAllocator::open(&mut conn, &cfg.bates).expect("allocator");
    let store = ContentStore::open(tmp.path().join("store")).expect("store");
    let ingestor = Ingestor::new(
        store,
        allocator,
        ExtractorSet::with_defaults(Some(Arc::new(ocr))),
        cfg,
    );
    let IngestResult::Ingested(outcome) = ingestor
        .ingest_bytes(&mut conn, logical, &bytes)
        .expect("ingest")
    else {
        panic!("uploaded image should be ingested");
    };
    assert!(outcome.created);
    assert_eq!(outcome.item.format, DocumentFormat::Image);
    assert_eq!(outcome.item.extracted_text, "termination memo dated 2022-03-01");

    let err = CommandOcr::new(slow.display().to_string())
        .with_timeout(Duration::from_millis(200))
        .recognize(logical, &bytes)
        .expect_err("deadline");
    assert_eq!(err.code, "OCR_TIMEOUT");
    assert!(err.retryable);
}
