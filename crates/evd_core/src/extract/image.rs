use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{ExtractFailure, Extraction, Extractor, FailureReason, SourceFile};
use crate::config::IngestConfig;
use crate::domain::DocumentFormat;
use crate::error::AppError;

pub(crate) fn is_image(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || bytes.starts_with(b"II*\0")
        || bytes.starts_with(b"MM\0*")
}

/// Optical character recognition backend for scanned images.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, path: &Path, bytes: &[u8]) -> Result<String, AppError>;
}

/// Runs an external OCR binary (tesseract by default) as `<program> <input> stdout`.
///
/// The engine always reads a private temporary copy of the bytes, so byte
/// streams with no file behind them are recognized the same way as files.
/// A run that outlives its deadline is killed.
#[derive(Debug, Clone)]
pub struct CommandOcr {
    program: String,
    timeout: Duration,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

impl CommandOcr {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_millis(IngestConfig::default().ocr_timeout_ms),
        }
    }

    pub fn tesseract() -> Self {
        Self::new("tesseract")
    }

    /// Tesseract with the configured deadline.
    pub fn from_config(cfg: &IngestConfig) -> Self {
        Self::tesseract().with_timeout(Duration::from_millis(cfg.ocr_timeout_ms))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stage_input(&self, path: &Path, bytes: &[u8]) -> Result<NamedTempFile, AppError> {
        let suffix = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let io_err = |e: std::io::Error| {
            AppError::new("OCR_STAGING_FAILED", "Failed to stage image for OCR")
                .with_details(format!("path={}; err={}", path.display(), e))
        };
        let mut file = tempfile::Builder::new()
            .prefix("evd-ocr-")
            .suffix(&suffix)
            .tempfile()
            .map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(file)
    }

    fn wait_with_deadline(&self, child: &mut Child, path: &Path) -> Result<ExitStatus, AppError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let polled = child.try_wait().map_err(|e| {
                AppError::new("OCR_FAILED", "Failed to wait for OCR engine")
                    .with_details(format!("path={}; err={}", path.display(), e))
            })?;
            if let Some(status) = polled {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!(program = %self.program, err = %e, "failed to kill OCR engine");
                }
                let _ = child.wait();
                return Err(AppError::transient("OCR_TIMEOUT", "OCR engine timed out").with_details(
                    format!(
                        "path={}; timeout_ms={}",
                        path.display(),
                        self.timeout.as_millis()
                    ),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn read_capture(mut file: File) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

impl OcrEngine for CommandOcr {
    fn recognize(&self, path: &Path, bytes: &[u8]) -> Result<String, AppError> {
        let input = self.stage_input(path, bytes)?;
        // Output goes to anonymous files rather than pipes so a chatty engine
        // cannot block on a full pipe while we poll for exit.
        let capture_err = |e: std::io::Error| {
            AppError::new("OCR_STAGING_FAILED", "Failed to capture OCR output")
                .with_details(format!("path={}; err={}", path.display(), e))
        };
        let stdout = tempfile::tempfile().map_err(capture_err)?;
        let stderr = tempfile::tempfile().map_err(capture_err)?;

        let mut child = Command::new(&self.program)
            .arg(input.path())
            .arg("stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone().map_err(capture_err)?))
            .stderr(Stdio::from(stderr.try_clone().map_err(capture_err)?))
            .spawn()
            .map_err(|e| {
                AppError::transient("OCR_SPAWN_FAILED", "Failed to start OCR engine")
                    .with_details(format!("program={}; err={}", self.program, e))
            })?;
        let status = self.wait_with_deadline(&mut child, path)?;

        if !status.success() {
            let err_text = read_capture(stderr).unwrap_or_default();
            return Err(AppError::new("OCR_FAILED", "OCR engine reported an error").with_details(
                format!(
                    "path={}; status={}; stderr={}",
                    path.display(),
                    status,
                    String::from_utf8_lossy(&err_text).trim()
                ),
            ));
        }
        let out = read_capture(stdout).map_err(capture_err)?;
        debug!(path = %path.display(), chars = out.len(), "OCR finished");
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

pub struct ImageExtractor {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl ImageExtractor {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }
}

impl Extractor for ImageExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Image
    }

    fn extract(&self, src: &SourceFile<'_>) -> Result<Extraction, ExtractFailure> {
        let Some(ocr) = self.ocr.as_ref() else {
            return Err(ExtractFailure::new(
                FailureReason::OcrUnavailable,
                "no OCR engine configured for image evidence",
            ));
        };
        let text = ocr.recognize(src.path, src.bytes).map_err(|e| {
            let reason = if e.code == "OCR_SPAWN_FAILED" {
                FailureReason::OcrUnavailable
            } else {
                FailureReason::ExtractionFailed
            };
            ExtractFailure::new(reason, e.to_string())
        })?;
        Ok(Extraction {
            text,
            ..Extraction::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FixedOcr(&'static str);

    impl OcrEngine for FixedOcr {
        fn recognize(&self, _path: &Path, _bytes: &[u8]) -> Result<String, AppError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn recognizes_common_image_signatures() {
        assert!(is_image(b"\x89PNG\r\n\x1a\n...."));
        assert!(is_image(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(is_image(b"GIF89a..."));
        assert!(!is_image(b"%PDF-1.7"));
    }

    #[test]
    fn uses_configured_ocr_engine() {
        let path = PathBuf::from("scan.png");
        let src = SourceFile {
            path: &path,
            bytes: b"\x89PNG\r\n\x1a\n",
        };
        let ex = ImageExtractor::new(Some(Arc::new(FixedOcr("scanned letter"))))
            .extract(&src)
            .unwrap();
        assert_eq!(ex.text, "scanned letter");

        let err = ImageExtractor::new(None).extract(&src).unwrap_err();
        assert_eq!(err.reason, FailureReason::OcrUnavailable);
    }
}
