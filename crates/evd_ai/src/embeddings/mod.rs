use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evd_core::error::AppError;

pub mod ollama_embed;

pub trait Embedder: Send + Sync {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError>;
}

/// Run one embedding call with a hard deadline.
///
/// The call runs on its own thread; on timeout the caller gets a transient
/// error immediately and the late result is dropped.
pub fn embed_with_timeout(
    embedder: Arc<dyn Embedder>,
    model: &str,
    input: &str,
    timeout: Duration,
) -> Result<Vec<f32>, AppError> {
    let (tx, rx) = mpsc::channel();
    let (model_owned, input_owned) = (model.to_string(), input.to_string());
    thread::Builder::new()
        .name("evd-embed".to_string())
        .spawn(move || {
            let _ = tx.send(embedder.embed(&model_owned, &input_owned));
        })
        .map_err(|e| {
            AppError::transient("AI_EMBEDDINGS_FAILED", "Failed to start embedding call")
                .with_details(e.to_string())
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(v)) if v.is_empty() => Err(AppError::transient(
            "AI_EMBEDDINGS_FAILED",
            "Embedding was empty",
        )
        .with_details(format!("model={model}"))),
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(AppError::transient("AI_EMBEDDINGS_FAILED", "Embedding call failed")
            .with_details(format!("model={model}; err={e}"))),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(AppError::transient(
            "AI_EMBEDDINGS_TIMEOUT",
            "Embedding call timed out",
        )
        .with_details(format!("model={model}; timeout_ms={}", timeout.as_millis()))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(AppError::transient(
            "AI_EMBEDDINGS_FAILED",
            "Embedding worker exited without a result",
        )
        .with_details(format!("model={model}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evd_core::error::ErrorKind;

    struct Slow;

    impl Embedder for Slow {
        fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
            thread::sleep(Duration::from_millis(500));
            Ok(vec![1.0])
        }
    }

    struct Broken;

    impl Embedder for Broken {
        fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
            Err(AppError::new("BOOM", "embedding backend down"))
        }
    }

    #[test]
    fn timeouts_and_failures_are_transient() {
        let err = embed_with_timeout(Arc::new(Slow), "m", "x", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.code, "AI_EMBEDDINGS_TIMEOUT");
        assert_eq!(err.kind, ErrorKind::Transient);

        let err = embed_with_timeout(Arc::new(Broken), "m", "x", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code, "AI_EMBEDDINGS_FAILED");
        assert!(err.retryable);
    }
}
