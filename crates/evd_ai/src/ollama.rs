use std::time::Duration;

use evd_core::config::SemanticConfig;
use evd_core::error::AppError;

const LOCAL_PREFIX: &str = "http://127.0.0.1";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    timeout: Duration,
}

impl OllamaClient {
    /// Create a client for Ollama. This is strictly limited to `127.0.0.1`.
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let not_allowed = || {
            AppError::validation(
                "AI_REMOTE_NOT_ALLOWED",
                "Ollama base URL must be localhost (127.0.0.1)",
            )
            .with_details(format!("base_url={base_url}"))
        };

        let rest = base_url.strip_prefix(LOCAL_PREFIX).ok_or_else(not_allowed)?;
        if !rest.is_empty() {
            let port = rest.strip_prefix(':').ok_or_else(not_allowed)?;
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                return Err(not_allowed());
            }
            match port.parse::<u32>() {
                Ok(p) if (1..=65535).contains(&p) => {}
                _ => return Err(not_allowed()),
            }
        }

        Ok(Self {
            base_url,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn from_config(cfg: &SemanticConfig) -> Result<Self, AppError> {
        Ok(Self::new(&cfg.ollama_base_url)?.with_timeout(Duration::from_millis(cfg.timeout_ms)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_check(&self) -> Result<(), AppError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = ureq::get(&url)
            .timeout(Duration::from_millis(800))
            .call();

        match resp {
            Ok(r) if r.status() == 200 => Ok(()),
            Ok(r) => Err(
                AppError::transient("AI_OLLAMA_UNHEALTHY", "Ollama health check failed")
                    .with_details(format!("status={}", r.status())),
            ),
            Err(e) => Err(AppError::transient(
                "AI_OLLAMA_UNREACHABLE",
                "Failed to reach Ollama on 127.0.0.1",
            )
            .with_details(e.to_string())),
        }
    }
}
