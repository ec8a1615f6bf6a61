use evd_core::error::AppError;

pub mod ollama_llm;

pub trait Llm: Send + Sync {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError>;
}
