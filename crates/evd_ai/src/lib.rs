pub mod embeddings;
pub mod guardrails;
pub mod indexer;
pub mod llm;
pub mod ollama;
pub mod query;
pub mod similarity;
pub mod vector;
