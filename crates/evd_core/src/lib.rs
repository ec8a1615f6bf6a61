pub mod anomaly;
pub mod bates;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fulltext;
pub mod ingest;
pub mod normalize;
pub mod repo;
pub mod stats;
pub mod store;
pub mod timeline;
