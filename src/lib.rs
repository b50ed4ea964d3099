pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod generation;
pub mod ingest;
pub mod knowledge;
pub mod llm;
pub mod models;
pub mod parse;
pub mod placeholder;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod structure;
pub mod tasks;

pub use config::AppConfig;
pub use error::PipelineError;
pub use server::run_server;
