use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub model: String,
    /// Timeout for primary analysis/generation calls.
    pub timeout_secs: u64,
    /// Timeout for auxiliary calls (key-fact extraction).
    pub extract_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct KnowledgeConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    /// Shared character budget for raw source excerpts.
    pub raw_text_budget: usize,
    /// Top-K for the local chunk relevance search.
    pub snippet_top_k: usize,
    /// Word cap per stored chunk during ingestion.
    pub chunk_max_tokens: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub worker_count: usize,
    pub llm: LlmConfig,
    pub knowledge: KnowledgeConfig,
    pub retrieval: RetrievalConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("BIDCRAFT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Self {
            bind_addr: env::var("BIDCRAFT_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            worker_count: env::var("BIDCRAFT_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            llm: LlmConfig {
                base_url: env::var("OLLAMA_BASE_URL").ok(),
                model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen3:14b".to_string()),
                timeout_secs: env::var("OLLAMA_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
                extract_timeout_secs: env::var("OLLAMA_EXTRACT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            },
            knowledge: KnowledgeConfig {
                base_url: env::var("KNOWLEDGE_BASE_URL").ok(),
                api_key: env::var("KNOWLEDGE_API_KEY").ok(),
                timeout_secs: env::var("KNOWLEDGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(45),
            },
            retrieval: RetrievalConfig {
                raw_text_budget: env::var("RAW_TEXT_BUDGET")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2_000),
                snippet_top_k: env::var("SNIPPET_TOP_K")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
                chunk_max_tokens: env::var("CHUNK_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(800),
            },
        }
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("bidcraft.sqlite3").display()
        )
    }
}
