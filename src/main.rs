use anyhow::Result;
use tracing_subscriber::EnvFilter;

use bidcraft::analysis::AnalysisService;
use bidcraft::db::Database;
use bidcraft::generation::GenerationService;
use bidcraft::ingest::Ingestor;
use bidcraft::knowledge::KnowledgeBase;
use bidcraft::llm::LlmClient;
use bidcraft::retrieval::ContextBuilder;
use bidcraft::storage::BlobStore;
use bidcraft::tasks::{ProjectLocks, TaskRunner};
use bidcraft::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let storage = BlobStore::new(config.blob_dir());
    let llm = LlmClient::new(&config.llm);
    let kb = KnowledgeBase::new(&config.knowledge);

    let context = ContextBuilder::new(
        db.clone(),
        storage.clone(),
        llm.clone(),
        kb,
        config.retrieval.clone(),
    );
    let locks = ProjectLocks::new();

    let analysis = AnalysisService::new(db.clone(), llm.clone(), context.clone(), locks.clone());
    let generation = GenerationService::new(
        db.clone(),
        llm,
        context,
        locks,
        storage.clone(),
        config.retrieval.chunk_max_tokens,
    );
    let ingestor = Ingestor::new(
        db.clone(),
        storage.clone(),
        config.retrieval.chunk_max_tokens,
    );
    let runner = TaskRunner::new(db.clone(), config.worker_count);

    run_server(config, db, storage, analysis, generation, ingestor, runner).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
