//! Research agent service
//!
//! Runs a reason/act loop over a knowledge base and the web for each task,
//! checkpointing every cycle and streaming progress over SSE.

mod accounting;
mod api;
mod checkpoint;
mod config;
mod db;
mod events;
mod history;
mod llm;
mod message;
mod run_status;
mod runtime;
mod state_machine;
mod system_prompt;
mod tools;

use api::{create_router, AppState};
use checkpoint::{CheckpointStore, MemoryCheckpointStore};
use config::AgentConfig;
use db::Database;
use run_status::{HttpRunStatusSink, RunStatusSink};
use runtime::{RunManager, RunSettings, RunSinks, ServiceLlmClient, ToolRegistryExecutor};
use std::net::SocketAddr;
use std::sync::Arc;
use tools::{MemoryClient, ToolRegistry, ToolsConfig};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "research_agent=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AgentConfig::from_env()?;

    let db = if config.ephemeral {
        tracing::warn!("Ephemeral mode: checkpoints and local run records are kept in memory");
        Database::open_in_memory()?
    } else {
        // Ensure database directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %config.db_path.display(), "Opening database");
        Database::open(&config.db_path)?
    };
    let checkpoints: Arc<dyn CheckpointStore> = if config.ephemeral {
        Arc::new(MemoryCheckpointStore::new())
    } else {
        Arc::new(db.clone())
    };

    let service = llm::create_service(&config.llm)?;
    tracing::info!(
        provider = ?config.llm.provider,
        model = %service.model_id(),
        "LLM service initialized"
    );
    if config.pricing.is_free() {
        tracing::info!("No token prices configured, run costs are recorded as 0");
    }

    let status: Arc<dyn RunStatusSink> = match &config.backend {
        Some(backend) => {
            tracing::info!(url = %backend.url, "Reporting run status to backend-core");
            Arc::new(HttpRunStatusSink::new(backend)?)
        }
        None => {
            tracing::warn!("BACKEND_CORE_URL not set, run status is kept in the local database");
            Arc::new(db.clone())
        }
    };

    let memory = match &config.backend {
        Some(backend) => Some(Arc::new(MemoryClient::new(backend)?)),
        None => None,
    };

    let registry = ToolRegistry::standard(
        &ToolsConfig {
            search_base_url: config.search_base_url.clone(),
        },
        memory.clone(),
    );

    let manager = RunManager::new(
        Arc::new(ServiceLlmClient::new(service)),
        Arc::new(ToolRegistryExecutor::new(registry)),
        RunSinks {
            checkpoints,
            status,
        },
        RunSettings {
            system_prompt: system_prompt::SYSTEM_PROMPT.to_string(),
            pricing: config.pricing,
            max_tokens: config.llm.max_tokens,
            default_max_revisions: config.max_revisions,
            default_identity: config.default_identity.clone(),
        },
    )
    .with_memory(memory);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(manager))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Research agent listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
