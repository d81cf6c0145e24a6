use std::sync::Arc;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::crm::{AlmanacClient, CrmClient, CrmPropagator};
use crate::email::{HttpMailer, Mailer};
use crate::leads::LeadQualifier;
use crate::ledger::Ledger;
use crate::model::{ModelClient, OpenAiClient};
use crate::preview::{HttpPreviewFetcher, PreviewFetcher};
use crate::queue::BackgroundQueue;
use crate::retrieval::{KnowledgeRetriever, PgRetriever};
use crate::router::post_chat;
use crate::store::{BoundedStore, PgStore, Store};
use crate::tools::ToolBroker;
use crate::types::now_iso;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub model: Arc<dyn ModelClient>,
    pub broker: ToolBroker,
    pub ledger: Ledger,
    pub qualifier: LeadQualifier,
    pub queue: BackgroundQueue,
}

/// Outbound collaborators of a turn.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub model: Arc<dyn ModelClient>,
    pub preview: Arc<dyn PreviewFetcher>,
    pub mailer: Arc<dyn Mailer>,
    pub crm: Arc<dyn CrmClient>,
}

impl AppState {
    pub fn new(config: AppConfig, parts: Collaborators) -> Self {
        let queue = BackgroundQueue::new(config.background_concurrency);
        let ledger = Ledger::new(parts.store.clone(), queue.clone());
        let background_store: Arc<dyn Store> =
            Arc::new(BoundedStore::new(parts.store.clone(), queue.clone()));
        let qualifier = LeadQualifier::new(
            background_store.clone(),
            parts.model.clone(),
            CrmPropagator::new(background_store, parts.crm),
            config.policy.clone(),
            &config.openai.extraction_model,
        );
        Self {
            broker: ToolBroker::new(parts.preview, parts.mailer),
            store: parts.store,
            retriever: parts.retriever,
            model: parts.model,
            ledger,
            qualifier,
            queue,
            config,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(post_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub async fn run() {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return;
        }
    };
    let db = match PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
    {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(
                error = %err,
                "failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)"
            );
            return;
        }
    };
    if let Err(err) = sqlx::migrate!("./migrations").run(&db).await {
        tracing::error!(error = %err, "failed to run sqlx migrations");
        return;
    }

    let http = match reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
    {
        Ok(http) => http,
        Err(err) => {
            tracing::error!(error = %err, "failed to build HTTP client");
            return;
        }
    };
    let openai = Arc::new(OpenAiClient::new(http.clone(), &config.openai));
    if !openai.has_api_key() {
        tracing::warn!("OPENAI_API_KEY is not set; chat turns will end incomplete");
    }
    let parts = Collaborators {
        store: Arc::new(PgStore::new(db.clone())),
        retriever: Arc::new(PgRetriever::new(db, openai.clone())),
        model: openai,
        preview: Arc::new(HttpPreviewFetcher::new(http.clone())),
        mailer: Arc::new(HttpMailer::new(
            http.clone(),
            config.email.clone(),
            &config.policy.scheduling_link,
        )),
        crm: Arc::new(AlmanacClient::new(http, config.almanac.clone())),
    };
    let port = config.port;
    let state = Arc::new(AppState::new(config, parts));
    let queue = state.queue.clone();
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind TCP listener");
            return;
        }
    };

    tracing::info!("lead chat server running at http://localhost:{port}");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server runtime failure");
    }

    tracing::info!(pending = queue.pending(), "waiting for background work");
    queue.drain().await;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
