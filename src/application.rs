use crate::chat::conversation::ConversationStore;
use crate::chat::model::{GeminiModel, GenerativeModel};
use crate::chat::rate_limit::RateLimiter;
use crate::chat::session::SessionStore;
use crate::chat::topics::TopicSuggester;
use crate::chat::{ChatBroker, ChatService};
use crate::config::Settings;
use crate::identity::TokenIdentityResolver;
use crate::maintenance::{CacheSweep, ConversationSweep, RateWindowSweep, SessionSweep, Sweeper};
use crate::metrics::MetricsCollector;
use crate::proxy::cache::CacheStore;
use crate::proxy::forwarding::ForwardingEngine;
use crate::proxy::headers::paths;
use crate::proxy::middleware_stack::MiddlewareStack;
use crate::proxy::service::ProxyService;
use crate::proxy::streaming::ConnectionRegistry;
use crate::Result;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    router: Router,
    connections: ConnectionRegistry,
    sweeper: Sweeper,
    sweeper_shutdown: mpsc::Sender<()>,
}

impl Application {
    /// Assemble the gateway with the Gemini client named in `settings`
    #[instrument(skip(settings))]
    pub fn new(settings: Settings) -> Result<Self> {
        if settings.chat.gemini_api_key.is_empty() {
            warn!("No Gemini API key configured; chat turns will degrade to fallback replies");
        }
        let model = GeminiModel::new(
            settings.chat.gemini_api_key.clone(),
            settings.chat.gemini_base_url.clone(),
            Duration::from_secs(settings.chat.model_timeout_secs),
        )?;
        Self::with_model(settings, Arc::new(model))
    }

    /// Assemble the gateway around an arbitrary model backend
    #[instrument(skip(settings, model))]
    pub fn with_model(settings: Settings, model: Arc<dyn GenerativeModel>) -> Result<Self> {
        settings.validate()?;
        let metrics = Arc::new(MetricsCollector::new());

        let proxy_config = settings.proxy_config();
        let cache = Arc::new(CacheStore::from_config(&proxy_config));
        let engine = Arc::new(ForwardingEngine::new(
            proxy_config,
            cache.clone(),
            metrics.clone(),
        )?);
        let connections = engine.connections().clone();

        let defaults = settings.chat_defaults()?;
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit_config()));
        let conversations = Arc::new(ConversationStore::new(
            settings.chat.max_history,
            Duration::from_secs(settings.chat.conversation_idle_secs),
        ));
        let sessions = Arc::new(SessionStore::new(
            settings.chat.max_history,
            Duration::from_secs(settings.chat.session_ttl_secs),
        ));
        let topics = TopicSuggester::new(
            model.clone(),
            sessions.clone(),
            defaults.model.clone(),
            defaults.generation,
        );
        let broker = Arc::new(ChatBroker::new(
            model,
            conversations.clone(),
            sessions.clone(),
            limiter.clone(),
            metrics,
            defaults,
        ));

        let (sweeper, sweeper_shutdown) = Sweeper::new(
            vec![
                Arc::new(RateWindowSweep(limiter)),
                Arc::new(ConversationSweep(conversations)),
                Arc::new(SessionSweep(sessions)),
                Arc::new(CacheSweep(cache)),
            ],
            Duration::from_secs(settings.maintenance.sweep_interval_secs),
            Duration::from_secs(settings.maintenance.failure_backoff_secs),
        );

        let identity = Arc::new(TokenIdentityResolver::new(
            settings.auth.user_tokens.clone(),
            settings.auth.service_keys.clone(),
        ));
        let routes = Router::new()
            .route(paths::HEALTH, get(health_handler))
            .merge(ProxyService::new(engine, settings.maintainer()).into_router())
            .merge(ChatService::new(broker, topics, connections.clone()).into_router());
        let router = MiddlewareStack::new(identity)
            .with_body_limit(settings.proxy.max_request_size)
            .apply_to_router(routes);

        Ok(Self {
            settings,
            router,
            connections,
            sweeper,
            sweeper_shutdown,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The fully layered router, for in-process use
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Serve until ctrl-c, then close live streams and stop the sweeper
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let address = self.settings.bind_address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, "Starting bare gateway");

        let sweeper = tokio::spawn(self.sweeper.run());

        let connections = self.connections.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let closed = connections.close_all();
                info!(closed, "Shutdown requested, streaming relays closed");
            })
            .await?;

        if self.sweeper_shutdown.send(()).await.is_err() {
            warn!("Sweeper already stopped");
        }
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }

        info!("Bare gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// `GET /health`
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}
