// Flowline signup server
// Decision: runs live in PostgreSQL when DATABASE_URL is set, in memory otherwise

mod api;
mod config;
mod signup;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use flowline_durable::prelude::*;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn start_engine<S>(store: Arc<S>, config: &ServerConfig) -> Result<Engine>
where
    S: EventStore + TimerStore,
{
    let builder = EngineBuilder::new(store).config(EngineConfig::from_env());
    signup::register(builder, config)
        .start()
        .await
        .context("Failed to start engine")
}

fn build_app(engine: Arc<Engine>, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api::routes(api::AppState::new(engine, config.signup_sleep)))
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowline=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowline-server starting...");

    let config = ServerConfig::from_env()?;
    tracing::info!(
        signup_sleep = ?config.signup_sleep,
        welcome_failure_rate = config.welcome_failure_rate,
        "Signup workflow configured"
    );

    let engine = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresEventStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            start_engine(Arc::new(store), &config).await?
        }
        None => {
            tracing::warn!("DATABASE_URL not set, runs are kept in memory only");
            start_engine(Arc::new(InMemoryEventStore::new()), &config).await?
        }
    };
    let engine = Arc::new(engine);

    let app = build_app(engine.clone(), &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    engine.shutdown().await.context("Engine shutdown failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let config = ServerConfig::default();
        let engine = start_engine(Arc::new(InMemoryEventStore::new()), &config)
            .await
            .unwrap();
        let engine = Arc::new(engine);
        let app = build_app(engine.clone(), &config);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");

        engine.shutdown().await.unwrap();
    }
}
