use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use onboarding_engine::config::EngineConfig;
use onboarding_engine::onboarding::{Catalog, OnboardingEngine, OnboardingRouteState, onboarding_routes};
use onboarding_engine::store::{LibSqlBackend, OnboardingStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    eprintln!("Onboarding engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}/api/onboarding/{{route}}", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn OnboardingStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    let engine = Arc::new(OnboardingEngine::with_config(store, &config));

    // ── Catalog ──────────────────────────────────────────────────────────
    if let Some(path) = &config.catalog_path {
        let catalog = Catalog::load(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?;
        catalog
            .apply(&engine)
            .await
            .with_context(|| format!("failed to apply catalog {}", path.display()))?;
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = onboarding_routes(OnboardingRouteState {
        engine: Arc::clone(&engine),
    });
    let listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    info!(port = config.http_port, "Onboarding HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
