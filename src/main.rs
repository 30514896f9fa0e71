use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use berth::core::App;
use berth::handlers::axum::router;
use berth_core::adapters::{DatabaseAdapter, MemoryDatabaseAdapter};
use berth_core::config::AppConfig;
use berth_core::email::{ConsoleEmailProvider, EmailProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let port = config.server_port;

    let database = connect_database(&config).await?;
    let email = email_provider(&config);

    let app = App::builder(config)
        .database(database)
        .email(email)
        .build()
        .await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "berth control plane listening");

    axum::serve(
        listener,
        router(Arc::new(app)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "sqlx-postgres")]
async fn connect_database(
    config: &AppConfig,
) -> Result<Arc<dyn DatabaseAdapter>, Box<dyn std::error::Error>> {
    match &config.database_url {
        Some(url) => {
            let adapter = berth_core::adapters::PostgresAdapter::connect(url).await?;
            tracing::info!("connected to postgres");
            Ok(Arc::new(adapter))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; falling back to the in-memory store");
            Ok(Arc::new(MemoryDatabaseAdapter::new()))
        }
    }
}

#[cfg(not(feature = "sqlx-postgres"))]
async fn connect_database(
    config: &AppConfig,
) -> Result<Arc<dyn DatabaseAdapter>, Box<dyn std::error::Error>> {
    if config.database_url.is_some() {
        tracing::warn!(
            "DATABASE_URL is set but this build lacks the sqlx-postgres feature; using the in-memory store"
        );
    }
    Ok(Arc::new(MemoryDatabaseAdapter::new()))
}

fn email_provider(config: &AppConfig) -> Arc<dyn EmailProvider> {
    if config.email.api_key.is_empty() {
        tracing::info!("EMAIL_API_KEY is not set; emails are logged to the console");
        Arc::new(ConsoleEmailProvider)
    } else {
        Arc::new(berth_api::email::ResendEmailProvider::new(
            config.email.api_key.clone(),
            config.email.from_email.clone(),
        ))
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
