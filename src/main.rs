use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claw::config::Config;
use claw::{database, Claw};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claw=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:claw.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let http = reqwest::Client::builder().build()?;
    let service = Arc::new(Claw::new(pool, load_config()?, http));

    let token = CancellationToken::new();
    spawn_signal_handlers(Arc::clone(&service), token.clone());

    tracing::info!("claw initialized, starting scheduler");
    service.run(token).await;

    Ok(())
}

/// Build the configuration from the CLAW_CONFIG file when set, else defaults.
fn load_config() -> anyhow::Result<Config> {
    match std::env::var("CLAW_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        Err(_) => Ok(Config::default()),
    }
}

/// SIGINT/SIGTERM cancel the root token; SIGUSR1 re-reads the config file and
/// publishes a reload.
fn spawn_signal_handlers(service: Arc<Claw>, token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut usr1) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        else {
            tracing::warn!("failed to install SIGUSR1 handler, live reload disabled");
            return;
        };
        while usr1.recv().await.is_some() {
            match load_config() {
                Ok(new_config) => service.reread_config(new_config),
                Err(e) => tracing::error!(error = %e, "failed to reload configuration"),
            }
        }
    });
    #[cfg(not(unix))]
    drop(service);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let Ok(mut term) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
