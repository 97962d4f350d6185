//! Ticket vault HTTP server binary

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vault_core::{api, config::LoggingConfig, Config, Vault};

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config = match std::env::var("CONFIG_FILE") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("Failed to load configuration from {}", path))?;
            config
                .apply_env(|key| std::env::var(key).ok())
                .context("Invalid environment override")?;
            config
        }
        Err(_) => Config::from_env().context("Invalid environment configuration")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting ticket vault"
    );

    let vault = Vault::open(config.clone())
        .await
        .context("Failed to open ledger")?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        sequence = vault.sequence(),
        "Ledger opened"
    );

    let vault = web::Data::new(vault);
    let app_vault = vault.clone();

    info!(
        "Starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(app_vault.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(api::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    info!("HTTP server stopped");
    if let Err(e) = vault.shutdown().await {
        warn!("Writer did not stop cleanly: {}", e);
    }

    Ok(())
}
