use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod routes;
mod session;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    if config.descriptor_secret_is_default() {
        tracing::warn!(
            "descriptor secret is the built-in development default; set ROLLCALL_DESCRIPTOR_SECRET before storing real faces"
        );
    }

    if !config.data_dir.exists() {
        tracing::info!(path = %config.data_dir.display(), "creating data directory");
    }
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let school_db = config.school_db_path();
    let descriptor_db = config.descriptor_db_path();
    for db in [&school_db, &descriptor_db] {
        if let Some(dir) = db.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }
    }

    let school = rollcall_store::SchoolStore::open(&school_db).await?;
    let descriptors =
        rollcall_store::DescriptorStore::open(&descriptor_db, &config.descriptor_secret).await?;

    let engine = engine::spawn_engine(&config.scrfd_model_path(), &config.arcface_model_path())?;

    let state = routes::AppState {
        school,
        descriptors,
        engine,
        match_threshold: config.match_threshold,
    };
    let app = routes::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
