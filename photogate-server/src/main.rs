//! # Photogate Server
//!
//! HTTP surface for the photo admission service.
//!
//! ## Overview
//!
//! - **Uploads**: multipart batches land in blob storage, get a PENDING
//!   record, and are scheduled onto the background admission pipeline
//! - **Listings**: paginated records with signed read URLs
//! - **Re-processing**: manual retry for anything not yet accepted
//! - **Storage**: local filesystem or S3, selected by configuration
//!
//! Built on Axum over `photogate-core`, with PostgreSQL (or an in-memory
//! store for development) behind the record-store port.

/// Server config
pub mod config;

/// Error types and handling
pub mod errors;

/// Request handlers
pub mod handlers;

/// Route organization
pub mod routes;

#[cfg(test)]
mod tests;

use clap::Parser;
use photogate_core::{
    AdmissionOptions, AdmissionService, AnalyzerSettings, BlobStore, LocalBlobStore, RecordStore,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, RecordStoreType, StorageType};

/// How long shutdown waits for in-flight pipeline runs.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line arguments for the Photogate server
#[derive(Parser, Debug)]
#[command(name = "photogate-server")]
#[command(about = "Photo admission service: validation pipeline, object storage, HTTP API")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "HOST")]
    host: Option<String>,
}

// Server application state
#[derive(Clone)]
pub struct AppState {
    pub admission: AdmissionService,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "photogate_server=info,photogate_core=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    let config = Arc::new(config);

    let settings = Arc::new(AnalyzerSettings::load(config.analyzer_config.as_deref())?);
    let records = build_record_store(&config).await?;
    let blobs = build_blob_store(&config).await?;

    let mut options = AdmissionOptions {
        dev_mode: config.dev_mode,
        ..AdmissionOptions::default()
    };
    if let Some(concurrency) = config.worker_concurrency {
        options.worker_concurrency = concurrency;
    }
    let admission = AdmissionService::new(records, blobs, settings, options);

    let state = AppState {
        admission: admission.clone(),
        config: config.clone(),
    };
    let app = routes::create_router(state);

    let addr = SocketAddr::new(config.host.parse::<IpAddr>()?, config.port);
    info!("photogate listening on {addr} ({:?} storage)", config.storage_type);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining in-flight pipeline runs");
    admission.shutdown(DRAIN_TIMEOUT).await;
    Ok(())
}

async fn build_record_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    match config.record_store {
        RecordStoreType::Memory => {
            info!("using in-memory record store");
            Ok(Arc::new(photogate_core::MemoryRecordStore::new()))
        }
        #[cfg(feature = "postgres")]
        RecordStoreType::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .expect("validated by Config::from_env");
            let store = photogate_core::PostgresRecordStore::connect(url).await?;
            store.initialize_schema().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        RecordStoreType::Postgres => {
            anyhow::bail!("built without the 'postgres' feature; set RECORD_STORE=memory")
        }
    }
}

async fn build_blob_store(config: &Config) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.storage_type {
        StorageType::Local => {
            tokio::fs::create_dir_all(&config.upload_dir).await?;
            let public_base = format!("{}/uploads", config.app_url);
            Ok(Arc::new(LocalBlobStore::new(
                config.upload_dir.clone(),
                public_base,
            )))
        }
        #[cfg(feature = "s3")]
        StorageType::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .expect("validated by Config::from_env");
            let store =
                photogate_core::S3BlobStore::from_env(bucket, config.s3_region.clone()).await;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StorageType::S3 => {
            anyhow::bail!("built without the 's3' feature; set STORAGE_TYPE=local")
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
