use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Which blob backend the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
}

/// Which record store backs the service. Memory is for development and
/// tests only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStoreType {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server settings
    pub host: String,
    pub port: u16,
    /// Public base URL clients reach the service under; local blob URLs
    /// are minted beneath it.
    pub app_url: String,

    // Blob storage
    pub storage_type: StorageType,
    pub upload_dir: PathBuf,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,

    // Record store
    pub record_store: RecordStoreType,
    pub database_url: Option<String>,

    // Pipeline settings
    pub worker_concurrency: Option<usize>,
    pub analyzer_config: Option<PathBuf>,

    // CORS settings
    pub cors_allowed_origins: Vec<String>,

    // Development settings
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let storage_type = match env::var("STORAGE_TYPE").as_deref() {
            Ok("s3") => StorageType::S3,
            Ok("local") | Err(_) => StorageType::Local,
            Ok(other) => anyhow::bail!("STORAGE_TYPE must be 'local' or 's3', got '{other}'"),
        };

        let record_store = match env::var("RECORD_STORE").as_deref() {
            Ok("memory") => RecordStoreType::Memory,
            Ok("postgres") | Err(_) => RecordStoreType::Postgres,
            Ok(other) => anyhow::bail!("RECORD_STORE must be 'postgres' or 'memory', got '{other}'"),
        };

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            app_url: env::var("APP_URL")
                .unwrap_or_else(|_| format!("http://localhost:{port}"))
                .trim_end_matches('/')
                .to_string(),

            storage_type,
            upload_dir: env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "./uploads".to_string())
                .into(),
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_region: env::var("S3_REGION").ok(),

            record_store,
            database_url: env::var("DATABASE_URL").ok(),

            worker_concurrency: env::var("WORKER_CONCURRENCY").ok().and_then(|v| v.parse().ok()),
            analyzer_config: env::var("ANALYZER_CONFIG").ok().map(PathBuf::from),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            dev_mode: env::var("DEV_MODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        };

        if config.storage_type == StorageType::S3 && config.s3_bucket.is_none() {
            anyhow::bail!("S3_BUCKET is required when STORAGE_TYPE=s3");
        }
        if config.record_store == RecordStoreType::Postgres && config.database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when RECORD_STORE=postgres");
        }

        Ok(config)
    }
}
