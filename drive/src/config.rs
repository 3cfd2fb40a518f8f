use serde::Deserialize;

/// Engine configuration, read from the environment like the rest of the
/// deployment's services.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Base directory for the chunked local backend.
    pub data_path: String,
    /// Default worker-pool size for upload batches.
    pub upload_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            data_path: std::env::var("DRIVE_DATA_PATH")
                .unwrap_or_else(|_| "./data/drive".to_string()),
            upload_concurrency: std::env::var("DRIVE_UPLOAD_CONCURRENCY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: "./data/drive".to_string(),
            upload_concurrency: 5,
        }
    }
}
