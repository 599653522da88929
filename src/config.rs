use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "stowage", about = "S3-compatible object storage backed by a plain directory tree", version = env!("STOWAGE_VERSION"))]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "STOWAGE_PORT", default_value = "8000")]
    pub port: u16,

    /// Address to bind to
    #[arg(long, env = "STOWAGE_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Root data directory
    #[arg(long, env = "STOWAGE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Access key ID clients must present when auth is enabled
    #[arg(long, env = "STOWAGE_ACCESS_KEY_ID", default_value = "")]
    pub access_key_id: String,

    /// Secret access key (accepted for CLI parity; request signatures are not verified)
    #[arg(long, env = "STOWAGE_SECRET_ACCESS_KEY", default_value = "")]
    pub secret_access_key: String,

    /// Require an AWS4-HMAC-SHA256 Authorization header with a matching access key
    #[arg(long, env = "STOWAGE_ENABLE_AUTH")]
    pub enable_auth: bool,

    /// Reject every mutating request with AccessDenied
    #[arg(long, env = "STOWAGE_READ_ONLY")]
    pub read_only: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enable_auth {
            anyhow::ensure!(
                !self.access_key_id.is_empty(),
                "access key ID is required when authentication is enabled"
            );
            anyhow::ensure!(
                !self.secret_access_key.is_empty(),
                "secret access key is required when authentication is enabled"
            );
        }
        Ok(())
    }
}
