use clap::Parser;

use crate::analysis::MAX_UPLOAD_BYTES;

fn parse_upload_limit(value: &str) -> Result<usize, String> {
    let bytes: usize = value.parse().map_err(|e| format!("{}", e))?;
    if bytes == 0 || bytes > MAX_UPLOAD_BYTES {
        return Err(format!("must be between 1 and {} bytes", MAX_UPLOAD_BYTES));
    }
    Ok(bytes)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Storage Args ---
    /// Where accounts, the session and analysis history live (file, redis, memory)
    #[arg(long, env = "STORAGE_TYPE", default_value = "file")]
    pub storage_type: String,

    /// Data directory for the file store.
    #[arg(long, env = "STORAGE_PATH", default_value = "data")]
    pub storage_path: String,

    /// Redis endpoint for the redis store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORAGE_HOST", default_value = "redis://127.0.0.1:6379")]
    pub storage_host: String,

    /// Prefix for Redis keys.
    #[arg(long, env = "STORAGE_REDIS_PREFIX", default_value = "derma_detect:")]
    pub storage_redis_prefix: String,

    // --- LLM Provider Args ---
    /// Provider used for image analysis and the assistant (gemini, openai)
    #[arg(long, env = "LLM_TYPE", default_value = "gemini")]
    pub llm_type: String,

    /// API Key for the LLM provider
    #[arg(long, env = "API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Model name (e.g., gemini-2.5-flash, gpt-4o). Adapter default when unset.
    #[arg(long, env = "LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Base URL for the provider API. Adapter default when unset.
    #[arg(long, env = "LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    // --- Analysis Args ---
    /// Largest accepted upload in bytes. May lower the 4 MiB ceiling, never raise it.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "4194304", value_parser = parse_upload_limit)]
    pub max_upload_bytes: usize,

    /// Give up on an image analysis after this many seconds. 0 waits forever.
    #[arg(long, env = "ANALYSIS_TIMEOUT_SECS", default_value = "0")]
    pub analysis_timeout_secs: u64,

    // --- Auth Args ---
    /// How new passwords are stored (argon2, legacy)
    #[arg(long, env = "PASSWORD_SCHEME", default_value = "argon2")]
    pub password_scheme: String,

    // --- Server Args ---
    /// Host address and port for the HTTP API.
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:4001")]
    pub http_addr: String,

    /// Host address and port for the assistant WebSocket server.
    #[arg(long, env = "WS_ADDR", default_value = "127.0.0.1:4000")]
    pub ws_addr: String,

    /// Browser origins allowed to call the HTTP API (comma separated). Unset with no
    /// API key means any origin; unset with an API key means none.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Optional API Key required by both the HTTP API and the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
