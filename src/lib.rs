pub mod advisor;
pub mod analysis;
pub mod auth;
pub mod chat;
pub mod cli;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;
pub mod storage;

use advisor::Advisor;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("HTTP Address: {}", args.http_addr);
    info!("WebSocket Address: {}", args.ws_addr);
    if !args.cors_origins.is_empty() {
        info!("CORS Origins: {}", args.cors_origins.join(", "));
    }
    info!("Storage Type: {}", args.storage_type);
    match args.storage_type.as_str() {
        "redis" => {
            info!("Storage Host: {}", args.storage_host);
            info!("Storage Key Prefix: {}", args.storage_redis_prefix);
        }
        "file" => info!("Storage Path: {}", args.storage_path),
        _ => {}
    }
    info!("LLM Type: {}", args.llm_type);
    info!("LLM Model: {}", args.llm_model.as_deref().unwrap_or("adapter default"));
    info!("Password Scheme: {}", args.password_scheme);
    info!("Max Upload Bytes: {}", args.max_upload_bytes);
    if args.analysis_timeout_secs > 0 {
        info!("Analysis Timeout: {}s", args.analysis_timeout_secs);
    } else {
        info!("Analysis Timeout: none");
    }
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let advisor = Arc::new(Advisor::new(args.clone()).await?);
    let server = Server::new(advisor, args);
    server.run().await?;

    Ok(())
}
