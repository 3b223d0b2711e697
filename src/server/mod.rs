pub mod api;
pub mod websocket;

use crate::advisor::Advisor;
use crate::cli::Args;
use log::{ info, warn };
use std::error::Error;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// The key a client offered, from the `X-API-Key` header or an `api_key` query
/// parameter.
pub(crate) fn offered_api_key(header: Option<&str>, query: Option<&str>) -> Option<String> {
    if let Some(key) = header {
        return Some(key.to_owned());
    }
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("api_key="))
        .map(str::to_owned)
}

pub(crate) fn api_key_matches(offered: Option<&str>, required: &str) -> bool {
    match offered {
        Some(offered) => bool::from(offered.as_bytes().ct_eq(required.as_bytes())),
        None => false,
    }
}

pub struct Server {
    advisor: Arc<Advisor>,
    api_key: Option<String>,
    args: Args,
}

impl Server {
    pub fn new(advisor: Arc<Advisor>, args: Args) -> Self {
        let api_key = args.server_api_key.clone().filter(|k| !k.trim().is_empty());

        if api_key.is_some() {
            info!("Server configured with API Key authentication.");
        } else {
            warn!("Server configured WITHOUT API Key authentication. Connections are open.");
        }

        Self { advisor, api_key, args }
    }

    /// Starts the HTTP API in the background, then serves WebSocket chat
    /// until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(self.advisor.clone(), self.api_key.clone(), self.args.clone()).await?;
        websocket::start_ws_server(self.advisor.clone(), self.api_key.clone(), self.args.clone()).await
    }
}
