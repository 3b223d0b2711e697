mod file;
mod memory;
mod redis;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use log::info;
use serde::{ de::DeserializeOwned, Serialize };
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;

pub const ACCOUNTS_KEY: &str = "accounts";
pub const SESSION_KEY: &str = "session";
pub const HISTORY_KEY_PREFIX: &str = "history:";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("unsupported storage type: {0}")]
    UnsupportedBackend(String),
}

/// Durable string key-value persistence. Values are JSON documents; callers go
/// through [`get_json`] and [`put_json`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

pub fn history_key(email: &str) -> String {
    format!("{}{}", HISTORY_KEY_PREFIX, email)
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.put(key, raw).await
}

pub fn create_store(args: &Args) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match args.storage_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => {
            let store = FileStore::open(&args.storage_path)?;
            Ok(Arc::new(store))
        }
        "redis" => {
            let store = RedisStore::new(&args.storage_host, &args.storage_redis_prefix)?;
            Ok(Arc::new(store))
        }
        other => Err(StorageError::UnsupportedBackend(other.to_string())),
    }
}

pub fn initialize_store(args: &Args) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match args.storage_type.to_lowercase().as_str() {
        "file" => info!("State will be stored in: file at {}", args.storage_path),
        "redis" => info!("State will be stored in: redis at {}", args.storage_host),
        other => info!("State will be stored in: {}", other),
    }
    create_store(args)
}
