#![allow(dead_code)]

use async_trait::async_trait;
use derma_detect::advisor::Advisor;
use derma_detect::auth::PasswordScheme;
use derma_detect::chat::ReplySink;
use derma_detect::llm::stream::create_streaming_response;
use derma_detect::llm::{ BoxError, DialogueClient, DialogueTurn, StructuredRequest, TextStream, VisionClient };
use derma_detect::storage::{ KeyValueStore, MemoryStore, StorageError, HISTORY_KEY_PREFIX };
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Arc;
use std::time::Duration;

pub const MIB: usize = 1024 * 1024;

pub const ECZEMA_REPLY: &str = r#"{
    "possible_conditions": [
        {
            "name": "Eczema",
            "confidence_score": 140,
            "description": "Dry, itchy patches.",
            "symptoms": ["itching", "redness"],
            "treatment_suggestions": "General advice: moisturize regularly."
        },
        { "name": "Contact dermatitis", "confidence_score": -5, "description": "A reaction to an irritant." }
    ],
    "disclaimer": "This is not a medical diagnosis. Please consult a healthcare professional."
}"#;

/// Answers every classification request with the same reply.
pub struct FixedVision {
    pub reply: String,
    pub calls: AtomicUsize,
}

impl FixedVision {
    pub fn new(reply: &str) -> Self {
        Self { reply: reply.to_string(), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClient for FixedVision {
    async fn generate_structured(&self, _request: StructuredRequest) -> Result<String, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Takes `delay` before answering like [`FixedVision`].
pub struct SlowVision {
    pub inner: FixedVision,
    pub delay: Duration,
}

#[async_trait]
impl VisionClient for SlowVision {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, BoxError> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate_structured(request).await
    }
}

/// Streams fixed chunks, optionally failing after `fail_after` of them.
pub struct FixedDialogue {
    pub chunks: Vec<String>,
    pub fail_after: Option<usize>,
}

impl FixedDialogue {
    pub fn new(chunks: &[&str]) -> Self {
        Self { chunks: chunks.iter().map(|c| c.to_string()).collect(), fail_after: None }
    }

    pub fn failing_after(chunks: &[&str], fail_after: usize) -> Self {
        Self { fail_after: Some(fail_after), ..Self::new(chunks) }
    }
}

#[async_trait]
impl DialogueClient for FixedDialogue {
    async fn stream_reply(
        &self,
        _system_instruction: &str,
        _turns: &[DialogueTurn]
    ) -> Result<TextStream, BoxError> {
        let chunks = self.chunks.clone();
        let fail_after = self.fail_after;
        Ok(
            create_streaming_response(move |tx| async move {
                for (i, chunk) in chunks.into_iter().enumerate() {
                    if Some(i) == fail_after {
                        let _ = tx.send(Err("connection reset".into())).await;
                        return;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            })
        )
    }
}

/// Memory store whose next history read fails once `fail_next_history_read`
/// is armed.
/// Keeps every reply chunk it is handed.
#[derive(Default)]
pub struct Collected(pub Vec<String>);

#[async_trait]
impl ReplySink for Collected {
    async fn chunk(&mut self, chunk: &str) -> Result<(), BoxError> {
        self.0.push(chunk.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FlakyHistoryStore {
    inner: MemoryStore,
    pub fail_next_history_read: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyHistoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if key.starts_with(HISTORY_KEY_PREFIX) && self.fail_next_history_read.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::other("disk unavailable").into());
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.inner.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}

pub fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

pub fn advisor_with(
    store: Arc<dyn KeyValueStore>,
    vision: Arc<dyn VisionClient>,
    dialogue: FixedDialogue
) -> Advisor {
    Advisor::with_components(
        store,
        vision,
        Arc::new(dialogue),
        PasswordScheme::Argon2,
        4 * MIB,
        None
    )
}

pub fn advisor() -> Advisor {
    advisor_with(
        memory_store(),
        Arc::new(FixedVision::new(ECZEMA_REPLY)),
        FixedDialogue::new(&["Hello ", "there."])
    )
}
