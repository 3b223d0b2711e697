pub mod gemini;
pub mod openai;
pub mod stream;

use async_trait::async_trait;
use futures::Stream;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use crate::models::chat::Role;
use self::gemini::GeminiClient;
use self::openai::OpenAIClient;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Ordered text deltas from a streaming completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, BoxError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    Gemini,
    OpenAI,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLlmTypeError {
    message: String,
}

impl fmt::Display for ParseLlmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseLlmTypeError {}

impl FromStr for LlmType {
    type Err = ParseLlmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(LlmType::Gemini),
            "openai" => Ok(LlmType::OpenAI),
            _ =>
                Err(ParseLlmTypeError {
                    message: format!("Invalid LLM type: '{}'", s),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::Gemini,
            api_key: None,
            model: None,
            base_url: None,
        }
    }
}

/// One image plus instructions, answered with JSON matching `response_schema`.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub instructions: String,
    pub image_base64: String,
    pub mime_type: String,
    /// JSON Schema (lowercase `type` names). Adapters translate as needed.
    pub response_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
}

/// The external classification capability.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Returns the raw JSON text of the reply.
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, BoxError>;
}

/// The external conversational capability. Stateless on the wire: the caller
/// resends the whole dialogue every turn.
#[async_trait]
pub trait DialogueClient: Send + Sync {
    async fn stream_reply(
        &self,
        system_instruction: &str,
        turns: &[DialogueTurn]
    ) -> Result<TextStream, BoxError>;
}

#[derive(Clone)]
pub struct LlmClients {
    pub vision: Arc<dyn VisionClient>,
    pub dialogue: Arc<dyn DialogueClient>,
}

pub fn new_clients(config: &LlmConfig) -> Result<LlmClients, BoxError> {
    let clients = match config.llm_type {
        LlmType::Gemini => {
            let specific_client = Arc::new(GeminiClient::from_config(config)?);
            LlmClients {
                vision: specific_client.clone(),
                dialogue: specific_client,
            }
        }
        LlmType::OpenAI => {
            let specific_client = Arc::new(OpenAIClient::from_config(config)?);
            LlmClients {
                vision: specific_client.clone(),
                dialogue: specific_client,
            }
        }
    };
    Ok(clients)
}
