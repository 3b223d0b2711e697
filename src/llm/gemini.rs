use async_trait::async_trait;
use log::info;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;

use super::stream::{ http_stream_generate, SseLine };
use super::{ BoxError, DialogueClient, DialogueTurn, LlmConfig, StructuredRequest, TextStream, VisionClient };

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    response_schema: JsonValue,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    prompt_feedback: Option<GooglePromptFeedback>,
    error: Option<GoogleError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleError {
    message: String,
}

impl GoogleResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

/// Gemini's schema dialect spells types in upper case (`OBJECT`, `STRING`).
pub fn to_gemini_schema(schema: &JsonValue) -> JsonValue {
    match schema {
        JsonValue::Object(map) => {
            let converted = map
                .iter()
                .map(|(key, value)| {
                    let value = match (key.as_str(), value) {
                        ("type", JsonValue::String(t)) => JsonValue::String(t.to_uppercase()),
                        _ => to_gemini_schema(value),
                    };
                    (key.clone(), value)
                })
                .collect();
            JsonValue::Object(converted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(to_gemini_schema).collect()),
        other => other.clone(),
    }
}

fn parse_gemini_line(data: &str) -> SseLine {
    match serde_json::from_str::<GoogleResponse>(data) {
        Ok(chunk) => {
            if let Some(err) = &chunk.error {
                return SseLine::Failed(err.message.clone());
            }
            if let Some(reason) = chunk.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_ref()) {
                return SseLine::Failed(format!("prompt blocked: {}", reason));
            }
            let text = chunk.text();
            if text.is_empty() { SseLine::Ignore } else { SseLine::Text(text) }
        }
        Err(_) => SseLine::Ignore,
    }
}

pub struct GeminiClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, BoxError> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| Box::new(e) as BoxError)?;

        Ok(Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, BoxError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "Google API key is required for GeminiClient".to_string())?;
        Self::new(api_key, config.model.clone(), config.base_url.clone())
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url.trim_end_matches('/'), self.model, method)
    }
}

#[async_trait]
impl VisionClient for GeminiClient {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, BoxError> {
        info!(
            "GeminiClient::generate_structured() → model={} mime_type={}",
            self.model,
            request.mime_type
        );

        let payload = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![
                    GeminiPart::InlineData {
                        inline_data: InlineData {
                            mime_type: request.mime_type,
                            data: request.image_base64,
                        },
                    },
                    GeminiPart::Text { text: request.instructions }
                ],
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: to_gemini_schema(&request.response_schema),
            }),
        };

        let resp = self.http
            .post(self.endpoint("generateContent"))
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send().await?;

        let status = resp.status();
        let body: GoogleResponse = resp.json().await?;
        if let Some(err) = &body.error {
            return Err(format!("Gemini returned {}: {}", status, err.message).into());
        }
        if !status.is_success() {
            return Err(format!("Gemini returned {}", status).into());
        }
        if let Some(reason) = body.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
            return Err(format!("Gemini blocked the request: {}", reason).into());
        }

        let text = body.text();
        if text.trim().is_empty() {
            let reason = body.candidates
                .first()
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(format!("Gemini returned no content ({})", reason).into());
        }
        Ok(text)
    }
}

#[async_trait]
impl DialogueClient for GeminiClient {
    async fn stream_reply(
        &self,
        system_instruction: &str,
        turns: &[DialogueTurn]
    ) -> Result<TextStream, BoxError> {
        info!("GeminiClient::stream_reply() → model={} turns={}", self.model, turns.len());

        let payload = GeminiRequest {
            contents: turns
                .iter()
                .map(|turn| GeminiContent {
                    role: Some(turn.role.as_str().to_string()),
                    parts: vec![GeminiPart::Text { text: turn.text.clone() }],
                })
                .collect(),
            system_instruction: Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text { text: system_instruction.to_string() }],
            }),
            generation_config: None,
        };

        let request = self.http
            .post(format!("{}?alt=sse", self.endpoint("streamGenerateContent")))
            .header("x-goog-api-key", &self.api_key)
            .json(&payload);

        Ok(http_stream_generate(request, parse_gemini_line))
    }
}
