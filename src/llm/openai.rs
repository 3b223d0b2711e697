use async_trait::async_trait;
use log::info;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;

use super::stream::{ http_stream_generate, SseLine };
use super::{ BoxError, DialogueClient, DialogueTurn, LlmConfig, StructuredRequest, TextStream, VisionClient };
use crate::models::chat::Role;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAIClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: OpenAIContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: JsonValue,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    error: Option<OpenAIError>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIError>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

fn parse_openai_line(data: &str) -> SseLine {
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                return SseLine::Failed(err.message);
            }
            let text: String = chunk.choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            if text.is_empty() { SseLine::Ignore } else { SseLine::Text(text) }
        }
        Err(_) => SseLine::Ignore,
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
    }
}

impl OpenAIClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, BoxError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| format!("Invalid API key format: {}", e))?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Box::new(e) as BoxError)?;

        Ok(Self {
            http,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, BoxError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "OpenAI API key is required".to_string())?;
        Self::new(api_key, config.model.clone(), config.base_url.clone())
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl VisionClient for OpenAIClient {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, BoxError> {
        info!(
            "OpenAIClient::generate_structured() → model={} mime_type={}",
            self.model,
            request.mime_type
        );

        let image_url = format!("data:{};base64,{}", request.mime_type, request.image_base64);
        let req = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: OpenAIContent::Parts(
                    vec![
                        OpenAIPart::Text { text: request.instructions },
                        OpenAIPart::ImageUrl { image_url: ImageUrl { url: image_url } }
                    ]
                ),
            }],
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: "skin_analysis".to_string(),
                    schema: request.response_schema,
                },
            }),
            stream: None,
        };

        let resp = self.http.post(self.completions_url()).json(&req).send().await?;
        let status = resp.status();
        let body: OpenAIResponse = resp.json().await?;
        if let Some(err) = body.error {
            return Err(format!("OpenAI returned {}: {}", status, err.message).into());
        }
        if !status.is_success() {
            return Err(format!("OpenAI returned {}", status).into());
        }

        let message = body.choices
            .into_iter()
            .next()
            .ok_or_else(|| "No response from OpenAI API".to_string())?
            .message;
        if let Some(refusal) = message.refusal {
            return Err(format!("OpenAI refused the request: {}", refusal).into());
        }
        message.content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| "OpenAI returned an empty message".into())
    }
}

#[async_trait]
impl DialogueClient for OpenAIClient {
    async fn stream_reply(
        &self,
        system_instruction: &str,
        turns: &[DialogueTurn]
    ) -> Result<TextStream, BoxError> {
        info!("OpenAIClient::stream_reply() → model={} turns={}", self.model, turns.len());

        let mut messages = vec![OpenAIMessage {
            role: "system".to_string(),
            content: OpenAIContent::Text(system_instruction.to_string()),
        }];
        messages.extend(
            turns.iter().map(|turn| OpenAIMessage {
                role: role_name(turn.role).to_string(),
                content: OpenAIContent::Text(turn.text.clone()),
            })
        );

        let req = OpenAIChatRequest {
            model: self.model.clone(),
            messages,
            response_format: None,
            stream: Some(true),
        };

        let request = self.http.post(self.completions_url()).json(&req);
        Ok(http_stream_generate(request, parse_openai_line))
    }
}
