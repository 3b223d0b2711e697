use async_trait::async_trait;
use futures::StreamExt;
use log::warn;

use super::{ Dialogue, FALLBACK_MESSAGE, GREETING };
use crate::llm::BoxError;
use crate::models::chat::{ ChatMessage, Role };

/// Where reply chunks go as they arrive. An error means the reader is gone.
#[async_trait]
pub trait ReplySink: Send {
    async fn chunk(&mut self, chunk: &str) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Blank prompt, nothing was sent.
    Ignored,
    Completed,
    /// The fallback message was appended. Any partial reply stays visible.
    Failed,
}

/// What one user sees of the conversation, opening with the greeting.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::model(GREETING)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn push_user(&mut self, prompt: &str) {
        self.messages.push(ChatMessage::user(prompt));
    }

    /// Opens an empty model message that chunks are appended to.
    pub fn begin_reply(&mut self) {
        self.messages.push(ChatMessage::model(""));
    }

    pub fn append_chunk(&mut self, chunk: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Model => last.text.push_str(chunk),
            _ => self.messages.push(ChatMessage::model(chunk)),
        }
    }

    pub fn push_fallback(&mut self) {
        self.messages.push(ChatMessage::model(FALLBACK_MESSAGE));
    }

    /// Sends `prompt` on `dialogue` and folds the streamed reply into the
    /// transcript, handing each piece to `sink` as it lands. Provider failures
    /// never escape; they surface as the fallback message. Only a failing sink
    /// is an error.
    pub async fn ask<S>(
        &mut self,
        dialogue: &Dialogue,
        prompt: &str,
        sink: &mut S
    ) -> Result<ReplyOutcome, BoxError>
        where S: ReplySink + ?Sized
    {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(ReplyOutcome::Ignored);
        }
        self.push_user(prompt);

        let mut stream = match dialogue.send(prompt).await {
            Ok(stream) => stream,
            Err(_) => {
                self.push_fallback();
                return Ok(ReplyOutcome::Failed);
            }
        };

        self.begin_reply();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    self.append_chunk(&chunk);
                    sink.chunk(&chunk).await?;
                }
                Err(e) => {
                    warn!("Assistant reply interrupted: {}", e);
                    self.push_fallback();
                    return Ok(ReplyOutcome::Failed);
                }
            }
        }
        Ok(ReplyOutcome::Completed)
    }
}
