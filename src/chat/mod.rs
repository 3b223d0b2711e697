mod transcript;

pub use transcript::{ ReplyOutcome, ReplySink, Transcript };

use futures::StreamExt;
use log::{ debug, error, info };
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::llm::stream::create_streaming_response;
use crate::llm::{ DialogueClient, DialogueTurn, TextStream };
use crate::models::chat::Role;

pub const SYSTEM_INSTRUCTION: &str =
    "You are a helpful and empathetic AI assistant specializing in general skin health. \
Provide informative, safe, and general advice. Do not provide medical diagnoses or prescriptions. \
Always encourage users to consult a healthcare professional for any medical concerns.";

pub const GREETING: &str =
    "Hello! I'm your AI Skin Health Assistant. How can I help you today? \
You can ask me general questions about skincare, skin conditions, or healthy habits.";

pub const FALLBACK_MESSAGE: &str =
    "Sorry, I encountered an error. Please check your connection or API key and try again.";

/// One ongoing conversation with the assistant. Completed exchanges are
/// remembered and sent along with every later prompt.
pub struct Dialogue {
    client: Arc<dyn DialogueClient>,
    system_instruction: String,
    turns: Arc<Mutex<Vec<DialogueTurn>>>,
}

impl Dialogue {
    fn new(client: Arc<dyn DialogueClient>, system_instruction: String) -> Self {
        Self {
            client,
            system_instruction,
            turns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Streams the reply to `prompt` chunk by chunk, in generation order.
    ///
    /// The exchange is recorded once the upstream finishes cleanly, even if the
    /// caller stopped reading. A failed exchange is not recorded.
    pub async fn send(&self, prompt: &str) -> Result<TextStream, AppError> {
        let mut turns = self.turns.lock().await.clone();
        turns.push(DialogueTurn { role: Role::User, text: prompt.to_string() });

        let mut upstream = self.client
            .stream_reply(&self.system_instruction, &turns).await
            .map_err(|e| {
                error!("Error sending message: {}", e);
                AppError::ConversationFailed(FALLBACK_MESSAGE.to_string())
            })?;

        let history = Arc::clone(&self.turns);
        let prompt = prompt.to_string();
        Ok(
            create_streaming_response(move |tx| async move {
                let mut reply = String::new();
                let mut listening = true;
                while let Some(item) = upstream.next().await {
                    match item {
                        Ok(chunk) => {
                            reply.push_str(&chunk);
                            if listening && tx.send(Ok(chunk)).await.is_err() {
                                debug!("Reader went away; finishing the reply in the background");
                                listening = false;
                            }
                        }
                        Err(e) => {
                            error!("Assistant stream failed: {}", e);
                            if listening {
                                let _ = tx.send(Err(e)).await;
                            }
                            return;
                        }
                    }
                }
                let mut turns = history.lock().await;
                turns.push(DialogueTurn { role: Role::User, text: prompt });
                turns.push(DialogueTurn { role: Role::Model, text: reply });
            })
        )
    }

    pub async fn turns(&self) -> Vec<DialogueTurn> {
        self.turns.lock().await.clone()
    }
}

/// Owns the single dialogue context, created on first use and shared after.
pub struct ConversationGateway {
    client: Arc<dyn DialogueClient>,
    system_instruction: String,
    dialogue: OnceCell<Arc<Dialogue>>,
}

impl ConversationGateway {
    pub fn new(client: Arc<dyn DialogueClient>) -> Self {
        Self::with_instruction(client, SYSTEM_INSTRUCTION)
    }

    pub fn with_instruction(client: Arc<dyn DialogueClient>, system_instruction: &str) -> Self {
        Self {
            client,
            system_instruction: system_instruction.to_string(),
            dialogue: OnceCell::new(),
        }
    }

    pub fn dialogue(&self) -> Arc<Dialogue> {
        let dialogue = self.dialogue.get_or_init(|| {
            info!("Creating assistant dialogue context");
            Arc::new(Dialogue::new(Arc::clone(&self.client), self.system_instruction.clone()))
        });
        Arc::clone(dialogue)
    }

    pub async fn send(&self, prompt: &str) -> Result<TextStream, AppError> {
        self.dialogue().send(prompt).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedDialogue;
    use super::*;

    #[tokio::test]
    async fn dialogue_context_is_created_once() {
        let gateway = ConversationGateway::new(Arc::new(ScriptedDialogue::replying(&["hi"])));
        let first = gateway.dialogue();
        let second = gateway.dialogue();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let gateway = ConversationGateway::new(
            Arc::new(ScriptedDialogue::replying(&["Wear ", "sunscreen ", "daily."]))
        );
        let chunks: Vec<String> = gateway
            .send("Tips?").await
            .unwrap()
            .map(|c| c.unwrap())
            .collect().await;
        assert_eq!(chunks.concat(), "Wear sunscreen daily.");
    }

    #[tokio::test]
    async fn completed_exchanges_are_sent_with_the_next_prompt() {
        let client = Arc::new(ScriptedDialogue::replying(&["Use SPF 30."]));
        let gateway = ConversationGateway::new(client.clone());

        let _: Vec<_> = gateway.send("Which SPF?").await.unwrap().collect().await;
        let _: Vec<_> = gateway.send("And for kids?").await.unwrap().collect().await;

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[1][0].text, "Which SPF?");
        assert_eq!(seen[1][1], DialogueTurn { role: Role::Model, text: "Use SPF 30.".into() });
        assert_eq!(seen[1][2].text, "And for kids?");
    }

    #[tokio::test]
    async fn failed_exchanges_are_not_remembered() {
        let mut scripted = ScriptedDialogue::replying(&["partial", "never"]);
        scripted.fail_after = Some(1);
        let gateway = ConversationGateway::new(Arc::new(scripted));

        let items: Vec<_> = gateway.send("Hello").await.unwrap().collect().await;
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(gateway.dialogue().turns().await.is_empty());
    }

    #[tokio::test]
    async fn refused_connection_is_a_conversation_failure() {
        let mut scripted = ScriptedDialogue::replying(&[]);
        scripted.refuse = true;
        let gateway = ConversationGateway::new(Arc::new(scripted));

        let err = gateway.send("Hello").await.err().unwrap();
        assert!(matches!(err, AppError::ConversationFailed(_)));
    }

    #[tokio::test]
    async fn abandoned_stream_still_completes_the_exchange() {
        let gateway = ConversationGateway::new(
            Arc::new(ScriptedDialogue::replying(&["one ", "two ", "three"]))
        );
        let mut stream = gateway.send("Count").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "one ");
        drop(stream);

        let dialogue = gateway.dialogue();
        for _ in 0..50 {
            if !dialogue.turns().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let turns = dialogue.turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "one two three");
    }
}
