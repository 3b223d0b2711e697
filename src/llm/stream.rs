use futures::{ Future, StreamExt };
use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ BoxError, TextStream };

/// What a provider-specific parser made of one SSE `data:` payload.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    Text(String),
    Done,
    Ignore,
    Failed(String),
}

type Sender = mpsc::Sender<Result<String, BoxError>>;

pub fn create_streaming_response<F, Fut>(response_fn: F) -> TextStream
    where
        F: FnOnce(Sender) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Splits a byte stream into lines. Holds partial lines (and partial UTF-8
/// sequences) until their newline arrives.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
    }
}

/// The payload of an SSE `data:` line. Comments, blank lines and other fields
/// yield `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(str::trim_start)
}

async fn forward_line(line: &str, line_parser: fn(&str) -> SseLine, tx: &Sender) -> bool {
    let data = match sse_data(line) {
        Some(data) => data,
        None => {
            return true;
        }
    };
    match line_parser(data) {
        SseLine::Text(tok) => {
            if tok.is_empty() {
                return true;
            }
            tx.send(Ok(tok)).await.is_ok()
        }
        SseLine::Ignore => true,
        SseLine::Done => false,
        SseLine::Failed(message) => {
            let _ = tx.send(Err(message.into())).await;
            false
        }
    }
}

/// Sends `request` and forwards each parsed SSE delta, in arrival order, as
/// soon as its line is complete.
pub fn http_stream_generate(
    request: reqwest::RequestBuilder,
    line_parser: fn(&str) -> SseLine
) -> TextStream {
    create_streaming_response(move |tx| async move {
        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(Box::new(e) as _)).await;
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let _ = tx.send(Err(format!("provider returned {}: {}", status, body).into())).await;
            return;
        }

        let mut bytes = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(buf) => {
                    for line in lines.push(&buf) {
                        debug!("stream line: {}", line);
                        if !forward_line(&line, line_parser, &tx).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(Box::new(e) as _)).await;
                    return;
                }
            }
        }
        if let Some(line) = lines.finish() {
            forward_line(&line, line_parser, &tx).await;
        }
    })
}
