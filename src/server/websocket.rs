use crate::advisor::Advisor;
use crate::chat::{ ReplyOutcome, ReplySink, Transcript, FALLBACK_MESSAGE, GREETING };
use crate::cli::Args;
use crate::llm::BoxError;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use super::{ api_key_matches, offered_api_key, API_KEY_HEADER };

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use async_trait::async_trait;
use chrono::Utc;
use futures::{ Sink, SinkExt, StreamExt };
use log::{ debug, info, warn, error };

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, BoxError> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

fn tls_acceptor(args: &Args) -> Result<Option<TlsAcceptor>, BoxError> {
    if !args.enable_tls {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        return Ok(None);
    }
    match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!(
                "TLS enabled. Loading certificate from '{}' and key from '{}'",
                cert_path,
                key_path
            );
            let config = load_tls_config(cert_path, key_path)?;
            Ok(Some(TlsAcceptor::from(config)))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            Err("Missing TLS certificate or key path".into())
        }
        (None, None) => {
            error!("--enable-tls was set but no certificate/key paths provided.");
            Err("TLS enabled without cert/key".into())
        }
    }
}

pub async fn start_ws_server(
    advisor: Arc<Advisor>,
    api_key: Option<String>,
    args: Args
) -> Result<(), BoxError> {
    let tls_acceptor = tls_acceptor(&args)?;
    let listener = TcpListener::bind(&args.ws_addr).await?;
    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, args.ws_addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let advisor = Arc::clone(&advisor);
        let required_api_key = api_key.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, advisor, required_api_key).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as BoxError)
                    }
                }
            } else {
                process_connection(peer, stream, advisor, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn provided_api_key(req: &Request) -> Option<String> {
    let header = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    offered_api_key(header, req.uri().query())
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("Unauthorized".to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    advisor: Arc<Advisor>,
    required_api_key: Option<String>
) -> Result<(), BoxError>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let required = match &required_api_key {
            Some(k) => k,
            None => {
                debug!("{} no API key required", peer);
                return Ok(response);
            }
        };
        if !api_key_matches(provided_api_key(req).as_deref(), required) {
            warn!("{}: bad or missing API key", peer);
            return Err(unauthorized());
        }
        info!("{} authenticated", peer);
        Ok(response)
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, advisor).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as BoxError)
        }
    }
}

async fn send_message<T>(tx: &mut T, msg: &ServerMessage) -> Result<(), BoxError>
    where T: Sink<Message> + Unpin, T::Error: Error + Send + Sync + 'static
{
    let json = serde_json::to_string(msg)?;
    tx.send(Message::Text(json)).await?;
    Ok(())
}

/// Forwards reply pieces to the client as `chunk` frames.
struct ChunkFrames<'a, T> {
    tx: &'a mut T,
}

#[async_trait]
impl<T> ReplySink for ChunkFrames<'_, T>
    where T: Sink<Message> + Unpin + Send, T::Error: Error + Send + Sync + 'static
{
    async fn chunk(&mut self, chunk: &str) -> Result<(), BoxError> {
        send_message(&mut *self.tx, &ServerMessage::Chunk { content: chunk.to_string() }).await
    }
}

/// Runs one chat exchange, streaming it to the client and into `transcript`.
async fn relay_reply<T>(
    tx: &mut T,
    advisor: &Advisor,
    transcript: &mut Transcript,
    prompt: &str
) -> Result<(), BoxError>
    where T: Sink<Message> + Unpin + Send, T::Error: Error + Send + Sync + 'static
{
    let dialogue = match advisor.dialogue().await {
        Ok(dialogue) => dialogue,
        Err(e) => {
            return send_message(tx, &ServerMessage::Error { message: e.to_string() }).await;
        }
    };

    send_message(tx, &ServerMessage::Processing).await?;
    let outcome = transcript.ask(&dialogue, prompt, &mut ChunkFrames { tx: &mut *tx }).await?;

    let last = match outcome {
        ReplyOutcome::Ignored => {
            return Ok(());
        }
        ReplyOutcome::Failed => ServerMessage::Error { message: FALLBACK_MESSAGE.to_string() },
        ReplyOutcome::Completed =>
            ServerMessage::Done {
                content: transcript
                    .last()
                    .map(|m| m.text.clone())
                    .unwrap_or_default(),
                timestamp: Utc::now().timestamp(),
            },
    };
    send_message(tx, &last).await
}

pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, advisor: Arc<Advisor>)
    where S: AsyncRead + AsyncWrite + Unpin + Send
{
    info!("New WebSocket connection: {}", peer);

    let (mut tx, mut rx) = websocket.split();
    let mut transcript = Transcript::new();

    let greeting = ServerMessage::Greeting { content: GREETING.to_string() };
    if let Err(e) = send_message(&mut tx, &greeting).await {
        error!("Failed to greet {}: {}", peer, e);
        return;
    }

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                error!("Error receiving message from {}: {}", peer, e);
                break;
            }
        };

        if message.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds size limit ({} > {})",
                peer,
                message.len(),
                MAX_MESSAGE_SIZE
            );
            let error_msg = ServerMessage::Error { message: "Message too large".to_string() };
            if send_message(&mut tx, &error_msg).await.is_err() {
                error!("Failed to send size limit error to {}", peer);
            }
            break;
        }

        match message {
            Message::Text(text) =>
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Chat { content }) => {
                        let prompt = content.trim();
                        if prompt.is_empty() {
                            debug!("Ignoring blank prompt from {}", peer);
                            continue;
                        }
                        if let Err(e) = relay_reply(&mut tx, &advisor, &mut transcript, prompt).await {
                            error!("Error sending reply to {}: {}", peer, e);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message from {}: {}", peer, e);
                        let error_msg = ServerMessage::Error {
                            message: "Invalid message format".to_string(),
                        };
                        if send_message(&mut tx, &error_msg).await.is_err() {
                            break;
                        }
                    }
                }
            Message::Close(_) => {
                info!("Client {} disconnected", peer);
                break;
            }
            _ => {}
        }
    }

    info!(
        "Connection closed: {} ({} transcript message(s))",
        peer,
        transcript.messages().len()
    );
}
