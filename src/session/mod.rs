//! Live streaming session over a single WebSocket.
//!
//! After the setup handshake the socket is split: a writer task owns the
//! sink and is fed through a capacity-1 channel (one frame in flight, callers
//! feel transport backpressure), and a reader task owns the stream, routes
//! every message into `ServerEvent`s and pushes them to an unbounded channel
//! so it never waits on the consumer. Both tasks watch one cancellation token.

pub mod router;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::encode::EncodedPayload;
use crate::protocol::ClientMessage;

pub use router::{MalformedEvent, ServerEvent};

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// How long the writer gets to send its close frame once cancelled
const WRITER_SHUTDOWN: Duration = Duration::from_secs(1);
/// How long a cancelled reader gets to notice before it is aborted
const READER_SHUTDOWN: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

pub fn live_url(api_key: &str) -> String {
    format!("{}?key={}", LIVE_ENDPOINT, api_key)
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session closed before setup completed: {reason}")]
    ClosedBeforeSetup { reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is closed")]
    Closed,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session task panicked")]
    Worker,
}

/// What the receiver saw over the session's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub messages: u64,
    pub events: u64,
    pub malformed: u64,
    pub acknowledged: bool,
    /// Stopped by cancellation rather than by the server closing
    pub cancelled: bool,
}

pub struct StreamSession {
    outbound: Option<mpsc::Sender<ClientMessage>>,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<Result<(), SessionError>>>,
    reader: Option<JoinHandle<Result<ReceiveSummary, SessionError>>>,
    grace: Duration,
}

impl StreamSession {
    /// Open the socket and send the setup message. No retry here: a failed
    /// handshake is returned to the caller as is.
    pub async fn connect(url: &str, config: &SessionConfig) -> Result<Self, SessionError> {
        info!("connecting live session (model {})", config.model);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let setup = ClientMessage::setup(config).to_json()?;
        ws_sender
            .send(WsMessage::Text(setup))
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        debug!("setup sent");

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel::<ClientMessage>(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(write_loop(ws_sender, outbound_rx, cancel.clone()));
        let reader = tokio::spawn(read_loop(ws_receiver, event_tx, cancel.clone()));

        Ok(Self {
            outbound: Some(outbound_tx),
            events: Some(event_rx),
            cancel,
            writer: Some(writer),
            reader: Some(reader),
            grace: config.response_grace,
        })
    }

    /// Take the event receiver (can only be called once per connection).
    /// It ends when the transport closes or the session is cancelled.
    pub fn receive(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.take()
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.enqueue(ClientMessage::text(text)).await
    }

    pub async fn send_frame(&self, payload: &EncodedPayload) -> Result<(), SessionError> {
        self.enqueue(ClientMessage::frame(payload)).await
    }

    async fn enqueue(&self, message: ClientMessage) -> Result<(), SessionError> {
        let outbound = self.outbound.as_ref().ok_or(SessionError::Closed)?;
        outbound.send(message).await.map_err(|_| SessionError::Closed)
    }

    /// Stop both tasks now. Idempotent; safe to call from any task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Finish the session: stop accepting input, let the receiver drain for
    /// up to the grace period, then cancel it and release the socket.
    pub async fn close(mut self) -> Result<ReceiveSummary, SessionError> {
        // Writer flushes what is queued, then idles until cancellation
        self.outbound.take();

        let reader_result = match self.reader.take() {
            Some(mut reader) => match timeout(self.grace, &mut reader).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!("grace period over, cancelling receiver");
                    self.cancel.cancel();
                    match timeout(READER_SHUTDOWN, &mut reader).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            reader.abort();
                            reader.await
                        }
                    }
                }
            },
            None => return Err(SessionError::Closed),
        };

        self.cancel.cancel();
        if let Some(mut writer) = self.writer.take() {
            match timeout(WRITER_SHUTDOWN, &mut writer).await {
                Ok(Ok(Err(e))) => debug!("writer ended with error: {}", e),
                Ok(_) => {}
                Err(_) => writer.abort(),
            }
        }

        match reader_result {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(ReceiveSummary {
                cancelled: true,
                ..ReceiveSummary::default()
            }),
            Err(_) => Err(SessionError::Worker),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(
    mut ws_sender: WsSink,
    mut outbound: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            next = outbound.recv() => match next {
                Some(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => break Err(SessionError::Serialize(e)),
                    };
                    if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                        break Err(SessionError::Transport(e.to_string()));
                    }
                }
                None => {
                    // Input finished; keep the socket open for trailing responses
                    cancel.cancelled().await;
                    break Ok(());
                }
            },
        }
    };

    let _ = ws_sender.close().await;
    result
}

async fn read_loop(
    mut ws_receiver: WsSource,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
) -> Result<ReceiveSummary, SessionError> {
    let mut summary = ReceiveSummary::default();

    let close_reason = loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("receiver cancelled");
                summary.cancelled = true;
                return Ok(summary);
            }
            msg = ws_receiver.next() => msg,
        };

        let payload = match msg {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "connection ended".to_string(),
        };

        summary.messages += 1;
        match router::route(&payload) {
            Ok(routed) => {
                for event in routed {
                    if event == ServerEvent::SetupAcknowledged {
                        summary.acknowledged = true;
                    }
                    summary.events += 1;
                    // A dropped consumer is not a transport problem; keep draining
                    let _ = events.send(event);
                }
            }
            Err(e) => {
                summary.malformed += 1;
                warn!("skipping message: {}", e);
            }
        }
    };

    if !summary.acknowledged {
        return Err(SessionError::ClosedBeforeSetup { reason: close_reason });
    }
    debug!("session transport closed: {}", close_reason);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    /// Accept one WebSocket connection on loopback and hand it to `handler`
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{}", addr)
    }

    async fn next_json(ws: &mut ServerWs) -> Option<serde_json::Value> {
        loop {
            match ws.next().await? {
                Ok(WsMessage::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    fn config(grace: Duration) -> SessionConfig {
        SessionConfig {
            response_grace: grace,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_and_events() {
        let url = serve_once(|mut ws| async move {
            let setup = next_json(&mut ws).await.unwrap();
            assert!(setup["setup"]["model"].as_str().unwrap().starts_with("models/"));

            ws.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into())).await.unwrap();
            ws.send(WsMessage::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"text":"All calm."}]}},"usageMetadata":{"promptTokenCount":5,"responseTokenCount":2}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::Text("garbage".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut session = StreamSession::connect(&url, &config(Duration::from_secs(5))).await.unwrap();
        let mut events = session.receive().unwrap();
        assert!(session.receive().is_none());

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ServerEvent::SetupAcknowledged,
                ServerEvent::TextDelta("All calm.".to_string()),
                ServerEvent::UsageReport {
                    prompt_tokens: 5,
                    response_tokens: 2
                },
            ]
        );

        let summary = session.close().await.unwrap();
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.malformed, 1);
        assert!(summary.acknowledged);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_close_before_any_frame_returns_within_grace() {
        let url = serve_once(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            ws.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into())).await.unwrap();
            // Stay silent until the client goes away
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let grace = Duration::from_millis(300);
        let mut session = StreamSession::connect(&url, &config(grace)).await.unwrap();
        let mut events = session.receive().unwrap();
        assert_eq!(events.recv().await, Some(ServerEvent::SetupAcknowledged));

        let started = Instant::now();
        let summary = session.close().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= grace);
        assert!(elapsed < grace + Duration::from_secs(2), "close took {:?}", elapsed);
        assert!(summary.cancelled);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_frames_and_text_are_sent_in_order() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let url = serve_once(move |mut ws| async move {
            let _ = next_json(&mut ws).await;
            ws.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into())).await.unwrap();
            while let Some(value) = next_json(&mut ws).await {
                let _ = seen_tx.send(value);
            }
        })
        .await;

        let session = StreamSession::connect(&url, &config(Duration::from_millis(100))).await.unwrap();
        session.send_text("watch the crib").await.unwrap();
        for seq in 1..=3 {
            let payload = EncodedPayload {
                data: vec![seq as u8],
                mime_type: "image/jpeg",
                seq,
            };
            session.send_frame(&payload).await.unwrap();
        }
        session.close().await.unwrap();

        let mut seen = Vec::new();
        while let Some(value) = seen_rx.recv().await {
            seen.push(value);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0]["realtimeInput"]["text"], "watch the crib");
        let frames: Vec<&str> = seen[1..]
            .iter()
            .map(|v| v["realtimeInput"]["video"]["data"].as_str().unwrap())
            .collect();
        // base64 of single bytes 1, 2, 3
        assert_eq!(frames, vec!["AQ==", "Ag==", "Aw=="]);
    }

    #[tokio::test]
    async fn test_closed_before_setup_is_an_error() {
        let url = serve_once(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            ws.close(None).await.unwrap();
        })
        .await;

        let session = StreamSession::connect(&url, &config(Duration::from_secs(5))).await.unwrap();
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, SessionError::ClosedBeforeSetup { .. }));
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        // Nothing listens here once the listener is dropped
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = StreamSession::connect(&url, &SessionConfig::default()).await.err().unwrap();
        assert!(matches!(err, SessionError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_send_after_cancel_reports_closed() {
        let url = serve_once(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            ws.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into())).await.unwrap();
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let session = StreamSession::connect(&url, &config(Duration::from_millis(50))).await.unwrap();
        session.cancel();
        session.cancel();

        // The writer drops its receiver once it sees the cancellation
        let mut result = Ok(());
        for _ in 0..50 {
            result = session.send_text("late").await;
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(result, Err(SessionError::Closed)));
        session.close().await.unwrap();
    }
}
