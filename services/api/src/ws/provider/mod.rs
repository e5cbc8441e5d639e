//! Owns the upstream realtime connection of one session.
//!
//! [`establish`] runs the configuration handshake and, on success, hands the
//! sink to a writer task. Everything else in the session talks to that task
//! through a cloneable [`UpstreamController`]; the inbound frame stream is
//! returned separately so the event router can own it.

pub mod openai;

use super::relay::RelayError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use openai_realtime::{
    ClientEvent, RealtimeLink, ServerEvent,
    client::{FrameSink, FrameStream},
    types::SessionConfig,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, warn};

const OUTBOUND_CAPACITY: usize = 256;

/// Opens a transport to the realtime service.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<RealtimeLink>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Failed to connect to the realtime service: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("Realtime transport failed during the handshake: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("Realtime service rejected the session configuration: {0}")]
    Rejected(String),
    #[error("Realtime connection closed before the session was configured")]
    Closed,
    #[error("No configuration acknowledgement within {0:?}")]
    Timeout(Duration),
}

/// A configured upstream session.
pub struct Established {
    pub controller: UpstreamController,
    pub events: FrameStream,
    /// Completes once the upstream sink has been closed.
    pub writer: JoinHandle<()>,
}

/// Connects, sends the session configuration and waits for the
/// acknowledgement. On any failure the transport is closed before returning.
pub async fn establish(
    connector: &dyn UpstreamConnector,
    session: SessionConfig,
    manual_commit: bool,
    handshake_timeout: Duration,
) -> Result<Established, HandshakeError> {
    let RealtimeLink {
        mut sink,
        mut stream,
    } = connector.connect().await.map_err(HandshakeError::Connect)?;

    let outcome = tokio::time::timeout(
        handshake_timeout,
        configure(&mut sink, &mut stream, session),
    )
    .await
    .unwrap_or(Err(HandshakeError::Timeout(handshake_timeout)));

    if let Err(e) = outcome {
        if let Err(close_err) = sink.close().await {
            debug!(error = %close_err, "Closing upstream after failed handshake");
        }
        return Err(e);
    }

    info!(manual_commit, "Upstream session configured");
    let (controller, writer) = UpstreamController::spawn(sink, manual_commit);
    Ok(Established {
        controller,
        events: stream,
        writer,
    })
}

async fn configure(
    sink: &mut FrameSink,
    stream: &mut FrameStream,
    session: SessionConfig,
) -> Result<(), HandshakeError> {
    let frame = serde_json::to_string(&ClientEvent::SessionUpdate { session })
        .map_err(|e| HandshakeError::Transport(e.into()))?;
    sink.send(frame).await.map_err(HandshakeError::Transport)?;

    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(HandshakeError::Transport)?;
        match serde_json::from_str::<ServerEvent>(&frame) {
            Ok(ServerEvent::SessionUpdated { .. }) => return Ok(()),
            Ok(ServerEvent::Error { error }) => return Err(HandshakeError::Rejected(error.message)),
            Ok(ServerEvent::SessionCreated { .. }) => {
                debug!("Upstream session created, awaiting configuration ack")
            }
            Ok(_) => debug!("Ignoring upstream event received before configuration ack"),
            Err(e) => warn!(error = %e, "Undecodable upstream frame during handshake"),
        }
    }
    Err(HandshakeError::Closed)
}

/// Cloneable handle to the session's upstream writer.
///
/// Each call enqueues one batch; batches reach the transport whole and in
/// call order. After [`close`](Self::close) every send fails with
/// [`RelayError::UpstreamGone`].
#[derive(Clone, Debug)]
pub struct UpstreamController {
    tx: mpsc::Sender<Vec<ClientEvent>>,
    close: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    manual_commit: bool,
}

impl UpstreamController {
    /// Moves `sink` into a writer task. The task closes the sink exactly once,
    /// when [`close`](Self::close) is called, every handle is dropped, or a
    /// send fails.
    pub fn spawn(sink: FrameSink, manual_commit: bool) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(run_writer(sink, rx, close_rx).in_current_span());
        let controller = Self {
            tx,
            close: Arc::new(Mutex::new(Some(close_tx))),
            manual_commit,
        };
        (controller, writer)
    }

    /// Whether audio turns are committed by this server rather than by upstream VAD.
    pub fn manual_commit(&self) -> bool {
        self.manual_commit
    }

    async fn send(&self, batch: Vec<ClientEvent>) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::UpstreamGone);
        }
        self.tx
            .send(batch)
            .await
            .map_err(|_| RelayError::UpstreamGone)
    }

    /// Forwards a base64 PCM16 chunk.
    pub async fn append_audio(&self, audio: String) -> Result<(), RelayError> {
        let mut batch = vec![ClientEvent::InputAudioBufferAppend { audio }];
        if self.manual_commit {
            batch.push(ClientEvent::InputAudioBufferCommit);
        }
        self.send(batch).await
    }

    pub async fn append_pcm(&self, pcm: &[u8]) -> Result<(), RelayError> {
        let mut batch = vec![ClientEvent::audio_append(pcm)];
        if self.manual_commit {
            batch.push(ClientEvent::InputAudioBufferCommit);
        }
        self.send(batch).await
    }

    pub async fn commit_audio(&self) -> Result<(), RelayError> {
        self.send(vec![ClientEvent::InputAudioBufferCommit]).await
    }

    pub async fn clear_audio(&self) -> Result<(), RelayError> {
        self.send(vec![ClientEvent::InputAudioBufferClear]).await
    }

    /// A typed user message followed by a response trigger.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.send(vec![ClientEvent::user_text(text), ClientEvent::ResponseCreate])
            .await
    }

    /// Reports a capability result and asks for the next response.
    pub async fn send_function_output(
        &self,
        call_id: &str,
        output: String,
    ) -> Result<(), RelayError> {
        self.send(vec![
            ClientEvent::function_output(call_id, output),
            ClientEvent::ResponseCreate,
        ])
        .await
    }

    pub async fn update_session(&self, session: SessionConfig) -> Result<(), RelayError> {
        self.send(vec![ClientEvent::SessionUpdate { session }]).await
    }

    /// Signals the writer to close the transport. Only the first call has an
    /// effect; it returns `true`.
    pub fn close(&self) -> bool {
        let sender = match self.close.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.close.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

async fn run_writer(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Vec<ClientEvent>>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut closing = false;
    loop {
        tokio::select! {
            // Stop accepting batches but flush the ones already queued.
            _ = &mut close_rx, if !closing => {
                closing = true;
                rx.close();
            }
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                if !write_batch(&mut sink, batch).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Upstream close reported an error");
    }
    debug!("Upstream writer finished");
}

async fn write_batch(sink: &mut FrameSink, batch: Vec<ClientEvent>) -> bool {
    for event in batch {
        let kind = event.kind();
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, kind, "Failed to encode upstream event");
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, kind, "Upstream send failed");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_sink() -> (FrameSink, fmpsc::UnboundedReceiver<String>) {
        let (tx, rx) = fmpsc::unbounded::<String>();
        (Box::pin(tx.sink_map_err(anyhow::Error::from)), rx)
    }

    struct Scripted {
        frames: Vec<&'static str>,
        sent: Arc<Mutex<Option<fmpsc::UnboundedReceiver<String>>>>,
        connects: AtomicUsize,
    }

    impl Scripted {
        fn new(frames: Vec<&'static str>) -> Self {
            Self {
                frames,
                sent: Arc::new(Mutex::new(None)),
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UpstreamConnector for Scripted {
        async fn connect(&self) -> anyhow::Result<RealtimeLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (sink, rx) = recording_sink();
            *self.sent.lock().unwrap() = Some(rx);
            let frames: Vec<anyhow::Result<String>> =
                self.frames.iter().map(|f| Ok(f.to_string())).collect();
            Ok(RealtimeLink {
                sink,
                stream: Box::pin(stream::iter(frames)),
            })
        }
    }

    fn sent_frames(connector: &Scripted) -> Vec<serde_json::Value> {
        let mut guard = connector.sent.lock().unwrap();
        let rx = guard.as_mut().unwrap();
        let mut out = Vec::new();
        while let Ok(Some(frame)) = rx.try_next() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn handshake_completes_on_session_updated() {
        let connector = Scripted::new(vec![
            r#"{"type":"session.created","session":{}}"#,
            r#"{"type":"session.updated","session":{}}"#,
        ]);
        let established = establish(
            &connector,
            SessionConfig::default(),
            false,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let frames = sent_frames(&connector);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "session.update");
        assert!(!established.controller.manual_commit());
    }

    #[tokio::test]
    async fn handshake_fails_when_stream_ends_first() {
        let connector = Scripted::new(vec![r#"{"type":"session.created","session":{}}"#]);
        let err = establish(
            &connector,
            SessionConfig::default(),
            false,
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HandshakeError::Closed));
    }

    #[tokio::test]
    async fn handshake_fails_on_error_event() {
        let connector = Scripted::new(vec![
            r#"{"type":"error","error":{"message":"invalid voice"}}"#,
        ]);
        let err = establish(
            &connector,
            SessionConfig::default(),
            false,
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HandshakeError::Rejected(ref m) if m == "invalid voice"));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_ack() {
        struct Silent;
        #[async_trait]
        impl UpstreamConnector for Silent {
            async fn connect(&self) -> anyhow::Result<RealtimeLink> {
                let (sink, _rx) = recording_sink();
                Ok(RealtimeLink {
                    sink,
                    stream: Box::pin(stream::pending()),
                })
            }
        }

        let err = establish(&Silent, SessionConfig::default(), false, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HandshakeError::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn manual_commit_follows_each_chunk() {
        let (sink, mut rx) = recording_sink();
        let (controller, writer) = UpstreamController::spawn(sink, true);
        controller.append_pcm(&[0, 1, 2]).await.unwrap();
        controller.close();
        writer.await.unwrap();

        let kinds: Vec<String> = std::iter::from_fn(|| rx.try_next().ok().flatten())
            .map(|f| serde_json::from_str::<serde_json::Value>(&f).unwrap()["type"].to_string())
            .collect();
        assert_eq!(
            kinds,
            vec!["\"input_audio_buffer.append\"", "\"input_audio_buffer.commit\""]
        );
    }

    #[tokio::test]
    async fn vad_mode_never_commits() {
        let (sink, mut rx) = recording_sink();
        let (controller, writer) = UpstreamController::spawn(sink, false);
        controller.append_audio("AAEC".into()).await.unwrap();
        drop(controller);
        writer.await.unwrap();

        let frames: Vec<String> = std::iter::from_fn(|| rx.try_next().ok().flatten()).collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("input_audio_buffer.append"));
    }

    #[tokio::test]
    async fn function_output_is_followed_by_response_trigger() {
        let (sink, mut rx) = recording_sink();
        let (controller, writer) = UpstreamController::spawn(sink, false);
        controller
            .send_function_output("call_1", "{\"ok\":true}".into())
            .await
            .unwrap();
        drop(controller);
        writer.await.unwrap();

        let frames: Vec<serde_json::Value> = std::iter::from_fn(|| rx.try_next().ok().flatten())
            .map(|f| serde_json::from_str(&f).unwrap())
            .collect();
        assert_eq!(frames[0]["item"]["type"], "function_call_output");
        assert_eq!(frames[0]["item"]["call_id"], "call_1");
        assert_eq!(frames[1]["type"], "response.create");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_later_sends() {
        let (sink, _rx) = recording_sink();
        let (controller, writer) = UpstreamController::spawn(sink, false);
        let other = controller.clone();

        assert!(controller.close());
        assert!(!other.close());
        assert!(other.is_closed());
        assert!(matches!(
            other.clear_audio().await,
            Err(RelayError::UpstreamGone)
        ));
        writer.await.unwrap();
    }
}
