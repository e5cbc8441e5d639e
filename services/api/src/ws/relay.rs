//! The per-session relay.
//!
//! A session is two pumps under one supervisor:
//!
//! - the client pump turns browser frames into upstream commands;
//! - the event router consumes upstream events, forwards what the browser
//!   needs, and dispatches function calls.
//!
//! Each pump owns its own state, so nothing is shared but the cloneable
//! upstream controller and the client sender. When either pump ends the
//! supervisor stops the other, closes the upstream transport and removes the
//! session from the registry.

use super::{
    dispatch::{CallOutcome, Dispatcher},
    protocol::{ClientMessage, ServerMessage, Speaker},
    provider::{Established, UpstreamConnector, UpstreamController, establish, openai},
    registry::{SessionEntry, SessionPhase, SessionRegistry},
    transcript::{TranscriptUpdate, TurnTranscript},
};
use crate::profile::{SessionProfile, VoiceSettings};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use openai_realtime::{ServerEvent, client::FrameStream};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;
use voicebot_core::{
    CapabilityDeclaration, CapabilitySet, external_api::EndpointCatalog, knowledge::KnowledgeBase,
};

/// How long a pump gets to notice a stop request before it is aborted.
const PUMP_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    #[error("client connection closed")]
    ClientGone,
    #[error("upstream connection closed")]
    UpstreamGone,
}

/// A frame received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    /// Raw PCM16 audio.
    Binary(Bytes),
    Close,
}

pub type ClientFrames = Pin<Box<dyn Stream<Item = ClientFrame> + Send>>;

/// Everything a session needs from the process.
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub profile: SessionProfile,
    /// Already narrowed to the profile's capabilities.
    pub capabilities: CapabilitySet,
    pub catalog: Arc<EndpointCatalog>,
    pub knowledge: KnowledgeBase,
    pub connector: Arc<dyn UpstreamConnector>,
    pub registry: SessionRegistry,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Client,
    Upstream,
    /// A pump panicked or had to be aborted.
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub established: bool,
    pub ended_by: Option<EndReason>,
    pub calls_dispatched: usize,
    /// Calls still running at teardown; their results were discarded.
    pub calls_abandoned: usize,
    pub in_flight_after_teardown: usize,
    pub final_phase: SessionPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    Stopped,
    ClientGone,
    UpstreamGone,
}

impl From<RelayError> for PumpExit {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ClientGone => Self::ClientGone,
            RelayError::UpstreamGone => Self::UpstreamGone,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RouterReport {
    exit: PumpExit,
    dispatched: usize,
    abandoned: usize,
    in_flight: usize,
}

#[derive(Clone)]
struct ClientLink(mpsc::Sender<ServerMessage>);

impl ClientLink {
    async fn send(&self, msg: ServerMessage) -> Result<(), RelayError> {
        self.0.send(msg).await.map_err(|_| RelayError::ClientGone)
    }
}

/// Runs one session to completion.
///
/// Messages for the browser are written to `client_tx`. The sender is
/// dropped when the session ends, which lets the socket writer finish.
pub async fn run_session<S>(
    ctx: SessionContext,
    frames: S,
    client_tx: mpsc::Sender<ServerMessage>,
) -> SessionSummary
where
    S: Stream<Item = ClientFrame> + Send + 'static,
{
    let span = info_span!(
        "session",
        session_id = %ctx.session_id,
        profile = %ctx.profile.kind
    );
    supervise(ctx, Box::pin(frames), ClientLink(client_tx))
        .instrument(span)
        .await
}

async fn supervise(ctx: SessionContext, frames: ClientFrames, client: ClientLink) -> SessionSummary {
    let SessionContext {
        session_id,
        profile,
        capabilities,
        catalog,
        knowledge,
        connector,
        registry,
        handshake_timeout,
    } = ctx;

    let mut summary = SessionSummary {
        session_id,
        established: false,
        ended_by: None,
        calls_dispatched: 0,
        calls_abandoned: 0,
        in_flight_after_teardown: 0,
        final_phase: SessionPhase::Connecting,
    };

    let settings = profile.default_settings();
    let declarations = capabilities.declarations();
    let session = openai::session_config(&profile, &settings, &declarations, &catalog.instructions());
    info!(tools = declarations.len(), vad = profile.uses_server_vad(), "Connecting upstream");

    let Established {
        controller,
        events,
        writer,
    } = match establish(
        connector.as_ref(),
        session,
        !profile.uses_server_vad(),
        handshake_timeout,
    )
    .await
    {
        Ok(established) => established,
        Err(e) => {
            error!(error = %e, "Upstream handshake failed");
            let _ = client
                .send(ServerMessage::error(format!("Failed to connect to OpenAI: {e}")))
                .await;
            summary.final_phase = SessionPhase::Closed;
            return summary;
        }
    };
    summary.established = true;

    let (phase_tx, phase_rx) = watch::channel(SessionPhase::Active);
    registry
        .insert(
            session_id,
            SessionEntry {
                profile: profile.kind,
                connected_at: Utc::now(),
                phase: phase_rx,
            },
        )
        .await;
    info!("Session active");

    if client
        .send(ServerMessage::Connected {
            session_id,
            profile: profile.kind,
        })
        .await
        .is_err()
    {
        debug!("Client left before the session became active");
    }

    let (client_stop_tx, client_stop_rx) = oneshot::channel();
    let (router_stop_tx, router_stop_rx) = oneshot::channel();
    let (dispatcher, outcomes) = Dispatcher::new(capabilities);

    let pump = ClientPump {
        controller: controller.clone(),
        client: client.clone(),
        profile,
        settings,
        declarations,
        catalog,
        knowledge,
    };
    let mut client_task = tokio::spawn(pump.run(frames, client_stop_rx).in_current_span());

    let router = EventRouter {
        client: client.clone(),
        controller: controller.clone(),
        transcript: TurnTranscript::new(),
        dispatcher,
    };
    let mut router_task =
        tokio::spawn(router.run(events, outcomes, router_stop_rx).in_current_span());
    drop(client);

    enum First {
        Client(Result<PumpExit, JoinError>),
        Router(Result<RouterReport, JoinError>),
    }

    let first = tokio::select! {
        res = &mut client_task => First::Client(res),
        res = &mut router_task => First::Router(res),
    };

    phase_tx.send_replace(SessionPhase::Closing);
    info!("Session closing");

    let (ended_by, report) = match first {
        First::Client(res) => {
            let _ = router_stop_tx.send(());
            let ended_by = match res {
                Ok(PumpExit::UpstreamGone) => EndReason::Upstream,
                Ok(_) => EndReason::Client,
                Err(e) => {
                    error!(error = %e, "Client pump failed");
                    EndReason::Fault
                }
            };
            (ended_by, stop_pump(router_task, "event router").await)
        }
        First::Router(res) => {
            let _ = client_stop_tx.send(());
            let _ = stop_pump(client_task, "client pump").await;
            let ended_by = match &res {
                Ok(report) if report.exit == PumpExit::UpstreamGone => EndReason::Upstream,
                Ok(_) => EndReason::Client,
                Err(e) => {
                    error!(error = %e, "Event router failed");
                    EndReason::Fault
                }
            };
            (ended_by, res.ok())
        }
    };

    summary.ended_by = Some(ended_by);
    if let Some(report) = report {
        summary.calls_dispatched = report.dispatched;
        summary.calls_abandoned = report.abandoned;
        summary.in_flight_after_teardown = report.in_flight;
    }

    controller.close();
    drop(controller);
    if let Err(e) = writer.await {
        warn!(error = %e, "Upstream writer task failed");
    }

    phase_tx.send_replace(SessionPhase::Closed);
    registry.remove(&session_id).await;
    summary.final_phase = SessionPhase::Closed;

    info!(
        ended_by = ?ended_by,
        calls_dispatched = summary.calls_dispatched,
        calls_abandoned = summary.calls_abandoned,
        "Session closed"
    );
    summary
}

async fn stop_pump<T>(mut task: JoinHandle<T>, name: &'static str) -> Option<T> {
    match tokio::time::timeout(PUMP_STOP_GRACE, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(pump = name, error = %e, "Pump failed during shutdown");
            None
        }
        Err(_) => {
            warn!(pump = name, "Pump ignored stop request, aborting");
            task.abort();
            None
        }
    }
}

/// Upstream errors worth surfacing to the browser.
fn is_severe(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("critical") || message.contains("failed")
}

struct ClientPump {
    controller: UpstreamController,
    client: ClientLink,
    profile: SessionProfile,
    settings: VoiceSettings,
    declarations: Vec<CapabilityDeclaration>,
    catalog: Arc<EndpointCatalog>,
    knowledge: KnowledgeBase,
}

impl ClientPump {
    async fn run(mut self, mut frames: ClientFrames, mut stop: oneshot::Receiver<()>) -> PumpExit {
        loop {
            let step = tokio::select! {
                _ = &mut stop => return PumpExit::Stopped,
                frame = frames.next() => match frame {
                    None | Some(ClientFrame::Close) => {
                        info!("Client disconnected");
                        return PumpExit::ClientGone;
                    }
                    Some(ClientFrame::Binary(pcm)) => self.controller.append_pcm(&pcm).await,
                    Some(ClientFrame::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => self.handle(msg).await,
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable client message");
                            Ok(())
                        }
                    },
                },
            };
            if let Err(e) = step {
                return e.into();
            }
        }
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        match msg {
            ClientMessage::AudioInput { audio, format } => {
                if format.as_deref() == Some("webm") {
                    return self
                        .client
                        .send(ServerMessage::error(
                            "WebM audio is not supported. Please send PCM16 audio at 24kHz.",
                        ))
                        .await;
                }
                if audio.is_empty() {
                    return Ok(());
                }
                self.controller.append_audio(audio).await
            }
            ClientMessage::TextInput { text } => {
                if text.trim().is_empty() {
                    return Ok(());
                }
                debug!(chars = text.len(), "Forwarding text input");
                self.controller.send_text(text).await
            }
            ClientMessage::UpdateSettings { settings } => {
                self.settings.apply(&settings);
                info!(voice = %self.settings.voice, temperature = self.settings.temperature, "Updating session settings");
                let update =
                    openai::settings_update(&self.profile, &self.settings, &self.catalog.instructions());
                self.controller.update_session(update).await?;
                self.client
                    .send(ServerMessage::SettingsUpdated { settings })
                    .await
            }
            ClientMessage::ResetAudioState => self.controller.clear_audio().await,
            ClientMessage::RecordingStopped => {
                if self.controller.manual_commit() {
                    self.controller.commit_audio().await
                } else {
                    debug!("Recording stopped; upstream VAD decides the turn end");
                    Ok(())
                }
            }
            ClientMessage::SessionConfig { config } => {
                if !config.enable_functions {
                    return Ok(());
                }
                let session = openai::session_config(
                    &self.profile,
                    &self.settings,
                    &self.declarations,
                    &self.catalog.instructions(),
                );
                self.controller.update_session(session).await
            }
            ClientMessage::RagIndex {
                file_id,
                content,
                file_name,
            } => {
                let file_name = file_name.unwrap_or_else(|| file_id.clone());
                match self
                    .knowledge
                    .index_document(&file_id, &file_name, &content)
                    .await
                {
                    Ok(chunks) => {
                        self.client
                            .send(ServerMessage::DocumentIndexed { file_id, chunks })
                            .await
                    }
                    Err(e) => {
                        warn!(%file_id, error = %e, "Failed to index document");
                        self.client
                            .send(ServerMessage::error(format!("Failed to index document: {e}")))
                            .await
                    }
                }
            }
            ClientMessage::Unknown => {
                debug!("Ignoring unknown client message type");
                Ok(())
            }
        }
    }
}

struct EventRouter {
    client: ClientLink,
    controller: UpstreamController,
    transcript: TurnTranscript,
    dispatcher: Dispatcher,
}

impl EventRouter {
    async fn run(
        mut self,
        mut events: FrameStream,
        mut outcomes: mpsc::Receiver<CallOutcome>,
        mut stop: oneshot::Receiver<()>,
    ) -> RouterReport {
        let exit = loop {
            let step = tokio::select! {
                _ = &mut stop => break PumpExit::Stopped,
                Some(outcome) = outcomes.recv() => self.complete(outcome).await,
                frame = events.next() => match frame {
                    None => {
                        info!("Upstream closed the connection");
                        break PumpExit::UpstreamGone;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Upstream transport error");
                        break PumpExit::UpstreamGone;
                    }
                    Some(Ok(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => self.route(event).await,
                        Err(e) => {
                            warn!(error = %e, "Dropping undecodable upstream event");
                            Ok(())
                        }
                    },
                },
            };
            if let Err(e) = step {
                break e.into();
            }
        };

        let abandoned = self.dispatcher.abandon_all();
        RouterReport {
            exit,
            dispatched: self.dispatcher.dispatched(),
            abandoned,
            in_flight: self.dispatcher.in_flight(),
        }
    }

    async fn user_final(&self, text: Option<String>) -> Result<(), RelayError> {
        match text {
            Some(text) => {
                debug!(%text, "User turn transcribed");
                self.client
                    .send(ServerMessage::TranscriptionComplete {
                        text,
                        role: Speaker::User,
                    })
                    .await
            }
            None => Ok(()),
        }
    }

    async fn user_update(&self, update: TranscriptUpdate) -> Result<(), RelayError> {
        match update {
            TranscriptUpdate::Provisional(text) => {
                self.client
                    .send(ServerMessage::Transcription {
                        text,
                        role: Speaker::User,
                    })
                    .await
            }
            TranscriptUpdate::Final(text) => self.user_final(Some(text)).await,
            TranscriptUpdate::Ignored => Ok(()),
        }
    }

    /// Closes the user's turn before any assistant output reaches the client.
    async fn close_user_turn(&mut self) -> Result<(), RelayError> {
        let text = self.transcript.take_final();
        self.user_final(text).await
    }

    async fn route(&mut self, event: ServerEvent) -> Result<(), RelayError> {
        match event {
            ServerEvent::Error { error } => {
                if is_severe(&error.message) {
                    warn!(code = ?error.code, message = %error.message, "Upstream reported an error");
                    self.client
                        .send(ServerMessage::Error {
                            error: error.message,
                            internal: true,
                        })
                        .await?;
                } else {
                    debug!(code = ?error.code, message = %error.message, "Upstream error suppressed");
                }
            }
            ServerEvent::SessionCreated { .. } => debug!("Upstream session created"),
            ServerEvent::SessionUpdated { .. } => debug!("Upstream session configuration acknowledged"),
            ServerEvent::SpeechStarted { item_id } => {
                self.transcript.speech_started(item_id.as_deref());
                self.client.send(ServerMessage::SpeechStarted).await?;
            }
            ServerEvent::SpeechStopped { item_id } => {
                self.client.send(ServerMessage::SpeechStopped).await?;
                let text = self.transcript.speech_stopped(item_id.as_deref());
                self.user_final(text).await?;
            }
            ServerEvent::AudioCommitted { item_id } => trace!(?item_id, "Input audio committed"),
            ServerEvent::AudioCleared => trace!("Input audio cleared"),
            ServerEvent::ItemCreated { item } => {
                if item.role.as_deref() == Some("user") {
                    if let Some(transcript) = item.input_audio_transcript() {
                        let text = self.transcript.completed(item.id.as_deref(), transcript);
                        self.user_final(text).await?;
                    }
                }
            }
            ServerEvent::TranscriptionDelta { item_id, delta } => {
                let update = self.transcript.delta(item_id.as_deref(), &delta);
                self.user_update(update).await?;
            }
            ServerEvent::TranscriptionPartial {
                item_id,
                transcript,
            } => {
                let update = self.transcript.partial(item_id.as_deref(), &transcript);
                self.user_update(update).await?;
            }
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                let text = self.transcript.completed(item_id.as_deref(), &transcript);
                self.user_final(text).await?;
            }
            ServerEvent::TranscriptionFailed { item_id, error } => {
                warn!(?item_id, message = %error.message, "Input transcription failed");
            }
            ServerEvent::ItemTruncated { item_id } => {
                debug!(?item_id, "Assistant output truncated");
                self.client.send(ServerMessage::ResponseInterrupted).await?;
            }
            ServerEvent::ResponseCreated { response } => {
                self.close_user_turn().await?;
                debug!(response_id = ?response.id, "Response started");
                self.client.send(ServerMessage::ResponseCreated).await?;
            }
            ServerEvent::ResponseDone { response } => {
                debug!(response_id = ?response.id, status = ?response.status, "Response finished");
                self.client.send(ServerMessage::ResponseDone).await?;
            }
            ServerEvent::ResponseCancelled { response_id } => {
                debug!(?response_id, "Response cancelled");
                self.client.send(ServerMessage::ResponseCancelled).await?;
            }
            ServerEvent::OutputItemAdded { item } => {
                if item.kind.as_deref() == Some("function_call") {
                    if let (Some(call_id), Some(name)) = (&item.call_id, &item.name) {
                        debug!(%call_id, %name, "Function call announced");
                        self.dispatcher.announce(call_id, name);
                    }
                }
            }
            ServerEvent::ContentPartDone { part } => {
                if part.kind.as_deref() == Some("audio") {
                    self.client.send(ServerMessage::AudioDone).await?;
                }
            }
            ServerEvent::TextDelta { delta } => {
                self.close_user_turn().await?;
                self.client
                    .send(ServerMessage::TextResponse { text: delta })
                    .await?;
            }
            ServerEvent::TextDone { .. } => trace!("Text response complete"),
            ServerEvent::AudioTranscriptDelta { delta } => {
                self.close_user_turn().await?;
                self.client
                    .send(ServerMessage::Transcription {
                        text: delta,
                        role: Speaker::Assistant,
                    })
                    .await?;
            }
            ServerEvent::AudioTranscriptDone { transcript } => {
                if !transcript.is_empty() {
                    self.client
                        .send(ServerMessage::TranscriptionComplete {
                            text: transcript,
                            role: Speaker::Assistant,
                        })
                        .await?;
                }
            }
            ServerEvent::AudioDelta { delta } => {
                self.close_user_turn().await?;
                self.client
                    .send(ServerMessage::AudioResponse { audio: delta })
                    .await?;
            }
            ServerEvent::AudioDone => trace!("Audio response complete"),
            ServerEvent::FunctionCallArgumentsDelta { .. } => {}
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                let Some(call) = self.dispatcher.begin(&call_id, name.as_deref(), &arguments)
                else {
                    return Ok(());
                };
                info!(%call_id, name = %call.name, "Function call requested");
                self.client
                    .send(ServerMessage::FunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        call_id,
                    })
                    .await?;
                self.dispatcher.launch(call);
            }
            ServerEvent::RateLimitsUpdated { .. } => trace!("Rate limits updated"),
            ServerEvent::Unknown => debug!("Ignoring unknown upstream event"),
        }
        Ok(())
    }

    /// Relays a finished call: output upstream, then the client notice, then
    /// the call is marked finished.
    async fn complete(&mut self, outcome: CallOutcome) -> Result<(), RelayError> {
        let CallOutcome {
            call_id,
            name,
            result,
        } = outcome;
        info!(%call_id, %name, success = result.is_success(), "Function call finished");

        let upstream = self
            .controller
            .send_function_output(&call_id, result.to_output_string())
            .await;
        let client = self
            .client
            .send(ServerMessage::FunctionResult {
                function: name,
                call_id: call_id.clone(),
                result: result.to_value(),
            })
            .await;
        self.dispatcher.finish(&call_id);
        upstream.and(client)
    }
}
