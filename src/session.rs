//! # Voice Session
//!
//! Coordinates the three resources of a duplex voice conversation: the
//! microphone, the playback scheduler and the transport. `VoiceSession` owns
//! their creation and destruction order and tears all of them down when any
//! one fails.
//!
//! ## Connect sequence:
//! 1. Acquire the microphone stream
//! 2. Initialize playback (and the shared audio graph, if configured)
//! 3. Connect the transport
//! 4. Start microphone capture
//!
//! A cancellation token is checked before and after every step. A step in
//! flight always runs to completion; if the attempt was cancelled meanwhile,
//! whatever it acquired is torn down instead of being promoted to connected.
//!
//! ## Teardown:
//! Always runs every step, in order, and may be repeated safely. Failures of
//! individual steps are reported as errors but never stop the steps after
//! them. Teardowns run one at a time, and only the last one pending writes
//! the final status. `connect()` is refused while any teardown is pending.
//! A session in `Error` stays in `Error` after the automatic teardown until
//! `disconnect_with(true)` or a new `connect()` replaces it.
//!
//! ## Rust Concepts:
//! - **`Arc<SessionInner>` + `Weak`**: background tasks and the microphone
//!   callback hold weak references so they never keep a dropped session alive
//! - **`parking_lot::Mutex`**: coordinator state is locked only for short
//!   synchronous sections and never across an `.await`
//! - **`CancellationToken`**: checked around each connect step
//! - **`tokio::sync::Mutex`**: serializes teardowns across their `.await`s

use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::bands::{self, BAND_COUNT};
use crate::audio::fragment::{decode_fragment, float_to_pcm16, AudioFragment};
use crate::audio::graph::{AudioGraph, AudioHost};
use crate::audio::visualization::{FrameScheduler, VisualizationStore};
use crate::config::ClientConfig;
use crate::error::{AudioError, SessionError};
use crate::microphone::{AudioCallback, MicStream, Microphone};
use crate::playback::{close_graph, PlaybackEvent, PlaybackScheduler};
use crate::router::{DecodeRequest, MessageRouter, RouteOutcome, ToolCallStatus, TranscriptEntry};
use crate::state::{ConnectOutcome, ResourceStatus, ResourceStatuses, SessionEvent, SessionStatus};
use crate::transport::{ConnectOptions, InboundEvent, OutboundMessage, Transport, TransportEvent};

const EVENT_CAPACITY: usize = 256;

/// External collaborators a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub audio_host: Arc<dyn AudioHost>,
    pub microphone: Arc<dyn Microphone>,
    pub transport: Arc<dyn Transport>,
    /// Display-frame source for both visualization stores
    pub frames: Arc<dyn FrameScheduler>,
}

/// Why a connect step did not complete.
enum StepError {
    Cancelled,
    Failed(SessionError),
}

impl From<SessionError> for StepError {
    fn from(error: SessionError) -> Self {
        StepError::Failed(error)
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), StepError> {
    if token.is_cancelled() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run one connect step to completion unless the attempt is already
/// cancelled. A step that finishes after a cancellation reports `Cancelled`
/// and leaves its result to the teardown.
async fn guarded<T, E, F>(token: &CancellationToken, step: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SessionError>,
{
    checkpoint(token)?;
    let result = step.await;
    checkpoint(token)?;
    result.map_err(|e| StepError::Failed(e.into()))
}

struct CoordinatorState {
    status: SessionStatus,
    resources: ResourceStatuses,
    cancel: Option<CancellationToken>,
    connecting: bool,
    /// Teardowns requested but not finished
    pending_teardowns: usize,
    /// Some pending teardown asked to replace `Error`
    clear_error: bool,
    player: Option<Arc<PlaybackScheduler>>,
    shared_graph: Option<Arc<dyn AudioGraph>>,
    tasks: Vec<JoinHandle<()>>,
    assistant_paused: bool,
    volume: f32,
    playback_muted: bool,
    last_error: Option<SessionError>,
}

/// Scratch state for the microphone spectrum.
struct MicTap {
    analyser: SpectrumAnalyser,
    bytes: Vec<u8>,
    bands: [f32; BAND_COUNT],
}

struct SessionInner {
    id: Uuid,
    config: ClientConfig,
    deps: SessionDeps,
    mic_store: VisualizationStore,
    playback_store: VisualizationStore,
    state: Mutex<CoordinatorState>,
    router: Mutex<MessageRouter>,
    mic_tap: Mutex<MicTap>,
    events: broadcast::Sender<SessionEvent>,
    teardown_lock: tokio::sync::Mutex<()>,
}

/// Handle to a voice session. Clones share the same session.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    pub fn new(config: ClientConfig, deps: SessionDeps) -> Self {
        let analyser = SpectrumAnalyser::from_config(&config.visualization);
        let bytes = vec![0u8; analyser.frequency_bin_count()];
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let id = Uuid::new_v4();

        let inner = SessionInner {
            id,
            mic_store: VisualizationStore::new(deps.frames.clone()),
            playback_store: VisualizationStore::new(deps.frames.clone()),
            state: Mutex::new(CoordinatorState {
                status: SessionStatus::Disconnected,
                resources: ResourceStatuses::default(),
                cancel: None,
                connecting: false,
                pending_teardowns: 0,
                clear_error: false,
                player: None,
                shared_graph: None,
                tasks: Vec::new(),
                assistant_paused: false,
                volume: config.playback.volume.clamp(0.0, 1.0),
                playback_muted: false,
                last_error: None,
            }),
            router: Mutex::new(MessageRouter::new(&config.session)),
            mic_tap: Mutex::new(MicTap {
                analyser,
                bytes,
                bands: [0.0; BAND_COUNT],
            }),
            events,
            teardown_lock: tokio::sync::Mutex::new(()),
            config,
            deps,
        };
        debug!("Created voice session {}", id);

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Connect to the server configured in `transport`.
    pub async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        let options = ConnectOptions::from(&self.inner.config.transport);
        self.connect_with(options).await
    }

    /// Bring up microphone, playback and transport.
    ///
    /// Returns `AlreadyActive` without touching anything while another
    /// attempt is in flight, a teardown is pending, or the session is
    /// connected.
    pub async fn connect_with(
        &self,
        options: ConnectOptions,
    ) -> Result<ConnectOutcome, SessionError> {
        let inner = &self.inner;
        let token = {
            let mut state = inner.state.lock();
            if state.connecting
                || state.pending_teardowns > 0
                || state.status == SessionStatus::Connected
            {
                debug!("Connect ignored, session {} is already active", inner.id);
                return Ok(ConnectOutcome::AlreadyActive);
            }
            let token = CancellationToken::new();
            state.connecting = true;
            state.cancel = Some(token.clone());
            state.status = SessionStatus::Connecting;
            state.resources = ResourceStatuses::all(ResourceStatus::Connecting);
            token
        };
        info!("Connecting voice session {} to {}", inner.id, options.url);
        inner.emit(SessionEvent::StatusChanged(SessionStatus::Connecting));

        let result = inner.run_connect(options, &token).await;

        let outcome = match result {
            Ok(()) => {
                let promoted = {
                    let mut state = inner.state.lock();
                    if token.is_cancelled() {
                        false
                    } else {
                        state.status = SessionStatus::Connected;
                        state.resources = ResourceStatuses::all(ResourceStatus::Connected);
                        true
                    }
                };
                if promoted {
                    info!("Voice session {} connected", inner.id);
                    inner.emit(SessionEvent::Connected {
                        session_id: inner.id,
                    });
                    inner.emit(SessionEvent::StatusChanged(SessionStatus::Connected));
                    Ok(ConnectOutcome::Connected)
                } else {
                    inner.finish_cancelled().await
                }
            }
            Err(StepError::Cancelled) => inner.finish_cancelled().await,
            Err(StepError::Failed(e)) => {
                error!("Voice session {} failed to connect: {}", inner.id, e);
                if inner.enter_error(e.clone()) {
                    inner.run_teardown(false).await;
                }
                Err(e)
            }
        };

        inner.state.lock().connecting = false;
        outcome
    }

    /// Tear everything down. An `Error` status survives.
    pub async fn disconnect(&self) {
        self.disconnect_with(false).await
    }

    /// Tear everything down; with `clear_error` an `Error` status is
    /// replaced by `Disconnected` as well.
    pub async fn disconnect_with(&self, clear_error: bool) {
        info!("Disconnecting voice session {}", self.inner.id);
        self.inner.teardown(clear_error).await;
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn resource_status(&self) -> ResourceStatuses {
        self.inner.state.lock().resources
    }

    /// Most recent error, including teardown failures that did not change
    /// the status.
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn mute_microphone(&self) {
        self.inner.deps.microphone.mute();
    }

    pub fn unmute_microphone(&self) {
        self.inner.deps.microphone.unmute();
    }

    pub fn is_microphone_muted(&self) -> bool {
        self.inner.deps.microphone.is_muted()
    }

    pub fn mute_playback(&self) {
        let player = {
            let mut state = self.inner.state.lock();
            state.playback_muted = true;
            state.player.clone()
        };
        if let Some(player) = player {
            player.mute();
        }
    }

    pub fn unmute_playback(&self) {
        let player = {
            let mut state = self.inner.state.lock();
            state.playback_muted = false;
            state.player.clone()
        };
        if let Some(player) = player {
            player.unmute();
        }
    }

    pub fn is_playback_muted(&self) -> bool {
        self.inner.state.lock().playback_muted
    }

    /// Output volume, clamped to 0.0..=1.0. Remembered across reconnects.
    pub fn set_volume(&self, level: f32) {
        let player = {
            let mut state = self.inner.state.lock();
            state.volume = level.clamp(0.0, 1.0);
            state.player.clone()
        };
        if let Some(player) = player {
            player.set_volume(level);
        }
    }

    pub fn volume(&self) -> f32 {
        self.inner.state.lock().volume
    }

    /// Ask the server to hold assistant responses.
    pub fn pause_assistant(&self) -> Result<(), SessionError> {
        self.inner
            .deps
            .transport
            .send_message(&OutboundMessage::PauseAssistantMessage)?;
        self.inner.state.lock().assistant_paused = true;
        Ok(())
    }

    pub fn resume_assistant(&self) -> Result<(), SessionError> {
        self.inner
            .deps
            .transport
            .send_message(&OutboundMessage::ResumeAssistantMessage)?;
        self.inner.state.lock().assistant_paused = false;
        Ok(())
    }

    pub fn is_assistant_paused(&self) -> bool {
        self.inner.state.lock().assistant_paused
    }

    /// Send typed text as a user turn.
    pub fn send_user_input(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.inner
            .deps
            .transport
            .send_message(&OutboundMessage::UserInput { text: text.into() })?;
        Ok(())
    }

    pub fn send_tool_response(
        &self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.inner
            .deps
            .transport
            .send_message(&OutboundMessage::ToolResponse {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
            })?;
        Ok(())
    }

    pub fn send_tool_error(
        &self,
        tool_call_id: impl Into<String>,
        error: impl Into<String>,
        content: Option<String>,
    ) -> Result<(), SessionError> {
        self.inner
            .deps
            .transport
            .send_message(&OutboundMessage::ToolError {
                tool_call_id: tool_call_id.into(),
                error: error.into(),
                content,
            })?;
        Ok(())
    }

    /// Transcript so far.
    pub fn messages(&self) -> Vec<TranscriptEntry> {
        self.inner.router.lock().history().to_vec()
    }

    pub fn tool_status(&self, call_id: &str) -> Option<ToolCallStatus> {
        self.inner.router.lock().tool_status(call_id).cloned()
    }

    pub fn chat_id(&self) -> Option<String> {
        self.inner.router.lock().chat_id().map(str::to_string)
    }

    pub fn microphone_visualization(&self) -> &VisualizationStore {
        &self.inner.mic_store
    }

    pub fn playback_visualization(&self) -> &VisualizationStore {
        &self.inner.playback_store
    }

    /// Fragments queued for playback, including the one playing.
    pub fn queue_length(&self) -> usize {
        self.inner
            .player()
            .map(|player| player.queue_length())
            .unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.inner
            .player()
            .map(|player| player.is_playing())
            .unwrap_or(false)
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn player(&self) -> Option<Arc<PlaybackScheduler>> {
        self.state.lock().player.clone()
    }

    async fn run_connect(
        self: &Arc<Self>,
        options: ConnectOptions,
        token: &CancellationToken,
    ) -> Result<(), StepError> {
        let stream = guarded(
            token,
            self.deps
                .microphone
                .acquire(self.config.microphone.device_id.clone()),
        )
        .await?;
        debug!(
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            "Microphone acquired"
        );

        checkpoint(token)?;
        self.start_playback()?;

        checkpoint(token)?;
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        guarded(token, self.deps.transport.connect(options, transport_tx)).await?;
        let pump = tokio::spawn(run_transport_pump(Arc::downgrade(self), transport_rx));
        {
            let mut state = self.state.lock();
            state.tasks.push(pump);
            state.resources.transport = ResourceStatus::Connected;
        }

        checkpoint(token)?;
        self.start_microphone(&stream)?;
        Ok(())
    }

    fn start_playback(self: &Arc<Self>) -> Result<(), SessionError> {
        let shared_graph = if self.config.playback.share_audio_clock {
            let graph = self.deps.audio_host.create_graph()?;
            self.state.lock().shared_graph = Some(graph.clone());
            Some(graph)
        } else {
            None
        };

        let (player, playback_events) = PlaybackScheduler::new(
            self.config.playback.clone(),
            self.playback_store.clone(),
            self.config.visualization.frame_interval(),
        );
        {
            let state = self.state.lock();
            player.set_volume(state.volume);
            if state.playback_muted {
                player.mute();
            }
        }
        player.initialize(self.deps.audio_host.as_ref(), shared_graph)?;

        let pump = tokio::spawn(run_playback_pump(Arc::downgrade(self), playback_events));
        let mut state = self.state.lock();
        state.player = Some(Arc::new(player));
        state.tasks.push(pump);
        state.resources.playback = ResourceStatus::Connected;
        Ok(())
    }

    fn start_microphone(self: &Arc<Self>, stream: &MicStream) -> Result<(), SessionError> {
        let weak = Arc::downgrade(self);
        let sample_rate = stream.sample_rate as f32;
        let on_audio: AudioCallback = Arc::new(move |samples: &[f32]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_microphone_audio(samples, sample_rate);
            }
        });
        self.deps.microphone.start(stream, on_audio)?;
        self.state.lock().resources.microphone = ResourceStatus::Connected;
        Ok(())
    }

    fn on_microphone_audio(self: &Arc<Self>, samples: &[f32], sample_rate: f32) {
        {
            let mut tap = self.mic_tap.lock();
            let tap = &mut *tap;
            tap.analyser.push_samples(samples);
            tap.analyser.byte_frequency_data(&mut tap.bytes);
            bands::reduce_into(&tap.bytes, sample_rate, &mut tap.bands);
            self.mic_store.write(&tap.bands);
        }

        let transport_up = self.state.lock().resources.transport == ResourceStatus::Connected;
        // A closed socket is reported by the transport itself
        if !transport_up || !self.deps.transport.is_open() {
            return;
        }
        if let Err(e) = self.deps.transport.send(float_to_pcm16(samples)) {
            self.fail(e.into());
        }
    }

    fn handle_inbound(self: &Arc<Self>, message: InboundEvent) {
        {
            let state = self.state.lock();
            if state.resources.any_down() || state.status.is_error() {
                debug!("Dropping {} message, session is not running", message.kind());
                return;
            }
        }

        let player = self.player();
        let outcome = {
            let mut router = self.router.lock();
            let outcome = router.route(&message);
            if outcome == RouteOutcome::Interrupt {
                // Stop under the router lock so no fresh fragment slips in between
                if let Some(player) = &player {
                    player.stop();
                }
            }
            outcome
        };

        match outcome {
            RouteOutcome::Decode(request) => self.spawn_decode(request),
            RouteOutcome::Interrupt => debug!("Playback interrupted"),
            RouteOutcome::RemoteError(e) => self.fail(e.into()),
            RouteOutcome::Handled => {}
        }
        self.emit(SessionEvent::Message(message));
    }

    fn spawn_decode(self: &Arc<Self>, request: DecodeRequest) {
        let Some(target_rate) = self.player().and_then(|player| player.sample_rate()) else {
            debug!("Dropping audio fragment, playback is not initialized");
            return;
        };
        let raw_pcm_rate = self.config.playback.source_sample_rate;
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let DecodeRequest {
                utterance_id,
                fragment_index,
                payload,
                epoch,
            } = request;
            let decoded = tokio::task::spawn_blocking(move || {
                decode_fragment(
                    &utterance_id,
                    fragment_index,
                    &payload,
                    raw_pcm_rate,
                    target_rate,
                )
            })
            .await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            match decoded {
                Ok(Ok(fragment)) => inner.on_decoded(fragment, epoch),
                Ok(Err(e)) => inner.report_fragment_error(e),
                Err(e) => error!("Audio decode task failed: {}", e),
            }
        });
    }

    fn on_decoded(&self, fragment: AudioFragment, epoch: u64) {
        let Some(player) = self.player() else {
            return;
        };
        let mut router = self.router.lock();
        for fragment in router.register_decoded(fragment, epoch) {
            if let Err(e) = player.enqueue(fragment) {
                self.report_fragment_error(e);
            }
        }
    }

    fn report_fragment_error(&self, error: AudioError) {
        warn!("Skipping audio fragment: {}", error);
        self.emit(SessionEvent::Error(error.into()));
    }

    fn on_playback_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { utterance_id } => {
                let released = self.router.lock().on_playback_started(&utterance_id);
                debug!(
                    utterance_id = %utterance_id,
                    messages = released.len(),
                    "Utterance started playing"
                );
                self.emit(SessionEvent::AudioStarted { utterance_id });
            }
            PlaybackEvent::Stopped => self.emit(SessionEvent::AudioStopped),
            PlaybackEvent::QueueLength(length) => self.emit(SessionEvent::QueueLength(length)),
            PlaybackEvent::Error(e) => self.report_fragment_error(e),
        }
    }

    /// Move to `Error` unless already there. Returns true if this call made
    /// the transition; the teardown is then already pending and the caller
    /// must run it.
    fn enter_error(&self, error: SessionError) -> bool {
        let entered = {
            let mut state = self.state.lock();
            state.last_error = Some(error.clone());
            if state.status.is_error() || error.is_closure_failure() {
                false
            } else {
                state.status = SessionStatus::Error(error.clone());
                mark_teardown(&mut state, false);
                true
            }
        };

        self.emit(SessionEvent::Error(error.clone()));
        if entered {
            self.emit(SessionEvent::StatusChanged(SessionStatus::Error(error)));
        }
        entered
    }

    /// Surface an error observed by a background task.
    fn fail(self: &Arc<Self>, error: SessionError) {
        error!(
            category = error.category(),
            kind = error.kind(),
            "Voice session {} error: {}",
            self.id,
            error
        );
        if self.enter_error(error) {
            self.spawn_teardown(false);
        }
    }

    /// Report a teardown step failure without changing the status.
    fn report_closure(&self, error: SessionError) {
        error!("Teardown step failed for session {}: {}", self.id, error);
        self.state.lock().last_error = Some(error.clone());
        self.emit(SessionEvent::Error(error));
    }

    /// Run an already marked teardown in the background.
    fn spawn_teardown(self: &Arc<Self>, clear_error: bool) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_teardown(clear_error).await;
        });
    }

    async fn finish_cancelled(self: &Arc<Self>) -> Result<ConnectOutcome, SessionError> {
        info!("Connect of voice session {} was cancelled", self.id);
        self.teardown(false).await;
        match self.state.lock().status.clone() {
            SessionStatus::Error(e) => Err(e),
            _ => Ok(ConnectOutcome::Cancelled),
        }
    }

    async fn teardown(self: &Arc<Self>, clear_error: bool) {
        mark_teardown(&mut self.state.lock(), clear_error);
        self.run_teardown(clear_error).await;
    }

    /// Release everything. Each call must follow exactly one `mark_teardown`.
    async fn run_teardown(self: &Arc<Self>, clear_error: bool) {
        let _serial = self.teardown_lock.lock().await;
        let (player, shared_graph, tasks) = {
            let mut state = self.state.lock();
            (
                state.player.take(),
                state.shared_graph.take(),
                std::mem::take(&mut state.tasks),
            )
        };
        debug!(clear_error, "Tearing down voice session {}", self.id);

        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.deps.microphone.stop().await {
            self.report_closure(e.into());
        }
        self.deps.transport.disconnect().await;

        if let Some(player) = player {
            if let Err(e) = player.stop_and_teardown().await {
                self.report_closure(e.into());
            }
        }
        if let Some(graph) = shared_graph {
            let playback = &self.config.playback;
            if let Err(e) = close_graph(
                graph.as_ref(),
                playback.close_attempts,
                playback.close_retry_delay(),
            )
            .await
            {
                self.report_closure(e.into());
            }
        }

        {
            let mut router = self.router.lock();
            router.interrupt();
            if self.config.session.clear_messages_on_disconnect {
                router.clear_history();
            }
        }
        self.mic_tap.lock().analyser.reset();
        self.mic_store.clear();
        self.playback_store.clear();

        let (last, status_change) = {
            let mut state = self.state.lock();
            state.pending_teardowns = state.pending_teardowns.saturating_sub(1);
            if state.pending_teardowns > 0 {
                (false, None)
            } else {
                state.assistant_paused = false;
                state.resources = ResourceStatuses::all(ResourceStatus::Disconnected);
                let clear_error = std::mem::take(&mut state.clear_error);
                let keep = state.status.is_error() && !clear_error;
                if !keep && state.status != SessionStatus::Disconnected {
                    state.status = SessionStatus::Disconnected;
                    (true, Some(SessionStatus::Disconnected))
                } else {
                    (true, None)
                }
            }
        };

        if !last {
            debug!("Voice session {} has another teardown pending", self.id);
            return;
        }
        if let Some(status) = status_change {
            self.emit(SessionEvent::StatusChanged(status));
        }
        info!("Voice session {} disconnected", self.id);
        self.emit(SessionEvent::Disconnected);
    }
}

/// Count a teardown as pending and stop the running connect attempt.
fn mark_teardown(state: &mut CoordinatorState, clear_error: bool) {
    state.pending_teardowns += 1;
    state.clear_error |= clear_error;
    state.resources.begin_disconnect();
    if let Some(token) = state.cancel.take() {
        token.cancel();
    }
}

async fn run_transport_pump(
    session: Weak<SessionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(message) => inner.handle_inbound(message),
            TransportEvent::Error(e) => inner.fail(e.into()),
            TransportEvent::Closed { code, reason } => {
                info!("Server closed session {}: {} {}", inner.id, code, reason);
                inner.emit(SessionEvent::TransportClosed { code, reason });
                mark_teardown(&mut inner.state.lock(), false);
                inner.spawn_teardown(false);
                break;
            }
        }
    }
}

async fn run_playback_pump(
    session: Weak<SessionInner>,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.on_playback_event(event);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
        let player = state.player.take();
        let shared_graph = state.shared_graph.take();
        if player.is_none()
            && shared_graph.is_none()
            && state.resources == ResourceStatuses::default()
        {
            return;
        }

        let microphone = self.deps.microphone.clone();
        let transport = self.deps.transport.clone();
        let close_attempts = self.config.playback.close_attempts;
        let close_retry_delay = self.config.playback.close_retry_delay();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Voice session {} dropped while active, tearing down", self.id);
                handle.spawn(async move {
                    let _ = microphone.stop().await;
                    transport.disconnect().await;
                    if let Some(player) = player {
                        let _ = player.stop_and_teardown().await;
                    }
                    if let Some(graph) = shared_graph {
                        let _ = close_graph(graph.as_ref(), close_attempts, close_retry_delay).await;
                    }
                });
            }
            Err(_) => warn!(
                "Voice session {} dropped outside a runtime, skipping teardown",
                self.id
            ),
        }
    }
}
