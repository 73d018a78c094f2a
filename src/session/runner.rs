//! Session manager: one actor task owning a whole tutoring call.
//!
//! [`SessionManager`] owns every resource of the call (microphone lease,
//! playback scheduler, remote session, uplink queue, meter task) and reads
//! a single inbox. Commands from a [`SessionHandle`], device callbacks,
//! remote events and timers are all posted there, so session state is only
//! ever touched from one task.
//!
//! # Generations
//!
//! Every connect attempt and every teardown bumps `generation`. Callbacks,
//! timers and remote events are tagged with the generation that created
//! them; anything tagged with an older one is dropped. That is what makes
//! `disconnect` safe in the middle of any in-flight operation.
//!
//! # Flow
//!
//! ```text
//! connect ─▶ Connecting ─▶ acquire mic ─▶ open output ─▶ spawn remote open
//!                                                           │
//!            Opened(gen, Ok) ◀──────────────────────────────┘
//!              └─▶ Connected ─▶ start uplink + meter ─▶ (500 ms) ─▶ attach mic
//!
//! Frame ─▶ resample 16 kHz ─▶ ChunkAccumulator ─▶ encode ─▶ UplinkQueue
//! Remote message ─▶ transcript │ tool calls + acks │ audio ─▶ playback │ interrupt
//! Remote error ─▶ FaultClassifier ─▶ ignore │ recover (once) │ fail
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{
    decode_base64_pcm16, encode_envelope, resample, spawn_meter, AudioFrame, AudioOutput,
    ChunkAccumulator, MicLease, Microphone, PlaybackScheduler, VoiceEndedCallback, VoiceId,
};
use crate::config::AppConfig;
use crate::remote::tools::{PROVIDE_PRONUNCIATION_FEEDBACK, UPDATE_SUBTITLES};
use crate::remote::{
    tools, FunctionCall, FunctionResponse, InstructionBuilder, RemoteConnector, RemoteError,
    RemoteEvent, RemoteEventSink, RemoteSession, ServerMessage, SessionSetup,
};

use super::fault::{FaultClass, FaultClassifier};
use super::state::{ConnectionState, Phase, PronunciationFeedback, SessionEvent, Subtitle};
use super::uplink::{UplinkAction, UplinkQueue};

/// Reported when a second recoverable fault exhausts the retry budget.
pub const SESSION_INTERRUPTED: &str = "Session interrupted. Please restart the conversation.";

/// Advisory sent before a silent reconnect.
pub const RECONNECTING: &str = "The connection to the tutor was interrupted. Reconnecting…";

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Lesson {
    scenario: Option<String>,
    speaking_rate: f32,
}

enum Command {
    Connect(Lesson),
    Disconnect,
    Shutdown,
}

enum Input {
    Command(Command),
    Opened {
        gen: u64,
        result: Result<Arc<dyn RemoteSession>, RemoteError>,
    },
    Remote {
        gen: u64,
        event: RemoteEvent,
    },
    CaptureSettled {
        gen: u64,
    },
    Frame {
        gen: u64,
        frame: AudioFrame,
    },
    VoiceEnded {
        gen: u64,
        id: VoiceId,
    },
    Volume {
        gen: u64,
        level: f32,
    },
    Reconnect {
        gen: u64,
    },
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable control surface of a running [`SessionManager`].
///
/// Every method returns `false` once the manager has stopped.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl SessionHandle {
    /// Start a call. Ignored while one is already connecting or connected.
    pub fn connect(&self, scenario: Option<&str>, speaking_rate: f32) -> bool {
        self.send(Command::Connect(Lesson {
            scenario: scenario.map(str::to_string),
            speaking_rate,
        }))
    }

    /// End the call. Safe in any phase, any number of times.
    pub fn disconnect(&self) -> bool {
        self.send(Command::Disconnect)
    }

    /// Disconnect and stop the manager task.
    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> bool {
        self.tx.send(Input::Command(command)).is_ok()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    config: AppConfig,
    mic: Arc<dyn Microphone>,
    output: Arc<dyn AudioOutput>,
    connector: Arc<dyn RemoteConnector>,
    classifier: FaultClassifier,

    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox: mpsc::UnboundedReceiver<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,

    phase: Phase,
    reported: ConnectionState,
    generation: u64,
    retries: u32,
    lesson: Lesson,
    transcript: String,
    accumulator: ChunkAccumulator,

    lease: Option<Box<dyn MicLease>>,
    playback: Option<PlaybackScheduler>,
    remote: Option<Arc<dyn RemoteSession>>,
    uplink: Option<UplinkQueue>,
    pending_open: Option<JoinHandle<()>>,
    meter: Option<JoinHandle<()>>,
    stopped: bool,
}

impl SessionManager {
    /// Build a manager plus its control handle and event stream. Nothing
    /// happens until [`run`](Self::run) is polled.
    pub fn new(
        config: AppConfig,
        mic: Arc<dyn Microphone>,
        output: Arc<dyn AudioOutput>,
        connector: Arc<dyn RemoteConnector>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            tx: inbox_tx.clone(),
        };

        let manager = Self {
            classifier: FaultClassifier::from_config(&config.recovery),
            accumulator: ChunkAccumulator::new(config.audio.uplink_chunk_samples.max(1)),
            lesson: Lesson {
                scenario: config.tutor.scenario.clone(),
                speaking_rate: config.tutor.speaking_rate,
            },
            config,
            mic,
            output,
            connector,
            inbox_tx,
            inbox,
            events,
            phase: Phase::Disconnected,
            reported: ConnectionState::Disconnected,
            generation: 0,
            retries: 0,
            transcript: String::new(),
            lease: None,
            playback: None,
            remote: None,
            uplink: None,
            pending_open: None,
            meter: None,
            stopped: false,
        };

        (manager, handle, events_rx)
    }

    /// Process the inbox until [`SessionHandle::shutdown`].
    pub async fn run(mut self) {
        log::debug!("session: manager running");
        while let Some(input) = self.inbox.recv().await {
            self.handle(input).await;
            if self.stopped {
                break;
            }
        }
        self.teardown();
        log::info!("session: manager stopped");
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(Command::Connect(lesson)) => self.connect(lesson, true).await,
            Input::Command(Command::Disconnect) => self.disconnect(),
            Input::Command(Command::Shutdown) => {
                self.disconnect();
                self.stopped = true;
            }
            Input::Opened { gen, result } => self.on_opened(gen, result),
            Input::Remote { gen, event } => self.on_remote(gen, event),
            Input::CaptureSettled { gen } => self.on_capture_settled(gen),
            Input::Frame { gen, frame } => self.on_frame(gen, frame),
            Input::VoiceEnded { gen, id } => {
                if gen == self.generation {
                    if let Some(playback) = self.playback.as_mut() {
                        playback.on_voice_ended(id);
                    }
                }
            }
            Input::Volume { gen, level } => {
                if gen == self.generation && self.phase == Phase::Connected {
                    self.emit(SessionEvent::Volume(level));
                }
            }
            Input::Reconnect { gen } => {
                if gen == self.generation && matches!(self.phase, Phase::Recovering { .. }) {
                    let lesson = self.lesson.clone();
                    self.connect(lesson, false).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `user` is false for the reconnect issued by recovery, which keeps the
    /// retry count.
    async fn connect(&mut self, lesson: Lesson, user: bool) {
        match self.phase {
            Phase::Connecting | Phase::Connected => {
                log::debug!("session: connect ignored, already {}", self.reported);
                return;
            }
            Phase::Recovering { .. } if user => {
                log::debug!("session: connect ignored, reconnect pending");
                return;
            }
            _ => {}
        }

        if user {
            self.retries = 0;
        }
        self.lesson = lesson;
        self.generation += 1;
        let gen = self.generation;
        self.set_phase(Phase::Connecting);
        log::info!(
            "session: connecting (rate {}, scenario: {})",
            self.lesson.speaking_rate,
            self.lesson.scenario.as_deref().unwrap_or("free conversation")
        );

        match self.mic.acquire().await {
            Ok(lease) => self.lease = Some(lease),
            Err(e) => {
                log::error!("session: microphone unavailable: {e}");
                self.fail(e.user_message());
                return;
            }
        }

        let tx = self.inbox_tx.clone();
        let on_ended: VoiceEndedCallback = Arc::new(move |id| {
            let _ = tx.send(Input::VoiceEnded { gen, id });
        });
        match self
            .output
            .open(self.config.audio.output_sample_rate, on_ended)
            .await
        {
            Ok(sink) => self.playback = Some(PlaybackScheduler::new(sink)),
            Err(e) => {
                self.fail(format!("Could not open audio output: {e}"));
                return;
            }
        }

        let setup = SessionSetup {
            model: self.config.remote.model.clone(),
            voice: self.config.remote.voice.clone(),
            system_instruction: InstructionBuilder::new(self.lesson.speaking_rate)
                .scenario(self.lesson.scenario.as_deref())
                .build(),
            tools: tools::declarations(),
        };

        let tx = self.inbox_tx.clone();
        let events = RemoteEventSink::new(move |event| {
            let _ = tx.send(Input::Remote { gen, event });
        });

        let connector = Arc::clone(&self.connector);
        let tx = self.inbox_tx.clone();
        self.pending_open = Some(tokio::spawn(async move {
            let result = connector.open(setup, events).await;
            let _ = tx.send(Input::Opened { gen, result });
        }));
    }

    fn on_opened(&mut self, gen: u64, result: Result<Arc<dyn RemoteSession>, RemoteError>) {
        if gen != self.generation || self.phase != Phase::Connecting {
            if let Ok(stale) = result {
                log::debug!("session: closing stale remote session");
                close_in_background(stale);
            }
            return;
        }
        self.pending_open = None;

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.fail(format!("Could not connect to the tutor: {e}"));
                return;
            }
        };

        self.uplink = Some(UplinkQueue::start(Arc::clone(&session)));
        self.remote = Some(session);
        self.set_phase(Phase::Connected);
        log::info!("session: connected");

        self.post_after(
            Duration::from_millis(self.config.audio.capture_settle_ms),
            Input::CaptureSettled { gen },
        );
        self.start_meter(gen);
    }

    fn start_meter(&mut self, gen: u64) {
        let Some(playback) = self.playback.as_ref() else {
            return;
        };
        let tx = self.inbox_tx.clone();
        self.meter = Some(spawn_meter(
            playback.tap(),
            Duration::from_millis(self.config.audio.meter_interval_ms.max(1)),
            move |level| tx.send(Input::Volume { gen, level }).is_ok(),
        ));
    }

    fn on_capture_settled(&mut self, gen: u64) {
        if gen != self.generation || self.phase != Phase::Connected {
            return;
        }
        let Some(lease) = self.lease.as_mut() else {
            return;
        };
        let tx = self.inbox_tx.clone();
        lease.start(Box::new(move |frame| {
            let _ = tx.send(Input::Frame { gen, frame });
        }));
        log::info!("session: capture started ({} Hz)", lease.sample_rate());
    }

    /// Tear down and report `DISCONNECTED`, keeping an `ERROR` state.
    fn disconnect(&mut self) {
        self.teardown();
        if !self.phase.is_error() {
            self.set_phase(Phase::Disconnected);
        }
    }

    /// Report one fatal error and tear down. Later fatal errors are dropped
    /// until the next `connect`.
    fn fail(&mut self, message: String) {
        if self.phase.is_error() {
            log::debug!("session: suppressed second fatal error: {message}");
            return;
        }
        log::error!("session: {message}");
        self.set_phase(Phase::Error {
            message: message.clone(),
        });
        self.emit(SessionEvent::Error {
            message,
            fatal: true,
        });
        self.teardown();
    }

    fn recover(&mut self, reason: &str) {
        if self.retries >= self.config.recovery.max_retries {
            log::error!("session: retry budget spent ({reason})");
            self.fail(SESSION_INTERRUPTED.to_string());
            return;
        }
        self.retries += 1;
        log::warn!(
            "session: recoverable fault ({reason}), reconnect attempt {}",
            self.retries
        );

        self.teardown();
        self.set_phase(Phase::Recovering {
            attempt: self.retries,
        });
        self.emit(SessionEvent::Error {
            message: RECONNECTING.to_string(),
            fatal: false,
        });
        self.post_after(
            Duration::from_millis(self.config.recovery.reconnect_delay_ms),
            Input::Reconnect {
                gen: self.generation,
            },
        );
    }

    /// Release everything in a fixed order. Every step tolerates the
    /// resource being absent or already released.
    fn teardown(&mut self) {
        self.generation += 1;

        if let Some(task) = self.pending_open.take() {
            task.abort();
        }
        if let Some(mut lease) = self.lease.take() {
            lease.stop();
            lease.release();
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.stop_all();
        }
        if let Some(remote) = self.remote.take() {
            close_in_background(remote);
        }
        if let Some(meter) = self.meter.take() {
            meter.abort();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        self.transcript.clear();
        self.accumulator.clear();
        if let Some(mut uplink) = self.uplink.take() {
            uplink.close();
        }
    }

    // -----------------------------------------------------------------------
    // Uplink
    // -----------------------------------------------------------------------

    fn on_frame(&mut self, gen: u64, frame: AudioFrame) {
        if gen != self.generation || self.phase != Phase::Connected {
            return;
        }
        let rate = self.config.audio.input_sample_rate;
        self.accumulator
            .push(&resample(&frame.samples, frame.sample_rate, rate));

        if let Some(chunk) = self.accumulator.take_chunk() {
            if let Some(uplink) = self.uplink.as_ref() {
                uplink.enqueue(UplinkAction::Audio(encode_envelope(&chunk, rate)));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remote events
    // -----------------------------------------------------------------------

    fn on_remote(&mut self, gen: u64, event: RemoteEvent) {
        if gen != self.generation {
            log::debug!("session: dropping event from an earlier connection");
            return;
        }
        match event {
            RemoteEvent::Message(msg) => {
                if self.phase == Phase::Connected {
                    self.dispatch(msg);
                }
            }
            RemoteEvent::Closed(reason) => {
                log::info!(
                    "session: remote closed ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.disconnect();
            }
            RemoteEvent::Error(message) => {
                if !self.phase.is_active() {
                    return;
                }
                match self.classifier.classify(&message) {
                    FaultClass::Transient => {
                        log::warn!("session: transient network error ignored: {message}")
                    }
                    FaultClass::Recoverable => self.recover(&message),
                    FaultClass::Fatal => self.fail(format!("Connection error: {message}")),
                }
            }
        }
    }

    fn dispatch(&mut self, msg: ServerMessage) {
        if let Some(fragment) = msg.transcription_fragment() {
            self.transcript.push_str(fragment);
        }
        if msg.turn_complete() {
            let text = self.transcript.trim();
            if !text.is_empty() {
                let text = text.to_string();
                self.emit(SessionEvent::UserTranscript(text));
            }
            self.transcript.clear();
        }

        for call in msg.function_calls() {
            self.handle_tool_call(call);
        }

        for payload in msg.audio_payloads() {
            let samples = match decode_base64_pcm16(payload) {
                Ok(samples) => samples,
                Err(e) => {
                    log::warn!("session: skipping undecodable audio chunk: {e}");
                    continue;
                }
            };
            if let Some(playback) = self.playback.as_mut() {
                if let Err(e) = playback.enqueue(samples) {
                    log::warn!("session: could not schedule audio chunk: {e}");
                }
            }
        }

        if msg.interrupted() {
            log::debug!("session: interrupted, dropping queued playback");
            if let Some(playback) = self.playback.as_mut() {
                playback.interrupt();
            }
            self.transcript.clear();
            self.accumulator.clear();
        }
    }

    fn handle_tool_call(&mut self, call: &FunctionCall) {
        match call.name.as_str() {
            UPDATE_SUBTITLES => match Subtitle::from_args(&call.args) {
                Ok(subtitle) => self.emit(SessionEvent::Subtitle(subtitle)),
                Err(e) => log::warn!("session: bad {UPDATE_SUBTITLES} arguments: {e}"),
            },
            PROVIDE_PRONUNCIATION_FEEDBACK => match PronunciationFeedback::from_args(&call.args) {
                Ok(feedback) => self.emit(SessionEvent::PronunciationFeedback(feedback)),
                Err(e) => log::warn!("session: bad {PROVIDE_PRONUNCIATION_FEEDBACK} arguments: {e}"),
            },
            other => log::debug!("session: acknowledging unknown tool {other:?}"),
        }

        if let Some(uplink) = self.uplink.as_ref() {
            uplink.enqueue(UplinkAction::ToolResponse(FunctionResponse::ok(call)));
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Change phase, reporting only changes of the external state.
    fn set_phase(&mut self, phase: Phase) {
        let external = phase.external();
        self.phase = phase;
        if external != self.reported {
            self.reported = external;
            log::debug!("session: state → {external}");
            self.emit(SessionEvent::StateChanged(external));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn post_after(&self, delay: Duration, input: Input) {
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(input);
        });
    }
}

fn close_in_background(session: Arc<dyn RemoteSession>) {
    tokio::spawn(async move {
        if let Err(e) = session.close().await {
            log::debug!("session: ignoring close failure: {e}");
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockMicrophone, MockOutput};
    use crate::remote::{MockConnector, Sent};
    use serde_json::json;

    struct Rig {
        manager: SessionManager,
        handle: SessionHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        mic: Arc<MockMicrophone>,
        output: Arc<MockOutput>,
        connector: Arc<MockConnector>,
    }

    fn rig_with_mic_rate(rate: u32) -> Rig {
        let mic = MockMicrophone::new(rate);
        let output = MockOutput::new();
        let connector = MockConnector::new();
        let (manager, handle, events) = SessionManager::new(
            AppConfig::default(),
            mic.clone(),
            output.clone(),
            connector.clone(),
        );
        Rig {
            manager,
            handle,
            events,
            mic,
            output,
            connector,
        }
    }

    fn rig() -> Rig {
        rig_with_mic_rate(16_000)
    }

    impl Rig {
        /// Let spawned tasks run and feed everything they posted to the
        /// manager.
        async fn settle(&mut self) {
            for _ in 0..20 {
                tokio::task::yield_now().await;
                while let Ok(input) = self.manager.inbox.try_recv() {
                    self.manager.handle(input).await;
                }
            }
        }

        async fn advance(&mut self, ms: u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.settle().await;
        }

        /// Connected with capture attached.
        async fn connected(&mut self) {
            self.handle.connect(None, 1.0);
            self.settle().await;
            self.advance(500).await;
            assert_eq!(self.manager.phase, Phase::Connected);
            assert!(self.mic.has_callback());
        }

        /// Events since the last call, without volume ticks.
        fn events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if !matches!(event, SessionEvent::Volume(_)) {
                    out.push(event);
                }
            }
            out
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SessionEvent::StateChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }

        fn message(&self, value: serde_json::Value) {
            let msg: ServerMessage = serde_json::from_value(value).unwrap();
            self.connector.emit(RemoteEvent::Message(msg));
        }

        fn assert_torn_down(&self) {
            assert!(!self.mic.is_live());
            assert!(self.output.playing().is_empty());
            assert!(self.manager.uplink.is_none());
            assert!(self.manager.remote.is_none());
            assert!(self.manager.playback.is_none());
            assert!(self.manager.meter.is_none());
        }
    }

    fn fatal_errors(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Error {
                    message,
                    fatal: true,
                } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Base64 of `n` PCM16 samples of silence.
    fn silence_b64(n: usize) -> String {
        crate::audio::encode_envelope(&vec![0.0; n], 24_000).data
    }

    // ---- Scenario A -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_connected_and_captures_after_settle() {
        let mut rig = rig();
        rig.handle.connect(None, 1.0);
        rig.settle().await;

        assert_eq!(
            rig.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(rig.connector.open_count(), 1);
        assert!(rig.mic.is_live());
        assert!(!rig.mic.has_callback());

        rig.advance(499).await;
        assert!(!rig.mic.has_callback());
        rig.advance(1).await;
        assert!(rig.mic.has_callback());

        let setup = &rig.connector.setups()[0];
        assert!(setup.system_instruction.contains("free conversation"));
        assert!(!setup.system_instruction.contains("Speak slowly"));
        assert_eq!(setup.tools.len(), 2);
    }

    // ---- Scenario B -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn denied_microphone_is_fatal_with_permission_message() {
        let mut rig = rig();
        rig.mic.deny_permission();
        rig.handle.connect(None, 1.0);
        rig.settle().await;

        let events = rig.events();
        assert_eq!(
            events[..2],
            [
                SessionEvent::StateChanged(ConnectionState::Connecting),
                SessionEvent::StateChanged(ConnectionState::Error),
            ]
        );
        let fatal = fatal_errors(&events);
        assert_eq!(fatal.len(), 1);
        assert!(fatal[0].contains("permission"));
        assert_eq!(rig.connector.open_count(), 0);
        rig.assert_torn_down();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_microphone_says_so() {
        let mut rig = rig();
        rig.mic.unplug();
        rig.handle.connect(None, 1.0);
        rig.settle().await;

        let fatal = fatal_errors(&rig.events());
        assert_eq!(fatal.len(), 1);
        assert!(fatal[0].contains("No microphone"));
    }

    #[tokio::test(start_paused = true)]
    async fn output_failure_is_fatal_and_releases_mic() {
        let mut rig = rig();
        rig.output.fail_opens();
        rig.handle.connect(None, 1.0);
        rig.settle().await;

        assert_eq!(rig.manager.phase.external(), ConnectionState::Error);
        assert_eq!(fatal_errors(&rig.events()).len(), 1);
        assert!(!rig.mic.is_live());
        assert_eq!(rig.connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_fatal() {
        let mut rig = rig();
        rig.connector.fail_opens("handshake refused");
        rig.handle.connect(None, 1.0);
        rig.settle().await;

        let events = rig.events();
        let fatal = fatal_errors(&events);
        assert_eq!(fatal.len(), 1);
        assert!(fatal[0].contains("handshake refused"));
        rig.assert_torn_down();
    }

    // ---- Scenario C -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn subtitle_tool_call_is_delivered_and_acknowledged() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.message(json!({"toolCall": {"functionCalls": [{
            "id": "1", "name": "update_subtitles",
            "args": {"hanzi": "你好", "pinyin": "nǐ hǎo", "english": "hello"}
        }]}}));
        rig.settle().await;

        assert_eq!(
            rig.events(),
            vec![SessionEvent::Subtitle(Subtitle {
                hanzi: "你好".into(),
                pinyin: "nǐ hǎo".into(),
                english: "hello".into(),
            })]
        );
        let sent = rig.connector.last_session().sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Sent::Tool(r) if r.id == "1" && r.name == "update_subtitles" && r.response.result == "ok"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_and_unknown_tools_are_all_acknowledged_in_order() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        // One full chunk of audio queued ahead of the tool calls.
        rig.mic.push_frame(vec![0.1; 4096]);
        rig.message(json!({"toolCall": {"functionCalls": [
            {"id": "a", "name": "provide_pronunciation_feedback",
             "args": {"userText": "你好", "pinyin": "nǐ hǎo", "score": 88, "feedback": "Nice tones."}},
            {"id": "b", "name": "open_whiteboard", "args": {}},
            {"id": "c", "name": "update_subtitles", "args": {"hanzi": "好", "pinyin": "hǎo", "english": "good"}}
        ]}}));
        rig.settle().await;

        let events = rig.events();
        assert!(matches!(
            &events[0],
            SessionEvent::PronunciationFeedback(f) if f.score == 88.0 && f.feedback == "Nice tones."
        ));
        assert!(matches!(&events[1], SessionEvent::Subtitle(s) if s.hanzi == "好"));

        let sent = rig.connector.last_session().sent();
        let order: Vec<String> = sent
            .iter()
            .map(|s| match s {
                Sent::Audio(_) => "audio".to_string(),
                Sent::Tool(r) => r.id.clone(),
            })
            .collect();
        assert_eq!(order, vec!["audio", "a", "b", "c"]);
    }

    // ---- Scenario D -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn interruption_stops_voices_and_restarts_clock() {
        let mut rig = rig();
        rig.connected().await;

        rig.output.set_time(2.0);
        rig.message(json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(24_000)}},
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(24_000)}}
        ]}}}));
        rig.settle().await;
        assert_eq!(rig.output.playing().len(), 2);
        assert_eq!(rig.output.voices()[1].start_at, 3.0);

        rig.message(json!({"serverContent": {"interrupted": true}}));
        rig.settle().await;
        assert!(rig.output.playing().is_empty());
        assert_eq!(rig.manager.playback.as_ref().unwrap().live_voices(), 0);

        rig.output.set_time(2.5);
        rig.message(json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(240)}}
        ]}}}));
        rig.settle().await;
        assert_eq!(rig.output.voices()[2].start_at, 2.5);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_discards_transcript_and_unsent_samples() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.mic.push_frame(vec![0.1; 1000]);
        rig.message(json!({"serverContent": {"inputTranscription": {"text": "wo xiang"}}}));
        rig.settle().await;
        assert_eq!(rig.manager.accumulator.len(), 1000);

        rig.message(json!({"serverContent": {"interrupted": true}}));
        rig.message(json!({"serverContent": {"turnComplete": true}}));
        rig.settle().await;

        assert!(rig.manager.accumulator.is_empty());
        assert!(rig.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_voices_leave_the_live_set() {
        let mut rig = rig();
        rig.connected().await;
        rig.message(json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(10)}}
        ]}}}));
        rig.settle().await;

        let id = rig.output.voices()[0].id;
        rig.output.finish(id);
        rig.settle().await;
        assert_eq!(rig.manager.playback.as_ref().unwrap().live_voices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_audio_is_skipped() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.message(json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "%%% not base64"}},
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(10)}}
        ]}}}));
        rig.settle().await;

        assert_eq!(rig.manager.phase, Phase::Connected);
        assert!(rig.events().is_empty());
        assert_eq!(rig.output.voices().len(), 1);
    }

    // ---- Transcript -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn transcript_is_flushed_on_turn_complete() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.message(json!({"serverContent": {"inputTranscription": {"text": " ni "}}}));
        rig.message(json!({"serverContent": {"inputTranscription": {"text": "hao "}, "turnComplete": true}}));
        rig.message(json!({"serverContent": {"inputTranscription": {"text": "   "}, "turnComplete": true}}));
        rig.settle().await;

        assert_eq!(
            rig.events(),
            vec![SessionEvent::UserTranscript("ni hao".into())]
        );
    }

    // ---- Uplink -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn frames_are_resampled_and_sent_once_threshold_is_reached() {
        let mut rig = rig_with_mic_rate(48_000);
        rig.connected().await;

        // 4096 samples at 48 kHz become 1366 at 16 kHz.
        rig.mic.push_frame(vec![0.0; 4096]);
        rig.mic.push_frame(vec![0.0; 4096]);
        rig.settle().await;
        assert!(rig.connector.last_session().sent().is_empty());
        assert_eq!(rig.manager.accumulator.len(), 2 * 1366);

        rig.mic.push_frame(vec![0.0; 4096]);
        rig.settle().await;

        let sent = rig.connector.last_session().sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Audio(env) => {
                assert_eq!(env.mime_type, "audio/pcm;rate=16000");
                let samples = decode_base64_pcm16(&env.data).unwrap();
                assert_eq!(samples.len(), 3 * 1366);
            }
            other => panic!("expected audio, got {other:?}"),
        }
        assert!(rig.manager.accumulator.len() < rig.manager.accumulator.threshold());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_before_settle_or_after_disconnect_are_ignored() {
        let mut rig = rig();
        rig.handle.connect(None, 1.0);
        rig.settle().await;
        assert!(!rig.mic.push_frame(vec![0.0; 4096]));

        rig.advance(500).await;
        rig.handle.disconnect();
        rig.settle().await;
        assert!(!rig.mic.push_frame(vec![0.0; 4096]));
        assert!(rig.connector.last_session().sent().is_empty());
    }

    // ---- connect / disconnect --------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_while_active_is_a_noop() {
        let mut rig = rig();
        rig.handle.connect(None, 1.0);
        rig.handle.connect(None, 1.0);
        rig.settle().await;
        rig.handle.connect(Some("again"), 0.5);
        rig.settle().await;

        assert_eq!(rig.connector.open_count(), 1);
        assert_eq!(rig.mic.acquired(), 1);
        assert_eq!(
            rig.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_from_any_phase() {
        let mut rig = rig();

        // From DISCONNECTED.
        rig.handle.disconnect();
        rig.settle().await;
        assert!(rig.states().is_empty());

        // Mid-CONNECTING: the open task has not run yet.
        rig.handle.connect(None, 1.0);
        rig.handle.disconnect();
        rig.handle.disconnect();
        rig.settle().await;
        assert_eq!(
            rig.states(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
        rig.assert_torn_down();

        // From CONNECTED, with audio playing and acks queued.
        rig.connected().await;
        rig.message(json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": silence_b64(24_000)}}
        ]}}}));
        rig.settle().await;
        rig.handle.disconnect();
        rig.handle.disconnect();
        rig.settle().await;

        rig.assert_torn_down();
        assert!(rig.connector.last_session().is_closed());
        assert_eq!(rig.output.closed(), rig.output.opened());
        assert_eq!(rig.manager.phase, Phase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_open_result_is_closed() {
        let mut rig = rig();
        rig.handle.connect(None, 1.0);
        rig.settle().await;
        // Pretend an earlier attempt finished late.
        let late = Arc::new(crate::remote::MockSession::default());
        let stale: Arc<dyn RemoteSession> = late.clone();
        rig.manager.on_opened(0, Ok(stale));
        rig.settle().await;

        assert!(late.is_closed());
        assert_eq!(rig.manager.phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_is_an_ordinary_disconnect() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.connector
            .emit(RemoteEvent::Closed(Some("session ended".into())));
        rig.settle().await;

        assert_eq!(
            rig.events(),
            vec![SessionEvent::StateChanged(ConnectionState::Disconnected)]
        );
        rig.assert_torn_down();
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_an_earlier_connection_are_ignored() {
        let mut rig = rig();
        rig.connected().await;
        rig.handle.disconnect();
        rig.settle().await;
        rig.connected().await;
        rig.events();

        rig.connector.emit_on(
            0,
            RemoteEvent::Message(
                serde_json::from_value(json!({"toolCall": {"functionCalls": [
                    {"id": "old", "name": "update_subtitles", "args": {}}
                ]}}))
                .unwrap(),
            ),
        );
        rig.connector
            .emit_on(0, RemoteEvent::Error("boom".into()));
        rig.settle().await;

        assert!(rig.events().is_empty());
        assert_eq!(rig.manager.phase, Phase::Connected);
        assert!(rig.connector.session(1).sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_run_loop() {
        let rig = rig();
        let Rig {
            manager,
            handle,
            mic,
            ..
        } = rig;
        let task = tokio::spawn(manager.run());

        handle.connect(None, 1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mic.is_live());

        handle.shutdown();
        task.await.unwrap();
        assert!(!mic.is_live());
        assert!(!handle.connect(None, 1.0));
    }

    // ---- Fault handling ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_ignored() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.connector
            .emit(RemoteEvent::Error("Network error: connection reset".into()));
        rig.settle().await;

        assert!(rig.events().is_empty());
        assert_eq!(rig.manager.phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_errors_are_fatal_exactly_once() {
        let mut rig = rig();
        rig.connected().await;
        rig.events();

        rig.connector.emit(RemoteEvent::Error("quota exceeded".into()));
        rig.connector.emit(RemoteEvent::Error("something else".into()));
        rig.settle().await;
        rig.manager.fail("late failure".into());

        let events = rig.events();
        assert_eq!(fatal_errors(&events), vec!["Connection error: quota exceeded"]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::StateChanged(ConnectionState::Error)))
                .count(),
            1
        );
        rig.assert_torn_down();

        // A routine disconnect keeps the error state.
        rig.handle.disconnect();
        rig.settle().await;
        assert!(rig.manager.phase.is_error());
        assert!(rig.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_fault_reconnects_once_then_escalates() {
        let mut rig = rig();
        rig.handle.connect(Some("Ordering tea."), 0.7);
        rig.settle().await;
        rig.advance(500).await;
        rig.events();

        rig.connector
            .emit(RemoteEvent::Error("Internal error encountered.".into()));
        rig.settle().await;

        assert_eq!(
            rig.events(),
            vec![
                SessionEvent::StateChanged(ConnectionState::Connecting),
                SessionEvent::Error {
                    message: RECONNECTING.into(),
                    fatal: false
                },
            ]
        );
        assert!(matches!(rig.manager.phase, Phase::Recovering { attempt: 1 }));
        assert!(rig.connector.session(0).is_closed());
        assert!(!rig.mic.is_live());
        assert_eq!(rig.connector.open_count(), 1);

        rig.advance(500).await;
        assert_eq!(rig.connector.open_count(), 2);
        assert_eq!(rig.connector.setups()[0], rig.connector.setups()[1]);
        assert!(rig.connector.setups()[1]
            .system_instruction
            .contains("Ordering tea."));
        assert_eq!(
            rig.states(),
            vec![ConnectionState::Connected]
        );

        rig.connector
            .emit(RemoteEvent::Error("Internal error encountered.".into()));
        rig.settle().await;
        rig.advance(1_000).await;

        let events = rig.events();
        assert_eq!(fatal_errors(&events), vec![SESSION_INTERRUPTED.to_string()]);
        assert_eq!(rig.connector.open_count(), 2);
        assert!(rig.manager.phase.is_error());
        rig.assert_torn_down();
    }

    #[tokio::test(start_paused = true)]
    async fn user_connect_after_error_starts_fresh() {
        let mut rig = rig();
        rig.connected().await;
        rig.connector
            .emit(RemoteEvent::Error("Internal error encountered.".into()));
        rig.settle().await;
        rig.advance(500).await;
        rig.connector
            .emit(RemoteEvent::Error("Internal error encountered.".into()));
        rig.settle().await;
        assert!(rig.manager.phase.is_error());
        rig.events();

        rig.handle.connect(None, 1.0);
        rig.settle().await;
        assert_eq!(
            rig.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        // Retry budget was reset by the user's connect.
        rig.connector
            .emit(RemoteEvent::Error("Internal error encountered.".into()));
        rig.settle().await;
        assert!(matches!(rig.manager.phase, Phase::Recovering { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_recovery_cancels_reconnect() {
        let mut rig = rig();
        rig.connected().await;
        rig.connector
            .emit(RemoteEvent::Error("The service is currently unavailable.".into()));
        rig.settle().await;
        rig.handle.disconnect();
        rig.settle().await;
        rig.advance(1_000).await;

        assert_eq!(rig.connector.open_count(), 1);
        assert_eq!(rig.manager.phase, Phase::Disconnected);
    }

    // ---- Volume -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn volume_is_reported_only_while_connected() {
        let mut rig = rig();
        rig.output.set_tap_samples(vec![0.5; 256]);
        rig.connected().await;
        while rig.events.try_recv().is_ok() {}

        rig.advance(48).await;
        let mut levels = Vec::new();
        while let Ok(event) = rig.events.try_recv() {
            if let SessionEvent::Volume(level) = event {
                levels.push(level);
            }
        }
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|l| (0.0..=1.0).contains(l)));

        rig.handle.disconnect();
        rig.settle().await;
        while rig.events.try_recv().is_ok() {}
        rig.advance(100).await;
        assert!(rig.events.try_recv().is_err());
    }
}
