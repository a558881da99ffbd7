//! Generation orchestrator.
//!
//! A [`Session`] is owned by a single front-end loop. Engine calls run on
//! spawned tokio tasks, but those tasks never touch session state: they send
//! [`GenerationEvent`]s back over a channel, and the owner feeds them to
//! [`Session::apply`] from its own loop. All transcript and state mutations
//! therefore happen in one place, in the order the engine produced them.

use crate::config_form::ConfigUpdateListener;
use crate::engine::{Engine, EngineFactory};
use crate::params::GenerationParameters;
use crate::state::{Affordances, EntryKind, SessionState};
use crate::transcript::Transcript;
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const EMPTY_PROMPT_NOTICE: &str = "Prompt is empty";
pub const ENGINE_PANIC_MESSAGE: &str = "engine task panicked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Prompt was empty; nothing changed
    Rejected,
    /// Request entry appended and generation started
    Started(RequestId),
    /// Request entry appended, but the engine could not be initialized.
    /// An error entry follows it and the session stays idle.
    EngineUnavailable(RequestId),
    /// A request was already running; it has been asked to stop
    CancelRequested(RequestId),
}

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Next streaming increment
    Delta(String),
    /// Full one-shot response
    Response(String),
    /// Always the last event of a request
    Finished(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationEvent {
    pub request: RequestId,
    pub kind: EventKind,
}

/// Notifications for whatever is rendering the session
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    TranscriptChanged { revision: u64 },
    StateChanged(SessionState),
    ScrollTo(usize),
    Notice(String),
    ConfigUpdated(GenerationParameters),
}

#[derive(Debug)]
struct InFlight {
    id: RequestId,
    streaming: bool,
    cancel: CancellationToken,
    cancel_requested: bool,
    accumulated: String,
}

pub struct Session {
    factory: Arc<dyn EngineFactory>,
    engine: Option<Arc<dyn Engine>>,
    params: GenerationParameters,
    pending_params: Option<GenerationParameters>,
    transcript: Transcript,
    state: SessionState,
    in_flight: Option<InFlight>,
    next_request: u64,
    events_tx: mpsc::UnboundedSender<GenerationEvent>,
    events_rx: mpsc::UnboundedReceiver<GenerationEvent>,
    updates: Vec<UiUpdate>,
}

impl Session {
    pub fn new(factory: Arc<dyn EngineFactory>, params: GenerationParameters) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            engine: None,
            params,
            pending_params: None,
            transcript: Transcript::new(),
            state: SessionState::Idle,
            in_flight: None,
            next_request: 1,
            events_tx,
            events_rx,
            updates: Vec::new(),
        }
    }

    /// Acquire the engine handle now instead of on the first submission
    pub fn initialize(&mut self) -> Result<(), crate::engine::EngineError> {
        self.ensure_engine().map(|_| ())
    }

    fn ensure_engine(&mut self) -> Result<Arc<dyn Engine>, crate::engine::EngineError> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        let engine = self.factory.initialize(&self.params)?;
        info!(engine = engine.name(), "engine initialized");
        self.engine = Some(engine.clone());
        Ok(engine)
    }

    /// Send a prompt, or cancel the running request if there is one.
    pub fn submit(&mut self, prompt: &str, use_streaming: bool) -> SubmitOutcome {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.cancel_requested {
                info!(request = in_flight.id.0, "cancellation requested");
            }
            in_flight.cancel_requested = true;
            in_flight.cancel.cancel();
            return SubmitOutcome::CancelRequested(in_flight.id);
        }

        if prompt.trim().is_empty() {
            self.updates.push(UiUpdate::Notice(EMPTY_PROMPT_NOTICE.to_string()));
            return SubmitOutcome::Rejected;
        }

        let id = RequestId(self.next_request);
        self.next_request += 1;

        self.transcript.append(EntryKind::Request, prompt);
        self.notify_transcript();

        let engine = match self.ensure_engine() {
            Ok(engine) => engine,
            Err(e) => {
                warn!(request = id.0, error = %e, "engine initialization failed");
                let index = self.transcript.append(EntryKind::ErrorResponse, e.to_string());
                self.notify_transcript();
                self.updates.push(UiUpdate::ScrollTo(index));
                return SubmitOutcome::EngineUnavailable(id);
            }
        };

        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            id,
            streaming: use_streaming,
            cancel: cancel.clone(),
            cancel_requested: false,
            accumulated: String::new(),
        });
        self.set_state(SessionState::Generating);

        info!(request = id.0, streaming = use_streaming, engine = engine.name(), "generation started");
        let tx = self.events_tx.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let work = async {
                if use_streaming {
                    run_stream(engine, &prompt, id, &cancel, &tx).await
                } else {
                    run_once(engine, &prompt, id, &cancel, &tx).await
                }
            };
            // A panicking engine must still end the request.
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(request = id.0, "engine task panicked");
                    Outcome::Failed(ENGINE_PANIC_MESSAGE.to_string())
                }
            };
            // The receiver lives as long as the session; a closed channel means it is gone.
            let _ = tx.send(GenerationEvent {
                request: id,
                kind: EventKind::Finished(outcome),
            });
        });

        SubmitOutcome::Started(id)
    }

    /// Wait for the next event from a running generation
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events_rx.recv().await
    }

    /// Fold an engine event into the transcript and state
    pub fn apply(&mut self, event: GenerationEvent) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            debug!(request = event.request.0, "dropping event with no request in flight");
            return;
        };
        if in_flight.id != event.request {
            debug!(
                request = event.request.0,
                current = in_flight.id.0,
                "dropping event for stale request"
            );
            return;
        }

        match event.kind {
            EventKind::Delta(delta) => {
                if !in_flight.streaming {
                    warn!(request = in_flight.id.0, "delta received for one-shot request");
                }
                in_flight.accumulated.push_str(&delta);
                let text = in_flight.accumulated.clone();
                if self.transcript.streaming_index().is_some() {
                    // The slot is open whenever it is Some, so this cannot fail.
                    let _ = self.transcript.update_streaming(text);
                } else {
                    self.transcript.begin_streaming(text);
                }
                self.notify_transcript();
            }
            EventKind::Response(text) => {
                self.transcript.append(EntryKind::Response, text);
                self.notify_transcript();
            }
            EventKind::Finished(outcome) => self.finish(outcome),
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        self.transcript.finish_streaming();

        match outcome {
            Outcome::Completed => {
                info!(request = in_flight.id.0, chars = in_flight.accumulated.len(), "generation completed");
            }
            Outcome::Cancelled => {
                info!(request = in_flight.id.0, "generation cancelled");
            }
            Outcome::Failed(message) => {
                warn!(request = in_flight.id.0, error = %message, "generation failed");
                self.transcript.append(EntryKind::ErrorResponse, message);
                self.notify_transcript();
            }
        }

        self.set_state(SessionState::Idle);
        if let Some(last) = self.transcript.len().checked_sub(1) {
            self.updates.push(UiUpdate::ScrollTo(last));
        }
    }

    /// Apply events until the current request finishes, then any held-back
    /// reconfiguration
    pub async fn run_until_idle(&mut self) {
        while self.state.is_generating() {
            match self.next_event().await {
                Some(event) => self.apply(event),
                None => break,
            }
        }
        self.apply_pending_config().await;
    }

    /// Replace the engine with one built from `params`.
    ///
    /// The old engine is released before the new one is created. While a
    /// request is running the change is held back until the session is idle
    /// and [`Session::apply_pending_config`] runs.
    pub async fn reconfigure(&mut self, params: GenerationParameters) {
        if self.state.is_generating() {
            info!("reconfiguration deferred until the current request finishes");
            self.pending_params = Some(params);
            return;
        }

        self.pending_params = None;
        self.params = params;
        if let Some(engine) = self.engine.take() {
            debug!(engine = engine.name(), "releasing engine");
            engine.release().await;
        }
        if let Err(e) = self.ensure_engine() {
            // Surfaced on the next submission, which retries initialization.
            warn!(error = %e, "engine re-initialization failed");
        }
        self.updates.push(UiUpdate::ConfigUpdated(params));
    }

    /// Swap the engine for held-back parameters once nothing is running.
    /// Front ends call this from their loop after handling input or events.
    pub async fn apply_pending_config(&mut self) {
        if self.state.is_generating() {
            return;
        }
        if let Some(params) = self.pending_params.take() {
            self.reconfigure(params).await;
        }
    }

    /// Cancel anything running and release the engine
    pub async fn shutdown(&mut self) {
        self.pending_params = None;
        if let Some(in_flight) = self.in_flight.as_ref() {
            in_flight.cancel.cancel();
        }
        self.run_until_idle().await;
        if let Some(engine) = self.engine.take() {
            engine.release().await;
        }
    }

    /// Drain pending UI notifications
    pub fn take_updates(&mut self) -> Vec<UiUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn affordances(&self) -> Affordances {
        self.state.affordances()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn params(&self) -> GenerationParameters {
        self.params
    }

    pub fn pending_params(&self) -> Option<GenerationParameters> {
        self.pending_params
    }

    pub fn cancel_requested(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.cancel_requested)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state changed");
            self.state = state;
            self.updates.push(UiUpdate::StateChanged(state));
        }
    }

    fn notify_transcript(&mut self) {
        self.updates.push(UiUpdate::TranscriptChanged {
            revision: self.transcript.revision(),
        });
    }
}

impl ConfigUpdateListener for Session {
    /// Holds the parameters; the swap happens in [`Session::apply_pending_config`]
    fn on_config_updated(&mut self, params: &GenerationParameters) {
        debug!(?params, "settings updated");
        self.pending_params = Some(*params);
    }
}

async fn run_once(
    engine: Arc<dyn Engine>,
    prompt: &str,
    id: RequestId,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<GenerationEvent>,
) -> Outcome {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = engine.generate_once(prompt) => match result {
            Ok(text) => {
                let _ = tx.send(GenerationEvent { request: id, kind: EventKind::Response(text) });
                Outcome::Completed
            }
            Err(e) => Outcome::Failed(e.to_string()),
        },
    }
}

async fn run_stream(
    engine: Arc<dyn Engine>,
    prompt: &str,
    id: RequestId,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<GenerationEvent>,
) -> Outcome {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Outcome::Cancelled,
        started = engine.generate_stream(prompt) => match started {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e.to_string()),
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            next = stream.next() => match next {
                Some(Ok(delta)) => {
                    let _ = tx.send(GenerationEvent { request: id, kind: EventKind::Delta(delta) });
                }
                Some(Err(e)) => return Outcome::Failed(e.to_string()),
                None => return Outcome::Completed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, TextStream};
    use crate::state::TranscriptEntry;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Engine whose replies are fixed up front
    struct ScriptedEngine {
        reply: Result<String, EngineError>,
        deltas: Vec<Result<String, EngineError>>,
        // When set, calls wait here before producing anything
        gate: Option<Arc<Notify>>,
        number: usize,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate_once(&self, _prompt: &str) -> Result<String, EngineError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.reply.clone()
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<TextStream, EngineError> {
            let items = self.deltas.clone();
            let gate = self.gate.clone();
            let stream = async_stream::stream! {
                for item in items {
                    if let Some(gate) = &gate {
                        gate.notified().await;
                    }
                    yield item;
                }
            };
            Ok(Box::pin(stream))
        }

        async fn release(&self) {
            // Let other tasks run first so an unawaited release would show up late
            tokio::task::yield_now().await;
            self.calls.lock().unwrap().push(format!("release#{}", self.number));
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        reply: Option<Result<String, EngineError>>,
        deltas: Vec<Result<String, EngineError>>,
        gate: Option<Arc<Notify>>,
        fail_init: bool,
        initialized: Mutex<Vec<GenerationParameters>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedFactory {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EngineFactory for ScriptedFactory {
        fn initialize(&self, params: &GenerationParameters) -> Result<Arc<dyn Engine>, EngineError> {
            if self.fail_init {
                return Err(EngineError::Unavailable("engine not installed".to_string()));
            }
            let mut initialized = self.initialized.lock().unwrap();
            initialized.push(*params);
            let number = initialized.len();
            self.calls.lock().unwrap().push(format!("init#{}", number));
            Ok(Arc::new(ScriptedEngine {
                reply: self.reply.clone().unwrap_or_else(|| Ok(String::new())),
                deltas: self.deltas.clone(),
                gate: self.gate.clone(),
                number,
                calls: self.calls.clone(),
            }))
        }
    }

    fn session_with(factory: ScriptedFactory) -> (Session, Arc<ScriptedFactory>) {
        let factory = Arc::new(factory);
        let session = Session::new(factory.clone(), GenerationParameters::default());
        (session, factory)
    }

    fn entries(session: &Session) -> Vec<(EntryKind, String)> {
        session
            .transcript()
            .entries()
            .iter()
            .map(|TranscriptEntry { kind, text }| (*kind, text.clone()))
            .collect()
    }

    fn assert_idle_affordances(session: &Session) {
        assert_eq!(session.state(), SessionState::Idle);
        let a = session.affordances();
        assert!(a.streaming_toggle_enabled);
        assert!(a.config_enabled);
        assert_eq!(a.submit_label, "Send");
    }

    #[tokio::test]
    async fn test_one_shot_response() {
        let (mut session, _) = session_with(ScriptedFactory {
            reply: Some(Ok("Hi there".to_string())),
            ..Default::default()
        });

        assert!(matches!(session.submit("Hello", false), SubmitOutcome::Started(_)));
        assert_eq!(session.state(), SessionState::Generating);
        assert!(!session.affordances().streaming_toggle_enabled);
        assert!(!session.affordances().config_enabled);

        session.run_until_idle().await;

        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "Hello".to_string()),
                (EntryKind::Response, "Hi there".to_string()),
            ]
        );
        assert_idle_affordances(&session);
        let updates = session.take_updates();
        assert!(updates.contains(&UiUpdate::StateChanged(SessionState::Generating)));
        assert_eq!(updates.last(), Some(&UiUpdate::ScrollTo(1)));
    }

    #[tokio::test]
    async fn test_streaming_accumulates_prefixes() {
        let (mut session, _) = session_with(ScriptedFactory {
            deltas: vec![Ok("1".into()), Ok("2".into()), Ok("3".into())],
            ..Default::default()
        });

        session.submit("Count", true);

        let mut seen = Vec::new();
        while session.state().is_generating() {
            let event = session.next_event().await.unwrap();
            let is_delta = matches!(event.kind, EventKind::Delta(_));
            session.apply(event);
            if is_delta {
                seen.push(session.transcript().last().unwrap().text.clone());
            }
        }

        assert_eq!(seen, vec!["1", "12", "123"]);
        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "Count".to_string()),
                (EntryKind::Response, "123".to_string()),
            ]
        );
        assert_eq!(session.transcript().streaming_index(), None);
        assert_idle_affordances(&session);
    }

    #[tokio::test]
    async fn test_final_text_is_concatenation_of_deltas() {
        let many: Vec<String> = (0..50).map(|i| format!("w{} ", i)).collect();
        let cases: Vec<Vec<String>> = vec![
            vec![],
            vec!["only".to_string()],
            vec!["".to_string(), "".to_string()],
            vec!["The", " quick", "", " brown", " fox ", "jumps"]
                .into_iter()
                .map(String::from)
                .collect(),
            vec!["héllo", " wörld", " ✓", " 日本", "語"]
                .into_iter()
                .map(String::from)
                .collect(),
            many,
        ];

        for deltas in cases {
            let (mut session, _) = session_with(ScriptedFactory {
                deltas: deltas.iter().cloned().map(Ok).collect(),
                ..Default::default()
            });
            session.submit("go", true);

            let mut applied = 0;
            while session.state().is_generating() {
                let event = session.next_event().await.unwrap();
                let is_delta = matches!(event.kind, EventKind::Delta(_));
                session.apply(event);
                if is_delta {
                    applied += 1;
                    let prefix = deltas[..applied].concat();
                    assert_eq!(session.transcript().last().unwrap().text, prefix);
                    assert_eq!(session.transcript().len(), 2);
                }
            }

            assert_eq!(applied, deltas.len());
            if deltas.is_empty() {
                // Nothing arrived, so no response entry was opened
                assert_eq!(entries(&session), vec![(EntryKind::Request, "go".to_string())]);
            } else {
                assert_eq!(session.transcript().last().unwrap().text, deltas.concat());
                assert_eq!(session.transcript().len(), 2);
            }
            assert_idle_affordances(&session);
        }
    }

    #[tokio::test]
    async fn test_engine_error_becomes_error_entry() {
        let (mut session, _) = session_with(ScriptedFactory {
            reply: Some(Err(EngineError::Unavailable("unavailable".to_string()))),
            ..Default::default()
        });

        session.submit("Hi", false);
        session.run_until_idle().await;

        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "Hi".to_string()),
                (EntryKind::ErrorResponse, "unavailable".to_string()),
            ]
        );
        assert_idle_affordances(&session);
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_text() {
        let (mut session, _) = session_with(ScriptedFactory {
            deltas: vec![
                Ok("par".into()),
                Ok("tial".into()),
                Err(EngineError::Backend("backend crashed".to_string())),
                Ok("never".into()),
            ],
            ..Default::default()
        });

        session.submit("x", true);
        session.run_until_idle().await;

        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "x".to_string()),
                (EntryKind::Response, "partial".to_string()),
                (EntryKind::ErrorResponse, "backend crashed".to_string()),
            ]
        );
        assert_idle_affordances(&session);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let (mut session, factory) = session_with(ScriptedFactory::default());

        for prompt in ["", "   ", "\n\t"] {
            assert_eq!(session.submit(prompt, false), SubmitOutcome::Rejected);
        }

        assert!(session.transcript().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(factory.initialized.lock().unwrap().is_empty());
        assert_eq!(
            session.take_updates(),
            vec![UiUpdate::Notice(EMPTY_PROMPT_NOTICE.to_string()); 3]
        );
    }

    #[tokio::test]
    async fn test_second_submit_cancels_one_shot() {
        let gate = Arc::new(Notify::new());
        let (mut session, _) = session_with(ScriptedFactory {
            reply: Some(Ok("too late".to_string())),
            gate: Some(gate.clone()),
            ..Default::default()
        });

        let SubmitOutcome::Started(id) = session.submit("A", false) else {
            panic!("request did not start");
        };
        assert_eq!(session.submit("B", false), SubmitOutcome::CancelRequested(id));
        assert!(session.cancel_requested());
        assert_eq!(session.state(), SessionState::Generating);

        session.run_until_idle().await;

        assert_eq!(entries(&session), vec![(EntryKind::Request, "A".to_string())]);
        assert_idle_affordances(&session);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_received_text() {
        let gate = Arc::new(Notify::new());
        let (mut session, _) = session_with(ScriptedFactory {
            deltas: vec![Ok("one".into()), Ok(" two".into())],
            gate: Some(gate.clone()),
            ..Default::default()
        });

        session.submit("A", true);
        gate.notify_one();
        let first = session.next_event().await.unwrap();
        assert_eq!(first.kind, EventKind::Delta("one".to_string()));
        session.apply(first);

        session.submit("", true);
        session.run_until_idle().await;

        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "A".to_string()),
                (EntryKind::Response, "one".to_string()),
            ]
        );
        assert_idle_affordances(&session);
    }

    #[tokio::test]
    async fn test_init_failure_is_error_entry() {
        let (mut session, _) = session_with(ScriptedFactory {
            fail_init: true,
            ..Default::default()
        });

        assert!(matches!(session.submit("Hi", true), SubmitOutcome::EngineUnavailable(_)));

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "Hi".to_string()),
                (EntryKind::ErrorResponse, "engine not installed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut session, _) = session_with(ScriptedFactory {
            reply: Some(Ok("ok".to_string())),
            ..Default::default()
        });

        session.apply(GenerationEvent {
            request: RequestId(99),
            kind: EventKind::Response("ghost".to_string()),
        });
        assert!(session.transcript().is_empty());

        session.submit("q", false);
        session.apply(GenerationEvent {
            request: RequestId(99),
            kind: EventKind::Finished(Outcome::Completed),
        });
        assert_eq!(session.state(), SessionState::Generating);

        session.run_until_idle().await;
        assert_eq!(session.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_reconfigure_releases_before_replacing() {
        let (mut session, factory) = session_with(ScriptedFactory::default());
        session.initialize().unwrap();

        let params = GenerationParameters {
            temperature: 0.9,
            top_k: 4,
            max_output_tokens: 10,
        };
        session.reconfigure(params).await;

        assert_eq!(factory.calls(), vec!["init#1", "release#1", "init#2"]);
        assert_eq!(session.params(), params);
        assert_eq!(
            *factory.initialized.lock().unwrap(),
            vec![GenerationParameters::default(), params]
        );
        assert!(session.take_updates().contains(&UiUpdate::ConfigUpdated(params)));
    }

    #[tokio::test]
    async fn test_config_update_is_held_until_applied() {
        let (mut session, factory) = session_with(ScriptedFactory::default());
        session.initialize().unwrap();

        let params = GenerationParameters {
            temperature: 0.3,
            top_k: 8,
            max_output_tokens: 64,
        };
        session.on_config_updated(&params);
        assert_eq!(session.pending_params(), Some(params));
        assert_eq!(factory.calls(), vec!["init#1"]);

        session.apply_pending_config().await;

        assert_eq!(session.pending_params(), None);
        assert_eq!(session.params(), params);
        assert_eq!(factory.calls(), vec!["init#1", "release#1", "init#2"]);
    }

    #[tokio::test]
    async fn test_reconfigure_deferred_while_generating() {
        let gate = Arc::new(Notify::new());
        let (mut session, factory) = session_with(ScriptedFactory {
            reply: Some(Ok("done".to_string())),
            gate: Some(gate.clone()),
            ..Default::default()
        });

        session.submit("slow", false);
        let params = GenerationParameters {
            temperature: 1.0,
            top_k: 2,
            max_output_tokens: 8,
        };
        session.reconfigure(params).await;

        assert_eq!(session.pending_params(), Some(params));
        assert_eq!(session.params(), GenerationParameters::default());
        assert_eq!(factory.initialized.lock().unwrap().len(), 1);

        gate.notify_one();
        session.run_until_idle().await;

        assert_eq!(session.params(), params);
        assert_eq!(session.pending_params(), None);
        assert_eq!(factory.initialized.lock().unwrap().last(), Some(&params));
        assert_eq!(session.transcript().last().unwrap().text, "done");
    }

    #[tokio::test]
    async fn test_shutdown_releases_engine() {
        let gate = Arc::new(Notify::new());
        let (mut session, factory) = session_with(ScriptedFactory {
            gate: Some(gate),
            ..Default::default()
        });

        session.submit("never answered", false);
        session.shutdown().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(factory.calls(), vec!["init#1", "release#1"]);
    }

    struct PanickingEngine;

    #[async_trait]
    impl Engine for PanickingEngine {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn generate_once(&self, _prompt: &str) -> Result<String, EngineError> {
            panic!("backend exploded");
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<TextStream, EngineError> {
            let stream = async_stream::stream! {
                yield Ok::<_, EngineError>("before".to_string());
                panic!("backend exploded mid-stream");
            };
            Ok(Box::pin(stream))
        }
    }

    struct PanickingFactory;

    impl EngineFactory for PanickingFactory {
        fn initialize(&self, _params: &GenerationParameters) -> Result<Arc<dyn Engine>, EngineError> {
            Ok(Arc::new(PanickingEngine))
        }
    }

    #[tokio::test]
    async fn test_engine_panic_returns_to_idle() {
        let mut session = Session::new(Arc::new(PanickingFactory), GenerationParameters::default());

        session.submit("hi", false);
        tokio::time::timeout(std::time::Duration::from_secs(5), session.run_until_idle())
            .await
            .expect("session stuck generating");

        assert_eq!(
            entries(&session),
            vec![
                (EntryKind::Request, "hi".to_string()),
                (EntryKind::ErrorResponse, ENGINE_PANIC_MESSAGE.to_string()),
            ]
        );
        assert_idle_affordances(&session);

        session.submit("again", true);
        tokio::time::timeout(std::time::Duration::from_secs(5), session.run_until_idle())
            .await
            .expect("session stuck generating");

        assert_eq!(
            entries(&session)[2..].to_vec(),
            vec![
                (EntryKind::Request, "again".to_string()),
                (EntryKind::Response, "before".to_string()),
                (EntryKind::ErrorResponse, ENGINE_PANIC_MESSAGE.to_string()),
            ]
        );
        assert_idle_affordances(&session);
    }
}
