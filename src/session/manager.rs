//! Per-connection session supervision
//!
//! Each session sits behind its own `Mutex`, so messages and completions
//! for one session are processed strictly one at a time while different
//! sessions run concurrently. Events are pushed to the connection's
//! channel while the lock is held, which keeps them in production order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::error::Elapsed;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{BackendError, Backends};
use crate::error::SessionError;
use crate::events::EventMessage;
use crate::ipc::Dispatcher;
use crate::modes::{ModeRegistry, UnknownModeError};
use crate::state::{Completion, Request, Step};

/// Outbound half of a client connection
pub type EventSink = mpsc::UnboundedSender<EventMessage>;

/// Settings applied to every new session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_mode: String,
    /// Fail a session that sits in listening this long; `None` waits forever
    pub listen_timeout: Option<Duration>,
    pub transcribe_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_mode: "tutor".to_string(),
            listen_timeout: None,
            transcribe_timeout: Duration::from_secs(15),
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// Spawned external request, tagged with the generation it was issued for
struct PendingRequest {
    generation: u64,
    handle: AbortHandle,
}

struct Session {
    dispatcher: Dispatcher,
    outbound: EventSink,
    /// In-flight request task; holds a reference to this session until it ends
    pending: Option<PendingRequest>,
}

impl Session {
    fn emit(&self, events: Vec<EventMessage>) {
        for event in events {
            debug!(session_id = %self.dispatcher.session_id(), %event, "emitting event");
            if self.outbound.send(event).is_err() {
                debug!(
                    session_id = %self.dispatcher.session_id(),
                    "connection gone, dropping events"
                );
                break;
            }
        }
    }

    /// Abort the in-flight request if the session has moved past its generation
    fn cancel_stale(&mut self) {
        let current = self.dispatcher.generation();
        if self.pending.as_ref().is_some_and(|p| p.generation == current) {
            return;
        }
        if let Some(pending) = self.pending.take() {
            debug!(
                session_id = %self.dispatcher.session_id(),
                generation = pending.generation,
                "aborting stale request"
            );
            pending.handle.abort();
        }
    }
}

type SharedSession = Arc<Mutex<Session>>;

struct Inner {
    sessions: RwLock<HashMap<String, SharedSession>>,
    registry: Arc<ModeRegistry>,
    backends: Backends,
    settings: SessionSettings,
}

/// Owns all live sessions. Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager. Fails if the default mode is not registered.
    pub fn new(
        registry: Arc<ModeRegistry>,
        backends: Backends,
        settings: SessionSettings,
    ) -> Result<Self, UnknownModeError> {
        registry.resolve(&settings.default_mode)?;

        Ok(Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                registry,
                backends,
                settings,
            }),
        })
    }

    /// Create a new `Idle` session whose events go to `outbound`
    pub async fn open(&self, outbound: EventSink) -> Result<String, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        let dispatcher = Dispatcher::new(
            session_id.clone(),
            Arc::clone(&self.inner.registry),
            &self.inner.settings.default_mode,
            self.inner.settings.listen_timeout,
        )?;

        let session = Session {
            dispatcher,
            outbound,
            pending: None,
        };
        session.emit(vec![EventMessage::SessionCreated {
            session_id: session_id.clone(),
        }]);

        self.inner
            .sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        info!(%session_id, mode = %self.inner.settings.default_mode, "session opened");
        Ok(session_id)
    }

    /// Forward a raw inbound message to the session's dispatcher.
    ///
    /// If the message stops the session, it is gone by the time this returns.
    pub async fn route(&self, session_id: &str, raw: &str) -> Result<(), SessionError> {
        self.with_session(session_id, |dispatcher| dispatcher.dispatch(raw))
            .await
    }

    /// Report a frame that could not be turned into a message (e.g. binary)
    pub async fn reject(&self, session_id: &str, err: SessionError) -> Result<(), SessionError> {
        self.with_session(session_id, |dispatcher| dispatcher.reject(err))
            .await
    }

    /// Force the session into `Stopped` and forget it
    pub async fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        let mut guard = session.lock().await;
        if !guard.dispatcher.is_stopped() {
            let step = guard.dispatcher.stop();
            self.apply(&session, &mut guard, step);
        }
        if let Some(pending) = guard.pending.take() {
            pending.handle.abort();
        }

        info!(
            %session_id,
            mode = guard.dispatcher.mode(),
            state = %guard.dispatcher.state(),
            "session closed"
        );
        Ok(())
    }

    /// Close every live session
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        info!(count = ids.len(), "closing all sessions");

        for id in ids {
            // a session may stop on its own while we iterate
            let _ = self.close(&id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    async fn with_session<F>(&self, session_id: &str, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Dispatcher) -> Step,
    {
        let session = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        let stopped = {
            let mut guard = session.lock().await;
            if guard.dispatcher.is_stopped() {
                return Err(SessionError::UnknownSession(session_id.to_string()));
            }
            let step = f(&mut guard.dispatcher);
            self.apply(&session, &mut guard, step);
            guard.dispatcher.is_stopped()
        };

        if stopped {
            self.remove(session_id).await;
        }
        Ok(())
    }

    /// Emit a step's events and start its request. Called with the session lock held.
    ///
    /// A request left over from an earlier generation is aborted, so timers and
    /// collaborator calls do not keep a finished turn's session alive.
    fn apply(&self, session: &SharedSession, guard: &mut Session, step: Step) {
        if step.is_empty() {
            return;
        }
        guard.emit(step.events);
        guard.cancel_stale();

        if let Some(request) = step.request {
            let generation = request.generation();
            let handle = self.spawn_request(
                Arc::clone(session),
                guard.dispatcher.session_id().to_string(),
                request,
            );
            guard.pending = Some(PendingRequest { generation, handle });
        }
    }

    fn spawn_request(
        &self,
        session: SharedSession,
        session_id: String,
        request: Request,
    ) -> AbortHandle {
        let manager = self.clone();
        tokio::spawn(async move {
            let completion = manager.run_request(&session_id, request).await;
            manager.complete(&session_id, &session, completion).await;
        })
        .abort_handle()
    }

    async fn run_request(&self, session_id: &str, request: Request) -> Completion {
        let backends = &self.inner.backends;
        let settings = &self.inner.settings;
        debug!(%session_id, generation = request.generation(), "running external request");

        match request {
            Request::Transcribe { generation, input } => {
                let timeout = settings.transcribe_timeout;
                let result =
                    tokio::time::timeout(timeout, backends.transcriber.transcribe(input)).await;

                match within(result, "transcriber", timeout) {
                    Ok(text) => Completion::Transcribed { generation, text },
                    Err(error) => Completion::Failed { generation, error },
                }
            }
            Request::Generate {
                generation,
                text,
                mode,
            } => {
                let timeout = settings.response_timeout;
                let result =
                    tokio::time::timeout(timeout, backends.responder.generate(&text, &mode)).await;

                match within(result, "response generator", timeout) {
                    Ok(response) => Completion::Responded {
                        generation,
                        mode: mode.name.clone(),
                        response,
                    },
                    Err(error) => Completion::Failed { generation, error },
                }
            }
            Request::ListenTimeout { generation, after } => {
                tokio::time::sleep(after).await;
                Completion::Failed {
                    generation,
                    error: BackendError::Timeout {
                        service: "listener",
                        timeout_ms: after.as_millis() as u64,
                    },
                }
            }
        }
    }

    async fn complete(&self, session_id: &str, session: &SharedSession, completion: Completion) {
        let stopped = {
            let mut guard = session.lock().await;
            if guard.dispatcher.is_stopped() {
                debug!(%session_id, "completion for stopped session discarded");
                return;
            }
            // this task is finishing on its own; don't abort it below
            if guard
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == completion.generation())
            {
                guard.pending = None;
            }
            let step = guard.dispatcher.complete(completion);
            self.apply(session, &mut guard, step);
            guard.dispatcher.is_stopped()
        };

        if stopped {
            self.remove(session_id).await;
        }
    }

    async fn remove(&self, session_id: &str) {
        if self.inner.sessions.write().await.remove(session_id).is_some() {
            info!(%session_id, "session removed");
        }
    }
}

fn within<T>(
    result: Result<Result<T, BackendError>, Elapsed>,
    service: &'static str,
    timeout: Duration,
) -> Result<T, BackendError> {
    result.unwrap_or_else(|_| {
        Err(BackendError::Timeout {
            service,
            timeout_ms: timeout.as_millis() as u64,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Generated, Input, ResponseGenerator, TokenUsage, Transcriber};
    use crate::modes::Mode;
    use crate::state::State;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    /// Responder that waits for the test to release it
    struct GatedResponder {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ResponseGenerator for GatedResponder {
        async fn generate(&self, text: &str, _mode: &Mode) -> Result<Generated, BackendError> {
            self.gate.notified().await;
            Ok(Generated {
                text: format!("echo: {text}"),
                usage: TokenUsage::default(),
                suggested_mode: None,
            })
        }
    }

    struct BrokenTranscriber;

    #[async_trait]
    impl Transcriber for BrokenTranscriber {
        async fn transcribe(&self, _input: Input) -> Result<String, BackendError> {
            Err(BackendError::failed("transcriber", "microphone unplugged"))
        }
    }

    struct SleepyResponder;

    #[async_trait]
    impl ResponseGenerator for SleepyResponder {
        async fn generate(&self, _text: &str, _mode: &Mode) -> Result<Generated, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(BackendError::failed("response generator", "unreachable"))
        }
    }

    fn create_manager(backends: Backends, settings: SessionSettings) -> SessionManager {
        SessionManager::new(Arc::new(ModeRegistry::builtin()), backends, settings).unwrap()
    }

    fn gated() -> (Backends, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let backends = Backends::new(
            Arc::new(crate::backend::PassthroughTranscriber),
            Arc::new(GatedResponder {
                gate: Arc::clone(&gate),
            }),
        );
        (backends, gate)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EventMessage>) -> EventMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn open(manager: &SessionManager) -> (String, mpsc::UnboundedReceiver<EventMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.open(tx).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::SessionCreated { session_id: id.clone() }
        );
        (id, rx)
    }

    #[tokio::test]
    async fn test_unknown_default_mode_rejected() {
        let settings = SessionSettings {
            default_mode: "pirate".into(),
            ..Default::default()
        };
        let registry = Arc::new(ModeRegistry::builtin());
        let result = SessionManager::new(registry, Backends::local(), settings);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_voice_start() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        assert_ok!(manager.route(&id, r#"{"type":"voice_start","mode":"friend"}"#).await);
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStarted { mode: "friend".into() });
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceState { state: State::Listening });
    }

    #[tokio::test]
    async fn test_text_input_full_turn() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"friend"}"#).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::VoiceState { state: State::Transcribing }
        );
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::VoiceTranscript { text: "Hello".into() }
        );
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::VoiceState { state: State::Responding }
        );

        match next_event(&mut rx).await {
            EventMessage::TextResponse { text, mode, .. } => {
                assert!(!text.is_empty());
                assert_eq!(mode, "friend");
            }
            other => panic!("expected text_response, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceState { state: State::Listening });
    }

    #[tokio::test]
    async fn test_mode_change_while_responding() {
        let (backends, gate) = gated();
        let manager = create_manager(backends, SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"friend"}"#).await.unwrap();
        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();
        loop {
            if next_event(&mut rx).await == (EventMessage::VoiceState { state: State::Responding })
            {
                break;
            }
        }

        manager.route(&id, r#"{"type":"voice_mode","mode":"tutor"}"#).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::ModeChanged {
                mode: "tutor".into(),
                previous: "friend".into()
            }
        );

        manager.route(&id, r#"{"type":"get_status"}"#).await.unwrap();
        match next_event(&mut rx).await {
            EventMessage::Status(status) => {
                assert_eq!(status.state, State::Responding);
                assert_eq!(status.mode, "tutor");
            }
            other => panic!("expected status, got {other:?}"),
        }

        gate.notify_one();
        assert!(matches!(
            next_event(&mut rx).await,
            EventMessage::TextResponse { ref text, .. } if text == "echo: Hello"
        ));
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceState { state: State::Listening });
    }

    #[tokio::test]
    async fn test_voice_stop_removes_session() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_stop"}"#).await.unwrap();
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);
        assert_eq!(manager.len().await, 0);

        let err = assert_err!(manager.route(&id, r#"{"type":"ping"}"#).await);
        assert_eq!(err, SessionError::UnknownSession(id.clone()));
        assert_err!(manager.close(&id).await);
    }

    #[tokio::test]
    async fn test_late_response_after_stop_is_discarded() {
        let (backends, gate) = gated();
        let manager = create_manager(backends, SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();
        loop {
            if next_event(&mut rx).await == (EventMessage::VoiceState { state: State::Responding })
            {
                break;
            }
        }

        manager.route(&id, r#"{"type":"voice_stop"}"#).await.unwrap();
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn test_collaborator_failure_stops_session() {
        let backends = Backends::new(
            Arc::new(BrokenTranscriber),
            Arc::new(crate::backend::ScriptedResponder),
        );
        let manager = create_manager(backends, SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;
        assert_eq!(
            next_event(&mut rx).await,
            EventMessage::VoiceState { state: State::Transcribing }
        );

        match next_event(&mut rx).await {
            EventMessage::Error { code, .. } => assert_eq!(code, "ExternalCollaboratorError"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.len().await, 0);
        assert_err!(manager.route(&id, r#"{"type":"ping"}"#).await);
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let backends = Backends::new(
            Arc::new(crate::backend::PassthroughTranscriber),
            Arc::new(SleepyResponder),
        );
        let settings = SessionSettings {
            response_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = create_manager(backends, settings);
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();

        loop {
            if let EventMessage::Error {
                code,
                message,
                category,
            } = next_event(&mut rx).await
            {
                assert_eq!(code, "TimeoutError");
                assert_eq!(message, "response generator timed out after 50ms");
                assert_eq!(category.as_deref(), Some("ExternalCollaboratorError"));
                break;
            }
        }
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);
    }

    #[tokio::test]
    async fn test_listen_timeout() {
        let settings = SessionSettings {
            listen_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let manager = create_manager(Backends::local(), settings);
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        match next_event(&mut rx).await {
            EventMessage::Error { code, .. } => assert_eq!(code, "TimeoutError"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);
    }

    /// The event channel closes once nothing holds the session any more
    async fn assert_released(rx: &mut mpsc::UnboundedReceiver<EventMessage>) {
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("session still held by a pending task");
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_stop_aborts_listen_timer() {
        let settings = SessionSettings {
            listen_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let manager = create_manager(Backends::local(), settings);
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        manager.route(&id, r#"{"type":"voice_stop"}"#).await.unwrap();
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);
        assert_released(&mut rx).await;
    }

    #[tokio::test]
    async fn test_input_aborts_listen_timer() {
        let (backends, _gate) = gated();
        let settings = SessionSettings {
            listen_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let manager = create_manager(backends, settings);
        let (id, mut rx) = open(&manager).await;

        manager.route(&id, r#"{"type":"voice_start","mode":"tutor"}"#).await.unwrap();
        manager.route(&id, r#"{"type":"text_input","text":"Hello"}"#).await.unwrap();
        loop {
            if next_event(&mut rx).await == (EventMessage::VoiceState { state: State::Responding })
            {
                break;
            }
        }

        // the gated generate call is the only task left; closing aborts it too
        manager.close(&id).await.unwrap();
        assert_eq!(next_event(&mut rx).await, EventMessage::VoiceStopped);
        assert_released(&mut rx).await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (a, mut rx_a) = open(&manager).await;
        let (b, mut rx_b) = open(&manager).await;
        assert_ne!(a, b);
        assert_eq!(manager.len().await, 2);

        manager.route(&a, r#"{"type":"voice_start","mode":"unknown"}"#).await.unwrap();
        manager.route(&b, r#"{"type":"voice_start","mode":"hybrid"}"#).await.unwrap();

        assert!(matches!(
            next_event(&mut rx_a).await,
            EventMessage::Error { ref code, .. } if code == "InvalidModeError"
        ));
        assert_eq!(
            next_event(&mut rx_b).await,
            EventMessage::VoiceStarted { mode: "hybrid".into() }
        );

        manager.close(&a).await.unwrap();
        assert_eq!(next_event(&mut rx_a).await, EventMessage::VoiceStopped);
        assert_eq!(manager.len().await, 1);
        assert_ok!(manager.route(&b, r#"{"type":"ping"}"#).await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (_a, mut rx_a) = open(&manager).await;
        let (_b, mut rx_b) = open(&manager).await;

        manager.close_all().await;
        assert_eq!(manager.len().await, 0);
        assert_eq!(next_event(&mut rx_a).await, EventMessage::VoiceStopped);
        assert_eq!(next_event(&mut rx_b).await, EventMessage::VoiceStopped);
    }

    #[tokio::test]
    async fn test_reject_binary_frame() {
        let manager = create_manager(Backends::local(), SessionSettings::default());
        let (id, mut rx) = open(&manager).await;

        manager
            .reject(&id, SessionError::MalformedMessage("binary frames are not supported".into()))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            EventMessage::Error { ref code, .. } if code == "MalformedMessageError"
        ));
        assert_eq!(manager.len().await, 1);
    }
}
