//! Core session state machine
//!
//! Handles transitions between Idle, Listening, Transcribing, Responding
//! and Stopped. External work is never performed here: transitions that
//! need it hand back a `Request`, and the result comes back later as a
//! `Completion` tagged with the generation it was issued under.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Generated, Input};
use crate::error::SessionError;
use crate::events::EventMessage;
use crate::modes::{Mode, ModeRegistry};

/// The five possible states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Created, waiting for `voice_start`
    #[default]
    Idle,
    /// Waiting for the next input
    Listening,
    /// Input handed to the transcription service
    Transcribing,
    /// Transcript handed to the response generator
    Responding,
    /// Terminal; the session is destroyed after entering it
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::Listening => write!(f, "listening"),
            State::Transcribing => write!(f, "transcribing"),
            State::Responding => write!(f, "responding"),
            State::Stopped => write!(f, "stopped"),
        }
    }
}

/// External work a transition asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Transcribe {
        generation: u64,
        input: Input,
    },
    Generate {
        generation: u64,
        text: String,
        mode: Arc<Mode>,
    },
    /// Fail the session if nothing arrives while listening
    ListenTimeout { generation: u64, after: Duration },
}

impl Request {
    pub fn generation(&self) -> u64 {
        match self {
            Request::Transcribe { generation, .. }
            | Request::Generate { generation, .. }
            | Request::ListenTimeout { generation, .. } => *generation,
        }
    }
}

/// Result of a `Request`, fed back into the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Transcribed {
        generation: u64,
        text: String,
    },
    Responded {
        generation: u64,
        /// Mode the response was generated in
        mode: String,
        response: Generated,
    },
    Failed {
        generation: u64,
        error: BackendError,
    },
}

impl Completion {
    pub fn generation(&self) -> u64 {
        match self {
            Completion::Transcribed { generation, .. }
            | Completion::Responded { generation, .. }
            | Completion::Failed { generation, .. } => *generation,
        }
    }
}

/// Output of one transition: events in emission order, plus follow-up work
#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<EventMessage>,
    pub request: Option<Request>,
}

impl Step {
    pub fn event(event: EventMessage) -> Self {
        Self {
            events: vec![event],
            request: None,
        }
    }

    pub fn rejected(err: &SessionError) -> Self {
        Self::event(err.into())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.request.is_none()
    }
}

/// State machine for one voice session
pub struct StateMachine {
    session_id: String,
    state: State,
    mode: Arc<Mode>,
    registry: Arc<ModeRegistry>,
    /// Bumped on every transition; completions from older generations are stale
    generation: u64,
    listen_timeout: Option<Duration>,
    state_entered_at: Instant,
}

impl StateMachine {
    /// Create a machine in `Idle` with the given initial mode
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<ModeRegistry>,
        mode: Arc<Mode>,
        listen_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: State::Idle,
            mode,
            registry,
            generation: 0,
            listen_timeout,
            state_entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> &Arc<Mode> {
        &self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    /// `idle --start--> listening`
    pub fn start(&mut self, mode: &str) -> Result<Step, SessionError> {
        match self.state {
            State::Idle => {}
            State::Stopped => return Err(SessionError::SessionStopped),
            state => {
                return Err(SessionError::InvalidState {
                    message: "voice_start",
                    state,
                })
            }
        }

        self.mode = self.registry.resolve(mode)?;

        let mut step = Step::event(EventMessage::VoiceStarted {
            mode: self.mode.name.clone(),
        });
        self.transition_to(State::Listening, &mut step);
        Ok(step)
    }

    /// `listening --input_received--> transcribing`
    pub fn input(&mut self, input: Input) -> Result<Step, SessionError> {
        let message = match input {
            Input::Text(_) => "text_input",
            Input::Audio(_) => "audio_input",
        };

        match self.state {
            State::Listening => {}
            State::Stopped => return Err(SessionError::SessionStopped),
            state => return Err(SessionError::InvalidState { message, state }),
        }

        let mut step = Step::default();
        self.transition_to(State::Transcribing, &mut step);
        step.request = Some(Request::Transcribe {
            generation: self.generation,
            input,
        });
        Ok(step)
    }

    /// `any --mode_change--> same state`
    pub fn change_mode(&mut self, mode: &str) -> Result<Step, SessionError> {
        if self.state == State::Stopped {
            return Err(SessionError::SessionStopped);
        }

        let mode = self.registry.resolve(mode)?;
        let previous = std::mem::replace(&mut self.mode, mode);

        info!(
            session_id = %self.session_id,
            from = %previous,
            to = %self.mode,
            state = %self.state,
            "mode changed"
        );

        Ok(Step::event(EventMessage::ModeChanged {
            mode: self.mode.name.clone(),
            previous: previous.name.clone(),
        }))
    }

    /// `any --stop--> stopped`. Stopping twice is a no-op that still acknowledges.
    pub fn stop(&mut self) -> Step {
        let mut step = Step::default();
        if self.state == State::Stopped {
            debug!(session_id = %self.session_id, "stop on stopped session");
            step.events.push(EventMessage::VoiceStopped);
        } else {
            self.transition_to(State::Stopped, &mut step);
        }
        step
    }

    /// Apply the result of an external request.
    ///
    /// Completions from a stale generation, or arriving after stop, are
    /// dropped without emitting anything.
    pub fn complete(&mut self, completion: Completion) -> Step {
        if self.state == State::Stopped || completion.generation() != self.generation {
            debug!(
                session_id = %self.session_id,
                generation = completion.generation(),
                current = self.generation,
                state = %self.state,
                "discarding stale completion"
            );
            return Step::default();
        }

        let mut step = Step::default();
        match (completion, self.state) {
            (Completion::Transcribed { text, .. }, State::Transcribing) => {
                step.events.push(EventMessage::VoiceTranscript { text: text.clone() });

                if text.trim().is_empty() {
                    debug!(session_id = %self.session_id, "empty transcript, listening again");
                    self.transition_to(State::Listening, &mut step);
                } else {
                    self.transition_to(State::Responding, &mut step);
                    step.request = Some(Request::Generate {
                        generation: self.generation,
                        text,
                        mode: Arc::clone(&self.mode),
                    });
                }
            }
            (Completion::Responded { mode, response, .. }, State::Responding) => {
                step.events.push(EventMessage::TextResponse {
                    text: response.text,
                    mode,
                    usage: response.usage,
                    suggested_mode: response.suggested_mode,
                });
                self.transition_to(State::Listening, &mut step);
            }
            (Completion::Failed { error, .. }, _) => {
                warn!(
                    session_id = %self.session_id,
                    %error,
                    state = %self.state,
                    "external collaborator failed"
                );
                let err = SessionError::from(error);
                step.events.push((&err).into());
                self.transition_to(State::Stopped, &mut step);
            }
            (completion, state) => {
                warn!(
                    session_id = %self.session_id,
                    ?completion,
                    %state,
                    "completion does not match state, ignoring"
                );
            }
        }
        step
    }

    /// Perform a state transition, appending its events to `step`
    fn transition_to(&mut self, new_state: State, step: &mut Step) {
        let old_state = self.state;
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        self.generation += 1;
        self.state = new_state;
        self.state_entered_at = Instant::now();

        info!(
            session_id = %self.session_id,
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            generation = self.generation,
            "state transition"
        );

        match new_state {
            State::Stopped => step.events.push(EventMessage::VoiceStopped),
            state => step.events.push(EventMessage::VoiceState { state }),
        }

        if let (State::Listening, Some(after)) = (new_state, self.listen_timeout) {
            step.request = Some(Request::ListenTimeout {
                generation: self.generation,
                after,
            });
        }
    }
}
