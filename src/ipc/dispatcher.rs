//! Control channel dispatcher
//!
//! Turns raw inbound frames into state machine calls. Every failure is
//! converted into exactly one `error` event; nothing is raised back into
//! the transport.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::Input;
use crate::error::SessionError;
use crate::events::{EventMessage, SessionStatus};
use crate::modes::{ModeRegistry, UnknownModeError};
use crate::state::{Completion, State, StateMachine, Step};

use super::protocol::{self, ControlMessage};

/// Dispatcher for one session's control channel
pub struct Dispatcher {
    session_id: String,
    machine: StateMachine,
}

impl Dispatcher {
    /// Create a dispatcher whose session starts `Idle` in `default_mode`
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<ModeRegistry>,
        default_mode: &str,
        listen_timeout: Option<Duration>,
    ) -> Result<Self, UnknownModeError> {
        let session_id = session_id.into();
        let mode = registry.resolve(default_mode)?;
        let machine = StateMachine::new(session_id.clone(), registry, mode, listen_timeout);

        Ok(Self {
            session_id,
            machine,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn mode(&self) -> &str {
        &self.machine.mode().name
    }

    /// Generation of the current state; requests from older ones are stale
    pub fn generation(&self) -> u64 {
        self.machine.generation()
    }

    pub fn is_stopped(&self) -> bool {
        self.machine.state() == State::Stopped
    }

    /// Process one raw inbound message to completion
    pub fn dispatch(&mut self, raw: &str) -> Step {
        let message = match protocol::decode(raw) {
            Ok(message) => message,
            Err(err) => return self.reject(err),
        };

        debug!(
            session_id = %self.session_id,
            kind = message.kind(),
            state = %self.machine.state(),
            "dispatching message"
        );

        match self.handle(message) {
            Ok(step) => step,
            Err(err) => self.reject(err),
        }
    }

    /// Apply the result of an external request
    pub fn complete(&mut self, completion: Completion) -> Step {
        self.machine.complete(completion)
    }

    /// Force the session into `Stopped`
    pub fn stop(&mut self) -> Step {
        self.machine.stop()
    }

    /// Report a message that never reached the state machine
    pub fn reject(&self, err: SessionError) -> Step {
        warn!(
            session_id = %self.session_id,
            code = err.code(),
            error = %err,
            "inbound message rejected"
        );
        Step::rejected(&err)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.machine.state(),
            mode: self.machine.mode().name.clone(),
            modes: self.machine.registry().list(),
            generation: self.machine.generation(),
        }
    }

    fn handle(&mut self, message: ControlMessage) -> Result<Step, SessionError> {
        match message {
            ControlMessage::VoiceStart { mode } => self.machine.start(&mode),
            ControlMessage::TextInput { text } => self.machine.input(Input::Text(text)),
            ControlMessage::AudioInput { handle } => self.machine.input(Input::Audio(handle)),
            ControlMessage::VoiceMode { mode } => self.machine.change_mode(&mode),
            ControlMessage::VoiceStop => Ok(self.machine.stop()),
            ControlMessage::Ping => Ok(Step::event(EventMessage::Pong)),
            ControlMessage::GetStatus => Ok(Step::event(EventMessage::Status(self.status()))),
        }
    }
}
