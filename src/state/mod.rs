//! State machine module for voice sessions
//!
//! Provides an explicit state machine with five states:
//! - Idle: session open, voice not started
//! - Listening: waiting for the next input
//! - Transcribing: waiting on the transcription service
//! - Responding: waiting on the response generator
//! - Stopped: terminal

mod machine;

pub use machine::{Completion, Request, State, StateMachine, Step};
