//! Mode registry module
//!
//! Interaction modes are named response-style profiles. The registry is
//! built once at startup and shared read-only by every session.

mod registry;

pub use registry::{Mode, ModeRegistry, ResponseStyle, UnknownModeError};
