//! Session manager module
//!
//! Owns every live session, serializes the work done for each one, and
//! runs external requests as tasks whose results re-enter the session
//! through its dispatcher.

mod manager;

pub use manager::{EventSink, SessionManager, SessionSettings};
