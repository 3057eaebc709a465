//! Control channel: wire protocol, per-session dispatcher and WebSocket server

mod dispatcher;
mod protocol;
mod server;

pub use dispatcher::Dispatcher;
pub use server::Server;
