//! WebSocket server for the voice control channel
//!
//! One connection drives one session at a time. Inbound text frames are
//! routed through the session manager; a writer task drains the session's
//! events back onto the socket in order.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::events::EventMessage;
use crate::session::{EventSink, SessionManager};

use super::protocol::{self, ControlMessage};

/// How long a closing connection may spend flushing queued events
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// How long shutdown waits for connection handlers to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// WebSocket server handling client connections
pub struct Server {
    listener: TcpListener,
    manager: SessionManager,
    shutdown_tx: broadcast::Sender<()>,
    /// Cloned into every connection handler; taken on shutdown
    handlers_tx: Mutex<Option<mpsc::Sender<()>>>,
    /// Yields `None` once every handler has dropped its sender
    handlers_rx: Mutex<mpsc::Receiver<()>>,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(addr: &str, manager: SessionManager) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (handlers_tx, handlers_rx) = mpsc::channel(1);

        info!(addr = %listener.local_addr()?, "WebSocket server listening");

        Ok(Self {
            listener,
            manager,
            shutdown_tx,
            handlers_tx: Mutex::new(Some(handlers_tx)),
            handlers_rx: Mutex::new(handlers_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let Some(handler_guard) = self.handlers_tx.lock().await.clone() else {
                        debug!(%peer, "shutting down, refusing connection");
                        continue;
                    };
                    debug!(%peer, "client connected");
                    let manager = self.manager.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        let result = Self::handle_client(stream, peer, manager, shutdown_rx);
                        if let Err(e) = result.await {
                            warn!(?e, %peer, "client handler error");
                        }
                        drop(handler_guard);
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        stream: TcpStream,
        peer: SocketAddr,
        manager: SessionManager,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let ws = tokio::select! {
            ws = tokio_tungstenite::accept_async(stream) => {
                ws.context("WebSocket handshake failed")?
            }
            _ = shutdown_rx.recv() => return Ok(()),
        };
        let (mut sink, mut source) = ws.split();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventMessage>();

        let writer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(?e, %event, "failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(?e, %peer, "failed to send event, closing writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut connection = Connection::open(manager, event_tx, peer).await?;

        loop {
            let frame = tokio::select! {
                frame = source.next() => frame,
                _ = shutdown_rx.recv() => {
                    debug!(%peer, "client handler shutting down");
                    break;
                }
            };
            let Some(frame) = frame else { break };

            match frame {
                Ok(Message::Text(text)) => connection.on_text(&text).await,
                Ok(Message::Binary(data)) => connection.on_binary(data.len()).await,
                Ok(Message::Close(_)) => {
                    debug!(%peer, "client closed connection");
                    break;
                }
                // tungstenite answers pings itself
                Ok(_) => {}
                Err(e) => {
                    warn!(?e, %peer, "WebSocket read error");
                    break;
                }
            }
        }

        connection.close().await;

        if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            debug!(%peer, "writer did not drain in time");
        }
        Ok(())
    }

    /// Close every session, then let each connection flush its final
    /// events and close frame before returning
    pub async fn shutdown(&self) {
        self.manager.close_all().await;
        let _ = self.shutdown_tx.send(());

        self.handlers_tx.lock().await.take();
        let mut handlers_rx = self.handlers_rx.lock().await;
        if tokio::time::timeout(SHUTDOWN_GRACE, handlers_rx.recv())
            .await
            .is_err()
        {
            warn!("connection handlers did not finish in time");
        }

        info!("WebSocket server shutdown complete");
    }
}

/// The session currently bound to one client connection
struct Connection {
    manager: SessionManager,
    outbound: EventSink,
    session_id: String,
    peer: SocketAddr,
}

impl Connection {
    async fn open(manager: SessionManager, outbound: EventSink, peer: SocketAddr) -> Result<Self> {
        let session_id = manager
            .open(outbound.clone())
            .await
            .context("failed to open session")?;

        info!(%peer, %session_id, "connection bound to session");

        Ok(Self {
            manager,
            outbound,
            session_id,
            peer,
        })
    }

    async fn on_text(&mut self, text: &str) {
        match self.manager.route(&self.session_id, text).await {
            Ok(()) => {}
            Err(SessionError::UnknownSession(_)) => self.on_stopped_session(text).await,
            Err(e) => warn!(peer = %self.peer, error = %e, "failed to route message"),
        }
    }

    /// The bound session has stopped. `voice_stop` is acknowledged again and
    /// `voice_start` brings up a new session; anything else is an error.
    async fn on_stopped_session(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(ControlMessage::VoiceStart { .. }) => {}
            Ok(ControlMessage::VoiceStop) => {
                debug!(peer = %self.peer, session_id = %self.session_id, "session already stopped");
                let _ = self.outbound.send(EventMessage::VoiceStopped);
                return;
            }
            _ => {
                self.send_error(&SessionError::UnknownSession(self.session_id.clone()));
                return;
            }
        }

        let session_id = match self.manager.open(self.outbound.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.send_error(&e);
                return;
            }
        };

        info!(
            peer = %self.peer,
            previous = %self.session_id,
            %session_id,
            "connection bound to new session"
        );
        self.session_id = session_id;

        if let Err(e) = self.manager.route(&self.session_id, text).await {
            warn!(peer = %self.peer, error = %e, "failed to route message to new session");
        }
    }

    async fn on_binary(&self, len: usize) {
        debug!(peer = %self.peer, len, "binary frame received");
        let err = SessionError::MalformedMessage("binary frames are not supported".into());

        if self.manager.reject(&self.session_id, err.clone()).await.is_err() {
            self.send_error(&err);
        }
    }

    /// Errors that belong to no live session go straight to the socket
    fn send_error(&self, err: &SessionError) {
        let _ = self.outbound.send(err.into());
    }

    async fn close(self) {
        if let Err(e) = self.manager.close(&self.session_id).await {
            debug!(peer = %self.peer, error = %e, "session already closed");
        }
    }
}
