//! Runtime link - live connection to the interpreter process.
//!
//! This module is responsible for:
//! - Holding the WebSocket connection to the running interpreter
//! - Sending verbosity hints and field-info requests (fire-and-forget)
//! - Receiving execution traces and feeding them to the engine
//!
//! # Architecture
//!
//! ```text
//! Engine --[setLogStat/reqFieldInfo]--> RuntimeLink --> interpreter
//!    ^                                                      |
//!    +---------------[printLog via reader thread]-----------+
//! ```
//!
//! The connection is best-effort: the interpreter may not be running at
//! all. Send failures are logged and dropped, read failures drive the state
//! machine to `Disconnected`, and reconnecting is always a fresh
//! [`RuntimeLink::connect`].

mod protocol;

pub use protocol::{Command, ProtocolError};

use std::{
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tungstenite::{WebSocket, protocol::Message, stream::MaybeTlsStream};

use crate::engine::EngineMsg;
use crate::{debug, log};

/// How often the reader thread polls the socket.
const READ_POLL_MS: u64 = 50;

/// Connection lifecycle. Terminal transitions always land on
/// `Disconnected`; there is no automatic reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection to interpreter failed: {0}")]
    Connect(#[from] Box<tungstenite::Error>),

    #[error("could not switch socket to non-blocking mode: {0}")]
    Configure(#[source] std::io::Error),
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// One live connection. Owned by the engine; dropped (after `shutdown`) on
/// disconnect or peer failure.
pub struct RuntimeLink {
    socket: Arc<Mutex<Socket>>,
    closed: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl RuntimeLink {
    /// Dial the interpreter and start the receive loop.
    ///
    /// Blocking; the engine runs this on a throwaway thread so the mutation
    /// context never stalls behind a slow handshake.
    pub fn connect(url: &str, engine_tx: mpsc::Sender<EngineMsg>) -> Result<Self, LinkError> {
        let (socket, _response) = tungstenite::connect(url).map_err(Box::new)?;

        // Handshake ran blocking; reads are polled from here on.
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream.set_nonblocking(true).map_err(LinkError::Configure)?;
        }

        let socket = Arc::new(Mutex::new(socket));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let socket = Arc::clone(&socket);
            let closed = Arc::clone(&closed);
            std::thread::spawn(move || reader_loop(socket, closed, engine_tx))
        };

        Ok(Self {
            socket,
            closed,
            reader: Some(reader),
        })
    }

    /// Send one command, fire-and-forget.
    ///
    /// A failure is logged and dropped: this is a verbosity hint, not an
    /// acknowledged transaction, and the caller's optimistic local state
    /// stays as-is.
    pub fn send(&self, command: &Command) {
        let frame = command.encode();
        let mut socket = self.socket.lock();
        if let Err(e) = socket.send(Message::Text(frame.into())) {
            log!("link"; "send failed ({}): {}", command.encode(), e);
        }
    }

    /// Close the socket and wait for the reader to exit.
    pub fn shutdown(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut socket = self.socket.lock();
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for RuntimeLink {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.shutdown();
        }
    }
}

/// Poll the socket for inbound frames, dispatching traces to the engine.
///
/// Exits when the peer closes, the socket errors, or `closed` is raised
/// locally; only the first two notify the engine.
fn reader_loop(socket: Arc<Mutex<Socket>>, closed: Arc<AtomicBool>, engine_tx: mpsc::Sender<EngineMsg>) {
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let read = { socket.lock().read() };
        match read {
            Ok(Message::Text(text)) => {
                if handle_frame(text.as_str(), &socket, &closed, &engine_tx).is_err() {
                    return; // engine gone, nothing left to notify
                }
            }
            Ok(Message::Close(_)) => {
                let _ = post(&engine_tx, &closed, EngineMsg::LinkClosed { reason: None });
                return;
            }
            // Control frames are answered by tungstenite itself.
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(READ_POLL_MS));
            }
            Err(e) => {
                if !closed.load(Ordering::SeqCst) {
                    let _ = post(
                        &engine_tx,
                        &closed,
                        EngineMsg::LinkClosed {
                            reason: Some(e.to_string()),
                        },
                    );
                }
                return;
            }
        }
    }
}

/// Post a message to the engine without ever blocking past shutdown.
///
/// The engine joins this thread while holding the receiving end open, so an
/// unbounded blocking send could deadlock the join; instead retry briefly
/// and bail once `closed` is raised or the retries run out.
fn post(
    engine_tx: &mpsc::Sender<EngineMsg>,
    closed: &AtomicBool,
    msg: EngineMsg,
) -> Result<(), ()> {
    use tokio::sync::mpsc::error::TrySendError;

    let mut pending = Some(msg);
    for _ in 0..200 {
        if closed.load(Ordering::SeqCst) {
            return Err(());
        }
        match engine_tx.try_send(pending.take().ok_or(())?) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(msg)) => {
                pending = Some(msg);
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(TrySendError::Closed(_)) => return Err(()),
        }
    }
    log!("link"; "engine queue saturated, dropping an inbound message");
    Ok(())
}

/// Decode and dispatch one inbound frame. `Err` means the engine channel is
/// closed.
fn handle_frame(
    frame: &str,
    socket: &Arc<Mutex<Socket>>,
    closed: &AtomicBool,
    engine_tx: &mpsc::Sender<EngineMsg>,
) -> Result<(), ()> {
    match Command::parse(frame) {
        Ok(Command::PrintLog { rule_id, tokens }) => {
            post(engine_tx, closed, EngineMsg::RuleLogged { rule_id, tokens })
        }
        Ok(Command::Ping { ts }) => {
            let mut socket = socket.lock();
            if let Err(e) = socket.send(Message::Text(Command::Pong { ts }.encode().into())) {
                debug!("link"; "pong failed: {}", e);
            }
            Ok(())
        }
        Ok(other) => {
            debug!("link"; "ignoring unexpected inbound frame: {}", other.encode());
            Ok(())
        }
        Err(e) => {
            log!("link"; "discarding malformed frame `{}`: {}", frame, e);
            Ok(())
        }
    }
}
