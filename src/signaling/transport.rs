//! WebSocket transport for the signaling channel
//!
//! A background task owns the socket. Outbound messages go through a command
//! channel; inbound frames are parsed and delivered in arrival order on an
//! event channel. Connection state is published through a `watch` channel.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

/// Socket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Error => write!(f, "error"),
        }
    }
}

/// What the transport reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket is open (fires again after every reconnect)
    Opened,
    /// Parsed server message
    Message(ServerMessage),
    /// Socket closed by the server or the network
    Closed { reason: Option<String> },
    /// Connection attempt or socket failed
    Failed(String),
}

/// Outbound side of the signaling channel
///
/// Sending never blocks. When the socket is not open the message is dropped
/// with a warning and an error is returned.
pub trait SignalSender: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

enum Command {
    Send(ClientMessage),
    Close,
}

enum SessionEnd {
    ClientClosed,
    Remote(Option<String>),
    Failed(String),
}

/// WebSocket signaling client
pub struct SignalingClient {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<TransportState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Start connecting to `url` in the background
    ///
    /// Returns the client handle and the receiver of transport events.
    pub fn connect(
        url: impl Into<String>,
        config: SignalingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);

        let task = tokio::spawn(connection_loop(
            url.into(),
            config,
            state_tx,
            event_tx,
            command_rx,
        ));

        let client = Self {
            command_tx,
            state_rx,
            task: Mutex::new(Some(task)),
        };
        (client, event_rx)
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Close the socket and stop the background task
    pub async fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Signaling task did not stop in time");
            }
        }
    }
}

impl SignalSender for SignalingClient {
    fn send(&self, message: ClientMessage) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            warn!("Signaling socket {}, dropping {}", state, message.kind());
            return Err(AppError::Signaling(format!("socket is {}", state)));
        }

        debug!("Sending {}", message.kind());
        self.command_tx
            .send(Command::Send(message))
            .map_err(|_| AppError::Signaling("signaling task stopped".to_string()))
    }
}

async fn connection_loop(
    url: String,
    config: SignalingConfig,
    state_tx: watch::Sender<TransportState>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut reconnect_delay = config.reconnect_delay_secs.max(1);

    loop {
        let _ = state_tx.send(TransportState::Connecting);
        info!("Connecting to signaling server {}", url);

        match tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs.max(1);
                let _ = state_tx.send(TransportState::Connected);
                let _ = event_tx.send(TransportEvent::Opened);
                info!("Signaling connected");

                match run_session(ws_stream, &event_tx, &mut command_rx).await {
                    SessionEnd::ClientClosed => {
                        let _ = state_tx.send(TransportState::Disconnected);
                        info!("Signaling closed by client");
                        return;
                    }
                    SessionEnd::Remote(reason) => {
                        info!("Signaling closed by server: {:?}", reason);
                        let _ = state_tx.send(TransportState::Disconnected);
                        let _ = event_tx.send(TransportEvent::Closed { reason });
                    }
                    SessionEnd::Failed(e) => {
                        warn!("Signaling socket error: {}", e);
                        let _ = state_tx.send(TransportState::Error);
                        let _ = event_tx.send(TransportEvent::Failed(e));
                    }
                }
            }
            Ok(Err(e)) => {
                error!("Failed to connect to signaling server: {}", e);
                let _ = state_tx.send(TransportState::Error);
                let _ = event_tx.send(TransportEvent::Failed(format!("Connection failed: {}", e)));
            }
            Err(_) => {
                error!(
                    "Signaling connection timed out after {}s",
                    config.connect_timeout_secs
                );
                let _ = state_tx.send(TransportState::Error);
                let _ = event_tx.send(TransportEvent::Failed(format!(
                    "Connection timed out after {}s",
                    config.connect_timeout_secs
                )));
            }
        }

        if !config.reconnect {
            return;
        }

        info!("Reconnecting in {} seconds", reconnect_delay);
        if !wait_backoff(Duration::from_secs(reconnect_delay), &mut command_rx).await {
            let _ = state_tx.send(TransportState::Disconnected);
            return;
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs.max(1));
    }
}

/// Sleep for the backoff delay; returns `false` if the client asked to close meanwhile
async fn wait_backoff(delay: Duration, command_rx: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = command_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    debug!("Dropping {} while reconnecting", msg.kind());
                }
                Some(Command::Close) | None => return false,
            },
        }
    }
}

async fn run_session<S>(
    ws_stream: S,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd
where
    S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", msg.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    let _ = write.close().await;
                    return SessionEnd::ClientClosed;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match ServerMessage::parse(text.as_str()) {
                    Ok(ServerMessage::Unknown) => {
                        debug!("Ignoring unknown signaling message: {}", text.as_str());
                    }
                    Ok(msg) => {
                        let _ = event_tx.send(TransportEvent::Message(msg));
                    }
                    Err(e) => {
                        warn!("Failed to parse signaling message: {}", e);
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    return SessionEnd::Remote(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                None => return SessionEnd::Remote(None),
            },
        }
    }
}
