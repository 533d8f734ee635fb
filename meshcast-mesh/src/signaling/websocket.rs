//! WebSocket signaling client
//!
//! Keeps one connection to the signaling server, re-announces the local peer
//! with a `join` on every (re)connect and reconnects with exponential backoff.
//! A normal close (code 1000) ends the session without reconnecting.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{SinkExt, StreamExt};
use meshcast_core::{Error, PeerId, Result, RoomId, SignalingConfig};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{PeerInfo, SignalingErrorKind, SignalingEvent, WireMessage};
use super::SignalingGateway;

#[derive(Debug, Clone)]
pub struct WebSocketSignalingConfig {
    pub server_url: String,
    pub room_id: RoomId,
    pub peer_id: PeerId,
    /// Retries after the first failed connect, so at most
    /// `reconnect_attempts + 1` connects per outage
    pub reconnect_attempts: u32,
    pub reconnect_base: Duration,
}

impl WebSocketSignalingConfig {
    #[must_use]
    pub fn from_config(config: &SignalingConfig, peer_id: PeerId) -> Self {
        Self {
            server_url: config.server_url.clone(),
            room_id: RoomId::new(config.room_id.clone()),
            peer_id,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
        }
    }
}

/// How a single connection ended
enum SessionEnd {
    /// Local shutdown or a normal close from the server
    Finished,
    /// Transport dropped; reconnect
    Lost,
}

pub struct WebSocketSignaling {
    config: WebSocketSignalingConfig,
    peer_info: Arc<RwLock<PeerInfo>>,
    outbound_tx: mpsc::UnboundedSender<WireMessage>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    /// Start the connection task. Events begin flowing immediately.
    pub fn connect(config: WebSocketSignalingConfig, peer_info: PeerInfo) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer_info = Arc::new(RwLock::new(peer_info));
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            config.clone(),
            Arc::clone(&peer_info),
            outbound_rx,
            event_tx,
            Arc::clone(&connected),
            cancel.clone(),
        ));

        Arc::new(Self {
            config,
            peer_info,
            outbound_tx,
            event_rx: Mutex::new(Some(event_rx)),
            connected,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Replace the presence info sent with the next `join`
    pub fn set_peer_info(&self, info: PeerInfo) {
        *self.peer_info.write() = info;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.config.peer_id
    }
}

#[async_trait]
impl SignalingGateway for WebSocketSignaling {
    async fn send(&self, message: WireMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Signaling("websocket is not open".to_string()));
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| Error::Signaling("signaling task stopped".to_string()))
    }

    /// Also remembered, so a `join` after a reconnect carries the latest info
    async fn send_peer_update(&self, peer_id: &PeerId, info: PeerInfo) -> Result<()> {
        if *peer_id == self.config.peer_id {
            self.set_peer_info(info.clone());
        }
        self.send(WireMessage::PeerUpdate {
            peer_id: peer_id.clone(),
            peer_info: info,
        })
        .await
    }

    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.event_rx.lock().take()
    }

    async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn report_transport_error(
    event_tx: &mpsc::UnboundedSender<SignalingEvent>,
    err: &tokio_tungstenite::tungstenite::Error,
) {
    let _ = event_tx.send(SignalingEvent::Error(SignalingErrorKind::Transport(
        err.to_string(),
    )));
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    config: WebSocketSignalingConfig,
    peer_info: Arc<RwLock<PeerInfo>>,
    mut outbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let build_backoff = || {
        ExponentialBuilder::default()
            .with_min_delay(config.reconnect_base)
            .with_factor(2.0)
            .with_max_times(config.reconnect_attempts as usize)
            .build()
    };
    let mut backoff = build_backoff();
    let mut failed_attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_async(config.server_url.as_str()).await {
            Ok((ws, _)) => {
                info!(
                    peer_id = %config.peer_id,
                    room_id = %config.room_id,
                    url = %config.server_url,
                    "Signaling connected"
                );
                backoff = build_backoff();
                failed_attempts = 0;

                let end = run_session(
                    ws,
                    &config,
                    &peer_info,
                    &mut outbound_rx,
                    &event_tx,
                    &connected,
                    &cancel,
                )
                .await;

                connected.store(false, Ordering::Release);
                let _ = event_tx.send(SignalingEvent::Disconnected);

                if matches!(end, SessionEnd::Finished) {
                    break;
                }
            }
            Err(e) => {
                failed_attempts += 1;
                warn!(
                    url = %config.server_url,
                    attempt = failed_attempts,
                    error = %e,
                    "Signaling connect failed"
                );
                report_transport_error(&event_tx, &e);
            }
        }

        let Some(delay) = backoff.next() else {
            error!(
                url = %config.server_url,
                attempts = config.reconnect_attempts,
                "Signaling reconnect exhausted"
            );
            let _ = event_tx.send(SignalingEvent::Error(
                SignalingErrorKind::ReconnectExhausted {
                    attempts: config.reconnect_attempts,
                },
            ));
            break;
        };

        debug!(delay_ms = delay.as_millis() as u64, "Signaling reconnect scheduled");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    config: &WebSocketSignalingConfig,
    peer_info: &RwLock<PeerInfo>,
    outbound_rx: &mut mpsc::UnboundedReceiver<WireMessage>,
    event_tx: &mpsc::UnboundedSender<SignalingEvent>,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    let join = WireMessage::Join {
        room_id: config.room_id.clone(),
        peer_id: config.peer_id.clone(),
        peer_info: peer_info.read().clone(),
    };
    match serde_json::to_string(&join) {
        Ok(text) => {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                warn!(error = %e, "Failed to send join");
                report_transport_error(event_tx, &e);
                return SessionEnd::Lost;
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to encode join");
            return SessionEnd::Finished;
        }
    }

    connected.store(true, Ordering::Release);
    let _ = event_tx.send(SignalingEvent::Connected);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                return SessionEnd::Finished;
            }
            Some(message) = outbound_rx.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Signaling send failed");
                    report_transport_error(event_tx, &e);
                    return SessionEnd::Lost;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WireMessage>(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = message.into_event() {
                                let _ = event_tx.send(event);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Unrecognized signaling message");
                            let _ = event_tx.send(SignalingEvent::Error(
                                SignalingErrorKind::Protocol(e.to_string()),
                            ));
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal);
                    info!(normal, "Signaling server closed the connection");
                    return if normal { SessionEnd::Finished } else { SessionEnd::Lost };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Signaling connection error");
                    report_transport_error(event_tx, &e);
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
        }
    }
}
