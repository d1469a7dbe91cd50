//! OOB transport connection (§4.B): a reliable full-duplex byte-message
//! channel (BLE GATT, Wi-Fi Aware, ...) carrying encoded `OobMessage`s.
//!
//! Two layers: [`RawTransport`] is the thin physical-layer trait a concrete
//! backend implements (send/recv/close on raw bytes, nothing else).
//! [`TransportConnection`] is the actor sitting on top of it that owns the
//! real state machine — `{CONNECTED, DISCONNECTED, CLOSED}`, the three FIFO
//! queues, and the 5 s disconnect timer — driven both by its own read loop
//! over the `RawTransport` and by whatever external supervisor observes the
//! physical link (`on_disconnect`/`on_reconnect`/`on_closed`). [`OobChannel`]
//! wraps a `TransportConnection` with message framing and a per-message
//! receive timeout for the negotiator to use.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ranging_wire::{codec, DeviceId, OobMessage, RangingError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Sleep};
use tracing::{debug, warn};

const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Why a transport connection ended, independent of anything ranging- or
/// negotiation-specific happening above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCloseReason {
    Requested,
    TransportClosed,
    TransportTimeout,
}

/// A single physical-layer OOB byte-stream connection to one peer. Backends
/// (BLE GATT, Wi-Fi Aware, the in-memory test double) implement only this —
/// the queueing, disconnect handling, and timeout live in
/// [`TransportConnection`] above it.
#[async_trait]
pub trait RawTransport: Send + Sync {
    fn peer(&self) -> DeviceId;

    async fn send(&mut self, bytes: Bytes) -> Result<(), RangingError>;

    /// `Ok(None)` signals a clean close by the peer.
    async fn recv(&mut self) -> Result<Option<Bytes>, RangingError>;

    async fn close(&mut self) -> Result<(), RangingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Connected,
    Disconnected,
    Closed,
}

enum Command {
    Send(Bytes, oneshot::Sender<Result<(), RangingError>>),
    Receive(oneshot::Sender<Result<Bytes, RangingError>>),
    Close(TransportCloseReason, oneshot::Sender<Result<(), RangingError>>),
    OnDisconnect,
    OnReconnect,
    OnClosed,
}

/// Handle to the connection actor. Cheap to clone: the data-plane methods
/// (`send`/`receive`/`close`) and the supervisor-facing ones
/// (`on_disconnect`/`on_reconnect`/`on_closed`) are both just messages onto
/// the same command channel, so whatever owns the physical link can hold a
/// clone purely to report link state without touching the byte stream.
#[derive(Clone)]
pub struct TransportConnection {
    peer: DeviceId,
    cmd_tx: mpsc::Sender<Command>,
}

impl TransportConnection {
    /// Spawns the actor owning `raw` and returns a handle to it.
    pub fn spawn(raw: Box<dyn RawTransport>) -> Self {
        let peer = raw.peer();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run(raw, cmd_rx));
        Self { peer, cmd_tx }
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// In `CONNECTED`, handed to the transport immediately; in
    /// `DISCONNECTED`, queued FIFO and flushed on reconnect; in `CLOSED`,
    /// fails immediately.
    pub async fn send(&self, bytes: Bytes) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send(bytes, reply_tx))
            .await
            .map_err(|_| RangingError::Transport("transport actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("transport actor dropped the reply".into()))?
    }

    /// Completes immediately if a byte message is already queued; otherwise
    /// waits its turn in FIFO order. Fails immediately in `CLOSED`.
    pub async fn receive(&self) -> Result<Bytes, RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Receive(reply_tx))
            .await
            .map_err(|_| RangingError::Transport("transport actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("transport actor dropped the reply".into()))?
    }

    /// Idempotent; moves to `CLOSED`, fails all pending receivers with
    /// `reason`, and drops buffered data.
    pub async fn close(&self, reason: TransportCloseReason) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(reason, reply_tx))
            .await
            .map_err(|_| RangingError::Transport("transport actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("transport actor dropped the reply".into()))?
    }

    /// Reported by whatever owns the physical link (BLE connection
    /// supervisor, Wi-Fi Aware session, ...) when it loses the peer without
    /// the connection itself having been asked to close. Arms the 5 s
    /// disconnect timer.
    pub async fn on_disconnect(&self) {
        let _ = self.cmd_tx.send(Command::OnDisconnect).await;
    }

    /// Reported when the physical link returns after a disconnect. Cancels
    /// the disconnect timer and flushes queued sends in FIFO order.
    pub async fn on_reconnect(&self) {
        let _ = self.cmd_tx.send(Command::OnReconnect).await;
    }

    /// Reported when the physical link is gone for good.
    pub async fn on_closed(&self) {
        let _ = self.cmd_tx.send(Command::OnClosed).await;
    }
}

async fn run(mut raw: Box<dyn RawTransport>, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut state = TransportState::Connected;
    let mut send_queue: VecDeque<Bytes> = VecDeque::new();
    let mut recv_queue: VecDeque<Bytes> = VecDeque::new();
    let mut waiters: VecDeque<oneshot::Sender<Result<Bytes, RangingError>>> = VecDeque::new();
    let mut disconnect_deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        let reading = state == TransportState::Connected;
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Send(bytes, reply) => {
                        let result = match state {
                            TransportState::Connected => raw.send(bytes).await,
                            TransportState::Disconnected => {
                                send_queue.push_back(bytes);
                                Ok(())
                            }
                            TransportState::Closed => {
                                Err(closed_error(TransportCloseReason::TransportClosed))
                            }
                        };
                        let _ = reply.send(result);
                    }
                    Command::Receive(reply) => {
                        if state == TransportState::Closed {
                            let _ = reply.send(Err(closed_error(TransportCloseReason::TransportClosed)));
                        } else if let Some(bytes) = recv_queue.pop_front() {
                            let _ = reply.send(Ok(bytes));
                        } else {
                            waiters.push_back(reply);
                        }
                    }
                    Command::Close(reason, reply) => {
                        close_now(
                            &mut raw, &mut state, reason,
                            &mut send_queue, &mut recv_queue, &mut waiters, &mut disconnect_deadline,
                        ).await;
                        let _ = reply.send(Ok(()));
                    }
                    Command::OnDisconnect => {
                        if state == TransportState::Connected {
                            debug!(peer = %raw.peer(), "transport disconnected, arming timeout");
                            state = TransportState::Disconnected;
                            disconnect_deadline = Some(Box::pin(sleep(DISCONNECT_TIMEOUT)));
                        }
                    }
                    Command::OnReconnect => {
                        if state == TransportState::Disconnected {
                            debug!(peer = %raw.peer(), queued = send_queue.len(), "transport reconnected, flushing queue");
                            disconnect_deadline = None;
                            state = TransportState::Connected;
                            while let Some(bytes) = send_queue.pop_front() {
                                if let Err(err) = raw.send(bytes).await {
                                    warn!(peer = %raw.peer(), error = %err, "failed to flush queued send after reconnect");
                                }
                            }
                        }
                    }
                    Command::OnClosed => {
                        close_now(
                            &mut raw, &mut state, TransportCloseReason::TransportClosed,
                            &mut send_queue, &mut recv_queue, &mut waiters, &mut disconnect_deadline,
                        ).await;
                    }
                }
            }
            read = raw.recv(), if reading => {
                match read {
                    Ok(Some(bytes)) => {
                        if let Some(waiter) = waiters.pop_front() {
                            let _ = waiter.send(Ok(bytes));
                        } else {
                            recv_queue.push_back(bytes);
                        }
                    }
                    Ok(None) => {
                        close_now(
                            &mut raw, &mut state, TransportCloseReason::TransportClosed,
                            &mut send_queue, &mut recv_queue, &mut waiters, &mut disconnect_deadline,
                        ).await;
                    }
                    Err(err) => {
                        warn!(peer = %raw.peer(), error = %err, "transport read failed, treating as disconnect");
                        state = TransportState::Disconnected;
                        disconnect_deadline = Some(Box::pin(sleep(DISCONNECT_TIMEOUT)));
                    }
                }
            }
            _ = await_deadline(&mut disconnect_deadline) => {
                warn!(peer = %raw.peer(), "disconnected connection did not recover in time");
                disconnect_deadline = None;
                close_now(
                    &mut raw, &mut state, TransportCloseReason::TransportTimeout,
                    &mut send_queue, &mut recv_queue, &mut waiters, &mut disconnect_deadline,
                ).await;
            }
        }
    }
}

async fn close_now(
    raw: &mut Box<dyn RawTransport>,
    state: &mut TransportState,
    reason: TransportCloseReason,
    send_queue: &mut VecDeque<Bytes>,
    recv_queue: &mut VecDeque<Bytes>,
    waiters: &mut VecDeque<oneshot::Sender<Result<Bytes, RangingError>>>,
    disconnect_deadline: &mut Option<Pin<Box<Sleep>>>,
) {
    if *state == TransportState::Closed {
        return;
    }
    *state = TransportState::Closed;
    *disconnect_deadline = None;
    let _ = raw.close().await;
    send_queue.clear();
    recv_queue.clear();
    for waiter in waiters.drain(..) {
        let _ = waiter.send(Err(closed_error(reason)));
    }
}

fn closed_error(reason: TransportCloseReason) -> RangingError {
    RangingError::Transport(format!("connection closed: {reason:?}"))
}

async fn await_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

/// Wraps a [`TransportConnection`] with `OobMessage` framing (encode/decode)
/// and a per-message receive timeout, used by the negotiator.
pub struct OobChannel {
    conn: TransportConnection,
    per_message_timeout: Duration,
}

impl OobChannel {
    pub fn new(inner: Box<dyn RawTransport>, per_message_timeout: Duration) -> Self {
        Self {
            conn: TransportConnection::spawn(inner),
            per_message_timeout,
        }
    }

    pub fn peer(&self) -> DeviceId {
        self.conn.peer()
    }

    pub async fn send(&self, msg: &OobMessage) -> Result<(), RangingError> {
        let bytes = codec::encode(msg)?;
        self.conn.send(Bytes::from(bytes)).await
    }

    pub async fn recv(&self) -> Result<OobMessage, RangingError> {
        let bytes = timeout(self.per_message_timeout, self.conn.receive())
            .await
            .map_err(|_| RangingError::OobTimeout)??;
        Ok(codec::decode(&bytes)?)
    }

    pub async fn close(&self, reason: TransportCloseReason) -> Result<(), RangingError> {
        self.conn.close(reason).await
    }

    /// A handle for whatever owns the physical link to report disconnects,
    /// reconnects, and closure, independent of sending/receiving messages.
    pub fn supervisor(&self) -> TransportConnection {
        self.conn.clone()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod in_memory {
    use super::*;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    /// An in-memory transport backed by a pair of unbounded channels, used
    /// to wire an initiator and a responder together in a single test
    /// process without any real radio underneath.
    pub struct ChannelPair {
        peer: DeviceId,
        tx: UnboundedSender<Bytes>,
        rx: UnboundedReceiver<Bytes>,
        closed: bool,
    }

    /// Builds two ends of an in-memory transport: `a` sees `peer() == b_id`
    /// and vice versa.
    pub fn paired(a_id: DeviceId, b_id: DeviceId) -> (ChannelPair, ChannelPair) {
        let (tx_a_to_b, rx_a_to_b) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b_to_a, rx_b_to_a) = tokio::sync::mpsc::unbounded_channel();
        let a = ChannelPair {
            peer: b_id,
            tx: tx_a_to_b,
            rx: rx_b_to_a,
            closed: false,
        };
        let b = ChannelPair {
            peer: a_id,
            tx: tx_b_to_a,
            rx: rx_a_to_b,
            closed: false,
        };
        (a, b)
    }

    #[async_trait]
    impl RawTransport for ChannelPair {
        fn peer(&self) -> DeviceId {
            self.peer
        }

        async fn send(&mut self, bytes: Bytes) -> Result<(), RangingError> {
            if self.closed {
                return Err(RangingError::Transport("send on closed channel".into()));
            }
            self.tx
                .send(bytes)
                .map_err(|_| RangingError::Transport("peer end dropped".into()))
        }

        async fn recv(&mut self) -> Result<Option<Bytes>, RangingError> {
            if self.closed {
                return Ok(None);
            }
            Ok(self.rx.recv().await)
        }

        async fn close(&mut self) -> Result<(), RangingError> {
            self.closed = true;
            Ok(())
        }
    }
}
