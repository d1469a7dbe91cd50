//! Peer session FSM (§4.G): one task per peer, states
//! `IDLE → INITIALIZING → STARTED → STOPPING → STOPPED`, driven exclusively
//! through an `mpsc` command channel — no session state is ever touched
//! from outside this task. Each peer gets its own dedicated `tokio::spawn`ed
//! loop owning its own state, rather than a shared state machine guarded by
//! a lock.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ranging_wire::{
    DeviceId, OobRangingConstraints, RangingData, RangingError, RawRangingParams, SessionConfig,
    TechnologyTag,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterSessionEvent, ClosedReason, RangingAdapter};
use crate::audit::AuditLogger;
use crate::capability::CapabilityRegistry;
use crate::filter_engine::{FilterEngine, PassthroughFilter};
use crate::fusion::PreferentialFuser;
use crate::gate::NotificationGate;
use crate::negotiator;
use crate::transport::OobChannel;

/// Timing knobs for the §4.G limit/watchdog machinery, one set shared by
/// every peer session a `SessionAggregator` spawns.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    /// No `Data` event at all within this long after `STARTED` force-closes
    /// the session.
    pub no_initial_data: Duration,
    /// No further `Data` event within this long after the last one
    /// force-closes the session.
    pub no_updated_data: Duration,
    /// How long the session tolerates `on_app_background` before forcing
    /// every active adapter closed.
    pub background: Duration,
    /// Grace period given to adapters to confirm `stop_session` before the
    /// session force-closes itself anyway.
    pub force_close: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            no_initial_data: Duration::from_secs(3),
            no_updated_data: Duration::from_secs(2),
            background: Duration::from_secs(10),
            force_close: Duration::from_secs(2),
        }
    }
}

impl From<&crate::config::ServiceConfig> for PeerTimeouts {
    fn from(config: &crate::config::ServiceConfig) -> Self {
        Self {
            no_initial_data: config.no_initial_data_timeout,
            no_updated_data: config.no_updated_data_timeout,
            background: config.background_timeout,
            force_close: config.force_close_timeout,
        }
    }
}

/// Awaits an armed deadline, or never resolves while `deadline` is `None` —
/// lets an optional timer sit alongside the other `select!` arms without a
/// separate "is this timer active" branch.
async fn await_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

fn arm(duration: Duration) -> Option<Pin<Box<Sleep>>> {
    Some(Box::pin(sleep(duration)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    Idle,
    Initializing,
    Started,
    Stopping,
    Stopped,
}

pub enum NegotiationRole {
    Initiator,
    Responder,
}

pub enum StartPreference {
    Raw(RawRangingParams),
    Oob {
        channel: OobChannel,
        constraints: OobRangingConstraints,
        session_config: SessionConfig,
        role: NegotiationRole,
    },
}

#[derive(Debug, Clone)]
pub enum PeerSessionEvent {
    StateChanged { peer: DeviceId, state: PeerSessionState },
    Data(RangingData),
    Closed { peer: DeviceId, reason: ClosedReason },
    /// Once-only lifecycle event for a `SessionAggregator::start` call that
    /// spans multiple peers (§4.H), distinct from each peer's own events.
    Aggregate(AggregateEvent),
}

/// Once-only lifecycle events for the aggregate multi-peer operation started
/// by `SessionAggregator::start` (§4.H) — distinct from the per-peer events,
/// which keep flowing for as long as each individual peer session lives.
#[derive(Debug, Clone)]
pub enum AggregateEvent {
    /// Every peer in the request reached `STARTED`.
    Opened,
    /// At least one peer failed to start; ranging with the others, if any,
    /// was torn down rather than left partially running.
    OpenFailed { reason: RangingError },
    /// Every peer session that `Opened` has now ended.
    Closed,
}

enum PeerCommand {
    Start {
        preference: StartPreference,
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    Background {
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    Foreground {
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
}

#[derive(Clone)]
pub struct PeerSessionHandle {
    pub peer: DeviceId,
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl PeerSessionHandle {
    pub async fn start(&self, preference: StartPreference) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Start {
                preference,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RangingError::Transport("peer session task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("peer session task dropped the reply".into()))?
    }

    pub async fn stop(&self) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Stop { reply: reply_tx })
            .await
            .map_err(|_| RangingError::Transport("peer session task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("peer session task dropped the reply".into()))?
    }

    /// The host application moved to the background (§4.G). Arms the
    /// background timeout; if the app doesn't return to the foreground
    /// before it fires, every active adapter is force-stopped.
    pub async fn on_app_background(&self) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Background { reply: reply_tx })
            .await
            .map_err(|_| RangingError::Transport("peer session task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("peer session task dropped the reply".into()))?
    }

    /// The host application returned to the foreground, cancelling the
    /// background timeout armed by `on_app_background`.
    pub async fn on_app_foreground(&self) -> Result<(), RangingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Foreground { reply: reply_tx })
            .await
            .map_err(|_| RangingError::Transport("peer session task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RangingError::Transport("peer session task dropped the reply".into()))?
    }
}

/// Spawns the task owning one peer's session state and returns a handle to
/// it. `events_tx` receives every state change, measurement, and closure
/// for this peer, to be forwarded upward by the aggregator.
pub fn spawn(
    peer: DeviceId,
    adapter: Arc<dyn RangingAdapter>,
    capabilities: CapabilityRegistry,
    audit: Arc<AuditLogger>,
    timeouts: PeerTimeouts,
    events_tx: mpsc::Sender<PeerSessionEvent>,
) -> PeerSessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    tokio::spawn(run(
        peer, adapter, capabilities, audit, timeouts, events_tx, cmd_rx,
    ));
    PeerSessionHandle { peer, cmd_tx }
}

async fn run(
    peer: DeviceId,
    adapter: Arc<dyn RangingAdapter>,
    capabilities: CapabilityRegistry,
    audit: Arc<AuditLogger>,
    timeouts: PeerTimeouts,
    events_tx: mpsc::Sender<PeerSessionEvent>,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
) {
    let mut state = PeerSessionState::Idle;
    let mut active_techs: Vec<TechnologyTag> = Vec::new();
    let (adapter_events_tx, mut adapter_events_rx) = mpsc::channel::<AdapterSessionEvent>(32);
    let mut gate = NotificationGate::new(SessionConfig::default().data_notification);
    let mut fuser = PreferentialFuser::new();
    let mut filter: Box<dyn FilterEngine> = Box::new(PassthroughFilter);
    let mut sensor_fusion_enabled = false;
    let mut measurement_count: u32 = 0;
    let mut measurement_limit: u32 = 0;
    let mut saw_first_data = false;
    let mut is_background = false;
    let mut pending_stop_reply: Option<oneshot::Sender<Result<(), RangingError>>> = None;

    let mut no_initial_data_deadline: Option<Pin<Box<Sleep>>> = None;
    let mut no_updated_data_deadline: Option<Pin<Box<Sleep>>> = None;
    let mut background_deadline: Option<Pin<Box<Sleep>>> = None;
    let mut force_close_deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    PeerCommand::Start { preference, reply } => {
                        if state != PeerSessionState::Idle && state != PeerSessionState::Stopped {
                            let _ = reply.send(Err(RangingError::OobProtocolError(
                                "session already active".into(),
                            )));
                            continue;
                        }
                        set_state(&mut state, PeerSessionState::Initializing, peer, &events_tx).await;
                        let outcome = start(
                            peer,
                            preference,
                            &adapter,
                            &capabilities,
                            &adapter_events_tx,
                            &mut gate,
                            &mut sensor_fusion_enabled,
                        )
                        .await;
                        match outcome {
                            Ok((techs, session_config)) => {
                                active_techs = techs;
                                measurement_count = 0;
                                measurement_limit = session_config.measurement_limit;
                                saw_first_data = false;
                                is_background = false;
                                no_updated_data_deadline = None;
                                background_deadline = None;
                                force_close_deadline = None;
                                no_initial_data_deadline = arm(timeouts.no_initial_data);
                                set_state(&mut state, PeerSessionState::Started, peer, &events_tx).await;
                                audit.log_session_event(peer, "session_started").await;
                                let _ = reply.send(Ok(()));
                            }
                            Err(err) => {
                                warn!(%peer, error = %err, "failed to start peer session");
                                set_state(&mut state, PeerSessionState::Idle, peer, &events_tx).await;
                                let _ = reply.send(Err(err));
                            }
                        }
                    }
                    PeerCommand::Stop { reply } => {
                        if state != PeerSessionState::Started {
                            let _ = reply.send(Err(RangingError::OobProtocolError(
                                "no active session to stop".into(),
                            )));
                            continue;
                        }
                        no_initial_data_deadline = None;
                        no_updated_data_deadline = None;
                        background_deadline = None;
                        set_state(&mut state, PeerSessionState::Stopping, peer, &events_tx).await;
                        for tech in &active_techs {
                            if let Err(err) = adapter.stop_session(peer, *tech).await {
                                warn!(%peer, technology = %tech, error = %err, "stop_session failed");
                            }
                        }
                        if active_techs.is_empty() {
                            set_state(&mut state, PeerSessionState::Stopped, peer, &events_tx).await;
                            audit.log_session_event(peer, "session_stopped").await;
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        force_close_deadline = arm(timeouts.force_close);
                        pending_stop_reply = Some(reply);
                    }
                    PeerCommand::Background { reply } => {
                        if state != PeerSessionState::Started {
                            let _ = reply.send(Err(RangingError::OobProtocolError(
                                "no active session to background".into(),
                            )));
                            continue;
                        }
                        is_background = true;
                        adapter.on_app_background().await;
                        background_deadline = arm(timeouts.background);
                        let _ = reply.send(Ok(()));
                    }
                    PeerCommand::Foreground { reply } => {
                        is_background = false;
                        background_deadline = None;
                        adapter.on_app_foreground().await;
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            Some(event) = adapter_events_rx.recv() => {
                match event {
                    AdapterSessionEvent::Data(data) => {
                        let emitted = if sensor_fusion_enabled {
                            fuser.ingest(data)
                        } else {
                            Some(data)
                        };
                        if let Some(data) = emitted {
                            let data = crate::filter_engine::apply(filter.as_mut(), data);
                            if gate.should_forward(&data) {
                                if !saw_first_data {
                                    saw_first_data = true;
                                    no_initial_data_deadline = None;
                                }
                                no_updated_data_deadline = arm(timeouts.no_updated_data);
                                let _ = events_tx.send(PeerSessionEvent::Data(data)).await;
                                measurement_count += 1;
                                if measurement_limit > 0 && measurement_count >= measurement_limit {
                                    no_updated_data_deadline = None;
                                    set_state(&mut state, PeerSessionState::Stopping, peer, &events_tx).await;
                                    for tech in &active_techs {
                                        if let Err(err) = adapter.stop_session(peer, *tech).await {
                                            warn!(%peer, technology = %tech, error = %err, "stop_session failed");
                                        }
                                    }
                                    if active_techs.is_empty() {
                                        set_state(&mut state, PeerSessionState::Stopped, peer, &events_tx).await;
                                        audit.log_session_event(peer, "measurement_limit_reached").await;
                                        break;
                                    }
                                    force_close_deadline = arm(timeouts.force_close);
                                }
                            }
                        }
                    }
                    AdapterSessionEvent::Closed { technology, reason, .. } => {
                        debug!(%peer, technology = %technology, ?reason, "adapter session closed");
                        active_techs.retain(|t| *t != technology);
                        let stopping = state == PeerSessionState::Stopping;
                        if active_techs.is_empty() && (state == PeerSessionState::Started || stopping) {
                            no_initial_data_deadline = None;
                            no_updated_data_deadline = None;
                            force_close_deadline = None;
                            set_state(&mut state, PeerSessionState::Stopped, peer, &events_tx).await;
                            audit.log_session_event(peer, "session_closed").await;
                            if let Some(reply) = pending_stop_reply.take() {
                                let _ = reply.send(Ok(()));
                            } else {
                                let _ = events_tx
                                    .send(PeerSessionEvent::Closed { peer, reason })
                                    .await;
                            }
                            break;
                        }
                    }
                }
            }
            _ = await_deadline(&mut no_initial_data_deadline) => {
                warn!(%peer, "no initial data within timeout, force-closing session");
                no_initial_data_deadline = None;
                force_stop(&adapter, peer, &active_techs).await;
                finish_forced(&mut state, peer, &events_tx, &audit, &mut pending_stop_reply, "no_initial_data_timeout").await;
                break;
            }
            _ = await_deadline(&mut no_updated_data_deadline) => {
                warn!(%peer, "no updated data within timeout, force-closing session");
                no_updated_data_deadline = None;
                force_stop(&adapter, peer, &active_techs).await;
                finish_forced(&mut state, peer, &events_tx, &audit, &mut pending_stop_reply, "no_updated_data_timeout").await;
                break;
            }
            _ = await_deadline(&mut background_deadline), if is_background => {
                warn!(%peer, "app stayed backgrounded past timeout, force-closing session");
                background_deadline = None;
                force_stop(&adapter, peer, &active_techs).await;
                finish_forced(&mut state, peer, &events_tx, &audit, &mut pending_stop_reply, "background_timeout").await;
                break;
            }
            _ = await_deadline(&mut force_close_deadline) => {
                warn!(%peer, "adapters did not confirm stop before grace period elapsed");
                force_close_deadline = None;
                force_stop(&adapter, peer, &active_techs).await;
                finish_forced(&mut state, peer, &events_tx, &audit, &mut pending_stop_reply, "force_close_timeout").await;
                break;
            }
            else => break,
        }
    }
    info!(%peer, "peer session task ended");
}

async fn force_stop(adapter: &Arc<dyn RangingAdapter>, peer: DeviceId, active_techs: &[TechnologyTag]) {
    for tech in active_techs {
        if let Err(err) = adapter.stop_session(peer, *tech).await {
            warn!(%peer, technology = %tech, error = %err, "stop_session failed during force-stop");
        }
    }
}

/// Transitions to `Stopped` after a timeout forced the session down, replying
/// to a pending `stop()` caller if one was waiting, otherwise emitting a
/// `Closed { reason: ForceStopped }` event for the aggregator to forward.
async fn finish_forced(
    state: &mut PeerSessionState,
    peer: DeviceId,
    events_tx: &mpsc::Sender<PeerSessionEvent>,
    audit: &Arc<AuditLogger>,
    pending_stop_reply: &mut Option<oneshot::Sender<Result<(), RangingError>>>,
    audit_event: &str,
) {
    set_state(state, PeerSessionState::Stopped, peer, events_tx).await;
    audit.log_session_event(peer, audit_event).await;
    if let Some(reply) = pending_stop_reply.take() {
        let _ = reply.send(Ok(()));
    } else {
        let _ = events_tx
            .send(PeerSessionEvent::Closed {
                peer,
                reason: ClosedReason::ForceStopped,
            })
            .await;
    }
}

async fn set_state(
    state: &mut PeerSessionState,
    next: PeerSessionState,
    peer: DeviceId,
    events_tx: &mpsc::Sender<PeerSessionEvent>,
) {
    *state = next;
    let _ = events_tx
        .send(PeerSessionEvent::StateChanged { peer, state: next })
        .await;
}

/// Starts the session, returning the technologies brought up and the
/// negotiated/caller-supplied `measurement_limit` (0 = unlimited).
async fn start(
    peer: DeviceId,
    preference: StartPreference,
    adapter: &Arc<dyn RangingAdapter>,
    capabilities: &CapabilityRegistry,
    adapter_events_tx: &mpsc::Sender<AdapterSessionEvent>,
    gate: &mut NotificationGate,
    sensor_fusion_enabled: &mut bool,
) -> Result<(Vec<TechnologyTag>, SessionConfig), RangingError> {
    match preference {
        StartPreference::Raw(params) => {
            let session_config = SessionConfig::default();
            let mut started = Vec::new();
            for config in params.configs {
                let tech = config.technology();
                adapter
                    .start_session(peer, config, session_config, adapter_events_tx.clone())
                    .await?;
                started.push(tech);
            }
            Ok((started, session_config))
        }
        StartPreference::Oob {
            mut channel,
            constraints,
            session_config,
            role,
        } => {
            let local_caps = capabilities.advertised_capabilities().await;
            let outcome = match role {
                NegotiationRole::Initiator => {
                    negotiator::negotiate_as_initiator(&mut channel, &local_caps, &constraints).await?
                }
                NegotiationRole::Responder => {
                    negotiator::negotiate_as_responder(&mut channel, &local_caps, |proposed| {
                        crate::selector::validate_against_local(&local_caps, proposed)
                    })
                    .await?
                }
            };
            *gate = NotificationGate::new(session_config.data_notification);
            *sensor_fusion_enabled = session_config.sensor_fusion_enabled;
            let mut started = Vec::new();
            for config in outcome.agreed_configs {
                let tech = config.technology();
                adapter
                    .start_session(peer, config, session_config, adapter_events_tx.clone())
                    .await?;
                started.push(tech);
            }
            Ok((started, session_config))
        }
    }
}
