//! Session aggregator (§4.H): owns the `DeviceId → PeerSession` map and is
//! the single entry point callers go through to start/stop ranging with a
//! peer. Each peer gets its own task (`peer_session::spawn`); the map
//! itself is the only piece of state protected by a lock.

use std::collections::HashMap;
use std::sync::Arc;

use ranging_wire::{
    DeviceId, OobRangingConstraints, RangingError, RangingPreference, RawRangingParams, SessionConfig,
};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::adapter::RangingAdapter;
use crate::audit::AuditLogger;
use crate::capability::CapabilityRegistry;
use crate::peer_session::{
    self, AggregateEvent, NegotiationRole, PeerSessionEvent, PeerSessionHandle, PeerTimeouts,
    StartPreference,
};
use crate::transport::OobChannel;

pub struct SessionAggregator {
    adapter: Arc<dyn RangingAdapter>,
    capabilities: CapabilityRegistry,
    audit: Arc<AuditLogger>,
    timeouts: PeerTimeouts,
    sessions: RwLock<HashMap<DeviceId, PeerSessionHandle>>,
    events_tx: mpsc::Sender<PeerSessionEvent>,
}

impl SessionAggregator {
    pub fn new(
        adapter: Arc<dyn RangingAdapter>,
        capabilities: CapabilityRegistry,
        audit: Arc<AuditLogger>,
    ) -> (Arc<Self>, mpsc::Receiver<PeerSessionEvent>) {
        Self::with_timeouts(adapter, capabilities, audit, PeerTimeouts::default())
    }

    pub fn with_timeouts(
        adapter: Arc<dyn RangingAdapter>,
        capabilities: CapabilityRegistry,
        audit: Arc<AuditLogger>,
        timeouts: PeerTimeouts,
    ) -> (Arc<Self>, mpsc::Receiver<PeerSessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                adapter,
                capabilities,
                audit,
                timeouts,
                sessions: RwLock::new(HashMap::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    async fn handle_for(&self, peer: DeviceId) -> PeerSessionHandle {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(peer)
            .or_insert_with(|| {
                info!(%peer, "spawning new peer session task");
                peer_session::spawn(
                    peer,
                    self.adapter.clone(),
                    self.capabilities.clone(),
                    self.audit.clone(),
                    self.timeouts,
                    self.events_tx.clone(),
                )
            })
            .clone()
    }

    /// Starts ranging with every peer named by `preference` at once (§4.H).
    /// Emits one [`AggregateEvent`] on `events_tx` describing the outcome:
    /// `Opened` only if every peer reached `STARTED`, `OpenFailed` and a
    /// rollback of whatever did start otherwise. On success, spawns a watcher
    /// that posts `Closed` once every peer named here has ended.
    pub async fn start(self: &Arc<Self>, preference: RangingPreference) -> Result<(), RangingError> {
        let peers: Vec<DeviceId> = match &preference {
            RangingPreference::RawInitiator { peers } => peers.iter().map(|(p, _)| *p).collect(),
            RangingPreference::RawResponder { peer } => vec![*peer],
            RangingPreference::OobInitiator { peers, .. } => peers.clone(),
            RangingPreference::OobResponder { peer } => vec![*peer],
        };

        let result: Result<(), RangingError> = match preference {
            RangingPreference::RawInitiator { peers } => {
                let mut started = Vec::new();
                let mut failure = None;
                for (peer, params) in peers {
                    match self.start_raw(peer, params).await {
                        Ok(()) => started.push(peer),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                match failure {
                    None => Ok(()),
                    Some(err) => {
                        for peer in started {
                            let _ = self.stop(peer).await;
                        }
                        Err(err)
                    }
                }
            }
            RangingPreference::RawResponder { peer } => {
                // A responder has nothing of its own to negotiate up front —
                // it starts once the initiator's raw session reaches this
                // device through whatever channel carried the request.
                let _ = peer;
                Ok(())
            }
            RangingPreference::OobInitiator { peers: _, .. } => Err(RangingError::OobProtocolError(
                "OOB initiator preference requires a transport per peer; use start_oob_initiator directly".into(),
            )),
            RangingPreference::OobResponder { peer: _ } => Err(RangingError::OobProtocolError(
                "OOB responder preference requires a transport; use start_oob_responder directly".into(),
            )),
        };

        let event = match &result {
            Ok(()) => PeerSessionEvent::Aggregate(AggregateEvent::Opened),
            Err(err) => PeerSessionEvent::Aggregate(AggregateEvent::OpenFailed { reason: err.clone() }),
        };
        let _ = self.events_tx.send(event).await;

        if result.is_ok() {
            let aggregator = self.clone();
            tokio::spawn(async move { aggregator.watch_for_close(peers).await });
        }
        result
    }

    /// Polls the session map until none of `peers` remain active, then posts
    /// a single `Closed` aggregate event.
    async fn watch_for_close(self: Arc<Self>, peers: Vec<DeviceId>) {
        loop {
            let sessions = self.sessions.read().await;
            if peers.iter().all(|p| !sessions.contains_key(p)) {
                break;
            }
            drop(sessions);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let _ = self
            .events_tx
            .send(PeerSessionEvent::Aggregate(AggregateEvent::Closed))
            .await;
    }

    pub async fn start_raw(&self, peer: DeviceId, params: RawRangingParams) -> Result<(), RangingError> {
        let handle = self.handle_for(peer).await;
        handle.start(StartPreference::Raw(params)).await
    }

    pub async fn start_oob_initiator(
        &self,
        peer: DeviceId,
        channel: OobChannel,
        constraints: OobRangingConstraints,
        session_config: SessionConfig,
    ) -> Result<(), RangingError> {
        let handle = self.handle_for(peer).await;
        handle
            .start(StartPreference::Oob {
                channel,
                constraints,
                session_config,
                role: NegotiationRole::Initiator,
            })
            .await
    }

    pub async fn start_oob_responder(
        &self,
        peer: DeviceId,
        channel: OobChannel,
        constraints: OobRangingConstraints,
        session_config: SessionConfig,
    ) -> Result<(), RangingError> {
        let handle = self.handle_for(peer).await;
        handle
            .start(StartPreference::Oob {
                channel,
                constraints,
                session_config,
                role: NegotiationRole::Responder,
            })
            .await
    }

    pub async fn stop(&self, peer: DeviceId) -> Result<(), RangingError> {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(&peer).cloned()
        };
        match handle {
            Some(handle) => {
                let result = handle.stop().await;
                self.sessions.write().await.remove(&peer);
                result
            }
            None => Err(RangingError::OobProtocolError(
                "no session exists for this peer".into(),
            )),
        }
    }

    pub async fn stop_all(&self) {
        let peers: Vec<DeviceId> = self.sessions.read().await.keys().copied().collect();
        for peer in peers {
            let _ = self.stop(peer).await;
        }
    }

    pub async fn active_peers(&self) -> Vec<DeviceId> {
        self.sessions.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SimulatedAdapter;

    #[tokio::test]
    async fn start_raw_then_stop_round_trips() {
        let adapter: Arc<dyn RangingAdapter> = Arc::new(SimulatedAdapter::new());
        let (aggregator, mut events_rx) =
            SessionAggregator::new(adapter, CapabilityRegistry::new(), Arc::new(AuditLogger::disabled()));

        let peer = DeviceId::new(99);
        let params = RawRangingParams::new(vec![ranging_wire::TechConfig::Rssi(
            ranging_wire::RssiConfig {
                bt_address: [0; 6],
            },
        )]);
        aggregator.start_raw(peer, params).await.unwrap();
        assert_eq!(aggregator.active_peers().await, vec![peer]);

        aggregator.stop(peer).await.unwrap();
        assert!(aggregator.active_peers().await.is_empty());

        // Drain a couple of events so the channel doesn't fill in longer
        // test runs; not asserting ordering here, peer_session tests cover
        // the state sequence in detail.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), events_rx.recv()).await;
    }

    #[tokio::test]
    async fn stopping_an_unknown_peer_is_an_error() {
        let adapter: Arc<dyn RangingAdapter> = Arc::new(SimulatedAdapter::new());
        let (aggregator, _events_rx) =
            SessionAggregator::new(adapter, CapabilityRegistry::new(), Arc::new(AuditLogger::disabled()));
        let result = aggregator.stop(DeviceId::new(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_with_raw_initiator_preference_emits_opened_then_closed() {
        let adapter: Arc<dyn RangingAdapter> = Arc::new(SimulatedAdapter::new());
        let (aggregator, mut events_rx) =
            SessionAggregator::new(adapter, CapabilityRegistry::new(), Arc::new(AuditLogger::disabled()));

        let peer = DeviceId::new(42);
        let params = RawRangingParams::new(vec![ranging_wire::TechConfig::Rssi(
            ranging_wire::RssiConfig { bt_address: [0; 6] },
        )]);
        aggregator
            .start(RangingPreference::RawInitiator { peers: vec![(peer, params)] })
            .await
            .unwrap();

        let opened = tokio::time::timeout(std::time::Duration::from_millis(500), async {
            loop {
                match events_rx.recv().await {
                    Some(PeerSessionEvent::Aggregate(AggregateEvent::Opened)) => return,
                    Some(_) => continue,
                    None => panic!("channel closed before Opened"),
                }
            }
        })
        .await;
        assert!(opened.is_ok());

        aggregator.stop(peer).await.unwrap();

        let closed = tokio::time::timeout(std::time::Duration::from_millis(500), async {
            loop {
                match events_rx.recv().await {
                    Some(PeerSessionEvent::Aggregate(AggregateEvent::Closed)) => return,
                    Some(_) => continue,
                    None => panic!("channel closed before Closed"),
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn start_with_oob_initiator_preference_is_rejected() {
        let adapter: Arc<dyn RangingAdapter> = Arc::new(SimulatedAdapter::new());
        let (aggregator, _events_rx) =
            SessionAggregator::new(adapter, CapabilityRegistry::new(), Arc::new(AuditLogger::disabled()));

        let result = aggregator
            .start(RangingPreference::OobInitiator {
                peers: vec![DeviceId::new(1)],
                constraints: OobRangingConstraints {
                    allowed_technologies: ranging_wire::tech_set_of(std::iter::empty::<ranging_wire::TechnologyTag>()),
                    security_level: ranging_wire::SecurityLevel::Basic,
                    ranging_mode: ranging_wire::RangingMode::Auto,
                    update_interval: ranging_wire::UpdateIntervalRange::new(50, 5000).unwrap(),
                },
                session_config: SessionConfig::default(),
            })
            .await;
        assert!(result.is_err());
    }
}
