//! End-to-end scenarios exercising the aggregator, negotiator, selector,
//! gate, and simulated adapter together, kept in a top-level `tests/`
//! directory since they cut across every module rather than exercising one
//! in isolation.

use std::sync::Arc;
use std::time::Duration;

use ranging_service::aggregator::SessionAggregator;
use ranging_service::audit::AuditLogger;
use ranging_service::capability::CapabilityRegistry;
use ranging_service::peer_session::PeerSessionEvent;
use ranging_service::test_support::{SimulatedAdapter, SimulatedBehavior};
use ranging_service::transport::in_memory::paired;
use ranging_service::transport::OobChannel;
use ranging_service::{
    AvailabilityState, DataNotificationConfig, DataNotificationType, DeviceId,
    OobRangingConstraints, RangingAdapter, RangingMode, RawRangingParams, SecurityLevel,
    SessionConfig, TechnologyTag, UpdateIntervalRange,
};

fn basic_constraints(techs: &[TechnologyTag]) -> OobRangingConstraints {
    OobRangingConstraints {
        allowed_technologies: ranging_wire::tech_set_of(techs.iter().copied()),
        security_level: SecurityLevel::Basic,
        ranging_mode: RangingMode::Auto,
        update_interval: UpdateIntervalRange::new(50, 5000).unwrap(),
    }
}

async fn wait_for_started(events_rx: &mut tokio::sync::mpsc::Receiver<PeerSessionEvent>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("timed out waiting for Started")
        {
            Some(PeerSessionEvent::StateChanged {
                state: ranging_service::peer_session::PeerSessionState::Started,
                ..
            }) => return,
            Some(_) => continue,
            None => panic!("event channel closed before Started"),
        }
    }
}

#[tokio::test]
async fn oob_negotiation_between_two_aggregators_reaches_started_and_delivers_data() {
    let adapter_a: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());
    let adapter_b: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());

    let capabilities_a = CapabilityRegistry::new();
    for cap in adapter_a.local_capabilities().await {
        capabilities_a.register(cap).await;
    }
    let capabilities_b = CapabilityRegistry::new();
    for cap in adapter_b.local_capabilities().await {
        capabilities_b.register(cap).await;
    }

    let (aggregator_a, mut events_a) =
        SessionAggregator::new(adapter_a, capabilities_a, Arc::new(AuditLogger::disabled()));
    let (aggregator_b, _events_b) =
        SessionAggregator::new(adapter_b, capabilities_b, Arc::new(AuditLogger::disabled()));

    let device_a = DeviceId::new(1);
    let device_b = DeviceId::new(2);
    let (chan_a, chan_b) = paired(device_a, device_b);
    let oob_a = OobChannel::new(Box::new(chan_a), Duration::from_secs(2));
    let oob_b = OobChannel::new(Box::new(chan_b), Duration::from_secs(2));

    let constraints = basic_constraints(&[TechnologyTag::Uwb, TechnologyTag::Rssi]);
    let session_config = SessionConfig::default();

    let responder_constraints = constraints.clone();
    let responder_session_config = session_config;
    let aggregator_b_clone = aggregator_b.clone();
    let responder = tokio::spawn(async move {
        aggregator_b_clone
            .start_oob_responder(device_a, oob_b, responder_constraints, responder_session_config)
            .await
    });

    aggregator_a
        .start_oob_initiator(device_b, oob_a, constraints, session_config)
        .await
        .expect("initiator negotiation should succeed");

    responder
        .await
        .expect("responder task should not panic")
        .expect("responder negotiation should succeed");

    wait_for_started(&mut events_a).await;

    let data_event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events_a.recv().await {
                Some(PeerSessionEvent::Data(data)) => return data,
                Some(_) => continue,
                None => panic!("events channel closed before any data arrived"),
            }
        }
    })
    .await
    .expect("should receive at least one measurement");

    assert_eq!(data_event.peer, device_b);
}

#[tokio::test]
async fn disabling_a_technology_removes_it_from_negotiation() {
    let adapter: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());
    let capabilities = CapabilityRegistry::new();
    for cap in adapter.local_capabilities().await {
        capabilities.register(cap).await;
    }
    capabilities
        .set_availability(TechnologyTag::Uwb, AvailabilityState::DisabledUser)
        .await;

    let advertised = capabilities.advertised_capabilities().await;
    assert!(advertised.is_empty(), "UWB was disabled and is the adapter's only capability");
}

#[tokio::test]
async fn raw_start_failure_surfaces_through_the_aggregator() {
    let adapter: Arc<dyn ranging_service::RangingAdapter> =
        Arc::new(SimulatedAdapter::with_behavior(SimulatedBehavior::FailToStart));
    let (aggregator, _events) =
        SessionAggregator::new(adapter, CapabilityRegistry::new(), Arc::new(AuditLogger::disabled()));

    let params = RawRangingParams::new(vec![ranging_wire::TechConfig::Rssi(
        ranging_wire::RssiConfig {
            bt_address: [0; 6],
        },
    )]);
    let result = aggregator.start_raw(DeviceId::new(5), params).await;
    assert!(result.is_err());
    assert!(aggregator.active_peers().await.is_empty());
}

#[tokio::test]
async fn disabled_notification_type_suppresses_all_data_events() {
    let adapter: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::with_behavior(
        SimulatedBehavior::Periodic {
            period: Duration::from_millis(5),
        },
    ));
    let capabilities = CapabilityRegistry::new();
    for cap in adapter.local_capabilities().await {
        capabilities.register(cap).await;
    }
    let (aggregator, mut events) =
        SessionAggregator::new(adapter, capabilities, Arc::new(AuditLogger::disabled()));

    let device_a = DeviceId::new(1);
    let device_b = DeviceId::new(2);
    let (chan_a, chan_b) = paired(device_a, device_b);
    let oob_a = OobChannel::new(Box::new(chan_a), Duration::from_secs(2));
    let oob_b = OobChannel::new(Box::new(chan_b), Duration::from_secs(2));

    let constraints = basic_constraints(&[TechnologyTag::Uwb]);
    let mut session_config = SessionConfig::default();
    session_config.data_notification = DataNotificationConfig {
        notification_type: DataNotificationType::Disable,
        proximity_near_m: 0.0,
        proximity_far_m: 0.0,
    };

    let responder_adapter: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());
    let responder_capabilities = CapabilityRegistry::new();
    for cap in responder_adapter.local_capabilities().await {
        responder_capabilities.register(cap).await;
    }
    let (responder_aggregator, _responder_events) = SessionAggregator::new(
        responder_adapter,
        responder_capabilities,
        Arc::new(AuditLogger::disabled()),
    );
    let responder_constraints = constraints.clone();
    let responder = tokio::spawn(async move {
        responder_aggregator
            .start_oob_responder(device_a, oob_b, responder_constraints, SessionConfig::default())
            .await
    });

    aggregator
        .start_oob_initiator(device_b, oob_a, constraints, session_config)
        .await
        .expect("negotiation should succeed");
    responder.await.unwrap().expect("responder should succeed");

    wait_for_started(&mut events).await;

    // No Data event should ever arrive — only state-change traffic.
    let saw_data = tokio::time::timeout(Duration::from_millis(100), async {
        loop {
            match events.recv().await {
                Some(PeerSessionEvent::Data(_)) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(!saw_data, "DISABLE notification mode must suppress every measurement");
}

#[tokio::test]
async fn transport_disconnect_flushes_queued_negotiation_message_on_reconnect() {
    let adapter_a: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());
    let adapter_b: Arc<dyn ranging_service::RangingAdapter> = Arc::new(SimulatedAdapter::new());
    let capabilities_a = CapabilityRegistry::new();
    for cap in adapter_a.local_capabilities().await {
        capabilities_a.register(cap).await;
    }
    let capabilities_b = CapabilityRegistry::new();
    for cap in adapter_b.local_capabilities().await {
        capabilities_b.register(cap).await;
    }
    let (aggregator_a, mut events_a) =
        SessionAggregator::new(adapter_a, capabilities_a, Arc::new(AuditLogger::disabled()));
    let (aggregator_b, _events_b) =
        SessionAggregator::new(adapter_b, capabilities_b, Arc::new(AuditLogger::disabled()));

    let device_a = DeviceId::new(1);
    let device_b = DeviceId::new(2);
    let (chan_a, chan_b) = paired(device_a, device_b);
    let oob_a = OobChannel::new(Box::new(chan_a), Duration::from_secs(5));
    let oob_b = OobChannel::new(Box::new(chan_b), Duration::from_secs(5));

    // Drop the initiator's link before it sends anything, so the whole
    // `CapabilityRequest → ... → StartRanging` exchange gets queued, then
    // recover well inside the 5 s transport timeout. The queued messages
    // must still reach the responder in the order they were issued.
    let supervisor_a = oob_a.supervisor();
    supervisor_a.on_disconnect().await;
    let reconnect = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor_a.on_reconnect().await;
    });

    let constraints = basic_constraints(&[TechnologyTag::Uwb]);
    let session_config = SessionConfig::default();
    let responder_constraints = constraints.clone();
    let aggregator_b_clone = aggregator_b.clone();
    let responder = tokio::spawn(async move {
        aggregator_b_clone
            .start_oob_responder(device_a, oob_b, responder_constraints, session_config)
            .await
    });

    aggregator_a
        .start_oob_initiator(device_b, oob_a, constraints, session_config)
        .await
        .expect("initiator negotiation should survive a transient disconnect");

    reconnect.await.unwrap();
    responder
        .await
        .expect("responder task should not panic")
        .expect("responder negotiation should succeed");

    wait_for_started(&mut events_a).await;
}
