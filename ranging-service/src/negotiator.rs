//! OOB negotiator (§4.E): drives the `CapabilityRequest/Response →
//! SetConfiguration/Response → StartRanging/Response` exchange over an
//! [`OobChannel`], from either the initiating or the responding side.
//!
//! Each side is a small linear state walk rather than a generic state
//! machine, realized as a plain `async fn` since the steps here are a fixed
//! sequence of request/response pairs, not a graph with branching
//! successors.

use ranging_wire::{OobMessage, OobRangingConstraints, RangingError, TechCapability, TechConfig, TechnologyTag};

use crate::selector;
use crate::transport::OobChannel;

/// Result of a completed negotiation: the configs both sides agreed to run,
/// together with the peer's full advertised fingerprint (useful for
/// logging/audit, even for technologies that weren't selected).
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    pub agreed_configs: Vec<TechConfig>,
    pub peer_capabilities: Vec<TechCapability>,
}

fn tech_set_of(techs: impl IntoIterator<Item = TechnologyTag>) -> ranging_wire::TechSet {
    techs.into_iter().collect()
}

/// Runs the initiator side: request the peer's capabilities, select
/// compatible configs locally, push them down, then start ranging on
/// whatever the peer confirmed.
pub async fn negotiate_as_initiator(
    channel: &mut OobChannel,
    local_capabilities: &[TechCapability],
    constraints: &OobRangingConstraints,
) -> Result<NegotiationOutcome, RangingError> {
    let requested = tech_set_of(ranging_wire::tech_set_iter(constraints.allowed_technologies));
    channel
        .send(&OobMessage::CapabilityRequest { requested })
        .await?;

    let peer_capabilities = match channel.recv().await? {
        OobMessage::CapabilityResponse { capabilities, .. } => capabilities,
        other => return Err(unexpected(&other, "CapabilityResponse")),
    };

    let configs = selector::select(local_capabilities, &peer_capabilities, constraints);
    if configs.is_empty() {
        return Err(RangingError::NoCompatibleCapabilities);
    }

    let all_techs = tech_set_of(configs.iter().map(TechConfig::technology));
    channel
        .send(&OobMessage::SetConfiguration {
            start_immediately: all_techs,
            configs: configs.clone(),
        })
        .await?;

    let successful = match channel.recv().await? {
        OobMessage::SetConfigurationResponse { successful } => successful,
        other => return Err(unexpected(&other, "SetConfigurationResponse")),
    };

    let agreed: Vec<TechConfig> = configs
        .into_iter()
        .filter(|c| successful.contains(c.technology()))
        .collect();
    if agreed.is_empty() {
        return Err(RangingError::NoCompatibleCapabilities);
    }

    let start_set = tech_set_of(agreed.iter().map(TechConfig::technology));
    channel
        .send(&OobMessage::StartRanging { techs: start_set })
        .await?;

    let started = match channel.recv().await? {
        OobMessage::StartRangingResponse { successful } => successful,
        other => return Err(unexpected(&other, "StartRangingResponse")),
    };

    let agreed_configs: Vec<TechConfig> = agreed
        .into_iter()
        .filter(|c| started.contains(c.technology()))
        .collect();
    if agreed_configs.is_empty() {
        return Err(RangingError::OobProtocolError(
            "peer confirmed configuration but started nothing".into(),
        ));
    }

    Ok(NegotiationOutcome {
        agreed_configs,
        peer_capabilities,
    })
}

/// Runs the responder side against a caller-supplied function that, given
/// the peer's requested technologies and our local fingerprint, decides
/// which configs we accept (normally just "everything the selector would
/// pick given our own policy constraints").
pub async fn negotiate_as_responder(
    channel: &mut OobChannel,
    local_capabilities: &[TechCapability],
    accept: impl Fn(&[TechConfig]) -> Vec<TechConfig>,
) -> Result<NegotiationOutcome, RangingError> {
    match channel.recv().await? {
        OobMessage::CapabilityRequest { .. } => {}
        other => return Err(unexpected(&other, "CapabilityRequest")),
    }

    channel
        .send(&OobMessage::CapabilityResponse {
            supported: tech_set_of(local_capabilities.iter().map(TechCapability::technology)),
            capabilities: local_capabilities.to_vec(),
        })
        .await?;

    let proposed = match channel.recv().await? {
        OobMessage::SetConfiguration { configs, .. } => configs,
        other => return Err(unexpected(&other, "SetConfiguration")),
    };

    let accepted = accept(&proposed);
    let successful = tech_set_of(accepted.iter().map(TechConfig::technology));
    channel
        .send(&OobMessage::SetConfigurationResponse { successful })
        .await?;

    if accepted.is_empty() {
        return Err(RangingError::NoCompatibleCapabilities);
    }

    let requested_start = match channel.recv().await? {
        OobMessage::StartRanging { techs } => techs,
        other => return Err(unexpected(&other, "StartRanging")),
    };

    let starting: Vec<TechConfig> = accepted
        .into_iter()
        .filter(|c| requested_start.contains(c.technology()))
        .collect();
    let started_set = tech_set_of(starting.iter().map(TechConfig::technology));
    channel
        .send(&OobMessage::StartRangingResponse {
            successful: started_set,
        })
        .await?;

    if starting.is_empty() {
        return Err(RangingError::OobProtocolError(
            "no accepted technology was in the peer's StartRanging request".into(),
        ));
    }

    Ok(NegotiationOutcome {
        agreed_configs: starting,
        peer_capabilities: Vec::new(),
    })
}

fn unexpected(got: &OobMessage, expected: &str) -> RangingError {
    RangingError::OobProtocolError(format!("expected {expected}, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::in_memory::paired;
    use ranging_wire::{
        tech_set_of as model_tech_set_of, DeviceId, RssiCapability, SecurityLevel,
        UpdateIntervalRange, UwbCapability,
    };
    use std::time::Duration;
    use tokio::time::timeout as tokio_timeout;

    fn uwb_cap(address: u16) -> TechCapability {
        TechCapability::Uwb(UwbCapability {
            address,
            supported_channels: 0b10,
            supported_preambles: 0b1,
            supported_config_ids: 0b1,
            min_ranging_interval_ms: 100,
            min_slot_duration_ms: 1,
            supported_roles: 0b11,
        })
    }

    fn rssi_cap() -> TechCapability {
        TechCapability::Rssi(RssiCapability {
            bt_address: [7; 6],
        })
    }

    #[tokio::test]
    async fn initiator_and_responder_agree_on_shared_technology() {
        let a = DeviceId::new(1);
        let b = DeviceId::new(2);
        let (chan_a, chan_b) = paired(a, b);
        let mut initiator_channel = OobChannel::new(Box::new(chan_a), Duration::from_secs(5));
        let mut responder_channel = OobChannel::new(Box::new(chan_b), Duration::from_secs(5));

        let initiator_caps = vec![uwb_cap(1), rssi_cap()];
        let responder_caps = vec![rssi_cap(), uwb_cap(2)];

        let constraints = OobRangingConstraints {
            allowed_technologies: model_tech_set_of([TechnologyTag::Uwb, TechnologyTag::Rssi]),
            security_level: SecurityLevel::Basic,
            ranging_mode: ranging_wire::RangingMode::Auto,
            update_interval: UpdateIntervalRange::new(50, 5000).unwrap(),
        };

        let responder = tokio::spawn(async move {
            negotiate_as_responder(&mut responder_channel, &responder_caps, |proposed| {
                proposed.to_vec()
            })
            .await
        });

        let initiator_result = tokio_timeout(
            Duration::from_secs(1),
            negotiate_as_initiator(&mut initiator_channel, &initiator_caps, &constraints),
        )
        .await
        .expect("should not time out")
        .expect("negotiation should succeed");

        let responder_result = responder
            .await
            .expect("task should not panic")
            .expect("negotiation should succeed");

        assert_eq!(initiator_result.agreed_configs.len(), 1);
        assert_eq!(
            initiator_result.agreed_configs[0].technology(),
            TechnologyTag::Uwb
        );
        assert_eq!(responder_result.agreed_configs.len(), 1);
    }

    #[tokio::test]
    async fn initiator_fails_fast_on_no_compatible_capabilities() {
        let a = DeviceId::new(1);
        let b = DeviceId::new(2);
        let (chan_a, chan_b) = paired(a, b);
        let mut initiator_channel = OobChannel::new(Box::new(chan_a), Duration::from_millis(50));
        let mut responder_channel = OobChannel::new(Box::new(chan_b), Duration::from_millis(50));

        let initiator_caps = vec![uwb_cap(1)];
        let responder_caps = vec![rssi_cap()];

        let constraints = OobRangingConstraints {
            allowed_technologies: model_tech_set_of([TechnologyTag::Uwb, TechnologyTag::Rssi]),
            security_level: SecurityLevel::Basic,
            ranging_mode: ranging_wire::RangingMode::Auto,
            update_interval: UpdateIntervalRange::new(50, 5000).unwrap(),
        };

        let responder = tokio::spawn(async move {
            let _ = negotiate_as_responder(&mut responder_channel, &responder_caps, |proposed| {
                proposed.to_vec()
            })
            .await;
        });

        let result = negotiate_as_initiator(&mut initiator_channel, &initiator_caps, &constraints).await;
        assert!(matches!(result, Err(RangingError::NoCompatibleCapabilities)));
        responder.abort();
    }
}
