//! Config selector (§4.D): turns a local capability fingerprint, a peer's
//! advertised capability fingerprint, and the caller's `OobRangingConstraints`
//! into the concrete `TechConfig`s both sides will run.
//!
//! Pure decision logic with no I/O: a side-effect-free function from
//! "current inputs" to "next decision" that the caller then acts on.

use ranging_wire::{
    CsConfig, OobRangingConstraints, RangingMode, RssiConfig, RttConfig, TechCapability,
    TechConfig, TechnologyTag, UpdateRateClass,
};

/// Accuracy-ranked default preference, highest first. Used by `AUTO` and as
/// the fuser's tie-break order.
pub const DEFAULT_PRIORITY: [TechnologyTag; 4] = [
    TechnologyTag::Uwb,
    TechnologyTag::Rtt,
    TechnologyTag::Cs,
    TechnologyTag::Rssi,
];

/// Picks the set of technologies to run given both sides' capabilities and
/// the caller's constraints, then synthesizes a concrete `TechConfig` for
/// each using the peer's advertised capability as the negotiation anchor
/// (address, supported channels, etc).
///
/// Returns an empty vector if nothing in common satisfies the constraints —
/// callers treat that as `NoCompatibleCapabilities`.
pub fn select(
    local: &[TechCapability],
    remote: &[TechCapability],
    constraints: &OobRangingConstraints,
) -> Vec<TechConfig> {
    // Step 1: intersect local/remote/allowed-set and the security floor.
    let common: Vec<&TechCapability> = remote
        .iter()
        .filter(|remote_cap| {
            let tech = remote_cap.technology();
            ranging_wire::tech_set_contains(constraints.allowed_technologies, tech)
                && local.iter().any(|l| l.technology() == tech)
                && satisfies_security(remote_cap, constraints)
        })
        .collect();

    if common.is_empty() {
        return Vec::new();
    }

    // Step 2: a single `UpdateRateClass` must be realizable for every
    // technology that survived step 1 at once — not independently per tech.
    let surviving_techs: Vec<TechnologyTag> = common.iter().map(|c| c.technology()).collect();
    let Some(rate_class) = UpdateRateClass::ALL
        .iter()
        .copied()
        .find(|class| class.realizable_for(surviving_techs.iter().copied(), constraints.update_interval))
    else {
        return Vec::new();
    };

    let chosen: Vec<&TechCapability> = match constraints.ranging_mode {
        RangingMode::Auto => DEFAULT_PRIORITY
            .iter()
            .find_map(|tech| common.iter().find(|c| c.technology() == *tech))
            .into_iter()
            .copied()
            .collect(),
        RangingMode::HighAccuracy | RangingMode::HighAccuracyPreferred => {
            let preferred = [TechnologyTag::Uwb, TechnologyTag::Rtt];
            let best = preferred
                .iter()
                .find_map(|tech| common.iter().find(|c| c.technology() == *tech));
            match best {
                Some(cap) => vec![*cap],
                None if constraints.ranging_mode == RangingMode::HighAccuracyPreferred => {
                    // Fall back to whatever is available when a precise
                    // technology wasn't negotiable but a fallback was
                    // accepted (`PREFERRED` semantics, vs. a hard failure).
                    common.first().copied().into_iter().collect()
                }
                None => Vec::new(),
            }
        }
        RangingMode::Fused => common,
    };

    chosen
        .into_iter()
        .filter_map(|cap| synthesize_config(cap, rate_class))
        .collect()
}

fn satisfies_security(cap: &TechCapability, constraints: &OobRangingConstraints) -> bool {
    match cap {
        TechCapability::Cs(cs) => {
            let minimum = constraints.security_level.minimum_cs_level();
            (0..8)
                .filter(|bit| cs.supported_security_levels & (1 << bit) != 0)
                .map(|bit| bit as u8 + 1)
                .any(|level| level >= minimum)
        }
        _ => true,
    }
}

fn synthesize_config(cap: &TechCapability, rate_class: UpdateRateClass) -> Option<TechConfig> {
    match cap {
        TechCapability::Uwb(c) => {
            let channel = lowest_set_bit(c.supported_channels)?;
            let preamble_index = lowest_set_bit(c.supported_preambles)?;
            let config_id = lowest_set_bit(c.supported_config_ids)?;
            Some(TechConfig::Uwb(ranging_wire::UwbConfig {
                address: c.address,
                session_id: session_id_for(c.address),
                config_id,
                channel,
                preamble_index,
                ranging_interval_ms: rate_class.concrete_interval_ms(TechnologyTag::Uwb) as u16,
                slot_duration_ms: c.min_slot_duration_ms.max(1),
                session_key: vec![0u8; 16],
                country_code: *b"US",
                device_role: ranging_wire::DeviceRole::Initiator,
                device_mode: ranging_wire::DeviceMode::Controller,
            }))
        }
        TechCapability::Cs(c) => {
            let minimum = 1; // caller-level policy already filtered by satisfies_security
            Some(TechConfig::Cs(CsConfig {
                bt_address: c.bt_address,
                security_level: highest_set_bit(c.supported_security_levels).unwrap_or(minimum),
            }))
        }
        TechCapability::Rtt(c) => Some(TechConfig::Rtt(RttConfig {
            name: "ranging".to_string(),
            device_role: ranging_wire::DeviceRole::Initiator,
            periodic_ranging: c.supports_periodic,
        })),
        TechCapability::Rssi(c) => Some(TechConfig::Rssi(RssiConfig {
            bt_address: c.bt_address,
        })),
    }
}

/// Responder-side re-validation (§4.E): checks each proposed `TechConfig`
/// against this device's own capability for that technology (re-running
/// step 3 of the selector locally rather than trusting the initiator's
/// narrowing). A technology with no matching local capability, or whose
/// proposed parameters fall outside it, is dropped.
pub fn validate_against_local(local: &[TechCapability], proposed: &[TechConfig]) -> Vec<TechConfig> {
    proposed
        .iter()
        .filter(|config| {
            local
                .iter()
                .find(|cap| cap.technology() == config.technology())
                .is_some_and(|cap| config_fits_local(config, cap))
        })
        .cloned()
        .collect()
}

fn config_fits_local(config: &TechConfig, local_cap: &TechCapability) -> bool {
    match (config, local_cap) {
        (TechConfig::Uwb(cfg), TechCapability::Uwb(cap)) => {
            cap.supported_channels & (1 << cfg.channel) != 0
                && cap.supported_preambles & (1 << cfg.preamble_index) != 0
                && cap.supported_config_ids & (1 << cfg.config_id) != 0
        }
        (TechConfig::Cs(cfg), TechCapability::Cs(cap)) => {
            cfg.security_level >= 1
                && cap.supported_security_levels & (1 << (cfg.security_level - 1)) != 0
        }
        (TechConfig::Rtt(cfg), TechCapability::Rtt(cap)) => !cfg.periodic_ranging || cap.supports_periodic,
        (TechConfig::Rssi(_), TechCapability::Rssi(_)) => true,
        _ => false,
    }
}

fn lowest_set_bit(bitmap: u32) -> Option<u8> {
    if bitmap == 0 {
        None
    } else {
        Some(bitmap.trailing_zeros() as u8)
    }
}

fn highest_set_bit(bitmap: u8) -> Option<u8> {
    if bitmap == 0 {
        None
    } else {
        Some(7 - bitmap.leading_zeros() as u8 + 1)
    }
}

fn session_id_for(address: u16) -> u32 {
    // Deterministic, address-derived session id: avoids colliding with a
    // concurrent session to a different peer while staying stable for a
    // given negotiation without needing an RNG in this pure function.
    0x5300_0000 ^ address as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_wire::{
        tech_set_of, CsCapability, RssiCapability, SecurityLevel, UpdateIntervalRange,
        UwbCapability,
    };

    fn constraints(
        allowed: &[TechnologyTag],
        mode: RangingMode,
        security: SecurityLevel,
    ) -> OobRangingConstraints {
        OobRangingConstraints {
            allowed_technologies: tech_set_of(allowed.iter().copied()),
            security_level: security,
            ranging_mode: mode,
            update_interval: UpdateIntervalRange::new(50, 5000).unwrap(),
        }
    }

    fn uwb(address: u16) -> TechCapability {
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

    fn rssi() -> TechCapability {
        TechCapability::Rssi(RssiCapability {
            bt_address: [9; 6],
        })
    }

    fn cs(levels: u8) -> TechCapability {
        TechCapability::Cs(CsCapability {
            bt_address: [1; 6],
            supported_security_levels: levels,
        })
    }

    #[test]
    fn no_overlap_yields_empty() {
        let local = [uwb(1)];
        let remote = [rssi()];
        let out = select(
            &local,
            &remote,
            &constraints(&[TechnologyTag::Uwb, TechnologyTag::Rssi], RangingMode::Auto, SecurityLevel::Basic),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn auto_picks_highest_priority_tech() {
        let local = [uwb(1), rssi()];
        let remote = [rssi(), uwb(2)];
        let out = select(
            &local,
            &remote,
            &constraints(&[TechnologyTag::Uwb, TechnologyTag::Rssi], RangingMode::Auto, SecurityLevel::Basic),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].technology(), TechnologyTag::Uwb);
    }

    #[test]
    fn fused_keeps_every_compatible_technology() {
        let local = [uwb(1), rssi()];
        let remote = [rssi(), uwb(2)];
        let out = select(
            &local,
            &remote,
            &constraints(&[TechnologyTag::Uwb, TechnologyTag::Rssi], RangingMode::Fused, SecurityLevel::Basic),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn no_single_rate_class_fitting_every_survivor_fails_the_whole_selection() {
        // UWB only realizes [150,550] via NORMAL (200ms); CS only realizes it
        // via FREQUENT (500ms). No single class covers both at once, so the
        // whole candidate set must be rejected rather than letting each tech
        // pick its own class independently.
        let local = [uwb(1), cs(0b1111)];
        let remote = [uwb(2), cs(0b1111)];
        let mut constraints = constraints(
            &[TechnologyTag::Uwb, TechnologyTag::Cs],
            RangingMode::Fused,
            SecurityLevel::Basic,
        );
        constraints.update_interval = UpdateIntervalRange::new(150, 550).unwrap();
        let out = select(&local, &remote, &constraints);
        assert!(out.is_empty());
    }

    #[test]
    fn responder_validation_drops_configs_outside_local_capability() {
        let local = [uwb(1)];
        let proposed = vec![
            TechConfig::Uwb(ranging_wire::UwbConfig {
                address: 1,
                session_id: 1,
                config_id: 0, // fits local's 0b1 config-id bitmap
                channel: 1,   // local only supports bit 1 (0b10)
                preamble_index: 0,
                ranging_interval_ms: 200,
                slot_duration_ms: 1,
                session_key: vec![0; 16],
                country_code: *b"US",
                device_role: ranging_wire::DeviceRole::Responder,
                device_mode: ranging_wire::DeviceMode::Controlee,
            }),
            TechConfig::Rssi(RssiConfig { bt_address: [0; 6] }), // no local RSSI capability
        ];
        let accepted = validate_against_local(&local, &proposed);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].technology(), TechnologyTag::Uwb);
    }

    #[test]
    fn secure_constraint_excludes_low_security_cs() {
        let local = [cs(0b0001)];
        let remote = [cs(0b0001)]; // only level 1 supported
        let out = select(
            &local,
            &remote,
            &constraints(&[TechnologyTag::Cs], RangingMode::Auto, SecurityLevel::Secure),
        );
        assert!(out.is_empty());
    }
}
