//! Core ranging data model (peer identity, technology tags, capability
//! fingerprints, session configuration, and emitted measurements).
//!
//! These types are shared by every component in the workspace: the codec
//! (`crate::codec`) serializes/deserializes the `TechCapability`/`TechConfig`
//! variants defined here, the selector produces them, and the peer-session
//! FSM in `ranging-service` consumes them. They live in their own crate so
//! both the wire codec and the service depend on a single definition.

use serde::{Deserialize, Serialize};
use std::fmt;

// ─── DeviceId ─────────────────────────────────────────────────────────────────

/// Process-unique opaque identifier for a remote ranging participant.
///
/// Equality and hashing are structural (derived): a plain value, not an
/// interned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u128);

impl DeviceId {
    pub fn new(id: u128) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ─── TechnologyTag ────────────────────────────────────────────────────────────

/// Closed enumeration of the radio technologies the core can coordinate.
///
/// The discriminant doubles as the wire bit index used throughout §4.A's
/// bitmaps (`UWB=0, CS=1, RTT=2, RSSI=3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TechnologyTag {
    Uwb,
    Cs,
    Rtt,
    Rssi,
}

impl TechnologyTag {
    pub const ALL: [TechnologyTag; 4] = [
        TechnologyTag::Uwb,
        TechnologyTag::Cs,
        TechnologyTag::Rtt,
        TechnologyTag::Rssi,
    ];

    /// Stable bit index used for bitmap (de)serialization.
    pub const fn bit_index(self) -> u8 {
        match self {
            TechnologyTag::Uwb => 0,
            TechnologyTag::Cs => 1,
            TechnologyTag::Rtt => 2,
            TechnologyTag::Rssi => 3,
        }
    }

    pub const fn from_bit_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(TechnologyTag::Uwb),
            1 => Some(TechnologyTag::Cs),
            2 => Some(TechnologyTag::Rtt),
            3 => Some(TechnologyTag::Rssi),
            _ => None,
        }
    }
}

impl fmt::Display for TechnologyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TechnologyTag::Uwb => "UWB",
            TechnologyTag::Cs => "CS",
            TechnologyTag::Rtt => "RTT",
            TechnologyTag::Rssi => "RSSI",
        };
        write!(f, "{s}")
    }
}

// ─── AvailabilityState ────────────────────────────────────────────────────────

/// Per-technology availability, as tracked by the capability registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityState {
    NotSupported,
    DisabledUser,
    DisabledSystem,
    Enabled,
}

impl AvailabilityState {
    pub fn is_usable(self) -> bool {
        matches!(self, AvailabilityState::Enabled)
    }
}

// ─── Device role / mode (UWB, RTT) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    Controller,
    Controlee,
}

/// BLE-CS security level, 1 (lowest) through 4 (highest / `SECURE`-capable).
pub type SecurityLevelValue = u8;

// ─── Concrete per-technology configuration (TechConfig wire blocks) ─────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UwbConfig {
    pub address: u16,
    pub session_id: u32,
    pub config_id: u8,
    pub channel: u8,
    pub preamble_index: u8,
    pub ranging_interval_ms: u16,
    pub slot_duration_ms: u8,
    /// Must be 8, 16, or 32 bytes.
    pub session_key: Vec<u8>,
    /// Two uppercase ASCII letters, e.g. `['U', 'S']`.
    pub country_code: [u8; 2],
    pub device_role: DeviceRole,
    pub device_mode: DeviceMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsConfig {
    pub bt_address: [u8; 6],
    pub security_level: SecurityLevelValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttConfig {
    pub name: String,
    pub device_role: DeviceRole,
    pub periodic_ranging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiConfig {
    pub bt_address: [u8; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TechConfig {
    Uwb(UwbConfig),
    Cs(CsConfig),
    Rtt(RttConfig),
    Rssi(RssiConfig),
}

impl TechConfig {
    pub fn technology(&self) -> TechnologyTag {
        match self {
            TechConfig::Uwb(_) => TechnologyTag::Uwb,
            TechConfig::Cs(_) => TechnologyTag::Cs,
            TechConfig::Rtt(_) => TechnologyTag::Rtt,
            TechConfig::Rssi(_) => TechnologyTag::Rssi,
        }
    }
}

// ─── Peer capability fingerprint (TechCapability wire blocks) ───────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwbCapability {
    pub address: u16,
    /// Bitmaps over the 32 possible values each field can take on the wire.
    pub supported_channels: u32,
    pub supported_preambles: u32,
    pub supported_config_ids: u32,
    pub min_ranging_interval_ms: u16,
    pub min_slot_duration_ms: u8,
    /// Bit 0 = INITIATOR, bit 1 = RESPONDER.
    pub supported_roles: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsCapability {
    pub bt_address: [u8; 6],
    /// Bit `n` set means security level `n+1` is supported.
    pub supported_security_levels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttCapability {
    pub supports_periodic: bool,
    /// Bitmap of supported bandwidth classes; meaning is adapter-defined.
    pub supported_bandwidths: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiCapability {
    pub bt_address: [u8; 6],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechCapability {
    Uwb(UwbCapability),
    Cs(CsCapability),
    Rtt(RttCapability),
    Rssi(RssiCapability),
}

impl TechCapability {
    pub fn technology(&self) -> TechnologyTag {
        match self {
            TechCapability::Uwb(_) => TechnologyTag::Uwb,
            TechCapability::Cs(_) => TechnologyTag::Cs,
            TechCapability::Rtt(_) => TechnologyTag::Rtt,
            TechCapability::Rssi(_) => TechnologyTag::Rssi,
        }
    }
}

// ─── Raw (non-negotiated) per-technology start parameters ──────────────────

/// Carrier for per-technology start parameters supplied directly by the
/// caller, bypassing OOB negotiation. One entry per technology the caller
/// wants to start for a given peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRangingParams {
    pub configs: Vec<TechConfig>,
}

impl RawRangingParams {
    pub fn new(configs: Vec<TechConfig>) -> Self {
        Self { configs }
    }

    pub fn technologies(&self) -> impl Iterator<Item = TechnologyTag> + '_ {
        self.configs.iter().map(TechConfig::technology)
    }
}

// ─── OOB negotiation constraints ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    Basic,
    Secure,
}

impl SecurityLevel {
    /// Minimum BLE-CS security level that satisfies this requirement.
    /// `SECURE` requires level four; `BASIC` accepts level one or above.
    pub fn minimum_cs_level(self) -> SecurityLevelValue {
        match self {
            SecurityLevel::Basic => 1,
            SecurityLevel::Secure => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangingMode {
    Auto,
    HighAccuracy,
    HighAccuracyPreferred,
    Fused,
}

/// Update interval range `[fastest, slowest]` in milliseconds.
///
/// Invariant: `fastest <= slowest`. Construct via [`UpdateIntervalRange::new`]
/// to enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIntervalRange {
    fastest_ms: u32,
    slowest_ms: u32,
}

impl UpdateIntervalRange {
    pub fn new(fastest_ms: u32, slowest_ms: u32) -> Option<Self> {
        if fastest_ms <= slowest_ms {
            Some(Self {
                fastest_ms,
                slowest_ms,
            })
        } else {
            None
        }
    }

    pub fn fastest_ms(&self) -> u32 {
        self.fastest_ms
    }

    pub fn slowest_ms(&self) -> u32 {
        self.slowest_ms
    }

    pub fn contains(&self, interval_ms: u32) -> bool {
        interval_ms >= self.fastest_ms && interval_ms <= self.slowest_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobRangingConstraints {
    pub allowed_technologies: TechSetValue,
    pub security_level: SecurityLevel,
    pub ranging_mode: RangingMode,
    pub update_interval: UpdateIntervalRange,
}

/// A plain set-of-technologies value, independent of the wire `TechSet`
/// bitmap type in `crate::codec` (this one never goes over the wire raw —
/// it's an in-memory constraint, constructed from a slice of tags).
pub type TechSetValue = u16;

pub fn tech_set_of(tags: impl IntoIterator<Item = TechnologyTag>) -> TechSetValue {
    tags.into_iter().fold(0u16, |acc, t| acc | (1 << t.bit_index()))
}

pub fn tech_set_contains(set: TechSetValue, tag: TechnologyTag) -> bool {
    set & (1 << tag.bit_index()) != 0
}

pub fn tech_set_iter(set: TechSetValue) -> impl Iterator<Item = TechnologyTag> {
    TechnologyTag::ALL
        .into_iter()
        .filter(move |t| tech_set_contains(set, *t))
}

// ─── UpdateRateClass ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateRateClass {
    Normal,
    Infrequent,
    Frequent,
}

impl UpdateRateClass {
    pub const ALL: [UpdateRateClass; 3] = [
        UpdateRateClass::Normal,
        UpdateRateClass::Infrequent,
        UpdateRateClass::Frequent,
    ];

    /// Concrete per-technology interval for this class, in milliseconds.
    /// Fixed table: UWB and Wi-Fi RTT NORMAL=200/INFREQUENT=600/FREQUENT=100;
    /// BLE-CS and BLE-RSSI NORMAL=1000/INFREQUENT=3000/FREQUENT=500.
    pub fn concrete_interval_ms(self, tech: TechnologyTag) -> u32 {
        match (tech, self) {
            (TechnologyTag::Uwb, UpdateRateClass::Normal) => 200,
            (TechnologyTag::Uwb, UpdateRateClass::Infrequent) => 600,
            (TechnologyTag::Uwb, UpdateRateClass::Frequent) => 100,
            (TechnologyTag::Rtt, UpdateRateClass::Normal) => 200,
            (TechnologyTag::Rtt, UpdateRateClass::Infrequent) => 600,
            (TechnologyTag::Rtt, UpdateRateClass::Frequent) => 100,
            (TechnologyTag::Cs, UpdateRateClass::Normal)
            | (TechnologyTag::Rssi, UpdateRateClass::Normal) => 1000,
            (TechnologyTag::Cs, UpdateRateClass::Infrequent)
            | (TechnologyTag::Rssi, UpdateRateClass::Infrequent) => 3000,
            (TechnologyTag::Cs, UpdateRateClass::Frequent)
            | (TechnologyTag::Rssi, UpdateRateClass::Frequent) => 500,
        }
    }

    /// A constraint interval range is realizable by this class iff the
    /// class's concrete interval lies in the range, for every technology
    /// in `techs`. An empty `techs` set is vacuously realizable.
    pub fn realizable_for(
        self,
        techs: impl IntoIterator<Item = TechnologyTag>,
        range: UpdateIntervalRange,
    ) -> bool {
        techs
            .into_iter()
            .all(|t| range.contains(self.concrete_interval_ms(t)))
    }
}

// ─── SessionConfig / DataNotificationConfig ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataNotificationType {
    Enable,
    Disable,
    ProximityLevel,
    ProximityEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataNotificationConfig {
    pub notification_type: DataNotificationType,
    pub proximity_near_m: f64,
    pub proximity_far_m: f64,
}

impl DataNotificationConfig {
    pub fn enabled() -> Self {
        Self {
            notification_type: DataNotificationType::Enable,
            proximity_near_m: 0.0,
            proximity_far_m: 0.0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            notification_type: DataNotificationType::Disable,
            proximity_near_m: 0.0,
            proximity_far_m: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 0 = unlimited.
    pub measurement_limit: u32,
    pub aoa_needed: bool,
    pub data_notification: DataNotificationConfig,
    pub sensor_fusion_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            measurement_limit: 0,
            aoa_needed: false,
            data_notification: DataNotificationConfig::enabled(),
            sensor_fusion_enabled: false,
        }
    }
}

// ─── Measurement / RangingData ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub error: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangingData {
    pub peer: DeviceId,
    pub technology: TechnologyTag,
    pub distance: Option<Measurement>,
    pub azimuth: Option<Measurement>,
    pub elevation: Option<Measurement>,
    pub timestamp_ms: i64,
}

// ─── Ranging preference (tagged variant; see spec §9 design notes) ─────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RangingPreference {
    RawInitiator {
        peers: Vec<(DeviceId, RawRangingParams)>,
    },
    RawResponder {
        peer: DeviceId,
    },
    OobInitiator {
        peers: Vec<DeviceId>,
        constraints: OobRangingConstraints,
        session_config: SessionConfig,
    },
    OobResponder {
        peer: DeviceId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_rate_class_table_is_internally_consistent() {
        assert_eq!(
            UpdateRateClass::Normal.concrete_interval_ms(TechnologyTag::Uwb),
            200
        );
        assert_eq!(
            UpdateRateClass::Frequent.concrete_interval_ms(TechnologyTag::Cs),
            500
        );
        assert_eq!(
            UpdateRateClass::Infrequent.concrete_interval_ms(TechnologyTag::Rssi),
            3000
        );
    }

    #[test]
    fn update_interval_range_rejects_inverted_bounds() {
        assert!(UpdateIntervalRange::new(100, 50).is_none());
        assert!(UpdateIntervalRange::new(50, 50).is_some());
    }

    #[test]
    fn tech_set_roundtrips_through_helpers() {
        let set = tech_set_of([TechnologyTag::Uwb, TechnologyTag::Rtt]);
        assert!(tech_set_contains(set, TechnologyTag::Uwb));
        assert!(tech_set_contains(set, TechnologyTag::Rtt));
        assert!(!tech_set_contains(set, TechnologyTag::Cs));
        let collected: Vec<_> = tech_set_iter(set).collect();
        assert_eq!(collected, vec![TechnologyTag::Uwb, TechnologyTag::Rtt]);
    }
}
