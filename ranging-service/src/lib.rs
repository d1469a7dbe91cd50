//! Multi-technology ranging core: negotiates, starts, and tears down
//! distance/angle sessions with nearby peers over UWB, BLE Channel
//! Sounding, Wi-Fi RTT, and BLE RSSI, either from caller-supplied raw
//! parameters or by negotiating over an out-of-band transport.

pub mod adapter;
pub mod aggregator;
pub mod audit;
pub mod capability;
pub mod config;
pub mod filter_engine;
pub mod fusion;
pub mod gate;
pub mod negotiator;
pub mod peer_session;
pub mod selector;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use ranging_wire::{
    AvailabilityState, DataNotificationConfig, DataNotificationType, DeviceId, Measurement,
    OobRangingConstraints, RangingData, RangingError, RangingMode, RangingPreference,
    RawRangingParams, SecurityLevel, SessionConfig, TechCapability, TechConfig, TechnologyTag,
    UpdateIntervalRange, UpdateRateClass,
};

pub use adapter::RangingAdapter;
pub use aggregator::SessionAggregator;
pub use capability::CapabilityRegistry;
