//! Fusion adapter and sensor-fusion decision (§4.J/§4.K).
//!
//! No positioning math lives here — accuracy claims are out of scope. The
//! "fusion" this crate performs is preferential: when a session has more
//! than one technology active against the same peer, the most recent
//! sample from the highest-priority technology still reporting is the one
//! delivered to the caller as the session's representative measurement.

use std::collections::HashMap;

use ranging_wire::{RangingData, TechnologyTag};

use crate::selector::DEFAULT_PRIORITY;

pub struct PreferentialFuser {
    priority: Vec<TechnologyTag>,
    latest: HashMap<TechnologyTag, RangingData>,
}

impl PreferentialFuser {
    pub fn new() -> Self {
        Self {
            priority: DEFAULT_PRIORITY.to_vec(),
            latest: HashMap::new(),
        }
    }

    pub fn with_priority(priority: Vec<TechnologyTag>) -> Self {
        Self {
            priority,
            latest: HashMap::new(),
        }
    }

    /// Records `data` as the latest sample for its technology and returns
    /// the current best available sample across all technologies, i.e. the
    /// fused output for this tick.
    pub fn ingest(&mut self, data: RangingData) -> Option<RangingData> {
        self.latest.insert(data.technology, data);
        self.priority
            .iter()
            .find_map(|tech| self.latest.get(tech))
            .cloned()
    }
}

impl Default for PreferentialFuser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_wire::{DeviceId, Measurement};

    fn sample(tech: TechnologyTag, value: f64) -> RangingData {
        RangingData {
            peer: DeviceId::new(1),
            technology: tech,
            distance: Some(Measurement {
                value,
                error: 0.0,
                confidence: 1.0,
            }),
            azimuth: None,
            elevation: None,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn prefers_higher_priority_technology() {
        let mut fuser = PreferentialFuser::new();
        let out = fuser.ingest(sample(TechnologyTag::Rssi, 3.0)).unwrap();
        assert_eq!(out.technology, TechnologyTag::Rssi);

        let out = fuser.ingest(sample(TechnologyTag::Uwb, 2.5)).unwrap();
        assert_eq!(out.technology, TechnologyTag::Uwb);

        // RSSI updates again, but UWB is still the latest/preferred source.
        let out = fuser.ingest(sample(TechnologyTag::Rssi, 3.1)).unwrap();
        assert_eq!(out.technology, TechnologyTag::Uwb);
    }
}
