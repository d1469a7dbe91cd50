//! Data-notification gate (§4.I): decides whether a given `RangingData`
//! sample should actually be delivered to the caller, based on the
//! session's `DataNotificationConfig`.

use ranging_wire::{DataNotificationConfig, DataNotificationType, RangingData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityBucket {
    Near,
    Medium,
    Far,
}

pub struct NotificationGate {
    config: DataNotificationConfig,
    last_bucket: Option<ProximityBucket>,
}

impl NotificationGate {
    pub fn new(config: DataNotificationConfig) -> Self {
        Self {
            config,
            last_bucket: None,
        }
    }

    fn bucket(&self, distance_m: f64) -> ProximityBucket {
        if distance_m <= self.config.proximity_near_m {
            ProximityBucket::Near
        } else if distance_m >= self.config.proximity_far_m {
            ProximityBucket::Far
        } else {
            ProximityBucket::Medium
        }
    }

    /// Whether `data` should be forwarded to the caller. Has side effects
    /// for `PROXIMITY_EDGE` mode: it remembers the last bucket crossed so
    /// the *next* call can tell whether a transition happened.
    pub fn should_forward(&mut self, data: &RangingData) -> bool {
        match self.config.notification_type {
            DataNotificationType::Disable => false,
            DataNotificationType::Enable => true,
            DataNotificationType::ProximityLevel => data
                .distance
                .is_some_and(|m| m.value >= self.config.proximity_near_m && m.value <= self.config.proximity_far_m),
            DataNotificationType::ProximityEdge => {
                let Some(distance) = data.distance.map(|m| m.value) else {
                    return false;
                };
                let bucket = self.bucket(distance);
                let crossed = self.last_bucket != Some(bucket);
                self.last_bucket = Some(bucket);
                crossed
            }
        }
    }
}
