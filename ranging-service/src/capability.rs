//! Capability registry (§4.C): tracks which technologies this device can use
//! right now and the capability fingerprint it advertises to peers over OOB.
//! A small in-process registry guarded by a `RwLock`, read far more often
//! than written.

use std::collections::HashMap;
use std::sync::Arc;

use ranging_wire::{AvailabilityState, TechCapability, TechnologyTag};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Default)]
struct Inner {
    availability: HashMap<TechnologyTag, AvailabilityState>,
    capabilities: HashMap<TechnologyTag, TechCapability>,
    /// Advertised to peers highest-priority first.
    priority: Vec<TechnologyTag>,
}

/// One posted change to the availability map (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityChange {
    pub technology: TechnologyTag,
    pub state: AvailabilityState,
}

/// Shared, thread-safe registry of this device's ranging capabilities.
///
/// Listeners subscribe via [`CapabilityRegistry::subscribe`]; every
/// availability mutation is posted while the write lock is still held, so
/// two listeners never observe transitions out of the order they actually
/// happened in.
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RwLock<Inner>>,
    changes: broadcast::Sender<AvailabilityChange>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes,
        }
    }

    /// Subscribes to every future availability change. Past changes are not
    /// replayed; callers that need the current state should also call
    /// [`CapabilityRegistry::availability`] after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<AvailabilityChange> {
        self.changes.subscribe()
    }

    /// Registers that this device can use `capability`'s technology, with a
    /// given priority rank (lower index = preferred first in `AUTO` mode).
    /// Marks the technology `Enabled` unless it was previously disabled by
    /// the user or system.
    pub async fn register(&self, capability: TechCapability) {
        let mut inner = self.inner.write().await;
        let tech = capability.technology();
        let already_disabled = matches!(
            inner.availability.get(&tech),
            Some(AvailabilityState::DisabledUser) | Some(AvailabilityState::DisabledSystem)
        );
        inner.capabilities.insert(tech, capability);
        if !already_disabled {
            inner.availability.insert(tech, AvailabilityState::Enabled);
            let _ = self.changes.send(AvailabilityChange {
                technology: tech,
                state: AvailabilityState::Enabled,
            });
        }
        if !inner.priority.contains(&tech) {
            inner.priority.push(tech);
        }
    }

    pub async fn set_availability(&self, tech: TechnologyTag, state: AvailabilityState) {
        let mut inner = self.inner.write().await;
        inner.availability.insert(tech, state);
        let _ = self.changes.send(AvailabilityChange {
            technology: tech,
            state,
        });
    }

    pub async fn availability(&self, tech: TechnologyTag) -> AvailabilityState {
        self.inner
            .read()
            .await
            .availability
            .get(&tech)
            .copied()
            .unwrap_or(AvailabilityState::NotSupported)
    }

    pub async fn capability(&self, tech: TechnologyTag) -> Option<TechCapability> {
        self.inner.read().await.capabilities.get(&tech).cloned()
    }

    /// Capability fingerprint to advertise in a `CapabilityResponse`,
    /// ordered highest-priority first, restricted to technologies that are
    /// currently enabled.
    pub async fn advertised_capabilities(&self) -> Vec<TechCapability> {
        let inner = self.inner.read().await;
        inner
            .priority
            .iter()
            .filter(|t| {
                matches!(
                    inner.availability.get(t),
                    Some(AvailabilityState::Enabled)
                )
            })
            .filter_map(|t| inner.capabilities.get(t).cloned())
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_wire::{RssiCapability, UwbCapability};

    fn uwb_cap() -> TechCapability {
        TechCapability::Uwb(UwbCapability {
            address: 1,
            supported_channels: 0b1,
            supported_preambles: 0b1,
            supported_config_ids: 0b1,
            min_ranging_interval_ms: 100,
            min_slot_duration_ms: 24,
            supported_roles: 0b11,
        })
    }

    fn rssi_cap() -> TechCapability {
        TechCapability::Rssi(RssiCapability {
            bt_address: [1, 2, 3, 4, 5, 6],
        })
    }

    #[tokio::test]
    async fn registering_enables_by_default() {
        let reg = CapabilityRegistry::new();
        reg.register(uwb_cap()).await;
        assert_eq!(
            reg.availability(TechnologyTag::Uwb).await,
            AvailabilityState::Enabled
        );
        assert_eq!(
            reg.availability(TechnologyTag::Cs).await,
            AvailabilityState::NotSupported
        );
    }

    #[tokio::test]
    async fn disabled_tech_is_excluded_from_advertisement() {
        let reg = CapabilityRegistry::new();
        reg.register(uwb_cap()).await;
        reg.register(rssi_cap()).await;
        reg.set_availability(TechnologyTag::Rssi, AvailabilityState::DisabledUser)
            .await;
        let advertised = reg.advertised_capabilities().await;
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].technology(), TechnologyTag::Uwb);
    }

    #[tokio::test]
    async fn subscribers_observe_availability_changes_in_order() {
        let reg = CapabilityRegistry::new();
        let mut changes = reg.subscribe();
        reg.register(uwb_cap()).await;
        reg.set_availability(TechnologyTag::Uwb, AvailabilityState::DisabledUser)
            .await;
        reg.set_availability(TechnologyTag::Uwb, AvailabilityState::Enabled)
            .await;

        assert_eq!(
            changes.recv().await.unwrap(),
            AvailabilityChange {
                technology: TechnologyTag::Uwb,
                state: AvailabilityState::Enabled
            }
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            AvailabilityChange {
                technology: TechnologyTag::Uwb,
                state: AvailabilityState::DisabledUser
            }
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            AvailabilityChange {
                technology: TechnologyTag::Uwb,
                state: AvailabilityState::Enabled
            }
        );
    }

    #[tokio::test]
    async fn priority_order_is_registration_order() {
        let reg = CapabilityRegistry::new();
        reg.register(rssi_cap()).await;
        reg.register(uwb_cap()).await;
        let advertised = reg.advertised_capabilities().await;
        assert_eq!(advertised[0].technology(), TechnologyTag::Rssi);
        assert_eq!(advertised[1].technology(), TechnologyTag::Uwb);
    }
}
