//! `SimulatedAdapter`: a `RangingAdapter` implementation used by the FSM and
//! aggregator test suites in place of real UWB/BLE/Wi-Fi hardware. A fake
//! peer that emits measurements on a timer and can be told to fail or
//! disconnect on demand, so the orchestration logic above it can be
//! exercised without any accuracy claims or real radio underneath.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ranging_wire::{DeviceId, Measurement, RangingData, RangingError, SessionConfig, TechCapability, TechConfig, TechnologyTag, UwbCapability};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::adapter::{AdapterSessionEvent, ClosedReason, RangingAdapter};

#[derive(Debug, Clone, Copy)]
pub enum SimulatedBehavior {
    /// Emit a measurement every `period` until stopped.
    Periodic { period: Duration },
    /// Fail the `start_session` call outright.
    FailToStart,
    /// Start, then immediately close with `LostConnection`.
    DropImmediately,
    /// Start successfully but never emit anything until stopped — used to
    /// exercise the peer session's no-data timeouts.
    Silent,
}

/// A software stand-in for radio hardware: every `start_session` spawns a
/// small task that drives `events` according to the configured behavior.
pub struct SimulatedAdapter {
    behavior: SimulatedBehavior,
    local_capabilities: Vec<TechCapability>,
    measurements_sent: Arc<AtomicU32>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self::with_behavior(SimulatedBehavior::Periodic {
            period: Duration::from_millis(10),
        })
    }

    pub fn with_behavior(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            local_capabilities: vec![TechCapability::Uwb(UwbCapability {
                address: 0xBEEF,
                supported_channels: 0b10,
                supported_preambles: 0b1,
                supported_config_ids: 0b1,
                min_ranging_interval_ms: 100,
                min_slot_duration_ms: 1,
                supported_roles: 0b11,
            })],
            measurements_sent: Arc::new(AtomicU32::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn measurements_sent(&self) -> u32 {
        self.measurements_sent.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RangingAdapter for SimulatedAdapter {
    async fn local_capabilities(&self) -> Vec<TechCapability> {
        self.local_capabilities.clone()
    }

    async fn start_session(
        &self,
        peer: DeviceId,
        config: TechConfig,
        _session_config: SessionConfig,
        events: mpsc::Sender<AdapterSessionEvent>,
    ) -> Result<(), RangingError> {
        let technology = config.technology();
        match self.behavior {
            SimulatedBehavior::FailToStart => {
                return Err(RangingError::Transport("simulated start failure".into()))
            }
            SimulatedBehavior::DropImmediately => {
                let _ = events
                    .send(AdapterSessionEvent::Closed {
                        peer,
                        technology,
                        reason: ClosedReason::LostConnection,
                    })
                    .await;
                return Ok(());
            }
            SimulatedBehavior::Silent => {}
            SimulatedBehavior::Periodic { period } => {
                let counter = self.measurements_sent.clone();
                let handle = tokio::spawn(async move {
                    let mut n = 0u32;
                    loop {
                        tokio::time::sleep(period).await;
                        n += 1;
                        counter.fetch_add(1, Ordering::Relaxed);
                        let data = RangingData {
                            peer,
                            technology,
                            distance: Some(Measurement {
                                value: 1.0 + (n as f64 * 0.01),
                                error: 0.05,
                                confidence: 0.9,
                            }),
                            azimuth: None,
                            elevation: None,
                            timestamp_ms: n as i64 * period.as_millis() as i64,
                        };
                        if events.send(AdapterSessionEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                });
                self.tasks.lock().await.push(handle);
            }
        }
        Ok(())
    }

    async fn stop_session(&self, peer: DeviceId, technology: TechnologyTag) -> Result<(), RangingError> {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        let _ = (peer, technology);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn periodic_behavior_emits_measurements() {
        let adapter = SimulatedAdapter::with_behavior(SimulatedBehavior::Periodic {
            period: Duration::from_millis(5),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let peer = DeviceId::new(1);
        let config = TechConfig::Rssi(ranging_wire::RssiConfig {
            bt_address: [0; 6],
        });
        adapter
            .start_session(peer, config, SessionConfig::default(), tx)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AdapterSessionEvent::Data(_)));
    }

    #[tokio::test]
    async fn fail_to_start_behavior_returns_error() {
        let adapter = SimulatedAdapter::with_behavior(SimulatedBehavior::FailToStart);
        let (tx, _rx) = mpsc::channel(8);
        let result = adapter
            .start_session(
                DeviceId::new(1),
                TechConfig::Rssi(ranging_wire::RssiConfig { bt_address: [0; 6] }),
                SessionConfig::default(),
                tx,
            )
            .await;
        assert!(result.is_err());
    }
}
