//! Ranging adapter (§4.F): the boundary between this crate's orchestration
//! logic and whatever actually drives the radio (UWB chip driver, BLE
//! stack, Wi-Fi NAN stack, ...).
//!
//! Object-safety matters here — the aggregator holds a single
//! `Arc<dyn RangingAdapter>` regardless of how many technologies or peers
//! are active — so this trait is `async_trait`'d to keep its async methods
//! object-safe.

use async_trait::async_trait;
use ranging_wire::{DeviceId, RangingData, RangingError, SessionConfig, TechCapability, TechConfig, TechnologyTag};
use tokio::sync::mpsc;

/// Why an active per-technology session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ClosedReason {
    Requested,
    FailedToStart,
    LostConnection,
    SystemPolicy,
    LocalRequest,
    RemoteRequest,
    Error(String),
    /// The session owner gave up waiting (no-initial-data, watchdog,
    /// background, or stop grace timer) and tore the session down itself.
    ForceStopped,
}

#[derive(Debug, Clone)]
pub enum AdapterSessionEvent {
    Data(RangingData),
    Closed {
        peer: DeviceId,
        technology: TechnologyTag,
        reason: ClosedReason,
    },
}

/// Drives the underlying hardware/stack for one or more peers.
#[async_trait]
pub trait RangingAdapter: Send + Sync {
    /// This device's own capability fingerprint, as advertised over OOB.
    async fn local_capabilities(&self) -> Vec<TechCapability>;

    /// Starts a single-technology session with `peer`. Events (measurements,
    /// and eventually a `Closed`) are pushed onto `events` until the session
    /// ends; the adapter is responsible for tagging every event it emits
    /// with the right `peer`/`technology`.
    async fn start_session(
        &self,
        peer: DeviceId,
        config: TechConfig,
        session_config: SessionConfig,
        events: mpsc::Sender<AdapterSessionEvent>,
    ) -> Result<(), RangingError>;

    /// Requests a clean stop of one technology with one peer. The adapter
    /// still emits a final `Closed { reason: Requested, .. }` on the
    /// channel it was given in `start_session` rather than synchronously
    /// tearing the session down here.
    async fn stop_session(&self, peer: DeviceId, technology: TechnologyTag) -> Result<(), RangingError>;

    /// The host application moved to the background. Adapters that need to
    /// throttle or suspend radio activity to save power override this; the
    /// default is a no-op and the session keeps running until the owning
    /// peer session's background timeout forces it closed.
    async fn on_app_background(&self) {}

    /// The host application returned to the foreground, cancelling any
    /// pending background timeout.
    async fn on_app_foreground(&self) {}
}
