//! Append-only, SHA-256-chained audit trail of session lifecycle and
//! selector-decision events: a genesis hash, a
//! `prev_hash || timestamp || event_type || payload` chain computed with
//! `sha2::Sha256`, and an `AuditLogger` that appends JSON lines to a file
//! under a lock, falling back to logging the entry via `tracing` if the
//! file can't be opened rather than losing the event or crashing the
//! service.

use std::sync::Arc;

use ranging_wire::DeviceId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    SessionOpened,
    SessionStarted,
    SessionStopped,
    SessionClosed,
    SelectorDecision,
    OobFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBlock {
    pub block_seq: u64,
    pub peer: String,
    pub timestamp_ms: u64,
    pub prev_hash: String,
    pub event_type: AuditEventType,
    pub detail: String,
    pub block_hash: String,
}

impl AuditBlock {
    fn compute_hash(prev_hash: &str, timestamp_ms: u64, event_type: AuditEventType, detail: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(format!("{event_type:?}").as_bytes());
        hasher.update(detail.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn new(
        block_seq: u64,
        peer: String,
        timestamp_ms: u64,
        prev_hash: String,
        event_type: AuditEventType,
        detail: String,
    ) -> Self {
        let block_hash = Self::compute_hash(&prev_hash, timestamp_ms, event_type, &detail);
        Self {
            block_seq,
            peer,
            timestamp_ms,
            prev_hash,
            event_type,
            detail,
            block_hash,
        }
    }

    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.prev_hash, self.timestamp_ms, self.event_type, &self.detail)
            == self.block_hash
    }
}

struct AuditState {
    next_seq: u64,
    last_hash: String,
}

/// `None` path means "log only, never touch the filesystem" — used by
/// tests and by the service binary when no writable audit directory is
/// configured.
pub struct AuditLogger {
    path: Option<String>,
    state: RwLock<AuditState>,
}

impl AuditLogger {
    pub fn new(path: String) -> Self {
        Self {
            path: Some(path),
            state: RwLock::new(AuditState {
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            state: RwLock::new(AuditState {
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    pub async fn append(&self, peer: DeviceId, event_type: AuditEventType, detail: impl Into<String>) {
        let detail = detail.into();
        let timestamp_ms = now_ms();
        let mut state = self.state.write().await;
        let block = AuditBlock::new(
            state.next_seq,
            peer.to_string(),
            timestamp_ms,
            state.last_hash.clone(),
            event_type,
            detail,
        );
        state.next_seq += 1;
        state.last_hash = block.block_hash.clone();
        drop(state);
        self.write_block(&block).await;
    }

    async fn write_block(&self, block: &AuditBlock) {
        let Some(path) = &self.path else {
            tracing::info!(event_type = ?block.event_type, peer = %block.peer, "audit (unlogged)");
            return;
        };
        let line = match serde_json::to_string(block) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize audit block");
                return;
            }
        };
        match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
            Ok(mut file) => {
                if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                    warn!(error = %err, path, "failed to append to audit log, falling back to stdout");
                    println!("{line}");
                }
            }
            Err(err) => {
                warn!(error = %err, path, "could not open audit log, falling back to stdout");
                println!("{line}");
            }
        }
    }

    pub async fn log_session_event(&self, peer: DeviceId, detail: impl Into<String>) {
        let detail = detail.into();
        let event_type = match detail.as_str() {
            "session_opened" => AuditEventType::SessionOpened,
            "session_started" => AuditEventType::SessionStarted,
            "session_stopped" => AuditEventType::SessionStopped,
            _ => AuditEventType::SessionClosed,
        };
        self.append(peer, event_type, detail).await;
    }

    pub async fn log_selector_decision(&self, peer: DeviceId, detail: impl Into<String>) {
        self.append(peer, AuditEventType::SelectorDecision, detail).await;
    }

    pub async fn log_oob_failure(&self, peer: DeviceId, detail: impl Into<String>) {
        self.append(peer, AuditEventType::OobFailure, detail).await;
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub type SharedAuditLogger = Arc<AuditLogger>;
