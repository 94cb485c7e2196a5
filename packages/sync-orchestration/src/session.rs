//! SessionStream / SequenceTracker (C5): per-session event stream, monotonic
//! sequence numbers, and anomaly detection (spec §4.3.7).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionStarted,
    SessionKeepalive,
    SessionRelationships,
    SessionCheckpoint,
    SessionTeardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
    Queued,
    ManualIntervention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRelationshipEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionEventPayload {
    pub change_id: Option<String>,
    #[serde(default)]
    pub relationships: Vec<SessionRelationshipEvent>,
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub seeds: Vec<String>,
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub errors: Vec<SyncError>,
    pub processed_changes: Option<usize>,
    pub total_changes: Option<usize>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: SessionEventKind,
    pub session_id: String,
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<SessionEventPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    Duplicate,
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyResolutionMode {
    Skip,
    Warn,
    Process,
}

impl AnomalyResolutionMode {
    pub fn from_env() -> Self {
        match std::env::var("ANOMALY_RESOLUTION_MODE").as_deref() {
            Ok("skip") => AnomalyResolutionMode::Skip,
            Ok("process") => AnomalyResolutionMode::Process,
            _ => AnomalyResolutionMode::Warn,
        }
    }
}

impl Default for AnomalyResolutionMode {
    fn default() -> Self {
        AnomalyResolutionMode::Warn
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSequenceAnomaly {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sequence_number: u64,
    pub previous_sequence: u64,
    pub reason: AnomalyReason,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SessionSequenceTrackingState {
    last_sequence: u64,
    last_type: Option<String>,
    per_type: HashMap<String, u64>,
}

/// C5: owns per-session sequence generation, anomaly detection, and the
/// broadcast channels the coordinator emits session events/anomalies on.
pub struct SessionStream {
    mode: AnomalyResolutionMode,
    counters: RwLock<HashMap<String, u64>>,
    tracking: RwLock<HashMap<String, SessionSequenceTrackingState>>,
    events: broadcast::Sender<SessionEvent>,
    anomalies: broadcast::Sender<SessionSequenceAnomaly>,
}

impl SessionStream {
    pub fn new(mode: AnomalyResolutionMode) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let (anomalies_tx, _) = broadcast::channel(256);
        Self {
            mode,
            counters: RwLock::new(HashMap::new()),
            tracking: RwLock::new(HashMap::new()),
            events: events_tx,
            anomalies: anomalies_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<SessionSequenceAnomaly> {
        self.anomalies.subscribe()
    }

    /// Strictly monotonic per-session sequence generator: `1, 2, 3, ...`.
    pub async fn next_session_sequence(&self, session_id: &str) -> u64 {
        let mut counters = self.counters.write().await;
        let counter = counters.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn generate_event_id(
        session_id: &str,
        sequence: u64,
        event_type: &str,
        to_id: &str,
        timestamp_ms: i64,
    ) -> String {
        let mut hasher = Sha1::new();
        hasher.update(format!(
            "{session_id}|{sequence}|{event_type}|{to_id}|{timestamp_ms}"
        ));
        let digest = format!("{:x}", hasher.finalize());
        format!("evt_{}", &digest[..16])
    }

    /// Canonical relationship id used for a session-scoped relationship,
    /// derived from the session and the underlying relationship id.
    pub fn session_relationship_id(session_id: &str, relationship_id: &str) -> String {
        format!("session_{session_id}_{relationship_id}")
    }

    /// Checks a just-generated `(type, sequence)` pair against the
    /// session's tracking state, emits an anomaly if one is found, and
    /// returns whether the event should still be processed (`false` means
    /// drop — only possible in `skip` mode; spec §4.3.7).
    pub async fn record_session_sequence(
        &self,
        session_id: &str,
        event_type: &str,
        sequence: u64,
        event_id: &str,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let mut tracking = self.tracking.write().await;
        let state = tracking.entry(session_id.to_string()).or_default();

        let per_type_prev = state.per_type.get(event_type).copied();
        let overall_prev = state.last_sequence;

        let mut reason = None;
        let mut previous_sequence = 0;
        if let Some(prev) = per_type_prev {
            if sequence == prev {
                reason = Some(AnomalyReason::Duplicate);
                previous_sequence = prev;
            } else if sequence < prev {
                reason = Some(AnomalyReason::OutOfOrder);
                previous_sequence = prev;
            }
        }
        if reason.is_none() && overall_prev > 0 {
            if sequence == overall_prev {
                reason = Some(AnomalyReason::Duplicate);
                previous_sequence = overall_prev;
            } else if sequence < overall_prev {
                reason = Some(AnomalyReason::OutOfOrder);
                previous_sequence = overall_prev;
            }
        }

        let keep = if let Some(reason) = reason {
            let anomaly = SessionSequenceAnomaly {
                session_id: session_id.to_string(),
                event_type: event_type.to_string(),
                sequence_number: sequence,
                previous_sequence,
                reason,
                event_id: event_id.to_string(),
                timestamp,
                previous_type: state.last_type.clone(),
            };
            if matches!(reason, AnomalyReason::OutOfOrder) {
                warn!(session_id, event_type, sequence, previous_sequence, "out-of-order session event");
            }
            let _ = self.anomalies.send(anomaly);
            self.mode != AnomalyResolutionMode::Skip
        } else {
            true
        };

        let entry = state.per_type.entry(event_type.to_string()).or_insert(0);
        *entry = (*entry).max(sequence);
        if sequence > state.last_sequence {
            state.last_sequence = sequence;
            state.last_type = Some(event_type.to_string());
        }

        keep
    }

    pub fn emit(
        &self,
        session_id: &str,
        operation_id: &str,
        kind: SessionEventKind,
        payload: Option<SessionEventPayload>,
    ) {
        let _ = self.events.send(SessionEvent {
            kind,
            session_id: session_id.to_string(),
            operation_id: operation_id.to_string(),
            timestamp: Utc::now(),
            payload,
        });
    }

    /// Drops all tracked state for a session (spec §4.3.6 step 6 teardown).
    pub async fn clear_session(&self, session_id: &str) {
        self.counters.write().await.remove(session_id);
        self.tracking.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_session_sequence_is_strictly_monotonic() {
        let stream = SessionStream::new(AnomalyResolutionMode::Warn);
        let seqs: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(stream.next_session_sequence("s1").await);
            }
            out
        };
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_event_ids_are_unique_for_distinct_sequences() {
        let a = SessionStream::generate_event_id("s1", 1, "session_relationships", "e1", 1000);
        let b = SessionStream::generate_event_id("s1", 2, "session_relationships", "e1", 1000);
        assert_ne!(a, b);
        assert!(a.starts_with("evt_"));
        assert_eq!(a.len(), 20);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_in_skip_mode_is_dropped() {
        let stream = SessionStream::new(AnomalyResolutionMode::Skip);
        let mut anomalies = stream.subscribe_anomalies();

        let keep1 = stream
            .record_session_sequence("s1", "session_relationships", 1, "evt_a", Utc::now())
            .await;
        assert!(keep1);

        let keep2 = stream
            .record_session_sequence("s1", "session_relationships", 1, "evt_b", Utc::now())
            .await;
        assert!(!keep2);

        let anomaly = tokio::time::timeout(std::time::Duration::from_millis(100), anomalies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(anomaly.reason, AnomalyReason::Duplicate);
    }

    #[tokio::test]
    async fn test_out_of_order_in_warn_mode_is_kept() {
        let stream = SessionStream::new(AnomalyResolutionMode::Warn);
        stream
            .record_session_sequence("s1", "t", 5, "evt_a", Utc::now())
            .await;
        let keep = stream
            .record_session_sequence("s1", "t", 3, "evt_b", Utc::now())
            .await;
        assert!(keep);
    }

    #[tokio::test]
    async fn test_clear_session_resets_counters() {
        let stream = SessionStream::new(AnomalyResolutionMode::Warn);
        stream.next_session_sequence("s1").await;
        stream.next_session_sequence("s1").await;
        stream.clear_session("s1").await;
        let next = stream.next_session_sequence("s1").await;
        assert_eq!(next, 1);
    }
}
