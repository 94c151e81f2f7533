//! Call history recording
//!
//! Teardown hands a finalized [`CallLogEntry`] to an application-provided
//! [`CallLogSink`]. Recording is fire-and-forget: the sink runs on its own
//! task and can never delay or fail a teardown.

use crate::types::{CallId, EndReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a call concluded, from the local device's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    /// Connected and later hung up by either side
    Completed,
    /// Never answered (ring or answer window elapsed)
    Missed,
    /// Explicitly declined by either side
    Declined,
    /// Rejected because another call was active
    Busy,
    /// Setup or transport failure
    Failed,
}

impl From<EndReason> for CallOutcome {
    fn from(reason: EndReason) -> Self {
        match reason {
            EndReason::HungUp | EndReason::RemoteHangUp => Self::Completed,
            EndReason::NoAnswer | EndReason::RingTimeout => Self::Missed,
            EndReason::RemoteDeclined | EndReason::LocalDeclined => Self::Declined,
            EndReason::Busy => Self::Busy,
            EndReason::TransportFailed
            | EndReason::MediaUnavailable
            | EndReason::NegotiationFailed => Self::Failed,
        }
    }
}

/// One finished call, as handed to the history sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    /// Server-assigned call id
    pub call_id: CallId,
    /// The remote participant
    pub remote_peer: String,
    /// Connected time in seconds; zero when the call never connected
    pub duration_seconds: u64,
    /// Outcome classification
    pub outcome: CallOutcome,
    /// When teardown finalized
    pub ended_at: DateTime<Utc>,
}

/// Destination for finished-call records
#[async_trait]
pub trait CallLogSink: Send + Sync {
    /// Record one entry. Infallible by contract: persistence failures are
    /// the sink's own concern to log.
    async fn record(&self, entry: CallLogEntry);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn end_reasons_map_to_outcomes() {
        assert_eq!(CallOutcome::from(EndReason::HungUp), CallOutcome::Completed);
        assert_eq!(
            CallOutcome::from(EndReason::RemoteHangUp),
            CallOutcome::Completed
        );
        assert_eq!(CallOutcome::from(EndReason::NoAnswer), CallOutcome::Missed);
        assert_eq!(
            CallOutcome::from(EndReason::RingTimeout),
            CallOutcome::Missed
        );
        assert_eq!(
            CallOutcome::from(EndReason::LocalDeclined),
            CallOutcome::Declined
        );
        assert_eq!(CallOutcome::from(EndReason::Busy), CallOutcome::Busy);
        assert_eq!(
            CallOutcome::from(EndReason::MediaUnavailable),
            CallOutcome::Failed
        );
    }

    #[test]
    fn log_entry_serializes() {
        let entry = CallLogEntry {
            call_id: CallId::from("call-1"),
            remote_peer: "peer-a".to_string(),
            duration_seconds: 42,
            outcome: CallOutcome::Completed,
            ended_at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["duration_seconds"], 42);
    }
}
