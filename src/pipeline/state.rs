use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RelayError;

/// Coordinator lifecycle.
///
/// `Idle -> Preparing -> Active -> Stopping -> Idle`; a fatal fault jumps
/// straight from `Preparing`/`Active` to `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Preparing,
    Active,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Notifications published to the owning application
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    SessionStarting { session_id: Uuid },
    SessionActive { session_id: Uuid },
    SessionStopped { session_id: Uuid },
    /// A send failed; the session keeps running
    TransportError(RelayError),
    /// The session was torn down and will not recover without a new `start`
    Fatal(RelayError),
}

/// Counters for the current (or last) session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    /// Frames accepted by `on_frame_ready` and queued for the worker
    pub frames_submitted: u64,
    pub frames_rendered: u64,
    /// Presentation time of the last rendered frame
    pub last_frame_pts_us: Option<i64>,
    /// Zero-timestamp frames and frames purged on stop
    pub frames_dropped: u64,
    pub video_units: u64,
    pub audio_units: u64,
    pub parameter_set_resends: u64,
    pub bytes_sent: u64,
    pub transport_errors: u64,
}

impl SessionStats {
    pub(crate) fn begin(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize() {
        let stats = SessionStats::begin(Uuid::new_v4());
        let json = serde_json::to_string(&stats).unwrap();
        let back: SessionStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::default().to_string(), "idle");
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
    }
}
