//! Transport boundary
//!
//! A `Transport` opens one `TransportSession` per recording, keyed by the
//! destination address. The session is owned by the muxer for the lifetime of
//! the recording and destroyed exactly once, on `stop` or when dropped.
//! Failed sends are returned to the caller and never retried here.

#[cfg(feature = "rtp")]
pub mod rtp;

#[cfg(feature = "rtp")]
pub use rtp::{H264Packetizer, RtpTransport};

use crate::errors::Result;
use crate::types::StreamId;

/// Factory for per-recording sessions
pub trait Transport: Send + Sync {
    fn create_session(&self, destination: &str) -> Result<Box<dyn TransportSession>>;
}

/// A live session to one destination
pub trait TransportSession: Send {
    /// Deliver one payload on the given logical stream
    fn send(&mut self, payload: &[u8], stream: StreamId) -> Result<()>;

    /// Release sockets and native state. Called at most once.
    fn destroy(&mut self);
}

/// Scope guard that destroys the wrapped session exactly once
pub struct SessionGuard {
    session: Option<Box<dyn TransportSession>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn TransportSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn send(&mut self, payload: &[u8], stream: StreamId) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.send(payload, stream),
            None => Err(crate::errors::RelayError::Transport(
                "session already destroyed".to_string(),
            )),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn destroy(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.destroy();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[test]
    fn test_guard_destroys_once() {
        let transport = RecordingTransport::new();
        let log = transport.log();
        {
            let mut guard = SessionGuard::new(transport.create_session("10.0.0.2").unwrap());
            guard.send(b"abc", StreamId::Video).unwrap();
            guard.destroy();
            assert!(!guard.is_open());
            assert!(guard.send(b"late", StreamId::Video).is_err());
        }
        let log = log.lock().unwrap();
        assert_eq!(log.sessions_created, 1);
        assert_eq!(log.sessions_destroyed, 1);
        assert_eq!(log.sends.len(), 1);
    }
}
