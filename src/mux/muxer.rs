//! Stream muxer forwarding access units to the transport session
//!
//! Track ids are fixed (video = 1, audio = 2) and derived from the encoder's
//! MIME type, never from registration order. The muxer only forwards once
//! every registered encoder has reported its track ready, and only counts as
//! stopped once every one of them has stopped.

use std::collections::BTreeSet;
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::adts::{AudioSpecificConfig, ADTS_HEADER_LEN};
use crate::errors::{RelayError, Result};
use crate::transport::SessionGuard;
use crate::types::{AccessUnit, AccessUnitKind, StreamId, TrackKind};

/// Forwarding counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxerStats {
    pub video_units: u64,
    pub audio_units: u64,
    pub parameter_set_resends: u64,
    pub bytes_sent: u64,
    /// Units that arrived before every track was ready
    pub dropped_before_start: u64,
}

#[derive(Debug, Default)]
struct StartGate {
    encoder_count: usize,
    started_count: usize,
    started: bool,
}

pub struct StreamMuxer {
    transport: SessionGuard,
    audio: AudioSpecificConfig,
    gate: Mutex<StartGate>,
    registered: BTreeSet<TrackKind>,
    tracks: BTreeSet<TrackKind>,
    parameter_sets: Option<Bytes>,
    stats: MuxerStats,
}

impl StreamMuxer {
    pub fn new(transport: SessionGuard, audio: AudioSpecificConfig) -> Self {
        Self {
            transport,
            audio,
            gate: Mutex::new(StartGate::default()),
            registered: BTreeSet::new(),
            tracks: BTreeSet::new(),
            parameter_sets: None,
            stats: MuxerStats::default(),
        }
    }

    /// Declare that an encoder feeding `kind` will take part in this session.
    ///
    /// The start gate waits for every registered encoder.
    pub fn register_encoder(&mut self, kind: TrackKind) -> Result<()> {
        let mut gate = self.gate.lock().expect("lock poisoned");
        if gate.started {
            return Err(RelayError::MuxerState("muxer already started".to_string()));
        }
        if !self.registered.insert(kind) {
            return Err(RelayError::MuxerState(format!("{} encoder already added", kind)));
        }
        gate.encoder_count = self.registered.len();
        Ok(())
    }

    /// Add the track described by an encoder's output MIME type and return
    /// its fixed id.
    pub fn add_track(&mut self, mime: &str) -> Result<u8> {
        if self.is_started() {
            return Err(RelayError::MuxerState("muxer already started".to_string()));
        }
        let kind = TrackKind::from_mime(mime)
            .ok_or_else(|| RelayError::MuxerState(format!("unsupported track format {}", mime)))?;
        if !self.tracks.insert(kind) {
            return Err(RelayError::MuxerState(format!("{} track already added", kind)));
        }
        log::info!("addTrack: encoders={}, track={} ({})", self.registered.len(), kind.track_id(), mime);
        Ok(kind.track_id())
    }

    /// Count one encoder as ready. Returns whether the muxer is now started.
    pub fn start(&self) -> Result<bool> {
        let mut gate = self.gate.lock().expect("lock poisoned");
        if gate.encoder_count == 0 {
            return Err(RelayError::MuxerState("no encoders registered".to_string()));
        }
        gate.started_count += 1;
        if gate.started_count >= gate.encoder_count && !gate.started {
            gate.started = true;
            log::info!("Muxer started with {} track(s)", gate.encoder_count);
        }
        Ok(gate.started)
    }

    /// Count one encoder as stopped. Returns whether the muxer is now fully
    /// stopped.
    pub fn stop(&self) -> bool {
        let mut gate = self.gate.lock().expect("lock poisoned");
        gate.started_count = gate.started_count.saturating_sub(1);
        if gate.encoder_count > 0 && gate.started_count == 0 {
            if gate.started {
                log::info!("Muxer stopped");
            }
            gate.started = false;
            return true;
        }
        false
    }

    pub fn is_started(&self) -> bool {
        self.gate.lock().expect("lock poisoned").started
    }

    /// Forward one access unit on `track`.
    ///
    /// Units arriving before the muxer has started are dropped, except video
    /// parameter sets, which are still cached for the first keyframe.
    /// Transport failures are returned to the caller unchanged.
    pub fn write_sample_data(&mut self, track: TrackKind, unit: &AccessUnit) -> Result<()> {
        if !self.is_started() {
            if track == TrackKind::Video && unit.kind == AccessUnitKind::ParameterSet {
                self.cache_parameter_sets(unit);
                return Ok(());
            }
            self.stats.dropped_before_start += 1;
            log::trace!("Dropping {:?} on {} track before muxer start", unit.kind, track);
            return Ok(());
        }
        if !self.tracks.contains(&track) {
            return Err(RelayError::MuxerState(format!("{} track not added", track)));
        }

        match track {
            TrackKind::Video => self.write_video(unit),
            TrackKind::Audio => self.write_audio(unit),
        }
    }

    fn write_video(&mut self, unit: &AccessUnit) -> Result<()> {
        match unit.kind {
            AccessUnitKind::ParameterSet => {
                self.cache_parameter_sets(unit);
                Ok(())
            }
            AccessUnitKind::Keyframe => {
                if let Some(parameter_sets) = self.parameter_sets.as_ref() {
                    self.transport.send(parameter_sets, StreamId::Video)?;
                    self.stats.parameter_set_resends += 1;
                    self.stats.bytes_sent += parameter_sets.len() as u64;
                }
                self.send(&unit.data, StreamId::Video)
            }
            AccessUnitKind::DeltaFrame => self.send(&unit.data, StreamId::Video),
            AccessUnitKind::AudioFrame => Err(RelayError::MuxerState(
                "audio unit written to video track".to_string(),
            )),
        }
    }

    fn cache_parameter_sets(&mut self, unit: &AccessUnit) {
        self.parameter_sets = Some(unit.data.clone());
        log::debug!("Cached {} bytes of parameter sets", unit.size());
    }

    fn write_audio(&mut self, unit: &AccessUnit) -> Result<()> {
        let header = self.audio.header(unit.size())?;
        let mut packet = BytesMut::with_capacity(ADTS_HEADER_LEN + unit.size());
        packet.put_slice(&header);
        packet.put_slice(&unit.data);
        self.send(&packet, StreamId::Audio)
    }

    fn send(&mut self, payload: &[u8], stream: StreamId) -> Result<()> {
        self.transport.send(payload, stream)?;
        match stream {
            StreamId::Video => self.stats.video_units += 1,
            StreamId::Audio => self.stats.audio_units += 1,
        }
        self.stats.bytes_sent += payload.len() as u64;
        Ok(())
    }

    pub fn stats(&self) -> MuxerStats {
        self.stats.clone()
    }

    /// Destroy the transport session. Safe to call more than once.
    pub fn close(&mut self) {
        if self.transport.is_open() {
            log::debug!("Destroying transport session");
        }
        self.transport.destroy();
    }
}
