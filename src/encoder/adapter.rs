//! Adapter driving one hardware encoder into the stream muxer

use crate::encoder::annexb::classify_access_unit;
use crate::encoder::{EncoderListener, EncoderOutput, HardwareEncoder};
use crate::errors::{RelayError, Result};
use crate::mux::StreamMuxer;
use crate::types::{AccessUnit, AccessUnitKind, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Prepared,
    Recording,
    /// End of stream requested, waiting for the encoder to flush
    Draining,
    Stopped,
    Released,
}

pub struct EncoderAdapter {
    encoder: Box<dyn HardwareEncoder>,
    track: TrackKind,
    state: AdapterState,
    /// Whether this adapter's start has been counted by the muxer
    muxer_started: bool,
    units_forwarded: u64,
}

impl EncoderAdapter {
    /// Wrap `encoder` and register its track with the muxer
    pub fn new(encoder: Box<dyn HardwareEncoder>, muxer: &mut StreamMuxer) -> Result<Self> {
        let track = TrackKind::from_mime(encoder.mime()).ok_or_else(|| {
            RelayError::Setup(format!("unsupported encoder output {}", encoder.mime()))
        })?;
        muxer.register_encoder(track)?;

        Ok(Self {
            encoder,
            track,
            state: AdapterState::Created,
            muxer_started: false,
            units_forwarded: 0,
        })
    }

    pub fn track(&self) -> TrackKind {
        self.track
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn units_forwarded(&self) -> u64 {
        self.units_forwarded
    }

    pub fn prepare(&mut self, listener: &mut dyn EncoderListener) -> Result<()> {
        self.encoder.prepare()?;
        self.state = AdapterState::Prepared;
        log::debug!("{} encoder prepared", self.track);
        listener.on_prepared(self.track, self.encoder.input_surface())
    }

    pub fn start_recording(&mut self) -> Result<()> {
        if self.state != AdapterState::Prepared {
            return Err(RelayError::Setup(format!(
                "{} encoder started in state {:?}",
                self.track, self.state
            )));
        }
        self.encoder.start()?;
        self.state = AdapterState::Recording;
        Ok(())
    }

    /// Tell the encoder a frame was submitted. Ignored unless recording.
    pub fn frame_available_soon(&mut self) -> Result<()> {
        if self.state != AdapterState::Recording {
            return Ok(());
        }
        self.encoder.frame_available_soon()
    }

    /// Forward up to `limit` pending outputs to the muxer.
    ///
    /// Returns the number of access units forwarded.
    pub fn drain(&mut self, muxer: &mut StreamMuxer, limit: usize) -> Result<usize> {
        if !matches!(self.state, AdapterState::Recording | AdapterState::Draining) {
            return Ok(0);
        }

        let mut forwarded = 0;
        for _ in 0..limit {
            let output = match self.encoder.poll_output()? {
                Some(output) => output,
                None => break,
            };

            match output {
                EncoderOutput::FormatChanged { mime } => self.on_format_changed(muxer, &mime)?,
                EncoderOutput::Unit(unit) => forwarded += self.forward(muxer, &unit)?,
                EncoderOutput::Buffer { data, flags, pts_us } => {
                    let kind = match self.track {
                        TrackKind::Video => AccessUnitKind::from_codec_flags(flags),
                        TrackKind::Audio => Some(AccessUnitKind::AudioFrame),
                    };
                    match kind {
                        Some(kind) => {
                            forwarded += self.forward(muxer, &AccessUnit::new(data, kind, pts_us))?
                        }
                        None => log::trace!("Skipping {} buffer with flags {}", self.track, flags),
                    }
                }
                EncoderOutput::Bitstream { data, pts_us } => {
                    for unit in classify_access_unit(&data, pts_us) {
                        forwarded += self.forward(muxer, &unit)?;
                    }
                }
                EncoderOutput::EndOfStream => {
                    self.finish(muxer);
                    break;
                }
            }
        }

        Ok(forwarded)
    }

    fn on_format_changed(&mut self, muxer: &mut StreamMuxer, mime: &str) -> Result<()> {
        if self.muxer_started {
            return Err(RelayError::Encoder(format!(
                "{} output format changed twice",
                self.track
            )));
        }
        muxer.add_track(mime)?;
        self.muxer_started = true;
        muxer.start()?;
        Ok(())
    }

    fn forward(&mut self, muxer: &mut StreamMuxer, unit: &AccessUnit) -> Result<usize> {
        muxer.write_sample_data(self.track, unit)?;
        self.units_forwarded += 1;
        Ok(1)
    }

    fn finish(&mut self, muxer: &mut StreamMuxer) {
        if self.muxer_started {
            muxer.stop();
            self.muxer_started = false;
        }
        self.state = AdapterState::Stopped;
        log::debug!("{} encoder reached end of stream", self.track);
    }

    /// Request end of stream and flush what the encoder still holds, bounded
    /// by `limit` outputs. The muxer's stop is counted even if the encoder
    /// never delivers its end-of-stream marker.
    pub fn stop(
        &mut self,
        muxer: &mut StreamMuxer,
        listener: &mut dyn EncoderListener,
        limit: usize,
    ) -> Result<()> {
        let mut result = Ok(());
        if self.state == AdapterState::Recording {
            self.state = AdapterState::Draining;
            result = self
                .encoder
                .signal_end_of_stream()
                .and_then(|_| self.drain(muxer, limit).map(|_| ()));
        }
        if matches!(
            self.state,
            AdapterState::Created | AdapterState::Prepared | AdapterState::Draining
        ) {
            self.finish(muxer);
        }
        if self.state == AdapterState::Stopped {
            listener.on_stopped(self.track);
        }
        result
    }

    /// Release the codec exactly once
    pub fn release(&mut self) {
        if self.state == AdapterState::Released {
            return;
        }
        self.encoder.release();
        self.state = AdapterState::Released;
        log::debug!("{} encoder released", self.track);
    }
}

impl Drop for EncoderAdapter {
    fn drop(&mut self) {
        self.release();
    }
}
