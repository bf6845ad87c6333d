//! RTP over UDP transport
//!
//! Video and audio each get their own UDP socket towards the receiver. Video
//! access units are packetized per RFC 6184 (single NAL unit packets, FU-A
//! fragmentation above the MTU); audio frames go out as one packet each.
//! The RTP timestamp advances by a fixed increment per access unit.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{Transport, TransportSession};
use crate::config::TransportConfig;
use crate::encoder::annexb::split_nal_units;
use crate::errors::{RelayError, Result};
use crate::types::StreamId;

pub const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;
const FU_A: u8 = 28;
const FU_HEADER_LEN: usize = 2;

/// One RTP payload before the header is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPayload {
    pub data: Bytes,
    /// Set on the last packet of an access unit
    pub marker: bool,
}

/// H.264 packetizer for Annex B access units
#[derive(Debug, Clone)]
pub struct H264Packetizer {
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: mtu.max(RTP_HEADER_LEN + FU_HEADER_LEN + 1),
        }
    }

    fn max_payload(&self) -> usize {
        self.mtu - RTP_HEADER_LEN
    }

    /// Split one access unit into RTP payloads. A buffer without start codes
    /// is treated as a single NAL unit.
    pub fn packetize(&self, access_unit: &[u8]) -> Vec<RtpPayload> {
        let mut nal_units = split_nal_units(access_unit);
        if nal_units.is_empty() && !access_unit.is_empty() {
            nal_units.push(access_unit);
        }

        let mut payloads = Vec::new();
        for (idx, nal_unit) in nal_units.iter().enumerate() {
            let is_last_nal = idx + 1 == nal_units.len();
            if nal_unit.len() <= self.max_payload() {
                payloads.push(RtpPayload {
                    data: Bytes::copy_from_slice(nal_unit),
                    marker: is_last_nal,
                });
            } else {
                self.fragment(nal_unit, is_last_nal, &mut payloads);
            }
        }
        payloads
    }

    fn fragment(&self, nal_unit: &[u8], is_last_nal: bool, payloads: &mut Vec<RtpPayload>) {
        let nal_header = nal_unit[0];
        let fu_indicator = (nal_header & 0xE0) | FU_A;
        let nal_type = nal_header & 0x1F;
        let chunk_size = self.max_payload() - FU_HEADER_LEN;

        let body = &nal_unit[1..];
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            let first = offset == 0;
            let last = end == body.len();

            let mut fu_header = nal_type;
            if first {
                fu_header |= 0x80;
            }
            if last {
                fu_header |= 0x40;
            }

            let mut data = BytesMut::with_capacity(FU_HEADER_LEN + end - offset);
            data.put_u8(fu_indicator);
            data.put_u8(fu_header);
            data.put_slice(&body[offset..end]);

            payloads.push(RtpPayload {
                data: data.freeze(),
                marker: last && is_last_nal,
            });
            offset = end;
        }
    }
}

/// Sequence/timestamp state and socket for one RTP stream
struct RtpStream {
    socket: UdpSocket,
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    increment: u32,
}

impl RtpStream {
    fn open(destination: Ipv4Addr, port: u16, config: &TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(SocketAddrV4::new(destination, port))?;
        Ok(Self {
            socket,
            ssrc: Uuid::new_v4().as_u128() as u32,
            payload_type: config.payload_type,
            sequence: 0,
            timestamp: 0,
            increment: config.timestamp_increment,
        })
    }

    fn send_packet(&mut self, payload: &[u8], marker: bool) -> Result<()> {
        let mut packet = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        packet.put_u8(RTP_VERSION << 6);
        packet.put_u8(((marker as u8) << 7) | (self.payload_type & 0x7F));
        packet.put_u16(self.sequence);
        packet.put_u32(self.timestamp);
        packet.put_u32(self.ssrc);
        packet.put_slice(payload);

        self.socket.send(&packet)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    fn advance(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(self.increment);
    }
}

/// UDP/RTP session factory
#[derive(Debug, Clone)]
pub struct RtpTransport {
    config: TransportConfig,
}

impl RtpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for RtpTransport {
    fn create_session(&self, destination: &str) -> Result<Box<dyn TransportSession>> {
        let address: Ipv4Addr = destination
            .parse()
            .map_err(|_| RelayError::InvalidAddress(destination.to_string()))?;

        let video = RtpStream::open(address, self.config.video_port, &self.config)?;
        let audio = RtpStream::open(address, self.config.audio_port, &self.config)?;
        log::info!(
            "RTP session to {} (video:{} audio:{} pt={})",
            address,
            self.config.video_port,
            self.config.audio_port,
            self.config.payload_type
        );

        Ok(Box::new(RtpSession {
            video: Some(video),
            audio: Some(audio),
            packetizer: H264Packetizer::new(self.config.mtu),
        }))
    }
}

struct RtpSession {
    video: Option<RtpStream>,
    audio: Option<RtpStream>,
    packetizer: H264Packetizer,
}

impl TransportSession for RtpSession {
    fn send(&mut self, payload: &[u8], stream: StreamId) -> Result<()> {
        match stream {
            StreamId::Video => {
                let rtp = self
                    .video
                    .as_mut()
                    .ok_or_else(|| RelayError::Transport("video stream closed".to_string()))?;
                for packet in self.packetizer.packetize(payload) {
                    rtp.send_packet(&packet.data, packet.marker)?;
                }
                rtp.advance();
            }
            StreamId::Audio => {
                let rtp = self
                    .audio
                    .as_mut()
                    .ok_or_else(|| RelayError::Transport("audio stream closed".to_string()))?;
                rtp.send_packet(payload, true)?;
                rtp.advance();
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let sent = self.video.as_ref().map(|s| s.sequence).unwrap_or(0);
        self.video = None;
        self.audio = None;
        log::info!("RTP session destroyed after {} video packets", sent);
    }
}
