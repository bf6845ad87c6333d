//! Track multiplexing for the outgoing transport
//!
//! - `StreamMuxer` fans video and audio access units into one transport
//!   session, caching parameter sets for keyframes
//! - `adts` synthesizes the fixed 7-byte header prefixed to AAC payloads

pub mod adts;
mod muxer;

pub use adts::{AudioSpecificConfig, ADTS_HEADER_LEN};
pub use muxer::{MuxerStats, StreamMuxer};
