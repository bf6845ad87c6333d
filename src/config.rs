//! Configuration management for camrelay
//!
//! Provides loading, saving and validation of the pipeline defaults, the
//! negotiated audio parameters and the RTP transport layout.

use crate::errors::RelayError;
use crate::mux::AudioSpecificConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
}

/// Defaults used when building an `EncoderConfig` without explicit values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate_bps: u32,
    pub fps: u32,
}

/// Audio parameters negotiated with the encoder, fixed for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub enabled: bool,
    /// AAC audio object type (2 = LC)
    pub profile: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

/// RTP transport layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Destination port for the video stream
    pub video_port: u16,
    /// Destination port for the audio stream
    pub audio_port: u16,
    pub payload_type: u8,
    /// Upper bound for one RTP packet, header included
    pub mtu: usize,
    /// RTP timestamp advance per send call
    pub timestamp_increment: u32,
}

/// Encoder worker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long `start` may block waiting for the worker's task queue
    pub ready_timeout_ms: u64,
    /// Idle interval after which the worker drains encoder output
    pub drain_interval_ms: u64,
    /// Bound on end-of-stream draining during teardown
    pub drain_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig {
                width: 1280,
                height: 720,
                bitrate_bps: 2_000_000,
                fps: 30,
            },
            audio: AudioConfig {
                enabled: false,
                profile: 2,
                sample_rate: 44_100,
                channels: 1,
            },
            transport: TransportConfig::default(),
            pipeline: PipelineConfig {
                ready_timeout_ms: 2000,
                drain_interval_ms: 10,
                drain_limit: 64,
            },
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            video_port: 5000,
            audio_port: 5100,
            payload_type: 96,
            mtu: 1200,
            timestamp_increment: 10,
        }
    }
}

impl AudioConfig {
    /// Fixed ADTS fields derived from this configuration
    pub fn specific_config(&self) -> Result<AudioSpecificConfig, RelayError> {
        AudioSpecificConfig::new(self.profile, self.sample_rate, self.channels)
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: RelayConfig = toml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RelayError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RelayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("camrelay.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(RelayError::Config("Invalid video resolution".to_string()));
        }
        if self.video.fps == 0 || self.video.fps > 240 {
            return Err(RelayError::Config("Invalid video FPS (must be 1-240)".to_string()));
        }

        self.audio.specific_config()?;

        if self.transport.video_port == self.transport.audio_port {
            return Err(RelayError::Config(
                "Video and audio ports must differ".to_string(),
            ));
        }
        if !(96..=127).contains(&self.transport.payload_type) {
            return Err(RelayError::Config(
                "Dynamic payload type must be between 96 and 127".to_string(),
            ));
        }
        if self.transport.mtu < 64 {
            return Err(RelayError::Config("MTU must be at least 64 bytes".to_string()));
        }

        if self.pipeline.ready_timeout_ms == 0 {
            return Err(RelayError::Config("Ready timeout must be non-zero".to_string()));
        }
        if self.pipeline.drain_interval_ms == 0 {
            return Err(RelayError::Config("Drain interval must be non-zero".to_string()));
        }
        if self.pipeline.drain_limit == 0 {
            return Err(RelayError::Config("Drain limit must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.transport.video_port, 5000);
        assert_eq!(config.transport.audio_port, 5100);
        assert_eq!(config.transport.payload_type, 96);
        assert_eq!(config.audio.profile, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut bad = RelayConfig::default();
        bad.video.width = 0;
        assert!(bad.validate().is_err());

        let mut same_ports = RelayConfig::default();
        same_ports.transport.audio_port = same_ports.transport.video_port;
        assert!(same_ports.validate().is_err());

        let mut bad_pt = RelayConfig::default();
        bad_pt.transport.payload_type = 8;
        assert!(bad_pt.validate().is_err());

        let mut bad_rate = RelayConfig::default();
        bad_rate.audio.sample_rate = 12_345;
        assert!(bad_rate.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("camrelay.toml");

        let mut config = RelayConfig::default();
        config.audio.enabled = true;
        config.transport.mtu = 1400;
        assert!(config.save_to_file(&config_path).is_ok());

        let loaded = RelayConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = toml::to_string_pretty(&RelayConfig::default()).unwrap();
        assert!(toml_string.contains("[video]"));
        assert!(toml_string.contains("[audio]"));
        assert!(toml_string.contains("[transport]"));
        assert!(toml_string.contains("[pipeline]"));
        assert!(toml_string.contains("video_port"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RelayConfig::load_from_file("nonexistent_camrelay.toml");
        assert_eq!(result.unwrap(), RelayConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[video\nwidth = ").unwrap();
        assert!(matches!(
            RelayConfig::load_from_file(&path),
            Err(RelayError::Config(_))
        ));
    }
}
