//! Player configuration
//!
//! Every knob of the pipeline lives here. The defaults reproduce the tuning
//! the pipeline was designed around: three decoded frames of look-ahead and a
//! fifty sample readahead queue.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Decoded frames kept ahead of the playhead; also caps the decoder queue
    pub frame_buffer_target: usize,
    /// Readahead high-water mark at which sample extraction is paused
    pub sample_buffer_target: usize,
    /// Maximum samples handed over by the parser in one batch
    pub samples_per_batch: usize,
    /// Network chunks buffered between the fetch task and the parser
    pub fetch_queue_depth: usize,
    /// Render tick frequency
    pub refresh_rate_hz: u32,
    /// Pixel buffers kept for reuse by the decoder
    pub frame_pool_size: usize,
    /// Optional object-detection overlay
    pub detection: Option<DetectionConfig>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            frame_buffer_target: 3,
            sample_buffer_target: 50,
            samples_per_batch: 1000,
            fetch_queue_depth: 16,
            refresh_rate_hz: 60,
            frame_pool_size: 8,
            detection: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Endpoint receiving `image/jpeg` POSTs
    pub endpoint: String,
    #[serde(default = "default_detection_timeout_ms")]
    pub timeout_ms: u64,
    /// Detections scoring below this are not drawn
    #[serde(default)]
    pub min_score: f32,
}

fn default_detection_timeout_ms() -> u64 {
    2000
}

impl DetectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_ms: default_detection_timeout_ms(),
            min_score: 0.0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PlayerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("frame_buffer_target", self.frame_buffer_target),
            ("sample_buffer_target", self.sample_buffer_target),
            ("samples_per_batch", self.samples_per_batch),
            ("fetch_queue_depth", self.fetch_queue_depth),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }

        if self.refresh_rate_hz == 0 || self.refresh_rate_hz > 1000 {
            return Err(ConfigError::Invalid(format!(
                "refresh_rate_hz must be within 1..=1000, got {}",
                self.refresh_rate_hz
            )));
        }

        if let Some(detection) = &self.detection {
            if detection.endpoint.is_empty() {
                return Err(ConfigError::Invalid("detection endpoint is empty".into()));
            }
        }

        Ok(())
    }

    /// Time between two render ticks
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.refresh_rate_hz.max(1)))
    }
}
