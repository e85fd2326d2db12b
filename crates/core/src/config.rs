use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};
use crate::source::Quality;

/// Encoding profile for one quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

/// Profile table indexed by [`Quality`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfiles {
    pub low: QualityProfile,
    pub high: QualityProfile,
}

impl QualityProfiles {
    pub fn get(&self, quality: Quality) -> QualityProfile {
        match quality {
            Quality::Low => self.low,
            Quality::High => self.high,
        }
    }
}

impl Default for QualityProfiles {
    fn default() -> Self {
        Self {
            low: QualityProfile {
                width: 640,
                height: 360,
                bitrate_kbps: 512,
                fps: 10,
            },
            high: QualityProfile {
                width: 1280,
                height: 720,
                bitrate_kbps: 2048,
                fps: 25,
            },
        }
    }
}

/// Which [`SourceAdapter`](crate::adapter::SourceAdapter) produces stream bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// External ffmpeg subprocess pulling the RTSP source.
    #[default]
    Ffmpeg,
    /// Locally generated placeholder frames.
    Synthetic,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ffmpeg => write!(f, "ffmpeg"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

impl FromStr for AdapterKind {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(Self::Ffmpeg),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(MuxError::InvalidConfig(format!("unknown adapter: {other}"))),
        }
    }
}

/// Manager-wide limits and timings.
///
/// Durations are kept in milliseconds so the struct deserializes from flat
/// JSON; use the accessor methods to get [`Duration`] values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Consecutive failed attempts after which a stream is marked failed.
    pub max_retries: u32,
    /// Fixed backoff between a failure and the next connection attempt.
    pub retry_interval_ms: u64,
    /// Watchdog guarding the `Connecting` state. Must be shorter than the retry interval.
    pub connection_timeout_ms: u64,
    /// Ceiling of concurrently active streams.
    pub max_connections: usize,
    /// How long an adapter gets to shut down before it is force-killed.
    pub grace_period_ms: u64,
    /// Delay before the synthetic adapter reports itself connected.
    pub synthetic_warmup_ms: u64,
    /// How long a relay client waits for a `Connecting` stream.
    pub client_wait_ms: u64,
    /// First port handed out by the proxy port allocator.
    pub base_port: u16,
    pub adapter: AdapterKind,
    pub ffmpeg_path: String,
    pub profiles: QualityProfiles,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 5_000,
            connection_timeout_ms: 3_000,
            max_connections: 10,
            grace_period_ms: 5_000,
            synthetic_warmup_ms: 500,
            client_wait_ms: 2_000,
            base_port: 9000,
            adapter: AdapterKind::default(),
            ffmpeg_path: "ffmpeg".to_string(),
            profiles: QualityProfiles::default(),
        }
    }
}

impl ManagerConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn synthetic_warmup(&self) -> Duration {
        Duration::from_millis(self.synthetic_warmup_ms)
    }

    pub fn client_wait(&self) -> Duration {
        Duration::from_millis(self.client_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MuxError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(MuxError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout_ms >= self.retry_interval_ms {
            return Err(MuxError::InvalidConfig(format!(
                "connection_timeout_ms ({}) must be shorter than retry_interval_ms ({})",
                self.connection_timeout_ms, self.retry_interval_ms
            )));
        }
        for (quality, profile) in [
            (Quality::Low, self.profiles.low),
            (Quality::High, self.profiles.high),
        ] {
            if profile.fps == 0 || profile.width == 0 || profile.height == 0 {
                return Err(MuxError::InvalidConfig(format!(
                    "{quality} profile needs non-zero fps and resolution"
                )));
            }
        }
        Ok(())
    }
}
