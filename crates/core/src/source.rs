use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Stream quality, selecting the locator and the encoding profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            other => Err(MuxError::InvalidSource(format!("unknown quality: {other}"))),
        }
    }
}

/// Immutable camera descriptor supplied by the caller.
///
/// The manager never mutates it; each stream record holds a shared copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub low_url: Option<String>,
    #[serde(default)]
    pub high_url: Option<String>,
}

impl Source {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            low_url: None,
            high_url: None,
        }
    }

    pub fn with_low_url(mut self, url: &str) -> Self {
        self.low_url = Some(url.to_string());
        self
    }

    pub fn with_high_url(mut self, url: &str) -> Self {
        self.high_url = Some(url.to_string());
        self
    }

    /// Locator for the requested quality.
    ///
    /// Falls back to the other quality's URL when only one is configured,
    /// since many cameras expose a single RTSP endpoint.
    pub fn locator(&self, quality: Quality) -> Result<&str> {
        let (preferred, fallback) = match quality {
            Quality::Low => (&self.low_url, &self.high_url),
            Quality::High => (&self.high_url, &self.low_url),
        };

        preferred
            .as_deref()
            .or(fallback.as_deref())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| MuxError::InvalidSource(format!("source {} has no locator", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parse_and_display() {
        assert_eq!("low".parse::<Quality>().unwrap(), Quality::Low);
        assert_eq!(" HIGH ".parse::<Quality>().unwrap(), Quality::High);
        assert!("medium".parse::<Quality>().is_err());
        assert_eq!(Quality::High.to_string(), "high");
    }

    #[test]
    fn locator_prefers_matching_quality() {
        let source = Source::new("cam1", "Door")
            .with_low_url("rtsp://10.0.0.5/sub")
            .with_high_url("rtsp://10.0.0.5/main");
        assert_eq!(source.locator(Quality::Low).unwrap(), "rtsp://10.0.0.5/sub");
        assert_eq!(source.locator(Quality::High).unwrap(), "rtsp://10.0.0.5/main");
    }

    #[test]
    fn locator_falls_back_to_other_quality() {
        let source = Source::new("cam1", "Door").with_high_url("rtsp://10.0.0.5/main");
        assert_eq!(source.locator(Quality::Low).unwrap(), "rtsp://10.0.0.5/main");
    }

    #[test]
    fn locator_missing() {
        let source = Source::new("cam1", "Door");
        assert!(matches!(
            source.locator(Quality::Low),
            Err(MuxError::InvalidSource(_))
        ));
    }

    #[test]
    fn source_deserializes_without_urls() {
        let source: Source = serde_json::from_str(r#"{"id":"cam2","name":"Yard"}"#).unwrap();
        assert_eq!(source.id, "cam2");
        assert!(source.low_url.is_none());
    }
}
