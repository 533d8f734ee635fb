//! Stream quality presets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quality requested by the broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    Medium,
    High,
    #[default]
    Auto,
}

/// Capture constraints handed to the external encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl VideoConstraints {
    pub const LOW: Self = Self::new(640, 360, 24);
    pub const MEDIUM: Self = Self::new(854, 480, 30);
    pub const HIGH: Self = Self::new(1280, 720, 30);

    #[must_use]
    pub const fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }
}

/// Network and device conditions used to resolve [`StreamQuality::Auto`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureEstimate {
    pub downlink_kbps: f64,
    pub is_mobile: bool,
}

impl Default for CaptureEstimate {
    fn default() -> Self {
        Self {
            downlink_kbps: 1000.0,
            is_mobile: false,
        }
    }
}

impl StreamQuality {
    /// Resolve into concrete constraints
    ///
    /// Fixed presets ignore the estimate. `Auto` picks 720p above 2 Mbps on
    /// non-mobile devices, 480p above 1 Mbps, 360p otherwise; frame rate is 30
    /// above 1 Mbps and 24 below.
    #[must_use]
    pub fn resolve(self, estimate: &CaptureEstimate) -> VideoConstraints {
        match self {
            Self::Low => VideoConstraints::LOW,
            Self::Medium => VideoConstraints::MEDIUM,
            Self::High => VideoConstraints::HIGH,
            Self::Auto => {
                let kbps = estimate.downlink_kbps;
                let (width, height) = if kbps > 2000.0 && !estimate.is_mobile {
                    (1280, 720)
                } else if kbps > 1000.0 {
                    (854, 480)
                } else {
                    (640, 360)
                };
                let frame_rate = if kbps > 1000.0 { 30 } else { 24 };
                VideoConstraints::new(width, height, frame_rate)
            }
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for StreamQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown stream quality: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_presets() {
        let est = CaptureEstimate::default();
        assert_eq!(StreamQuality::Low.resolve(&est), VideoConstraints::new(640, 360, 24));
        assert_eq!(StreamQuality::Medium.resolve(&est), VideoConstraints::new(854, 480, 30));
        assert_eq!(StreamQuality::High.resolve(&est), VideoConstraints::new(1280, 720, 30));
    }

    #[test]
    fn test_auto_follows_estimate() {
        let fast = CaptureEstimate {
            downlink_kbps: 5000.0,
            is_mobile: false,
        };
        assert_eq!(StreamQuality::Auto.resolve(&fast), VideoConstraints::HIGH);

        let fast_mobile = CaptureEstimate {
            downlink_kbps: 5000.0,
            is_mobile: true,
        };
        assert_eq!(StreamQuality::Auto.resolve(&fast_mobile), VideoConstraints::MEDIUM);

        let slow = CaptureEstimate {
            downlink_kbps: 600.0,
            is_mobile: false,
        };
        assert_eq!(StreamQuality::Auto.resolve(&slow), VideoConstraints::LOW);
    }

    #[test]
    fn test_parse_quality() {
        assert_eq!("HIGH".parse::<StreamQuality>().unwrap(), StreamQuality::High);
        assert!("ultra".parse::<StreamQuality>().is_err());
    }
}
