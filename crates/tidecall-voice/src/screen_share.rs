//! Screen-share quality levels and the auto-adjust policy.
//!
//! Screen share does not ride the call's fallback ladder. Its quality is a
//! three-level setting picked from measured upload speed and local CPU load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tidecall_common::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScreenShareQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Encode parameters for one screen-share quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScreenShareParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

impl ScreenShareQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn params(&self) -> ScreenShareParams {
        match self {
            Self::High => ScreenShareParams {
                width: 1920,
                height: 1080,
                frame_rate: 30,
                bitrate_kbps: 2500,
            },
            Self::Medium => ScreenShareParams {
                width: 1280,
                height: 720,
                frame_rate: 15,
                bitrate_kbps: 1200,
            },
            Self::Low => ScreenShareParams {
                width: 854,
                height: 480,
                frame_rate: 10,
                bitrate_kbps: 500,
            },
        }
    }
}

impl fmt::Display for ScreenShareQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScreenShareQuality {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(CallError::InvalidScreenShareQuality(other.to_string())),
        }
    }
}

/// Recommend a quality from upload speed (kbps) and CPU usage (percent).
pub fn recommend_quality(speed_kbps: f64, cpu_pct: f64) -> ScreenShareQuality {
    if speed_kbps > 3000.0 && cpu_pct < 70.0 {
        ScreenShareQuality::High
    } else if speed_kbps > 1000.0 && cpu_pct < 80.0 {
        ScreenShareQuality::Medium
    } else {
        ScreenShareQuality::Low
    }
}

/// `Some(recommended)` when the recommendation differs from `current`.
pub fn check_adjustment(
    current: ScreenShareQuality,
    speed_kbps: f64,
    cpu_pct: f64,
) -> Option<ScreenShareQuality> {
    let recommended = recommend_quality(speed_kbps, cpu_pct);
    (recommended != current).then_some(recommended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_known_levels() {
        assert_eq!("high".parse::<ScreenShareQuality>(), Ok(ScreenShareQuality::High));
        assert_eq!("low".parse::<ScreenShareQuality>(), Ok(ScreenShareQuality::Low));
        assert_eq!(
            "ultra".parse::<ScreenShareQuality>(),
            Err(CallError::InvalidScreenShareQuality("ultra".into()))
        );
    }

    #[test]
    fn recommendation_weighs_speed_and_cpu() {
        assert_eq!(recommend_quality(5000.0, 50.0), ScreenShareQuality::High);
        assert_eq!(recommend_quality(5000.0, 75.0), ScreenShareQuality::Medium);
        assert_eq!(recommend_quality(2000.0, 50.0), ScreenShareQuality::Medium);
        assert_eq!(recommend_quality(2000.0, 85.0), ScreenShareQuality::Low);
        assert_eq!(recommend_quality(3000.0, 10.0), ScreenShareQuality::Medium);
        assert_eq!(recommend_quality(900.0, 10.0), ScreenShareQuality::Low);
    }

    #[test]
    fn adjustment_only_when_different() {
        assert_eq!(check_adjustment(ScreenShareQuality::High, 5000.0, 20.0), None);
        assert_eq!(
            check_adjustment(ScreenShareQuality::High, 500.0, 20.0),
            Some(ScreenShareQuality::Low)
        );
    }

    #[test]
    fn ordering_and_params() {
        assert!(ScreenShareQuality::Low < ScreenShareQuality::Medium);
        assert!(ScreenShareQuality::High.params().bitrate_kbps > ScreenShareQuality::Low.params().bitrate_kbps);
    }
}
