//! The fallback ladder and the media profile attached to each rung.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered degradation rungs, best first. `Ord` follows severity:
/// `HighQuality < ... < Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackRung {
    HighQuality,
    MediumQuality,
    LowQuality,
    VeryLowQuality,
    AudioOnly,
    TextOnly,
    Disconnected,
}

impl FallbackRung {
    pub const ALL: [FallbackRung; 7] = [
        Self::HighQuality,
        Self::MediumQuality,
        Self::LowQuality,
        Self::VeryLowQuality,
        Self::AudioOnly,
        Self::TextOnly,
        Self::Disconnected,
    ];

    /// Wire name, identical to the serde representation.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HighQuality => "high_quality",
            Self::MediumQuality => "medium_quality",
            Self::LowQuality => "low_quality",
            Self::VeryLowQuality => "very_low_quality",
            Self::AudioOnly => "audio_only",
            Self::TextOnly => "text_only",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.label() == s)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// One rung less severe, or `None` at the top.
    pub fn step_up(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Whether media still flows on this rung.
    pub fn carries_media(self) -> bool {
        self <= Self::AudioOnly
    }
}

impl fmt::Display for FallbackRung {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Media parameters for one rung. An empty `video_codec` means no video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaProfile {
    pub rung: FallbackRung,
    pub description: &'static str,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub audio_codec: &'static str,
    pub video_codec: &'static str,
    /// Minimum sustained bandwidth this profile expects.
    pub min_bandwidth_kbps: u32,
    pub max_latency_ms: u32,
    pub max_packet_loss_pct: f64,
}

impl MediaProfile {
    pub fn has_video(&self) -> bool {
        !self.video_codec.is_empty()
    }
}

const fn profile(
    rung: FallbackRung,
    description: &'static str,
    video_bitrate_kbps: u32,
    audio_bitrate_kbps: u32,
    (width, height): (u32, u32),
    frame_rate: u32,
    video_codec: &'static str,
    (min_bandwidth_kbps, max_latency_ms): (u32, u32),
    max_packet_loss_pct: f64,
) -> MediaProfile {
    MediaProfile {
        rung,
        description,
        video_bitrate_kbps,
        audio_bitrate_kbps,
        resolution: Resolution { width, height },
        frame_rate,
        audio_codec: "opus",
        video_codec,
        min_bandwidth_kbps,
        max_latency_ms,
        max_packet_loss_pct,
    }
}

static PROFILES: [MediaProfile; 5] = [
    profile(
        FallbackRung::HighQuality,
        "HD video for stable networks",
        4000, 192, (1920, 1080), 30, "vp8", (3000, 100), 2.0,
    ),
    profile(
        FallbackRung::MediumQuality,
        "Standard definition video for ordinary networks",
        2000, 128, (1280, 720), 30, "vp8", (1500, 150), 5.0,
    ),
    profile(
        FallbackRung::LowQuality,
        "Low definition video for weak networks",
        1000, 96, (854, 480), 24, "vp8", (800, 200), 8.0,
    ),
    profile(
        FallbackRung::VeryLowQuality,
        "Minimal video for very weak networks",
        500, 64, (640, 360), 15, "vp8", (400, 300), 12.0,
    ),
    profile(
        FallbackRung::AudioOnly,
        "Voice only for severely degraded networks",
        0, 64, (0, 0), 0, "", (100, 500), 20.0,
    ),
];

/// Static rung → profile table.
pub struct MediaProfileLadder;

impl MediaProfileLadder {
    /// Profile for `rung`; `TextOnly` and `Disconnected` carry no media.
    pub fn profile_for(rung: FallbackRung) -> Option<&'static MediaProfile> {
        PROFILES.iter().find(|p| p.rung == rung)
    }

    pub fn profiles() -> &'static [MediaProfile] {
        &PROFILES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rungs_are_ordered_by_severity() {
        assert!(FallbackRung::HighQuality < FallbackRung::MediumQuality);
        assert!(FallbackRung::AudioOnly < FallbackRung::TextOnly);
        assert_eq!(FallbackRung::ALL.iter().max(), Some(&FallbackRung::Disconnected));
    }

    #[test]
    fn step_up_stops_at_the_top() {
        assert_eq!(FallbackRung::HighQuality.step_up(), None);
        assert_eq!(
            FallbackRung::LowQuality.step_up(),
            Some(FallbackRung::MediumQuality)
        );
        assert_eq!(
            FallbackRung::Disconnected.step_up(),
            Some(FallbackRung::TextOnly)
        );
    }

    #[test]
    fn labels_match_the_serde_names() {
        for rung in FallbackRung::ALL {
            assert_eq!(FallbackRung::parse(rung.label()), Some(rung));
            assert_eq!(serde_json::to_value(rung).unwrap(), rung.label());
            assert_eq!(rung.to_string(), rung.label());
        }
        assert_eq!(FallbackRung::parse("ultra"), None);
        assert_eq!(FallbackRung::parse("very_low"), None);
        assert_eq!(FallbackRung::VeryLowQuality.label(), "very_low_quality");
    }

    #[test]
    fn media_rungs_have_profiles() {
        for rung in FallbackRung::ALL {
            assert_eq!(
                MediaProfileLadder::profile_for(rung).is_some(),
                rung.carries_media(),
                "{rung}"
            );
        }
        let audio = MediaProfileLadder::profile_for(FallbackRung::AudioOnly).unwrap();
        assert!(!audio.has_video());
        assert_eq!(audio.audio_bitrate_kbps, 64);
        assert_eq!(audio.resolution.to_string(), "0x0");
    }

    #[test]
    fn every_profile_is_described() {
        for p in MediaProfileLadder::profiles() {
            assert!(!p.description.is_empty(), "{}", p.rung);
        }
        let json = serde_json::to_value(MediaProfileLadder::profile_for(FallbackRung::HighQuality)).unwrap();
        assert_eq!(json["description"], "HD video for stable networks");
        assert_eq!(json["rung"], "high_quality");
    }

    #[test]
    fn bitrates_shrink_down_the_ladder() {
        let profiles = MediaProfileLadder::profiles();
        for pair in profiles.windows(2) {
            assert!(pair[0].video_bitrate_kbps >= pair[1].video_bitrate_kbps);
            assert!(pair[0].min_bandwidth_kbps > pair[1].min_bandwidth_kbps);
            assert!(pair[0].max_latency_ms < pair[1].max_latency_ms);
        }
    }
}
