//! Codec catalog: which audio/video codecs a session may use, and in what order.
//!
//! Selection is two steps:
//! 1. **Filter** by the caller's constraints: bandwidth, latency budget,
//!    loss tolerance (network-adaptive codecs are exempt), browser and
//!    mobile support, and hardware acceleration for video.
//! 2. **Rank** by stable partition against static preference lists: first
//!    the device type's list, then the network type's list, so network
//!    preference wins and device preference orders the remainder.
//!
//! Everything here is static data; the catalog is shared read-only.

use crate::ladder::{FallbackRung, MediaProfile, MediaProfileLadder};
use crate::quality::{NetworkSample, NetworkType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

/// Static description of one codec.
#[derive(Debug, Clone, Serialize)]
pub struct CodecDescriptor {
    /// Catalog key, e.g. `"opus"`.
    pub name: &'static str,
    pub display_name: &'static str,
    pub media_type: MediaType,
    pub mime_type: &'static str,
    pub clock_rate: u32,
    /// Bandwidth the codec needs at its nominal bitrate.
    pub bandwidth_kbps: u32,
    /// Algorithmic latency.
    pub latency_ms: u32,
    /// Packet loss the codec tolerates without its own resilience tools.
    pub packet_loss_tolerance_pct: f64,
    pub cpu_cost_pct: f64,
    pub network_adaptive: bool,
    pub hardware_accel: bool,
    pub mobile_support: bool,
    pub browser_support: &'static [&'static str],
}

/// Browsers the catalog has support data for. Unknown browsers are not filtered.
const KNOWN_BROWSERS: &[&str] = &["chrome", "firefox", "safari", "edge"];

static CODECS: &[CodecDescriptor] = &[
    CodecDescriptor {
        name: "opus",
        display_name: "OPUS",
        media_type: MediaType::Audio,
        mime_type: "audio/opus",
        clock_rate: 48_000,
        bandwidth_kbps: 128,
        latency_ms: 20,
        packet_loss_tolerance_pct: 2.0,
        cpu_cost_pct: 15.0,
        network_adaptive: true,
        hardware_accel: false,
        mobile_support: true,
        browser_support: &["chrome", "firefox", "edge"],
    },
    CodecDescriptor {
        name: "g722",
        display_name: "G.722",
        media_type: MediaType::Audio,
        mime_type: "audio/G722",
        clock_rate: 8_000,
        bandwidth_kbps: 64,
        latency_ms: 30,
        packet_loss_tolerance_pct: 3.0,
        cpu_cost_pct: 10.0,
        network_adaptive: false,
        hardware_accel: true,
        mobile_support: true,
        browser_support: &["chrome", "firefox", "safari", "edge"],
    },
    CodecDescriptor {
        name: "pcmu",
        display_name: "PCMU",
        media_type: MediaType::Audio,
        mime_type: "audio/PCMU",
        clock_rate: 8_000,
        bandwidth_kbps: 64,
        latency_ms: 20,
        packet_loss_tolerance_pct: 5.0,
        cpu_cost_pct: 5.0,
        network_adaptive: false,
        hardware_accel: true,
        mobile_support: true,
        browser_support: &["chrome", "firefox", "safari", "edge"],
    },
    CodecDescriptor {
        name: "vp8",
        display_name: "VP8",
        media_type: MediaType::Video,
        mime_type: "video/VP8",
        clock_rate: 90_000,
        bandwidth_kbps: 2000,
        latency_ms: 50,
        packet_loss_tolerance_pct: 3.0,
        cpu_cost_pct: 25.0,
        network_adaptive: true,
        hardware_accel: true,
        mobile_support: true,
        browser_support: &["chrome", "firefox", "edge"],
    },
    CodecDescriptor {
        name: "vp9",
        display_name: "VP9",
        media_type: MediaType::Video,
        mime_type: "video/VP9",
        clock_rate: 90_000,
        bandwidth_kbps: 3000,
        latency_ms: 60,
        packet_loss_tolerance_pct: 2.5,
        cpu_cost_pct: 35.0,
        network_adaptive: true,
        hardware_accel: true,
        mobile_support: false,
        browser_support: &["chrome", "firefox"],
    },
    CodecDescriptor {
        name: "h264",
        display_name: "H.264",
        media_type: MediaType::Video,
        mime_type: "video/H264",
        clock_rate: 90_000,
        bandwidth_kbps: 2500,
        latency_ms: 40,
        packet_loss_tolerance_pct: 2.0,
        cpu_cost_pct: 20.0,
        network_adaptive: false,
        hardware_accel: true,
        mobile_support: true,
        browser_support: &["chrome", "firefox", "safari", "edge"],
    },
];

/// Base candidate order per media type, before any ranking.
fn base_order(media_type: MediaType) -> &'static [&'static str] {
    match media_type {
        MediaType::Audio => &["opus", "g722", "pcmu"],
        MediaType::Video => &["vp8", "h264", "vp9"],
    }
}

fn network_preference(network: NetworkType) -> &'static [&'static str] {
    match network {
        NetworkType::Wifi | NetworkType::Ethernet | NetworkType::Cellular4g => {
            &["vp8", "h264", "opus"]
        }
        NetworkType::Cellular3g => &["vp8", "opus", "g722"],
        NetworkType::Cellular2g => &["opus", "g722", "pcmu"],
        NetworkType::Unknown => &[],
    }
}

fn device_preference(device: DeviceType) -> &'static [&'static str] {
    match device {
        DeviceType::Desktop | DeviceType::Tablet => &["vp8", "h264", "opus"],
        DeviceType::Mobile => &["vp8", "opus", "g722"],
    }
}

/// Constraints for one codec selection.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecQuery {
    pub media_type: MediaType,
    pub network_type: NetworkType,
    pub device_type: DeviceType,
    /// Lowercase browser name, if the client reported one.
    pub browser: Option<String>,
    pub hardware_accel_preferred: bool,
    pub available_bandwidth_kbps: f64,
    pub latency_budget_ms: f64,
    pub observed_loss_pct: f64,
}

/// Client capabilities that don't change over a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub hardware_accel_preferred: bool,
}

impl CodecQuery {
    /// Build a query from a network sample, a client profile, and a latency budget.
    pub fn from_sample(
        media_type: MediaType,
        sample: &NetworkSample,
        client: &ClientProfile,
        latency_budget_ms: f64,
    ) -> Self {
        Self {
            media_type,
            network_type: sample.network_type,
            device_type: client.device_type,
            browser: client.browser.as_ref().map(|b| b.to_ascii_lowercase()),
            hardware_accel_preferred: client.hardware_accel_preferred,
            available_bandwidth_kbps: sample.bandwidth_kbps,
            latency_budget_ms,
            observed_loss_pct: sample.packet_loss_pct,
        }
    }
}

/// Outcome of comparing two codecs head to head.
#[derive(Debug, Clone, Serialize)]
pub struct CodecComparison {
    /// `None` on a tie.
    pub winner: Option<&'static str>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub audio: usize,
    pub video: usize,
    pub network_adaptive: usize,
    pub hardware_accel: usize,
    pub mobile_support: usize,
}

/// Read-only registry of codec descriptors and preference orderings.
#[derive(Debug, Clone, Copy)]
pub struct CodecCatalog {
    codecs: &'static [CodecDescriptor],
}

impl Default for CodecCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CodecCatalog {
    pub fn builtin() -> Self {
        Self { codecs: CODECS }
    }

    pub fn codec(&self, name: &str) -> Option<&'static CodecDescriptor> {
        self.codecs.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All codecs of one media type (or all, for `None`), sorted by display name.
    pub fn codecs(&self, media_type: Option<MediaType>) -> Vec<&'static CodecDescriptor> {
        let mut codecs: Vec<_> = self
            .codecs
            .iter()
            .filter(|c| media_type.is_none_or(|t| c.media_type == t))
            .collect();
        codecs.sort_by_key(|c| c.display_name);
        codecs
    }

    /// Eligible codec names for `query`, best first.
    pub fn select_codecs(&self, query: &CodecQuery) -> Vec<&'static str> {
        let eligible: Vec<&'static str> = base_order(query.media_type)
            .iter()
            .filter_map(|name| self.codec(name))
            .filter(|codec| self.is_eligible(codec, query))
            .map(|codec| codec.name)
            .collect();

        let by_device = stable_partition(eligible, device_preference(query.device_type));
        stable_partition(by_device, network_preference(query.network_type))
    }

    fn is_eligible(&self, codec: &CodecDescriptor, query: &CodecQuery) -> bool {
        if codec.media_type != query.media_type {
            return false;
        }
        if f64::from(codec.bandwidth_kbps) > query.available_bandwidth_kbps {
            return false;
        }
        if f64::from(codec.latency_ms) > query.latency_budget_ms {
            return false;
        }
        if codec.packet_loss_tolerance_pct < query.observed_loss_pct && !codec.network_adaptive {
            return false;
        }
        if let Some(browser) = query.browser.as_deref() {
            if KNOWN_BROWSERS.contains(&browser) && !codec.browser_support.contains(&browser) {
                return false;
            }
        }
        if query.device_type == DeviceType::Mobile && !codec.mobile_support {
            return false;
        }
        if query.media_type == MediaType::Video
            && query.hardware_accel_preferred
            && !codec.hardware_accel
        {
            return false;
        }
        true
    }

    /// Swap a profile's codecs for the best eligible ones when the profile's
    /// own choice is not usable under the current sample.
    ///
    /// A codec is only replaced when at least one alternative is eligible;
    /// otherwise the ladder's default stays.
    pub fn refine(
        &self,
        profile: &MediaProfile,
        sample: &NetworkSample,
        client: &ClientProfile,
    ) -> MediaProfile {
        let mut refined = profile.clone();
        let budget = f64::from(profile.max_latency_ms);

        if !profile.audio_codec.is_empty() {
            let query = CodecQuery::from_sample(MediaType::Audio, sample, client, budget);
            refined.audio_codec = pick(profile.audio_codec, &self.select_codecs(&query));
        }
        if !profile.video_codec.is_empty() {
            let query = CodecQuery::from_sample(MediaType::Video, sample, client, budget);
            refined.video_codec = pick(profile.video_codec, &self.select_codecs(&query));
        }
        refined
    }

    /// The rung's ladder profile with codecs refined for this client.
    /// `None` for rungs that carry no media.
    pub fn select_for(
        &self,
        rung: FallbackRung,
        sample: &NetworkSample,
        client: &ClientProfile,
    ) -> Option<MediaProfile> {
        MediaProfileLadder::profile_for(rung).map(|p| self.refine(p, sample, client))
    }

    /// Compare latency, CPU cost, loss tolerance, and adaptivity; most wins takes it.
    pub fn compare(&self, a: &str, b: &str) -> Option<CodecComparison> {
        let (a, b) = (self.codec(a)?, self.codec(b)?);
        let mut reasons = Vec::new();
        let mut tally = 0i32;

        let mut point = |ord: Ordering, what: &str| match ord {
            Ordering::Less => {
                tally += 1;
                reasons.push(format!("{} {what}", a.display_name));
            }
            Ordering::Greater => {
                tally -= 1;
                reasons.push(format!("{} {what}", b.display_name));
            }
            Ordering::Equal => {}
        };

        point(a.latency_ms.cmp(&b.latency_ms), "has lower latency");
        point(a.cpu_cost_pct.total_cmp(&b.cpu_cost_pct), "uses less CPU");
        // Lower declared tolerance wins, matching the catalog's historical scoring.
        point(
            a.packet_loss_tolerance_pct
                .total_cmp(&b.packet_loss_tolerance_pct),
            "degrades less under loss",
        );
        point(
            b.network_adaptive.cmp(&a.network_adaptive),
            "adapts to network conditions",
        );

        let winner = match tally.cmp(&0) {
            Ordering::Greater => Some(a.name),
            Ordering::Less => Some(b.name),
            Ordering::Equal => None,
        };
        Some(CodecComparison { winner, reasons })
    }

    pub fn stats(&self) -> CatalogStats {
        self.codecs.iter().fold(
            CatalogStats {
                total: self.codecs.len(),
                ..Default::default()
            },
            |mut s, c| {
                match c.media_type {
                    MediaType::Audio => s.audio += 1,
                    MediaType::Video => s.video += 1,
                }
                s.network_adaptive += usize::from(c.network_adaptive);
                s.hardware_accel += usize::from(c.hardware_accel);
                s.mobile_support += usize::from(c.mobile_support);
                s
            },
        )
    }
}

fn pick(current: &'static str, ranked: &[&'static str]) -> &'static str {
    if ranked.contains(&current) {
        current
    } else {
        ranked.first().copied().unwrap_or(current)
    }
}

/// Names in `preferred` first (in `preferred` order), then the rest in original order.
fn stable_partition(candidates: Vec<&'static str>, preferred: &[&str]) -> Vec<&'static str> {
    let mut ranked: Vec<&'static str> = preferred
        .iter()
        .filter_map(|p| candidates.iter().copied().find(|c| c == p))
        .collect();
    ranked.extend(candidates.iter().copied().filter(|c| !preferred.contains(c)));
    ranked
}
