#![forbid(unsafe_code)]

// Configuration for the worker pool and WebRTC transports.

use crate::engine::{
    MediaKind, RtpCodecCapability, WebRtcTransportOptions, WorkerLogLevel, WorkerLogTag,
    WorkerSettings,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{info, warn};

/// First RTC port handed to the pool; worker `i` owns
/// `[base + span·i, base + span·(i+1) - 1]`.
pub const RTC_BASE_PORT: u16 = 20_000;
pub const RTC_PORTS_PER_WORKER: u16 = 1_000;

/// Main media configuration, compiled-in apart from `ANNOUNCED_IP`.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub workers: WorkerPoolConfig,
    pub transport: TransportConfig,
}

impl MediaConfig {
    /// Builds the config from the environment (`ANNOUNCED_IP`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.transport.announced_ip = read_announced_ip();
        config
    }
}

fn read_announced_ip() -> Option<String> {
    match std::env::var("ANNOUNCED_IP") {
        Ok(ip) if !ip.is_empty() => {
            info!("Using ANNOUNCED_IP={}", ip);
            Some(ip)
        }
        _ => {
            // Permitted for loopback testing; behind NAT, ICE will fail
            // without an announced address.
            warn!("ANNOUNCED_IP not set; ICE candidates will carry the listen address only");
            None
        }
    }
}

/// Worker pool sizing and per-worker process settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(2),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Srtp,
                WorkerLogTag::Rtcp,
            ],
        }
    }
}

impl WorkerPoolConfig {
    /// Settings for the `index`-th worker slot. Port ranges of distinct
    /// slots never overlap.
    pub fn settings_for(&self, index: usize) -> WorkerSettings {
        let (min, max) = port_range_for(index);
        WorkerSettings {
            log_level: self.log_level,
            log_tags: self.log_tags.clone(),
            rtc_min_port: min,
            rtc_max_port: max,
        }
    }

    /// Settings reusing an explicit port range (worker restarts keep the
    /// range of the worker they replace).
    pub fn settings_for_range(&self, rtc_min_port: u16, rtc_max_port: u16) -> WorkerSettings {
        WorkerSettings {
            log_level: self.log_level,
            log_tags: self.log_tags.clone(),
            rtc_min_port,
            rtc_max_port,
        }
    }
}

/// RTC port range of the `index`-th worker slot.
pub fn port_range_for(index: usize) -> (u16, u16) {
    let min = RTC_BASE_PORT + RTC_PORTS_PER_WORKER * index as u16;
    (min, min + RTC_PORTS_PER_WORKER - 1)
}

/// WebRTC transport options, identical for both directions; recv transports
/// additionally get a max incoming bitrate applied after creation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub announced_ip: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub min_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub ice_consent_timeout_secs: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            announced_ip: None,
            initial_available_outgoing_bitrate: 1_000_000,
            min_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            ice_consent_timeout_secs: 20,
        }
    }
}

impl TransportConfig {
    pub fn webrtc_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
            min_available_outgoing_bitrate: self.min_available_outgoing_bitrate,
            enable_sctp: false,
            max_sctp_message_size: 262_144,
            ice_consent_timeout_secs: self.ice_consent_timeout_secs,
        }
    }
}

/// The fixed codec set every room router is created with.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = vec![
        "nack".to_string(),
        "nack pli".to_string(),
        "ccm fir".to_string(),
        "goog-remb".to_string(),
        "transport-cc".to_string(),
    ];

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: Some(111),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::from([
                ("minptime".to_string(), serde_json::json!(10)),
                ("useinbandfec".to_string(), serde_json::json!(1)),
            ]),
            rtcp_feedback: vec!["transport-cc".to_string()],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: Some(96),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".into(),
            preferred_payload_type: Some(98),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            preferred_payload_type: Some(102),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::from([
                ("level-asymmetry-allowed".to_string(), serde_json::json!(1)),
                ("packetization-mode".to_string(), serde_json::json!(1)),
                ("profile-level-id".to_string(), serde_json::json!("42e01f")),
            ]),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            preferred_payload_type: Some(104),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::from([
                ("level-asymmetry-allowed".to_string(), serde_json::json!(1)),
                ("packetization-mode".to_string(), serde_json::json!(1)),
                ("profile-level-id".to_string(), serde_json::json!("4d0032")),
            ]),
            rtcp_feedback: video_feedback,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ranges_are_disjoint_and_contiguous() {
        for i in 0..8usize {
            let (min, max) = port_range_for(i);
            assert_eq!(min, 20_000 + 1_000 * i as u16);
            assert_eq!(max - min + 1, RTC_PORTS_PER_WORKER);
            if i > 0 {
                let (_, prev_max) = port_range_for(i - 1);
                assert_eq!(min, prev_max + 1);
            }
        }
    }

    #[test]
    fn worker_count_has_a_floor_of_two() {
        assert!(WorkerPoolConfig::default().num_workers >= 2);
    }

    #[test]
    fn codec_set_covers_both_h264_profiles() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 5);
        let profiles: Vec<&str> = codecs
            .iter()
            .filter(|c| c.mime_type == "video/H264")
            .filter_map(|c| c.parameters.get("profile-level-id"))
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(profiles, vec!["42e01f", "4d0032"]);
        assert!(codecs.iter().all(|c| match c.kind {
            MediaKind::Audio => c.clock_rate == 48_000,
            MediaKind::Video => c.clock_rate == 90_000,
        }));
    }
}
