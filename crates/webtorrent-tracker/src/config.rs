use std::env;
use std::time::Duration;

use crate::wire::PeerId;

pub const DEFAULT_TRACKER_URL: &str = "wss://tracker.openwebtorrent.com";
pub const DEFAULT_PEER_ID_PREFIX: &str = "-WT0001-";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "webrtc-datachannel";

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TrackerClientConfig {
    /// Websocket URL of the tracker.
    pub url: String,
    pub peer_id: PeerId,
    /// Pause between a dropped tracker connection and the next dial.
    pub reconnect_delay: Duration,
    /// How long a negotiated connection may take to open its data channel
    /// before it is closed.
    pub answer_timeout: Duration,
    /// Announce again for the same info hash after every answered offer.
    pub reannounce_after_answer: bool,
}

impl TrackerClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let url = env::var("WEBTORRENT_TRACKER_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TRACKER_URL.to_string());
        let prefix = env::var("WEBTORRENT_PEER_ID_PREFIX")
            .unwrap_or_else(|_| DEFAULT_PEER_ID_PREFIX.to_string());
        Self {
            url,
            peer_id: PeerId::generate(&prefix),
            reconnect_delay: env_secs("WEBTORRENT_RECONNECT_DELAY_SECS")
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
            answer_timeout: env_secs("WEBTORRENT_ANSWER_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_ANSWER_TIMEOUT),
            reannounce_after_answer: env::var("WEBTORRENT_REANNOUNCE")
                .map(|value| env_truthy(&value))
                .unwrap_or(true),
        }
    }
}

impl Default for TrackerClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TRACKER_URL.to_string(),
            peer_id: PeerId::generate(DEFAULT_PEER_ID_PREFIX),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            reannounce_after_answer: true,
        }
    }
}

/// Settings for the `webrtc` backed negotiator.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_urls: Vec<String>,
    pub data_channel_label: String,
}

impl RtcConfig {
    /// Host candidates only; useful on a LAN or in tests.
    pub fn localhost() -> Self {
        Self {
            ice_urls: Vec::new(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        if env::var("WEBTORRENT_DISABLE_STUN")
            .map(|value| env_truthy(&value))
            .unwrap_or(false)
        {
            return Self::localhost();
        }
        let ice_urls = env::var("WEBTORRENT_STUN_URLS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_STUN_URL.to_string()]);
        Self {
            ice_urls,
            ..Self::default()
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_urls: vec![DEFAULT_STUN_URL.to_string()],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .map(Duration::from_secs)
}

fn env_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
