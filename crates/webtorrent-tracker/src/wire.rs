//! Tracker wire format.
//!
//! WebTorrent trackers speak JSON over a websocket. Binary identifiers (info
//! hashes, peer ids, offer ids) travel as strings whose code points are the
//! raw byte values, so every byte maps to exactly one char in U+0000..=U+00FF.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ANNOUNCE_ACTION: &str = "announce";
pub const ID_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("code point {0:?} does not encode a single byte")]
    NonByteCodePoint(char),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

pub fn binary_to_json_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

pub fn json_string_to_binary(text: &str) -> Result<Vec<u8>, WireError> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| WireError::NonByteCodePoint(c)))
        .collect()
}

fn json_string_to_id(text: &str) -> Result<[u8; ID_LEN], WireError> {
    let bytes = json_string_to_binary(text)?;
    <[u8; ID_LEN]>::try_from(bytes.as_slice()).map_err(|_| WireError::InvalidLength {
        expected: ID_LEN,
        actual: bytes.len(),
    })
}

/// 20-byte identifier of a torrent swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; ID_LEN]);

impl InfoHash {
    pub fn from_hex(text: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(text.trim()).map_err(|err| WireError::InvalidHex(err.to_string()))?;
        let actual = bytes.len();
        <[u8; ID_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| WireError::InvalidLength {
                expected: ID_LEN,
                actual,
            })
    }

    pub fn from_json_string(text: &str) -> Result<Self, WireError> {
        json_string_to_id(text).map(Self)
    }

    pub fn to_json_string(&self) -> String {
        binary_to_json_string(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; ID_LEN]);

impl PeerId {
    /// Azureus-style id: the prefix (truncated to 20 bytes) followed by
    /// random alphanumerics.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; ID_LEN];
        let prefix = prefix.as_bytes();
        let fixed = prefix.len().min(ID_LEN);
        id[..fixed].copy_from_slice(&prefix[..fixed]);
        let mut rng = rand::thread_rng();
        for byte in &mut id[fixed..] {
            *byte = rng.sample(rand::distributions::Alphanumeric);
        }
        Self(id)
    }

    pub fn from_json_string(text: &str) -> Result<Self, WireError> {
        json_string_to_id(text).map(Self)
    }

    pub fn to_json_string(&self) -> String {
        binary_to_json_string(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Opaque token correlating an offer with its answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferId(String);

impl OfferId {
    pub fn random() -> Self {
        let bytes: [u8; ID_LEN] = rand::random();
        Self(binary_to_json_string(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        json_string_to_binary(&self.0)
    }
}

impl From<String> for OfferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&hex::encode(bytes)),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    /// Wire name; empty for `None`, which is left out of the request.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnounceEvent::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Transfer accounting reported with every announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnounceFields {
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub numwant: u32,
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    pub action: String,
    pub info_hash: String,
    pub peer_id: String,
    pub offers: Vec<Offer>,
}

impl AnnounceRequest {
    /// Requests a single peer: each wanted peer needs its own offer.
    pub fn single_offer(
        event: AnnounceEvent,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        fields: AnnounceFields,
        offer: Offer,
    ) -> Self {
        Self {
            numwant: 1,
            uploaded: fields.uploaded,
            downloaded: fields.downloaded,
            left: fields.left,
            event: event.as_str().to_string(),
            action: ANNOUNCE_ACTION.to_string(),
            info_hash: info_hash.to_json_string(),
            peer_id: peer_id.to_json_string(),
            offers: vec![offer],
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnounceResponse {
    #[serde(default)]
    pub info_hash: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<OfferId>,
    #[serde(
        rename = "failure reason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_reason: Option<String>,
    #[serde(
        rename = "warning message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub warning_message: Option<String>,
}

/// What a decoded response asks the client to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer {
        offer: SessionDescription,
        offer_id: OfferId,
        info_hash: String,
        from_peer_id: String,
    },
    Answer {
        offer_id: OfferId,
        answer: SessionDescription,
    },
    /// An offer or answer nobody could correlate.
    MissingOfferId,
    Other,
}

impl AnnounceResponse {
    pub fn answer(
        info_hash: &InfoHash,
        peer_id: &PeerId,
        to_peer_id: String,
        offer_id: OfferId,
        answer: SessionDescription,
    ) -> Self {
        Self {
            info_hash: info_hash.to_json_string(),
            action: ANNOUNCE_ACTION.to_string(),
            peer_id: peer_id.to_json_string(),
            to_peer_id,
            answer: Some(answer),
            offer_id: Some(offer_id),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn into_signal(self) -> Signal {
        let carries_sdp = self.offer.is_some() || self.answer.is_some();
        let Some(offer_id) = self.offer_id.filter(|id| !id.as_str().is_empty()) else {
            return if carries_sdp {
                Signal::MissingOfferId
            } else {
                Signal::Other
            };
        };
        match (self.offer, self.answer) {
            (Some(offer), _) => Signal::Offer {
                offer,
                offer_id,
                info_hash: self.info_hash,
                from_peer_id: self.peer_id,
            },
            (None, Some(answer)) => Signal::Answer { offer_id, answer },
            (None, None) => Signal::Other,
        }
    }
}
