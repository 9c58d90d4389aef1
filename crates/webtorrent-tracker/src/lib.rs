//! WebTorrent websocket tracker client.
//!
//! Keeps a connection to a tracker, announces offers for any number of
//! swarms and answers offers relayed from other peers. Every negotiation that
//! ends with an open data channel is handed to the caller's callback.

pub mod client;
pub mod config;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod negotiation;
pub mod offers;
pub mod rtc;
pub mod transport;
pub mod wire;

pub use client::{TrackerClient, TrackerClientStats, TrackerError};
pub use config::{RtcConfig, TrackerClientConfig};
pub use negotiation::{
    DataChannel, DataChannelContext, NegotiationError, Negotiator, PeerConnection,
};
pub use rtc::RtcNegotiator;
pub use transport::{TrackerConnection, TrackerDialer, TransportError, WebSocketDialer};
pub use wire::{AnnounceEvent, AnnounceFields, InfoHash, OfferId, PeerId, SessionDescription};
