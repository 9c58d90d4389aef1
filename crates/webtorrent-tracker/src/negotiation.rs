//! Seam between the signaling engine and a WebRTC stack.
//!
//! The engine decides when offers and answers are created, exchanged and
//! matched; everything below that (ICE, DTLS, SCTP) lives behind these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::wire::{InfoHash, OfferId, SessionDescription};

#[derive(Debug, Error, Clone)]
pub enum NegotiationError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("peer connection closed")]
    Closed,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fired once, when the negotiated data channel becomes usable.
pub type OnOpenHdlrFn = Box<dyn FnOnce(Arc<dyn DataChannel>) -> HandlerFuture + Send + Sync>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send(&self, data: Bytes) -> Result<(), NegotiationError>;

    /// Next inbound message; `None` once the channel is closed.
    async fn recv(&self) -> Option<Bytes>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Applies the remote answer to a connection that produced an offer.
    /// `on_open` fires when the offerer's data channel opens.
    async fn set_answer(
        &self,
        answer: SessionDescription,
        on_open: OnOpenHdlrFn,
    ) -> Result<(), NegotiationError>;

    /// Registers `on_open` for the first data channel the remote side opens
    /// on an answering connection.
    fn on_data_channel_open(&self, on_open: OnOpenHdlrFn);

    async fn close(&self);
}

pub struct LocalOffer {
    pub connection: Arc<dyn PeerConnection>,
    pub data_channel: Arc<dyn DataChannel>,
    pub offer: SessionDescription,
}

pub struct LocalAnswer {
    pub connection: Arc<dyn PeerConnection>,
    pub answer: SessionDescription,
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_offer(&self) -> Result<LocalOffer, NegotiationError>;

    async fn create_answering_connection(
        &self,
        offer: &SessionDescription,
    ) -> Result<LocalAnswer, NegotiationError>;
}

/// Describes how a data channel handed to the application was negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelContext {
    pub local: SessionDescription,
    pub remote: SessionDescription,
    pub offer_id: OfferId,
    pub local_offered: bool,
    pub info_hash: InfoHash,
}
