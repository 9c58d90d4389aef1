use std::collections::HashMap;
use std::sync::Arc;

use crate::negotiation::{DataChannel, PeerConnection};
use crate::wire::{InfoHash, OfferId, SessionDescription};

/// An offer sent to the tracker that is still waiting for an answer.
pub struct OutboundOffer {
    pub original_offer: SessionDescription,
    pub connection: Arc<dyn PeerConnection>,
    pub data_channel: Arc<dyn DataChannel>,
    pub info_hash: InfoHash,
}

impl OutboundOffer {
    /// Tears down both handles of an offer nobody will answer anymore.
    pub async fn abandon(self) {
        self.data_channel.close().await;
        self.connection.close().await;
    }
}

/// Pending outbound offers keyed by offer id. Callers serialise access.
#[derive(Default)]
pub struct OfferTable {
    offers: HashMap<OfferId, OutboundOffer>,
}

impl OfferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `offer`. Returns it back if the id is already pending so the
    /// caller can dispose of it.
    pub fn insert(&mut self, id: OfferId, offer: OutboundOffer) -> Result<(), OutboundOffer> {
        if self.offers.contains_key(&id) {
            return Err(offer);
        }
        self.offers.insert(id, offer);
        Ok(())
    }

    pub fn remove(&mut self, id: &OfferId) -> Option<OutboundOffer> {
        self.offers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Empties the table, handing every pending offer to the caller.
    pub fn drain(&mut self) -> Vec<(OfferId, OutboundOffer)> {
        self.offers.drain().collect()
    }
}
