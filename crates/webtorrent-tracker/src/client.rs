//! The tracker client: one websocket to the tracker, many concurrent
//! announcers, and the offer/answer bookkeeping in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::config::TrackerClientConfig;
use crate::negotiation::{
    DataChannel, DataChannelContext, HandlerFuture, LocalAnswer, LocalOffer, NegotiationError,
    Negotiator, OnOpenHdlrFn, PeerConnection,
};
use crate::offers::{OfferTable, OutboundOffer};
use crate::transport::{TrackerConnection, TrackerDialer, TransportError};
use crate::wire::{
    AnnounceEvent, AnnounceFields, AnnounceRequest, AnnounceResponse, InfoHash, Offer, OfferId,
    SessionDescription, Signal,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker client closed")]
    Closed,
    #[error("dialing tracker: {0}")]
    Dial(#[source] TransportError),
    #[error("tracker connection ended: {0}")]
    Connection(#[source] TransportError),
    #[error("writing to tracker: {0}")]
    Write(#[source] TransportError),
    #[error("creating offer: {0}")]
    CreateOffer(#[source] NegotiationError),
    #[error("creating answer: {0}")]
    CreateAnswer(#[source] NegotiationError),
    #[error("encoding tracker message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerClientStats {
    pub dials: u64,
    pub announces: u64,
    pub converted_inbound_conns: u64,
    pub converted_outbound_conns: u64,
    pub inbound_timeouts: u64,
    pub outbound_timeouts: u64,
}

pub type AnnounceFieldsFn = Arc<dyn Fn(AnnounceEvent, &InfoHash) -> AnnounceFields + Send + Sync>;
pub type OnConnFn = Arc<dyn Fn(Arc<dyn DataChannel>, DataChannelContext) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

struct ClientState {
    connection: Option<Arc<dyn TrackerConnection>>,
    offers: OfferTable,
    closed: bool,
    stats: TrackerClientStats,
}

struct Inner {
    config: TrackerClientConfig,
    negotiator: Arc<dyn Negotiator>,
    dialer: Arc<dyn TrackerDialer>,
    announce_fields: AnnounceFieldsFn,
    on_conn: OnConnFn,
    state: AsyncMutex<ClientState>,
    /// Woken when a connection is installed or the client closes.
    connected: Notify,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; every clone drives the same client.
#[derive(Clone)]
pub struct TrackerClient {
    inner: Arc<Inner>,
}

impl TrackerClient {
    pub fn new(
        config: TrackerClientConfig,
        negotiator: Arc<dyn Negotiator>,
        dialer: Arc<dyn TrackerDialer>,
        announce_fields: impl Fn(AnnounceEvent, &InfoHash) -> AnnounceFields + Send + Sync + 'static,
        on_conn: impl Fn(Arc<dyn DataChannel>, DataChannelContext) + Send + Sync + 'static,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                negotiator,
                dialer,
                announce_fields: Arc::new(announce_fields),
                on_conn: Arc::new(on_conn),
                state: AsyncMutex::new(ClientState {
                    connection: None,
                    offers: OfferTable::new(),
                    closed: false,
                    stats: TrackerClientStats::default(),
                }),
                connected: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &TrackerClientConfig {
        &self.inner.config
    }

    /// Keeps a tracker connection up until [`close`](Self::close): dial, read
    /// until the connection fails, clean up, wait, repeat.
    pub async fn run(&self) -> Result<(), TrackerError> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            if inner.is_closed().await {
                break;
            }
            let result = inner.run_connection().await;
            let closed = inner.is_closed().await;
            match result {
                Err(err) if closed => {
                    debug!(target = "webtorrent", url = %inner.config.url, error = %err, "tracker connection ended");
                }
                Err(err) => {
                    info!(target = "webtorrent", url = %inner.config.url, error = %err, "tracker connection ended");
                }
                Ok(()) => {}
            }
            if closed {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
                _ = shutdown.wait_for(|closed| *closed) => break,
            }
        }
        Ok(())
    }

    /// Stops the client. Pending offers are closed, waiting writers fail with
    /// [`TrackerError::Closed`], and `run` returns. Later calls do nothing.
    pub async fn close(&self) {
        let inner = &self.inner;
        let (connection, abandoned) = {
            let mut state = inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            (state.connection.clone(), state.offers.drain())
        };
        inner.shutdown.send_replace(true);
        inner.connected.notify_waiters();
        if let Some(connection) = connection {
            connection.close().await;
        }
        close_offers(abandoned).await;
        debug!(target = "webtorrent", url = %inner.config.url, "tracker client closed");
    }

    /// Creates an offer for `info_hash` and sends it to the tracker. Waits for
    /// a tracker connection if none is up.
    pub async fn announce(
        &self,
        event: AnnounceEvent,
        info_hash: InfoHash,
    ) -> Result<OfferId, TrackerError> {
        self.inner.announce(event, info_hash).await
    }

    pub async fn stats(&self) -> TrackerClientStats {
        self.inner.state.lock().await.stats
    }

    /// Number of offers still waiting for an answer.
    pub async fn pending_offers(&self) -> usize {
        self.inner.state.lock().await.offers.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connection.is_some()
    }
}

impl Inner {
    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Locks the state once a connection is installed, the way a condition
    /// variable wait would.
    async fn lock_connected(
        &self,
    ) -> Result<(MutexGuard<'_, ClientState>, Arc<dyn TrackerConnection>), TrackerError> {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if state.closed {
                    return Err(TrackerError::Closed);
                }
                if let Some(connection) = state.connection.clone() {
                    return Ok((state, connection));
                }
            }
            notified.await;
        }
    }

    async fn run_connection(self: &Arc<Self>) -> Result<(), TrackerError> {
        counter!("webtorrent_tracker_dials_total", 1);
        self.state.lock().await.stats.dials += 1;
        let mut shutdown = self.shutdown.subscribe();
        let dialed = tokio::select! {
            dialed = self.dialer.dial(&self.config.url) => dialed,
            _ = shutdown.wait_for(|closed| *closed) => return Err(TrackerError::Closed),
        };
        let connection = dialed.map_err(TrackerError::Dial)?;
        debug!(target = "webtorrent", url = %self.config.url, "dialed tracker");
        {
            let mut state = self.state.lock().await;
            if state.closed {
                drop(state);
                connection.close().await;
                return Err(TrackerError::Closed);
            }
            state.connection = Some(connection.clone());
        }
        self.connected.notify_waiters();

        let err = self.read_loop(connection.as_ref()).await;

        let abandoned = {
            let mut state = self.state.lock().await;
            state.connection = None;
            state.offers.drain()
        };
        if !abandoned.is_empty() {
            debug!(target = "webtorrent", count = abandoned.len(), "closing unanswered offers");
        }
        close_offers(abandoned).await;
        connection.close().await;
        Err(TrackerError::Connection(err))
    }

    async fn read_loop(self: &Arc<Self>, connection: &dyn TrackerConnection) -> TransportError {
        loop {
            let text = match connection.recv().await {
                Ok(text) => text,
                Err(err) => return err,
            };
            let response = match AnnounceResponse::from_json(&text) {
                Ok(response) => response,
                Err(err) => {
                    warn!(target = "webtorrent", error = %err, "error decoding announce response");
                    continue;
                }
            };
            if let Some(reason) = &response.failure_reason {
                warn!(target = "webtorrent", reason = %reason, "tracker reported failure");
            }
            if let Some(message) = &response.warning_message {
                info!(target = "webtorrent", message = %message, "tracker warning");
            }
            match response.into_signal() {
                Signal::Offer {
                    offer,
                    offer_id,
                    info_hash,
                    from_peer_id,
                } => {
                    let info_hash = match InfoHash::from_json_string(&info_hash) {
                        Ok(info_hash) => info_hash,
                        Err(err) => {
                            warn!(target = "webtorrent", error = %err, "error decoding info_hash in offer");
                            continue;
                        }
                    };
                    if let Err(err) = self
                        .handle_offer(offer, offer_id.clone(), info_hash, from_peer_id)
                        .await
                    {
                        warn!(
                            target = "webtorrent",
                            offer_id = %offer_id,
                            info_hash = %info_hash,
                            error = %err,
                            "error answering offer"
                        );
                    }
                }
                Signal::Answer { offer_id, answer } => self.handle_answer(offer_id, answer).await,
                Signal::MissingOfferId => {
                    warn!(target = "webtorrent", "dropping offer or answer without offer_id");
                }
                Signal::Other => {
                    trace!(target = "webtorrent", "announce response without offer or answer");
                }
            }
        }
    }

    async fn announce(
        self: &Arc<Self>,
        event: AnnounceEvent,
        info_hash: InfoHash,
    ) -> Result<OfferId, TrackerError> {
        counter!("webtorrent_outbound_announces_total", 1);
        let offer_id = OfferId::random();
        let LocalOffer {
            connection,
            data_channel,
            offer,
        } = self
            .negotiator
            .create_offer()
            .await
            .map_err(TrackerError::CreateOffer)?;

        let fields = (self.announce_fields)(event, &info_hash);
        let request = AnnounceRequest::single_offer(
            event,
            &info_hash,
            &self.config.peer_id,
            fields,
            Offer {
                offer_id: offer_id.clone(),
                offer: offer.clone(),
            },
        );
        let text = match request.to_json() {
            Ok(text) => text,
            Err(err) => {
                connection.close().await;
                return Err(err.into());
            }
        };

        let pending = OutboundOffer {
            original_offer: offer,
            connection: connection.clone(),
            data_channel,
            info_hash,
        };
        let rejected = {
            let (mut state, tracker) = match self.lock_connected().await {
                Ok(locked) => locked,
                Err(err) => {
                    connection.close().await;
                    return Err(err);
                }
            };
            if let Err(err) = tracker.send(text).await {
                drop(state);
                connection.close().await;
                return Err(TrackerError::Write(err));
            }
            state.stats.announces += 1;
            state.offers.insert(offer_id.clone(), pending).err()
        };
        if let Some(duplicate) = rejected {
            // 160 random bits; a collision means the rng is broken.
            warn!(target = "webtorrent", offer_id = %offer_id, "offer id already pending");
            duplicate.abandon().await;
        }
        debug!(
            target = "webtorrent",
            event = %event,
            info_hash = %info_hash,
            offer_id = %offer_id,
            "announced"
        );
        Ok(offer_id)
    }

    async fn handle_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
        offer_id: OfferId,
        info_hash: InfoHash,
        from_peer_id: String,
    ) -> Result<(), TrackerError> {
        let LocalAnswer { connection, answer } = self
            .negotiator
            .create_answering_connection(&offer)
            .await
            .map_err(TrackerError::CreateAnswer)?;
        let response = AnnounceResponse::answer(
            &info_hash,
            &self.config.peer_id,
            from_peer_id,
            offer_id.clone(),
            answer.clone(),
        );
        let text = match response.to_json() {
            Ok(text) => text,
            Err(err) => {
                connection.close().await;
                return Err(err.into());
            }
        };
        {
            let (state, tracker) = match self.lock_connected().await {
                Ok(locked) => locked,
                Err(err) => {
                    connection.close().await;
                    return Err(err);
                }
            };
            if let Err(err) = tracker.send(text).await {
                drop(state);
                connection.close().await;
                return Err(TrackerError::Write(err));
            }
        }

        let deadline = self.arm_open_deadline(connection.clone(), Direction::Inbound);
        let client = Arc::downgrade(self);
        let context = DataChannelContext {
            local: answer,
            remote: offer,
            offer_id,
            local_offered: false,
            info_hash,
        };
        connection.on_data_channel_open(deliver_on_open(client, deadline, Direction::Inbound, context));
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, offer_id: OfferId, answer: SessionDescription) {
        let Some(pending) = self.state.lock().await.offers.remove(&offer_id) else {
            warn!(target = "webtorrent", offer_id = %offer_id, "could not find offer for answer");
            return;
        };
        counter!("webtorrent_outbound_offers_answered_total", 1);
        let OutboundOffer {
            original_offer,
            connection,
            data_channel: _,
            info_hash,
        } = pending;

        let deadline = self.arm_open_deadline(connection.clone(), Direction::Outbound);
        let context = DataChannelContext {
            local: original_offer,
            remote: answer.clone(),
            offer_id: offer_id.clone(),
            local_offered: true,
            info_hash,
        };
        let on_open = deliver_on_open(
            Arc::downgrade(self),
            deadline.clone(),
            Direction::Outbound,
            context,
        );
        if let Err(err) = connection.set_answer(answer, on_open).await {
            warn!(
                target = "webtorrent",
                offer_id = %offer_id,
                error = %err,
                "error using outbound offer answer"
            );
            if deadline.settle() {
                connection.close().await;
            }
            return;
        }

        if self.config.reannounce_after_answer {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.announce(AnnounceEvent::None, info_hash).await {
                    debug!(target = "webtorrent", info_hash = %info_hash, error = %err, "re-announce failed");
                }
            });
        }
    }

    /// Closes `connection` unless its data channel opens within
    /// `answer_timeout`.
    fn arm_open_deadline(
        self: &Arc<Self>,
        connection: Arc<dyn PeerConnection>,
        direction: Direction,
    ) -> OpenDeadline {
        let settled = Arc::new(AtomicBool::new(false));
        let flag = settled.clone();
        let client = Arc::downgrade(self);
        let timeout = self.config.answer_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            match direction {
                Direction::Inbound => {
                    counter!("webtorrent_answering_connections_timed_out_total", 1)
                }
                Direction::Outbound => {
                    counter!("webtorrent_offering_connections_timed_out_total", 1)
                }
            }
            if let Some(client) = client.upgrade() {
                let mut state = client.state.lock().await;
                match direction {
                    Direction::Inbound => state.stats.inbound_timeouts += 1,
                    Direction::Outbound => state.stats.outbound_timeouts += 1,
                }
            }
            debug!(target = "webtorrent", ?direction, "data channel did not open in time");
            connection.close().await;
        });
        OpenDeadline {
            settled,
            timer: timer.abort_handle(),
        }
    }
}

/// Either the timer closes the connection or the open handler claims it;
/// whichever settles first wins.
#[derive(Clone)]
struct OpenDeadline {
    settled: Arc<AtomicBool>,
    timer: AbortHandle,
}

impl OpenDeadline {
    fn settle(&self) -> bool {
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.timer.abort();
        true
    }
}

fn deliver_on_open(
    client: Weak<Inner>,
    deadline: OpenDeadline,
    direction: Direction,
    context: DataChannelContext,
) -> OnOpenHdlrFn {
    Box::new(move |channel: Arc<dyn DataChannel>| -> HandlerFuture {
        Box::pin(async move {
            if !deadline.settle() {
                channel.close().await;
                return;
            }
            let Some(client) = client.upgrade() else {
                channel.close().await;
                return;
            };
            {
                let mut state = client.state.lock().await;
                match direction {
                    Direction::Inbound => {
                        counter!("webtorrent_answering_connection_conversions_total", 1);
                        state.stats.converted_inbound_conns += 1;
                    }
                    Direction::Outbound => {
                        counter!("webtorrent_outbound_offers_opened_total", 1);
                        state.stats.converted_outbound_conns += 1;
                    }
                }
            }
            debug!(
                target = "webtorrent",
                offer_id = %context.offer_id,
                info_hash = %context.info_hash,
                local_offered = context.local_offered,
                "data channel open"
            );
            (client.on_conn)(channel, context);
        })
    })
}

async fn close_offers(abandoned: Vec<(OfferId, OutboundOffer)>) {
    for (_, offer) in abandoned {
        offer.abandon().await;
    }
}
