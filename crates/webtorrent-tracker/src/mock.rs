//! In-memory tracker and negotiator used by tests and local simulations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::negotiation::{
    DataChannel, LocalAnswer, LocalOffer, NegotiationError, Negotiator, OnOpenHdlrFn,
    PeerConnection,
};
use crate::transport::{TrackerConnection, TrackerDialer, TransportError};
use crate::wire::SessionDescription;

// ============================================================================
// Mock tracker
// ============================================================================

type DialOutcome = Result<Arc<dyn TrackerConnection>, TransportError>;

struct MockTrackerInner {
    outcomes_tx: mpsc::UnboundedSender<DialOutcome>,
    outcomes_rx: AsyncMutex<mpsc::UnboundedReceiver<DialOutcome>>,
    dials: AtomicUsize,
}

/// Hands out one scripted outcome per dial. A dial with nothing scripted
/// waits until `accept` or `refuse` is called.
#[derive(Clone)]
pub struct MockTracker {
    inner: Arc<MockTrackerInner>,
}

impl MockTracker {
    pub fn new() -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockTrackerInner {
                outcomes_tx,
                outcomes_rx: AsyncMutex::new(outcomes_rx),
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub fn dialer(&self) -> Arc<dyn TrackerDialer> {
        Arc::new(self.clone())
    }

    /// Lets the next dial succeed and returns the tracker's end of it.
    pub fn accept(&self) -> MockSession {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, closed) = watch::channel(false);
        let fail_writes = Arc::new(AtomicBool::new(false));
        let connection = MockConnection {
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            shutdown,
            fail_writes: fail_writes.clone(),
        };
        let _ = self.inner.outcomes_tx.send(Ok(Arc::new(connection)));
        MockSession {
            outbound_rx: AsyncMutex::new(outbound_rx),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            closed,
            fail_writes,
        }
    }

    /// Makes the next dial fail.
    pub fn refuse(&self) {
        let _ = self
            .inner
            .outcomes_tx
            .send(Err(TransportError::Connect("mock tracker refused".into())));
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }
}

impl Default for MockTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackerDialer for MockTracker {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn TrackerConnection>, TransportError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.inner.outcomes_rx.lock().await;
        match outcomes.recv().await {
            Some(outcome) => outcome,
            None => Err(TransportError::Connect("mock tracker gone".into())),
        }
    }
}

struct MockConnection {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    shutdown: watch::Sender<bool>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl TrackerConnection for MockConnection {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Send("mock write failure".into()));
        }
        self.outbound_tx
            .send(text)
            .map_err(|_| TransportError::Send("mock tracker hung up".into()))
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Err(TransportError::Closed),
            text = inbound.recv() => text.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// The tracker's side of one accepted connection.
pub struct MockSession {
    outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: watch::Receiver<bool>,
    fail_writes: Arc<AtomicBool>,
}

impl MockSession {
    /// Next frame written by the client; `None` once the client dropped it.
    pub async fn next_frame(&self) -> Option<String> {
        self.outbound_rx.lock().await.recv().await
    }

    pub async fn next_json(&self) -> Option<serde_json::Value> {
        let frame = self.next_frame().await?;
        serde_json::from_str(&frame).ok()
    }

    pub fn try_next_frame(&self) -> Option<String> {
        self.outbound_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn deliver(&self, text: impl Into<String>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(text.into());
        }
    }

    pub fn deliver_json(&self, value: &serde_json::Value) {
        self.deliver(value.to_string());
    }

    /// Drops the tracker's end; the client's pending read fails.
    pub fn disconnect(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// True once the client closed its end.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

// ============================================================================
// Mock negotiator
// ============================================================================

/// Data channel that records what it is sent and replays what it is fed.
pub struct MockDataChannel {
    label: String,
    sent: Mutex<Vec<Bytes>>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn feed(&self, data: Bytes) {
        let _ = self.inbound_tx.send(data);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, data: Bytes) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        if self.is_closed() {
            return None;
        }
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRole {
    Offerer,
    Answerer,
}

/// Peer connection whose open event is fired by the test via [`open`].
///
/// [`open`]: MockPeerConnection::open
pub struct MockPeerConnection {
    id: usize,
    role: MockRole,
    channel: Arc<MockDataChannel>,
    remote: Mutex<Option<SessionDescription>>,
    on_open: Mutex<Option<OnOpenHdlrFn>>,
    reject_answer: AtomicBool,
    answers_applied: AtomicUsize,
    closes: AtomicUsize,
}

impl MockPeerConnection {
    fn new(id: usize, role: MockRole, remote: Option<SessionDescription>) -> Self {
        Self {
            id,
            role,
            channel: Arc::new(MockDataChannel::new(format!("mock-{id}"))),
            remote: Mutex::new(remote),
            on_open: Mutex::new(None),
            reject_answer: AtomicBool::new(false),
            answers_applied: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role(&self) -> MockRole {
        self.role
    }

    pub fn channel(&self) -> Arc<MockDataChannel> {
        self.channel.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn reject_answers(&self, reject: bool) {
        self.reject_answer.store(reject, Ordering::SeqCst);
    }

    pub fn answers_applied(&self) -> usize {
        self.answers_applied.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn has_open_handler(&self) -> bool {
        self.on_open.lock().is_some()
    }

    /// Fires the registered open handler. Returns false if none was pending.
    pub async fn open(&self) -> bool {
        let handler = self.on_open.lock().take();
        match handler {
            Some(handler) => {
                let channel: Arc<dyn DataChannel> = self.channel.clone();
                handler(channel).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn set_answer(
        &self,
        answer: SessionDescription,
        on_open: OnOpenHdlrFn,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if self.reject_answer.load(Ordering::SeqCst) {
            return Err(NegotiationError::Description("mock answer rejected".into()));
        }
        *self.remote.lock() = Some(answer);
        *self.on_open.lock() = Some(on_open);
        self.answers_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_data_channel_open(&self, on_open: OnOpenHdlrFn) {
        *self.on_open.lock() = Some(on_open);
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.channel.close().await;
    }
}

#[derive(Default)]
struct Created {
    offers: Vec<Arc<MockPeerConnection>>,
    answers: Vec<Arc<MockPeerConnection>>,
}

/// Negotiator producing [`MockPeerConnection`]s with numbered SDP bodies.
pub struct MockNegotiator {
    created: Mutex<Created>,
    next_id: AtomicUsize,
    fail_offers: AtomicBool,
    fail_answers: AtomicBool,
    hold_answers: watch::Sender<bool>,
}

impl Default for MockNegotiator {
    fn default() -> Self {
        let (hold_answers, _) = watch::channel(false);
        Self {
            created: Mutex::default(),
            next_id: AtomicUsize::new(0),
            fail_offers: AtomicBool::new(false),
            fail_answers: AtomicBool::new(false),
            hold_answers,
        }
    }
}

impl MockNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While held, `create_answering_connection` records its connection and
    /// then waits for release before returning the answer.
    pub fn hold_answers(&self, hold: bool) {
        self.hold_answers.send_replace(hold);
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    /// Connections created by `create_offer`, oldest first.
    pub fn offers(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().offers.clone()
    }

    /// Connections created by `create_answering_connection`, oldest first.
    pub fn answers(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().answers.clone()
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn create_offer(&self) -> Result<LocalOffer, NegotiationError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(NegotiationError::Setup("mock offer failure".into()));
        }
        let id = self.next_id();
        let connection = Arc::new(MockPeerConnection::new(id, MockRole::Offerer, None));
        self.created.lock().offers.push(connection.clone());
        Ok(LocalOffer {
            data_channel: connection.channel(),
            connection,
            offer: SessionDescription::offer(format!("mock-offer-{id}")),
        })
    }

    async fn create_answering_connection(
        &self,
        offer: &SessionDescription,
    ) -> Result<LocalAnswer, NegotiationError> {
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(NegotiationError::Setup("mock answer failure".into()));
        }
        let id = self.next_id();
        let connection = Arc::new(MockPeerConnection::new(
            id,
            MockRole::Answerer,
            Some(offer.clone()),
        ));
        self.created.lock().answers.push(connection.clone());
        let mut held = self.hold_answers.subscribe();
        let _ = held.wait_for(|hold| !*hold).await;
        Ok(LocalAnswer {
            connection,
            answer: SessionDescription::answer(format!("mock-answer-{id}")),
        })
    }
}
