use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use webtorrent_tracker::mock::{MockNegotiator, MockSession, MockTracker};
use webtorrent_tracker::{
    AnnounceEvent, AnnounceFields, DataChannel, DataChannelContext, InfoHash, OfferId, PeerId,
    SessionDescription, TrackerClient, TrackerClientConfig, TrackerClientStats, TrackerError,
};

const INFO_HASH: InfoHash = InfoHash([0xab; 20]);
const LEFT: i64 = 4096;

type Opened = Arc<Mutex<Vec<(Arc<dyn DataChannel>, DataChannelContext)>>>;

struct Harness {
    client: TrackerClient,
    tracker: MockTracker,
    negotiator: Arc<MockNegotiator>,
    opened: Opened,
    peer_id: PeerId,
}

fn test_config() -> TrackerClientConfig {
    TrackerClientConfig {
        url: "ws://tracker.test/announce".into(),
        peer_id: PeerId::generate("-TS0001-"),
        reconnect_delay: Duration::from_millis(200),
        answer_timeout: Duration::from_secs(30),
        reannounce_after_answer: true,
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: TrackerClientConfig) -> Self {
        let tracker = MockTracker::new();
        let negotiator = MockNegotiator::new();
        let opened: Opened = Arc::default();
        let peer_id = config.peer_id;
        let sink = opened.clone();
        let client = TrackerClient::new(
            config,
            negotiator.clone(),
            tracker.dialer(),
            |_event: AnnounceEvent, _info_hash: &InfoHash| AnnounceFields {
                uploaded: 0,
                downloaded: 0,
                left: LEFT,
            },
            move |channel: Arc<dyn DataChannel>, context: DataChannelContext| {
                sink.lock().push((channel, context));
            },
        );
        Self {
            client,
            tracker,
            negotiator,
            opened,
            peer_id,
        }
    }

    fn spawn_run(&self) -> JoinHandle<Result<(), TrackerError>> {
        let client = self.client.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn connect(&self) -> (JoinHandle<Result<(), TrackerError>>, MockSession) {
        let runner = self.spawn_run();
        let session = self.tracker.accept();
        self.wait_connected(true).await;
        (runner, session)
    }

    async fn wait_connected(&self, connected: bool) {
        for _ in 0..400 {
            if self.client.is_connected().await == connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client connected state never became {connected}");
    }

    async fn wait_stats(&self, condition: impl Fn(&TrackerClientStats) -> bool) -> TrackerClientStats {
        for _ in 0..400 {
            let stats = self.client.stats().await;
            if condition(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stats never matched: {:?}", self.client.stats().await);
    }

    async fn shutdown(&self, runner: JoinHandle<Result<(), TrackerError>>) {
        self.client.close().await;
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run returns after close")
            .expect("run task joined")
            .expect("run result");
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

async fn next_json(session: &MockSession) -> Value {
    tokio::time::timeout(Duration::from_secs(5), session.next_json())
        .await
        .expect("frame within timeout")
        .expect("frame is json")
}

fn answer_frame(offer_id: &OfferId, from: &PeerId, sdp: &str) -> Value {
    json!({
        "action": "announce",
        "info_hash": INFO_HASH.to_json_string(),
        "peer_id": from.to_json_string(),
        "offer_id": offer_id.as_str(),
        "answer": { "type": "answer", "sdp": sdp },
    })
}

fn offer_frame(offer_id: &str, from: &PeerId, sdp: &str) -> Value {
    json!({
        "action": "announce",
        "info_hash": INFO_HASH.to_json_string(),
        "peer_id": from.to_json_string(),
        "offer_id": offer_id,
        "offer": { "type": "offer", "sdp": sdp },
    })
}

#[tokio::test]
async fn announce_waits_for_a_tracker_connection() {
    let h = Harness::new();
    let announcer = h.client.clone();
    let announce =
        tokio::spawn(async move { announcer.announce(AnnounceEvent::Started, INFO_HASH).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!announce.is_finished());
    assert_eq!(h.negotiator.offers().len(), 1);

    let (runner, session) = h.connect().await;
    let frame = next_json(&session).await;
    let offer_id = announce
        .await
        .expect("announce task")
        .expect("announce succeeds");

    assert_eq!(frame["action"], "announce");
    assert_eq!(frame["event"], "started");
    assert_eq!(frame["numwant"], 1);
    assert_eq!(frame["left"], LEFT);
    assert_eq!(frame["info_hash"], INFO_HASH.to_json_string());
    assert_eq!(frame["peer_id"], h.peer_id.to_json_string());
    assert_eq!(frame["offers"][0]["offer_id"], offer_id.as_str());
    assert_eq!(frame["offers"][0]["offer"]["type"], "offer");
    assert_eq!(frame["offers"][0]["offer"]["sdp"], "mock-offer-0");
    assert_eq!(h.client.pending_offers().await, 1);
    assert_eq!(h.client.stats().await.announces, 1);

    h.shutdown(runner).await;
}

#[tokio::test]
async fn concurrent_announces_use_distinct_offer_ids() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;

    let first = h.client.clone();
    let second = h.client.clone();
    let (a, b) = tokio::join!(
        first.announce(AnnounceEvent::Started, INFO_HASH),
        second.announce(AnnounceEvent::Started, InfoHash([0x01; 20])),
    );
    let a = a.expect("first announce");
    let b = b.expect("second announce");
    assert_ne!(a, b);

    let frames = [next_json(&session).await, next_json(&session).await];
    let mut ids: Vec<String> = frames
        .iter()
        .map(|frame| frame["offers"][0]["offer_id"].as_str().expect("offer id").to_string())
        .collect();
    ids.sort();
    let mut expected = vec![a.as_str().to_string(), b.as_str().to_string()];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(h.client.pending_offers().await, 2);

    h.shutdown(runner).await;
}

#[tokio::test]
async fn close_empties_the_offer_table_and_fails_later_announces() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    for _ in 0..2 {
        h.client
            .announce(AnnounceEvent::Started, INFO_HASH)
            .await
            .expect("announce");
    }
    assert_eq!(h.client.pending_offers().await, 2);

    h.shutdown(runner).await;

    assert_eq!(h.client.pending_offers().await, 0);
    assert!(session.is_closed());
    for offer in h.negotiator.offers() {
        assert_eq!(offer.close_count(), 1);
        assert!(offer.channel().is_closed());
    }

    let result = h.client.announce(AnnounceEvent::Started, INFO_HASH).await;
    assert!(matches!(result, Err(TrackerError::Closed)));
    let late = h.negotiator.offers().pop().expect("late offer");
    assert_eq!(late.close_count(), 1);

    // Idempotent.
    h.client.close().await;
}

#[tokio::test]
async fn close_releases_blocked_announcers_and_a_pending_dial() {
    let h = Harness::new();
    let runner = h.spawn_run();
    let announcer = h.client.clone();
    let announce =
        tokio::spawn(async move { announcer.announce(AnnounceEvent::Started, INFO_HASH).await });
    eventually(|| h.tracker.dial_count() == 1).await;

    h.client.close().await;

    let result = tokio::time::timeout(Duration::from_secs(5), announce)
        .await
        .expect("announce returns after close")
        .expect("announce task");
    assert!(matches!(result, Err(TrackerError::Closed)));
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run returns after close")
        .expect("run task")
        .expect("run result");
    assert!(h.negotiator.offers()[0].is_closed());
}

#[tokio::test]
async fn answer_is_correlated_once_and_triggers_a_reannounce() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let offer_id = h
        .client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce");
    next_json(&session).await;

    session.deliver_json(&answer_frame(&offer_id, &remote, "remote-answer"));
    let offer = h.negotiator.offers()[0].clone();
    eventually(|| offer.answers_applied() == 1).await;
    assert_eq!(
        offer.remote_description(),
        Some(SessionDescription::answer("remote-answer"))
    );

    let reannounce = next_json(&session).await;
    assert!(reannounce.get("event").is_none());
    assert_ne!(reannounce["offers"][0]["offer_id"], offer_id.as_str());
    assert_eq!(reannounce["info_hash"], INFO_HASH.to_json_string());

    // A second answer for the same id finds nothing to correlate.
    session.deliver_json(&answer_frame(&offer_id, &remote, "late-answer"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(offer.answers_applied(), 1);
    assert!(session.try_next_frame().is_none());

    assert!(offer.open().await);
    let opened = h.opened.lock().clone();
    assert_eq!(opened.len(), 1);
    let context = &opened[0].1;
    assert!(context.local_offered);
    assert_eq!(context.offer_id, offer_id);
    assert_eq!(context.info_hash, INFO_HASH);
    assert_eq!(context.local, SessionDescription::offer("mock-offer-0"));
    assert_eq!(context.remote, SessionDescription::answer("remote-answer"));
    assert_eq!(h.client.stats().await.converted_outbound_conns, 1);
    assert!(!offer.is_closed());

    h.shutdown(runner).await;
}

#[tokio::test(start_paused = true)]
async fn inbound_offer_is_answered_and_delivered_on_open() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));
    let frame = next_json(&session).await;
    assert_eq!(frame["action"], "announce");
    assert_eq!(frame["info_hash"], INFO_HASH.to_json_string());
    assert_eq!(frame["peer_id"], h.peer_id.to_json_string());
    assert_eq!(frame["to_peer_id"], remote.to_json_string());
    assert_eq!(frame["offer_id"], "remote-offer-id");
    assert_eq!(frame["answer"]["type"], "answer");
    assert_eq!(frame["answer"]["sdp"], "mock-answer-0");

    let answering = h.negotiator.answers()[0].clone();
    eventually(|| answering.has_open_handler()).await;
    assert_eq!(
        answering.remote_description(),
        Some(SessionDescription::offer("remote-offer"))
    );

    assert!(answering.open().await);
    {
        let opened = h.opened.lock();
        assert_eq!(opened.len(), 1);
        let context = &opened[0].1;
        assert!(!context.local_offered);
        assert_eq!(context.offer_id, OfferId::from("remote-offer-id".to_string()));
        assert_eq!(context.local, SessionDescription::answer("mock-answer-0"));
        assert_eq!(context.remote, SessionDescription::offer("remote-offer"));
    }
    assert_eq!(h.client.stats().await.converted_inbound_conns, 1);

    // The open won the race; the abandonment timer must not close it.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(answering.close_count(), 0);
    assert_eq!(h.client.stats().await.inbound_timeouts, 0);

    h.shutdown(runner).await;
}

#[tokio::test(start_paused = true)]
async fn unopened_inbound_connection_is_closed_after_the_timeout() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));
    next_json(&session).await;
    let answering = h.negotiator.answers()[0].clone();
    eventually(|| answering.has_open_handler()).await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(!answering.is_closed());
    tokio::time::sleep(Duration::from_secs(2)).await;

    h.wait_stats(|stats| stats.inbound_timeouts == 1).await;
    eventually(|| answering.close_count() == 1).await;

    // A late open loses the race and is not reported.
    assert!(answering.open().await);
    assert!(h.opened.lock().is_empty());
    assert_eq!(h.client.stats().await.converted_inbound_conns, 0);
    assert_eq!(answering.close_count(), 1);

    h.shutdown(runner).await;
}

#[tokio::test(start_paused = true)]
async fn unopened_outbound_connection_is_closed_after_the_timeout() {
    let h = Harness::with_config(TrackerClientConfig {
        reannounce_after_answer: false,
        ..test_config()
    });
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let offer_id = h
        .client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce");
    next_json(&session).await;
    session.deliver_json(&answer_frame(&offer_id, &remote, "remote-answer"));
    let offer = h.negotiator.offers()[0].clone();
    eventually(|| offer.answers_applied() == 1).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    h.wait_stats(|stats| stats.outbound_timeouts == 1).await;
    assert_eq!(offer.close_count(), 1);
    assert!(session.try_next_frame().is_none());
    assert_eq!(h.negotiator.offers().len(), 1);

    h.shutdown(runner).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_offers_and_stale_answers_are_ignored() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let offer_id = h
        .client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce");
    next_json(&session).await;
    let offer = h.negotiator.offers()[0].clone();

    session.disconnect();
    h.wait_connected(false).await;
    eventually(|| offer.is_closed()).await;
    eventually(|| session.is_closed()).await;
    assert_eq!(h.client.pending_offers().await, 0);

    let second = h.tracker.accept();
    h.wait_connected(true).await;
    assert_eq!(h.client.stats().await.dials, 2);

    second.deliver_json(&answer_frame(&offer_id, &remote, "stale-answer"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(offer.answers_applied(), 0);
    assert_eq!(offer.close_count(), 1);
    assert!(second.try_next_frame().is_none());

    h.shutdown(runner).await;
}

#[tokio::test]
async fn malformed_frames_do_not_end_the_connection() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let offer_id = h
        .client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce");
    next_json(&session).await;

    session.deliver("this is not json");
    session.deliver_json(&json!({ "action": "announce", "interval": 120, "complete": 3 }));
    session.deliver_json(&json!({ "failure reason": "unsupported info hash" }));
    let mut short_hash = offer_frame("bad-hash", &remote, "remote-offer");
    short_hash["info_hash"] = json!("short");
    session.deliver_json(&short_hash);
    session.deliver_json(&answer_frame(&offer_id, &remote, "remote-answer"));

    let offer = h.negotiator.offers()[0].clone();
    eventually(|| offer.answers_applied() == 1).await;
    assert!(h.negotiator.answers().is_empty());
    assert!(h.client.is_connected().await);
    assert_eq!(h.client.stats().await.dials, 1);

    h.shutdown(runner).await;
}

#[tokio::test]
async fn failed_answer_creation_sends_nothing() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");
    h.negotiator.fail_answers(true);

    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.try_next_frame().is_none());
    assert!(h.client.is_connected().await);

    h.negotiator.fail_answers(false);
    session.deliver_json(&offer_frame("second-offer-id", &remote, "remote-offer"));
    let frame = next_json(&session).await;
    assert_eq!(frame["offer_id"], "second-offer-id");

    h.shutdown(runner).await;
}

#[tokio::test]
async fn failed_answer_write_closes_the_answering_connection() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");
    session.fail_writes(true);

    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));
    eventually(|| {
        h.negotiator
            .answers()
            .first()
            .is_some_and(|answering| answering.close_count() == 1)
    })
    .await;
    let answering = h.negotiator.answers()[0].clone();
    assert!(!answering.has_open_handler());
    assert!(h.client.is_connected().await);

    session.fail_writes(false);
    session.deliver_json(&offer_frame("second-offer-id", &remote, "remote-offer"));
    let frame = next_json(&session).await;
    assert_eq!(frame["offer_id"], "second-offer-id");
    assert_eq!(answering.close_count(), 1);

    h.shutdown(runner).await;
}

#[tokio::test]
async fn offer_still_being_answered_at_close_is_dropped() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");
    h.negotiator.hold_answers(true);

    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));
    eventually(|| h.negotiator.answers().len() == 1).await;
    h.client.close().await;
    h.negotiator.hold_answers(false);

    let answering = h.negotiator.answers()[0].clone();
    eventually(|| answering.close_count() == 1).await;
    assert!(!answering.has_open_handler());
    assert!(session.try_next_frame().is_none());
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run returns after close")
        .expect("run task")
        .expect("run result");

    // Nothing reads the tracker once closed.
    session.deliver_json(&offer_frame("late-offer-id", &remote, "remote-offer"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.negotiator.answers().len(), 1);
    assert!(session.try_next_frame().is_none());
}

#[tokio::test]
async fn offer_without_id_is_not_answered() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let mut missing_id = offer_frame("unused", &remote, "remote-offer");
    missing_id
        .as_object_mut()
        .expect("frame is an object")
        .remove("offer_id");
    session.deliver_json(&missing_id);
    session.deliver_json(&offer_frame("", &remote, "remote-offer"));
    session.deliver_json(&offer_frame("remote-offer-id", &remote, "remote-offer"));

    let frame = next_json(&session).await;
    assert_eq!(frame["offer_id"], "remote-offer-id");
    assert_eq!(h.negotiator.answers().len(), 1);
    assert!(session.try_next_frame().is_none());

    h.shutdown(runner).await;
}

#[tokio::test]
async fn write_failure_closes_the_new_offer() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    session.fail_writes(true);

    let result = h.client.announce(AnnounceEvent::Started, INFO_HASH).await;
    assert!(matches!(result, Err(TrackerError::Write(_))));
    assert_eq!(h.negotiator.offers()[0].close_count(), 1);
    assert_eq!(h.client.pending_offers().await, 0);
    assert_eq!(h.client.stats().await.announces, 0);

    session.fail_writes(false);
    h.client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce after writes recover");
    assert_eq!(h.client.pending_offers().await, 1);

    h.shutdown(runner).await;
}

#[tokio::test]
async fn failed_offer_creation_is_reported() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    h.negotiator.fail_offers(true);

    let result = h.client.announce(AnnounceEvent::Started, INFO_HASH).await;
    assert!(matches!(result, Err(TrackerError::CreateOffer(_))));
    assert!(session.try_next_frame().is_none());

    h.shutdown(runner).await;
}

#[tokio::test]
async fn rejected_answer_closes_the_connection() {
    let h = Harness::new();
    let (runner, session) = h.connect().await;
    let remote = PeerId::generate("-RM0001-");

    let offer_id = h
        .client
        .announce(AnnounceEvent::Started, INFO_HASH)
        .await
        .expect("announce");
    next_json(&session).await;
    let offer = h.negotiator.offers()[0].clone();
    offer.reject_answers(true);

    session.deliver_json(&answer_frame(&offer_id, &remote, "remote-answer"));
    eventually(|| offer.is_closed()).await;
    assert_eq!(h.client.pending_offers().await, 0);
    assert_eq!(offer.close_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.try_next_frame().is_none());

    h.shutdown(runner).await;
}

#[tokio::test(start_paused = true)]
async fn every_dial_attempt_is_counted() {
    let h = Harness::new();
    h.tracker.refuse();
    h.tracker.refuse();
    let (runner, _session) = h.connect().await;

    let stats = h.client.stats().await;
    assert_eq!(stats.dials, 3);
    assert_eq!(h.tracker.dial_count(), 3);

    h.shutdown(runner).await;
}
