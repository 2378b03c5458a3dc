//! Communicator, vault and shared-hash tests.
//!
//! These drive the retry scheduler with a simulated clock and inject
//! pub/sub traffic through the subscriber's fake-message hook; the
//! publishing side is verified against the mock server.

mod support;

use quark_oxide::clock::SimulatedClock;
use quark_oxide::pubsub::{Message, Subscriber};
use quark_oxide::shared::binary;
use quark_oxide::shared::{Communicator, CommunicatorListener, CommunicatorReply, TransientSharedHash};
use quark_oxide::Options;
use std::sync::Arc;
use std::time::Duration;
use support::{ok, Action, CommandLog, MockServer};
use tokio::time::timeout;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Mock that acknowledges every command (handshakes, SUBSCRIBE, PUBLISH)
/// and records the traffic.
async fn pubsub_server(log: CommandLog) -> MockServer {
    MockServer::start(Arc::new(move |conn, _idx, args: &[Vec<u8>]| {
        log.record(conn, args);
        Action::Reply(ok())
    }))
    .await
}

fn publishes(log: &CommandLog) -> Vec<Vec<Vec<u8>>> {
    log.snapshot()
        .into_iter()
        .map(|(_, args)| args)
        .filter(|args| args.first().map(|a| a.as_slice()) == Some(b"PUBLISH".as_ref()))
        .collect()
}

#[tokio::test]
async fn retry_schedule_follows_the_simulated_clock() {
    let log = CommandLog::new();
    let server = pubsub_server(log.clone()).await;

    let subscriber = Subscriber::new(server.members(), Options::default());
    let clock = Arc::new(SimulatedClock::new());
    let communicator = Communicator::with_timing(
        &subscriber,
        "comm-channel",
        clock.clone(),
        secs(10),
        secs(30),
    )
    .await;

    let (_id, mut rx) = communicator.issue_tracked(b"987".to_vec()).await;
    assert_eq!(communicator.pending(), 1);

    // t=0: the request was just published, no retry yet.
    assert_eq!(communicator.retry_pass(secs(0)).await, 0);
    // t=9s: still within the retry interval.
    assert_eq!(communicator.retry_pass(secs(9)).await, 0);
    // t=10s: first retry goes out.
    clock.set(secs(10));
    assert_eq!(communicator.retry_pass(secs(10)).await, 1);
    // t=20s: second retry.
    clock.set(secs(20));
    assert_eq!(communicator.retry_pass(secs(20)).await, 1);
    assert!(rx.try_recv().is_err());

    // t=30s: the hard deadline expires the request.
    clock.set(secs(30));
    assert_eq!(communicator.retry_pass(secs(30)).await, 0);
    assert_eq!(communicator.pending(), 0);
    let reply = timeout(Duration::from_secs(1), rx)
        .await
        .expect("expired future resolves")
        .expect("synthetic reply delivered");
    assert_eq!(reply.status, quark_oxide::shared::vault::DEADLINE_EXCEEDED_STATUS);

    // Initial publish + two retries went over the wire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(publishes(&log).len(), 3);
}

#[tokio::test]
async fn replies_satisfy_pending_requests() {
    let log = CommandLog::new();
    let server = pubsub_server(log.clone()).await;

    let subscriber = Subscriber::new(server.members(), Options::default());
    let communicator = Communicator::new(&subscriber, "comm-channel").await;

    let (id, rx) = communicator.issue_tracked(b"what time is it".to_vec()).await;

    // The other side answers with the same UUID on the same channel.
    let reply = CommunicatorReply {
        status: 0,
        contents: b"beer o'clock".to_vec(),
    };
    subscriber.feed_fake_message(Message::message(
        "comm-channel",
        binary::serialize_reply(&id, &reply).to_vec(),
    ));

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("future resolves")
        .expect("reply delivered");
    assert_eq!(received, reply);
    assert_eq!(communicator.pending(), 0);

    // A second reply for the same UUID is ignored.
    subscriber.feed_fake_message(Message::message(
        "comm-channel",
        binary::serialize_reply(&id, &reply).to_vec(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(communicator.pending(), 0);
}

#[tokio::test]
async fn messages_on_other_channels_are_ignored() {
    let log = CommandLog::new();
    let server = pubsub_server(log.clone()).await;

    let subscriber = Subscriber::new(server.members(), Options::default());
    let communicator = Communicator::new(&subscriber, "comm-channel").await;

    let (id, mut rx) = communicator.issue_tracked(b"req".to_vec()).await;
    let reply = CommunicatorReply {
        status: 0,
        contents: b"misrouted".to_vec(),
    };
    subscriber.feed_fake_message(Message::message(
        "other-channel",
        binary::serialize_reply(&id, &reply).to_vec(),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(communicator.pending(), 1);
}

#[tokio::test]
async fn listener_collects_requests_in_order_and_deduplicates() {
    let log = CommandLog::new();
    let server = pubsub_server(log.clone()).await;

    let subscriber = Subscriber::new(server.members(), Options::default());
    let listener = CommunicatorListener::new(&subscriber, "comm-channel").await;

    let feed = |uuid: &str, contents: &[u8]| {
        subscriber.feed_fake_message(Message::message(
            "comm-channel",
            binary::serialize_request(uuid, contents).to_vec(),
        ));
    };

    feed("req-1", b"first");
    feed("req-2", b"second");
    // A retried request arrives again: suppressed.
    feed("req-1", b"first");

    let first = timeout(Duration::from_secs(5), listener.next())
        .await
        .expect("request arrives");
    assert_eq!(first.id(), "req-1");
    assert_eq!(first.contents(), b"first");

    let second = timeout(Duration::from_secs(5), listener.next())
        .await
        .expect("request arrives");
    assert_eq!(second.id(), "req-2");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.size(), 0);

    // Replying publishes the serialized reply with the same UUID.
    listener.send_reply(0, "req-1", b"answer").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let published = publishes(&log);
    let reply_payload = &published.last().expect("reply published")[2];
    let (uuid, reply) = binary::parse_reply(reply_payload).unwrap();
    assert_eq!(uuid, "req-1");
    assert_eq!(reply.contents, b"answer");
}

#[tokio::test]
async fn listener_front_and_pop_front() {
    let server = pubsub_server(CommandLog::new()).await;
    let subscriber = Subscriber::new(server.members(), Options::default());
    let listener = CommunicatorListener::new(&subscriber, "ch").await;

    subscriber.feed_fake_message(Message::message(
        "ch",
        binary::serialize_request("id-a", b"a").to_vec(),
    ));

    let request = timeout(Duration::from_secs(5), listener.next()).await.unwrap();
    assert_eq!(request.id(), "id-a");
    assert!(listener.front().is_none());
    assert!(listener.pop_front().is_none());
}

#[tokio::test]
async fn shared_hash_applies_local_and_remote_updates() {
    let log = CommandLog::new();
    let server = pubsub_server(log.clone()).await;

    let subscriber = Subscriber::new(server.members(), Options::default());
    let hash = TransientSharedHash::new(&subscriber, "hash-channel").await;

    // Local writes are applied immediately and published.
    hash.set("node", "n1").await;
    assert_eq!(hash.get("node").as_deref(), Some("n1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let published = publishes(&log);
    assert_eq!(published.len(), 1);
    let batch = binary::parse_batch(&published[0][2]).unwrap();
    assert_eq!(batch, vec![("node".to_string(), "n1".to_string())]);

    // Remote updates win by arrival order.
    let update = binary::serialize_batch(&[("node".to_string(), "n2".to_string())]);
    subscriber.feed_fake_message(Message::message("hash-channel", update.to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hash.get("node").as_deref(), Some("n2"));

    // Unknown keys read as absent.
    assert!(hash.get("missing").is_none());
    assert_eq!(hash.len(), 1);
}
