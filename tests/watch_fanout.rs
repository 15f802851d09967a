//! End-to-end fan-out scenarios driven through the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use ripple::testing::{wait_for, MockConnector, MockSideband};
use ripple::{
    EventKind, Listener, ListenerConfig, SidebandStore, WatchError, WatchEvent, WatchFilter,
    Watcher,
};

const EPOCH_START: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

fn setup(staging_capacity: usize) -> (Listener, MockConnector, Arc<MockSideband>) {
    let connector = MockConnector::new();
    let sideband = Arc::new(MockSideband::default());
    let config = ListenerConfig {
        staging_capacity,
        ..ListenerConfig::new("mock")
    };
    let listener = Listener::with_connector(
        config,
        Arc::new(connector.clone()),
        Arc::clone(&sideband) as Arc<dyn SidebandStore>,
    );
    (listener, connector, sideband)
}

/// Builds a wire payload in the producer's seven-field format.
fn payload(key: &[u8], epoch: &str, op: &str, index: &str, value: &[u8], kind: &str, body: &str) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        STANDARD.encode(key),
        epoch,
        op,
        index,
        STANDARD.encode(value),
        kind,
        body
    )
}

fn inline_put(key: &[u8], epoch: &str, body: &[u8]) -> String {
    payload(key, epoch, "INSERT", "idx", b"v", "inline", &STANDARD.encode(body))
}

async fn recv_timeout(watcher: &mut Watcher) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(5), watcher.recv())
        .await
        .expect("timed out waiting for event")
        .expect("watcher stream ended unexpectedly")
}

#[tokio::test]
async fn happy_put() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener
        .listen("c", "repo", WatchFilter::puts())
        .await
        .unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());

    connector.notify(
        "c",
        "aGVsbG8= 1700000000.000000001 INSERT idx_name dmFs inline cGF5bG9hZA==",
    );

    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.kind, EventKind::Put);
    assert_eq!(event.key.as_ref(), b"hello");
    assert_eq!(event.value.as_ref(), b"payload");
    assert_eq!(event.tag.as_str(), "repo");
}

#[tokio::test]
async fn filtered_out() {
    let (listener, connector, _) = setup(1000);
    let mut filtered = listener
        .listen("c", "t", WatchFilter::all().with_index("other", "x"))
        .await
        .unwrap();
    filtered.start_forwarding(EPOCH_START, CancellationToken::new());
    let mut sentinel = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    sentinel.start_forwarding(EPOCH_START, CancellationToken::new());

    connector.notify(
        "c",
        "aGVsbG8= 1700000000.000000001 INSERT idx_name dmFs inline cGF5bG9hZA==",
    );

    // The unfiltered watcher sees the event; by then routing for this
    // notification has completed, and the filtered watcher saw nothing.
    let event = recv_timeout(&mut sentinel).await;
    assert_eq!(event.kind, EventKind::Put);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(filtered.try_recv().is_none());
}

#[tokio::test]
async fn overflow_aborts_slow_watcher_only() {
    let capacity = 4;
    let (listener, connector, _) = setup(capacity);

    // Slow: never reads. Healthy: drains continuously.
    let mut slow = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    let mut healthy = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    healthy.start_forwarding(EPOCH_START, CancellationToken::new());

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = healthy.recv().await {
            if seen_tx.send(event).is_err() {
                return;
            }
        }
    });

    for i in 0..=capacity {
        connector.notify("c", &inline_put(format!("k{i}").as_bytes(), "1700000000", b"row"));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The slow watcher overflowed and was ejected.
    wait_for(|| async { listener.watcher_count().await == 1 }).await;

    // A subsequent notification still reaches the healthy watcher.
    connector.notify("c", &inline_put(b"after", "1700000000", b"row"));

    let mut healthy_keys = Vec::new();
    for _ in 0..=capacity + 1 {
        let event = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Put);
        healthy_keys.push(event.key.clone());
    }
    assert_eq!(healthy_keys.last().unwrap().as_ref(), b"after");

    // The slow watcher observes its staged events followed by exactly one
    // overflow error.
    slow.start_forwarding(EPOCH_START, CancellationToken::new());
    for _ in 0..capacity {
        let event = recv_timeout(&mut slow).await;
        assert_eq!(event.kind, EventKind::Put);
    }
    let event = recv_timeout(&mut slow).await;
    assert_eq!(event.err, Some(WatchError::WatcherFull));
}

#[tokio::test]
async fn sideband_miss_is_latency_error() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());

    connector.notify(
        "c",
        &payload(b"k", "1700000000", "INSERT", "idx", b"v", "stored", "42"),
    );

    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.kind, EventKind::Error);
    let message = event.err.unwrap().to_string();
    assert!(message.contains("watcher latency may be too high"), "{message}");
}

#[tokio::test]
async fn sideband_fetches_once_and_only_when_forwarded() {
    let (listener, connector, sideband) = setup(1000);
    sideband.insert("42", b"spilled-row");

    // Filtered out: the stored payload must not be fetched.
    let mut filtered = listener
        .listen("c", "t", WatchFilter::all().with_index("other", "x"))
        .await
        .unwrap();
    filtered.start_forwarding(EPOCH_START, CancellationToken::new());
    connector.notify(
        "c",
        &payload(b"k", "1700000000", "INSERT", "idx", b"v", "stored", "42"),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sideband.fetch_count(), 0);

    // Forwarded: exactly one fetch.
    let mut watching = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watching.start_forwarding(EPOCH_START, CancellationToken::new());
    connector.notify(
        "c",
        &payload(b"k", "1700000000", "INSERT", "idx", b"v", "stored", "42"),
    );
    let event = recv_timeout(&mut watching).await;
    assert_eq!(event.kind, EventKind::Put);
    assert_eq!(event.value.as_ref(), b"spilled-row");
    assert_eq!(sideband.fetch_count(), 1);
}

#[tokio::test]
async fn connection_loss_resets_everything() {
    let (listener, connector, _) = setup(1000);
    let mut a = listener.listen("a", "t", WatchFilter::all()).await.unwrap();
    a.start_forwarding(EPOCH_START, CancellationToken::new());
    let mut b = listener.listen("b", "t", WatchFilter::all()).await.unwrap();
    b.start_forwarding(EPOCH_START, CancellationToken::new());

    connector.drop_connection();

    for watcher in [&mut a, &mut b] {
        let event = recv_timeout(watcher).await;
        assert_eq!(event.err, Some(WatchError::ConnectionLost));
        // Exactly one error event; the stream is quiescent afterwards.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(watcher.try_recv().is_none());
    }
    assert_eq!(listener.watcher_count().await, 0);
    assert!(connector.listening().is_empty());

    // A later listen re-subscribes lazily on the surviving transport.
    let _again = listener.listen("a", "t", WatchFilter::all()).await.unwrap();
    assert_eq!(connector.listening(), vec!["a".to_string()]);
}

#[tokio::test]
async fn start_time_lower_bound() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    watcher.start_forwarding(start, CancellationToken::new());

    connector.notify("c", &inline_put(b"before", "1699999999", b"r"));
    connector.notify("c", &inline_put(b"at", "1700000000", b"r"));
    connector.notify("c", &inline_put(b"after", "1700000001", b"r"));

    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.key.as_ref(), b"at");
    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.key.as_ref(), b"after");
}

#[tokio::test]
async fn events_arrive_in_listener_order() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());

    for i in 0..10 {
        connector.notify("c", &inline_put(format!("k{i}").as_bytes(), "1700000000", b"r"));
    }
    for i in 0..10 {
        let event = recv_timeout(&mut watcher).await;
        assert_eq!(event.key.as_ref(), format!("k{i}").as_bytes());
    }
}

#[tokio::test]
async fn parse_error_surfaces_and_stream_continues() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());

    connector.notify("c", "only three parts");
    connector.notify("c", &inline_put(b"k", "1700000000", b"r"));

    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.err, Some(WatchError::MalformedPayload(3)));
    // Later events are independent of a per-event parse failure.
    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.kind, EventKind::Put);
}

#[tokio::test]
async fn initial_events_precede_the_stream() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();

    let seeder = watcher.initial_seeder();
    let seed = tokio::spawn(async move {
        for i in 0..3 {
            let event = WatchEvent::put(
                bytes::Bytes::from(format!("seed{i}")),
                bytes::Bytes::from_static(b"row"),
                "t".into(),
            );
            seeder.send(event).await.unwrap();
        }
    });

    for i in 0..3 {
        let event = recv_timeout(&mut watcher).await;
        assert_eq!(event.key.as_ref(), format!("seed{i}").as_bytes());
    }
    seed.await.unwrap();

    watcher.start_forwarding(EPOCH_START, CancellationToken::new());
    connector.notify("c", &inline_put(b"live", "1700000000", b"r"));
    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.key.as_ref(), b"live");
}

#[tokio::test]
async fn send_initial_fails_after_close() {
    let (listener, _, _) = setup(1000);
    let watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.close();
    let err = watcher
        .send_initial(WatchEvent::put(
            bytes::Bytes::from_static(b"k"),
            bytes::Bytes::from_static(b"v"),
            "t".into(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err, WatchError::WatcherClosed);
}

#[tokio::test]
async fn closed_watcher_receives_nothing_further() {
    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());

    watcher.close();
    wait_for(|| async { listener.watcher_count().await == 0 }).await;

    connector.notify("c", &inline_put(b"k", "1700000000", b"r"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(watcher.try_recv().is_none());
}

#[tokio::test]
async fn cancellation_surfaces_one_error_and_unregisters() {
    let (listener, _, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    let cancel = CancellationToken::new();
    watcher.start_forwarding(EPOCH_START, cancel.clone());

    cancel.cancel();

    let event = recv_timeout(&mut watcher).await;
    assert_eq!(event.err, Some(WatchError::Canceled));
    wait_for(|| async { listener.watcher_count().await == 0 }).await;
}

#[tokio::test]
async fn stream_adapter_delivers_and_closes_on_drop() {
    use tokio_stream::StreamExt;

    let (listener, connector, _) = setup(1000);
    let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
    watcher.start_forwarding(EPOCH_START, CancellationToken::new());
    let mut stream = watcher.into_stream();

    connector.notify("c", &inline_put(b"k", "1700000000", b"r"));
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::Put);

    drop(stream);
    wait_for(|| async { listener.watcher_count().await == 0 }).await;
}
