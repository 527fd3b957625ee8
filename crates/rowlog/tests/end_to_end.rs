use std::sync::Arc;
use std::time::Duration;

use rowlog::coordination::CoordinationStore;
use rowlog::subscription::Subscription;
use rowlog::testing::{RecordingListener, TestRowLog};
use rowlog::types::SubscriptionId;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until_empty(log: &TestRowLog) -> bool {
    tokio::time::timeout(WAIT, async {
        while !log.storage().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn single_message_is_delivered_and_purged() {
    let log = TestRowLog::new().await;
    let sub = Subscription::local("index", 1, 3);
    log.row_log().register_subscription(sub.clone()).await.unwrap();
    let listener = Arc::new(RecordingListener::new());
    log.row_log().register_listener(sub.id.clone(), listener.clone());
    let processor = log.processor();
    processor.start().await.unwrap();

    let msg = log
        .row_log()
        .put_message(b"user/1", Some(b"created"), None)
        .await
        .unwrap();
    assert!(listener.wait_for(1, WAIT).await);
    assert!(wait_until_empty(&log).await);

    assert_eq!(listener.delivered(), vec![msg.clone()]);
    assert_eq!(listener.delivered()[0].data.as_deref(), Some(&b"created"[..]));
    assert!(log.row_log().is_message_done(&msg, &sub.id).await.unwrap());
    processor.stop().await;
}

#[tokio::test]
async fn messages_of_one_row_arrive_in_put_order() {
    let log = TestRowLog::new().await;
    let sub = Subscription::local("index", 1, 3);
    log.row_log().register_subscription(sub.clone()).await.unwrap();
    let listener = Arc::new(RecordingListener::new());
    log.row_log().register_listener(sub.id.clone(), listener.clone());

    let mut puts = Vec::new();
    for i in 0..10u8 {
        puts.push(log.row_log().put_message(b"row", Some(&[i]), None).await.unwrap());
    }
    let processor = log.processor();
    processor.start().await.unwrap();

    assert!(listener.wait_for(10, WAIT).await);
    assert_eq!(listener.delivered(), puts);
    processor.stop().await;
}

#[tokio::test]
async fn two_subscriptions_see_every_message_and_the_log_drains() {
    let log = TestRowLog::new().await;
    let index = Subscription::local("index", 1, 3);
    let blobs = Subscription::local("blobs", 2, 3);
    log.row_log().register_subscription(index.clone()).await.unwrap();
    log.row_log().register_subscription(blobs.clone()).await.unwrap();
    let index_listener = Arc::new(RecordingListener::new());
    let blobs_listener = Arc::new(RecordingListener::new());
    log.row_log().register_listener(index.id.clone(), index_listener.clone());
    log.row_log().register_listener(blobs.id.clone(), blobs_listener.clone());

    let processor = log.processor();
    processor.start().await.unwrap();

    let mut puts = Vec::new();
    for row in 0..5 {
        for i in 0..5u8 {
            let key = format!("row-{row}");
            puts.push(
                log.row_log()
                    .put_message(key.as_bytes(), Some(&[i]), None)
                    .await
                    .unwrap(),
            );
        }
    }

    assert!(index_listener.wait_for(25, WAIT).await);
    assert!(blobs_listener.wait_for(25, WAIT).await);
    assert!(wait_until_empty(&log).await);

    for listener in [&index_listener, &blobs_listener] {
        let delivered = listener.delivered();
        assert_eq!(delivered.len(), 25);
        for row in 0..5 {
            let key = format!("row-{row}");
            let of_row: Vec<_> = delivered
                .iter()
                .filter(|m| m.row_key == key.as_bytes())
                .cloned()
                .collect();
            let expected: Vec<_> = puts
                .iter()
                .filter(|m| m.row_key == key.as_bytes())
                .cloned()
                .collect();
            assert_eq!(of_row, expected);
        }
    }
    assert_eq!(log.shard().pending_count(&index.id), 0);
    assert_eq!(log.shard().pending_count(&blobs.id), 0);

    processor.stop().await;
    let config = log.row_log().config();
    assert_eq!(
        log.coordination()
            .processor_address(&config.row_log_id, &config.shard_id)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn unregistering_a_subscription_releases_its_messages() {
    let log = TestRowLog::new().await;
    let index = Subscription::local("index", 1, 3);
    let blobs = Subscription::local("blobs", 2, 3);
    log.row_log().register_subscription(index.clone()).await.unwrap();
    log.row_log().register_subscription(blobs.clone()).await.unwrap();
    let index_listener = Arc::new(RecordingListener::new());
    log.row_log().register_listener(index.id.clone(), index_listener.clone());
    // No listener for blobs: its messages stay pending.

    let processor = log.processor();
    processor.start().await.unwrap();
    log.row_log().put_message(b"row", None, None).await.unwrap();
    assert!(index_listener.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.storage().len(), 1);

    log.row_log().unregister_subscription(&blobs.id).await.unwrap();
    // Nothing waits on the first message any more.
    assert!(log.storage().is_empty());

    log.row_log().put_message(b"row", None, None).await.unwrap();
    assert!(index_listener.wait_for(2, WAIT).await);
    assert!(wait_until_empty(&log).await);
    assert!(!processor.is_running(&blobs.id).await);
    processor.stop().await;
}

#[tokio::test]
async fn payload_is_readable_until_purge() {
    let log = TestRowLog::new().await;
    let sub = Subscription::local("blobs", 1, 3);
    log.row_log().register_subscription(sub.clone()).await.unwrap();
    let msg = log
        .row_log()
        .put_message(b"doc", None, Some(b"large body"))
        .await
        .unwrap();
    assert_eq!(msg.payload.map(|p| p.len), Some(10));
    assert_eq!(
        log.row_log().payload(&msg).await.unwrap().as_deref(),
        Some(&b"large body"[..])
    );

    log.row_log().message_done(&msg, &sub.id).await.unwrap();
    assert_eq!(log.row_log().payload(&msg).await.unwrap(), None);
}

#[tokio::test]
async fn message_put_before_subscription_is_never_delivered_to_it() {
    let log = TestRowLog::new().await;
    let early = Subscription::local("index", 1, 3);
    log.row_log().register_subscription(early.clone()).await.unwrap();
    let before = log.row_log().put_message(b"row", None, None).await.unwrap();

    let late = Subscription::local("audit", 2, 3);
    log.row_log().register_subscription(late.clone()).await.unwrap();
    let late_listener = Arc::new(RecordingListener::new());
    log.row_log().register_listener(late.id.clone(), late_listener.clone());
    log.row_log()
        .register_listener(early.id.clone(), Arc::new(RecordingListener::new()));

    let processor = log.processor();
    processor.start().await.unwrap();
    let after = log.row_log().put_message(b"row", None, None).await.unwrap();
    assert!(late_listener.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(late_listener.delivered(), vec![after]);
    assert!(log
        .row_log()
        .is_message_done(&before, &SubscriptionId::new("audit"))
        .await
        .unwrap());
    processor.stop().await;
}
