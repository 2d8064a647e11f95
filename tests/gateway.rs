#![cfg(feature = "inmem-store")]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common::*;
use convo::gateway::{backlog, Backlog, CallbackSink, FanOutGateway};
use convo::models::{DeliveredMessage, Id, Message};

fn message(id: Id, thread_id: Id, author_id: Id) -> Message {
    Message {
        id,
        thread_id,
        author_id,
        content: Some(format!("m{id}")),
        attachments: vec![],
        metadata: None,
        created_at: Utc::now(),
        deleted_at: None,
        deleted_by: None,
    }
}

fn gateway(queue: usize) -> FanOutGateway {
    FanOutGateway::new(Arc::new(directory()), queue)
}

async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

async fn drain(rx: &mut Backlog) -> Vec<Id> {
    let mut out = vec![];
    while let Ok(Some(m)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
        out.push(m.message.id);
    }
    out
}

#[tokio::test]
async fn every_subscriber_sees_messages_in_order() {
    let gw = gateway(16);
    let (tx_a, mut rx_a) = backlog(16);
    let (tx_b, mut rx_b) = backlog(16);
    gw.subscribe(1, TENANT, tx_a);
    gw.subscribe(1, M1, tx_b);
    assert_eq!(gw.subscriber_count(1), 2);

    for id in 1..=5 {
        gw.publish(message(id, 1, TENANT));
    }
    // other threads are not delivered
    gw.publish(message(99, 2, TENANT));

    assert_eq!(drain(&mut rx_a).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(drain(&mut rx_b).await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn author_profile_is_resolved_at_delivery() {
    let gw = gateway(8);
    let (tx, mut rx) = backlog(8);
    gw.subscribe(1, M1, tx);
    gw.publish(message(1, 1, PROVIDER));
    gw.publish(message(2, 1, 4242));

    let known = rx.recv().await.unwrap();
    assert_eq!(known.author.display_name.as_deref(), Some("Paul Plombier"));
    assert!(known.author.avatar_url.is_some());
    let unknown = rx.recv().await.unwrap();
    assert_eq!(unknown.author.id, 4242);
    assert_eq!(unknown.author.display_name, None);
}

#[tokio::test]
async fn resubscribing_replaces_the_previous_subscription() {
    let gw = gateway(8);
    let (tx_old, mut rx_old) = backlog(8);
    let (tx_new, mut rx_new) = backlog(8);
    let old = gw.subscribe(1, M1, tx_old);
    let new = gw.subscribe(1, M1, tx_new);
    assert_eq!(gw.subscriber_count(1), 1);
    assert!(!old.is_active());
    assert!(new.is_active());

    gw.publish(message(1, 1, TENANT));
    assert_eq!(drain(&mut rx_new).await, vec![1]);
    assert!(rx_old.recv().await.is_none());

    // cancelling the stale handle must not tear down its replacement
    old.cancel();
    assert_eq!(gw.subscriber_count(1), 1);
    new.cancel();
    assert_eq!(gw.subscriber_count(1), 0);
    assert_eq!(gw.active_threads(), 0);
}

#[tokio::test]
async fn unsubscribe_drops_all_callbacks_and_is_idempotent() {
    let gw = gateway(8);
    let (tx_a, mut rx_a) = backlog(8);
    let (tx_b, mut rx_b) = backlog(8);
    gw.subscribe(1, TENANT, tx_a);
    gw.subscribe(1, M1, tx_b);

    gw.unsubscribe(1);
    gw.unsubscribe(1);
    assert_eq!(gw.subscriber_count(1), 0);
    assert_eq!(gw.active_threads(), 0);
    assert!(rx_a.recv().await.is_none());
    assert!(rx_b.recv().await.is_none());
}

#[tokio::test]
async fn slow_subscriber_keeps_newest_without_holding_up_others() {
    let gw = gateway(4);
    let (fast_tx, mut fast_rx) = backlog(64);
    let (slow_tx, mut slow_rx) = backlog(3); // never read until the end
    gw.subscribe(1, M1, fast_tx);
    gw.subscribe(1, M2, slow_tx);

    for id in 1..=20 {
        gw.publish(message(id, 1, TENANT));
        settle().await;
    }

    assert_eq!(drain(&mut fast_rx).await, (1..=20).collect::<Vec<_>>());
    assert_eq!(slow_rx.len(), 3);
    assert_eq!(drain(&mut slow_rx).await, vec![18, 19, 20]);
}

#[tokio::test]
async fn backlog_ends_after_queued_messages_once_the_subscription_is_gone() {
    let gw = gateway(8);
    let (tx, mut rx) = backlog(8);
    let handle = gw.subscribe(1, M1, tx);
    gw.publish(message(1, 1, TENANT));
    gw.publish(message(2, 1, TENANT));
    settle().await;
    handle.cancel();

    assert_eq!(rx.recv().await.map(|m| m.message.id), Some(1));
    assert_eq!(rx.recv().await.map(|m| m.message.id), Some(2));
    assert!(rx.recv().await.is_none());
    assert!(rx.is_empty());
}

#[tokio::test]
async fn dropped_backlog_ends_the_subscription() {
    let gw = gateway(8);
    let (tx, rx) = backlog(8);
    gw.subscribe(1, M1, tx);
    drop(rx);
    gw.publish(message(1, 1, TENANT));
    settle().await;
    assert_eq!(gw.subscriber_count(1), 0);
}

#[tokio::test]
async fn callback_sinks_and_shutdown() {
    let gw = gateway(8);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    gw.subscribe(
        3,
        TENANT,
        CallbackSink(move |m: DeliveredMessage| {
            sink_seen.lock().unwrap().push(m.message.id);
            true
        }),
    );
    gw.publish(message(7, 3, M1));
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![7]);

    gw.shutdown();
    assert_eq!(gw.active_threads(), 0);
    gw.publish(message(8, 3, M1));
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn sink_refusal_ends_the_subscription() {
    let gw = gateway(8);
    gw.subscribe(5, TENANT, CallbackSink(|_m: DeliveredMessage| false));
    gw.publish(message(1, 5, M1));
    settle().await;
    assert_eq!(gw.subscriber_count(5), 0);
}

#[tokio::test]
async fn change_feed_drives_delivery() {
    use convo::models::NewMessage;
    use convo::repo::inmem::InMemRepo;
    use convo::repo::{ChangeFeed, MessageRepo, ThreadRepo};

    let repo = InMemRepo::new();
    let gw = gateway(8);
    gw.attach_feed(repo.message_feed());
    let thread = repo
        .create_thread(convo::models::NewThread {
            intervention_id: INTERVENTION_X,
            team_id: TEAM_A,
            thread_type: convo::models::ThreadType::Group,
            title: "t".into(),
            created_by: TENANT,
            participants: vec![],
        })
        .await
        .unwrap();
    let (tx, mut rx) = backlog(8);
    gw.subscribe(thread.id, M1, tx);

    let mut expected = vec![];
    for text in ["a", "b", "c"] {
        let m = repo
            .create_message(NewMessage {
                thread_id: thread.id,
                author_id: TENANT,
                content: text.into(),
                attachments: vec![],
                metadata: None,
            })
            .await
            .unwrap();
        expected.push(m.id);
    }
    assert_eq!(drain(&mut rx).await, expected);
}
