//! Long-poll coordination: wakeups, timeouts, cancellation, and the
//! cancel-versus-delivery race.

use courier::{Message, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[tokio::test]
async fn long_poll_wakes_on_push() {
    let registry = Arc::new(Registry::memory());
    registry.declare("a").unwrap();

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let delivery = registry.long_poll("a", Duration::from_secs(2)).await;
            (delivery, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.push("a", &Message::new(b"hi".to_vec())).unwrap();

    let (delivery, waited) = waiter.await.unwrap();
    let delivery = delivery.unwrap().expect("woken with a message");
    assert_eq!(delivery.message.body, b"hi");
    assert!(waited < Duration::from_millis(1500), "woke late: {waited:?}");
}

#[tokio::test]
async fn long_poll_times_out_empty() {
    let registry = Registry::memory();
    registry.declare("a").unwrap();
    let delivery = registry
        .long_poll("a", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(delivery.is_none());
}

#[tokio::test]
async fn long_poll_returns_empty_when_abandoned() {
    let registry = Arc::new(Registry::memory());
    registry.declare("a").unwrap();

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.long_poll("a", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.abandon("a").unwrap();

    assert!(waiter.await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn cancel_unblocks_waiter() {
    let registry = Arc::new(Registry::memory());
    registry.declare("a").unwrap();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .long_poll_cancelable("a", Duration::from_secs(5), cancel_rx)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    assert!(waiter.await.unwrap().unwrap().is_none());
}

/// No message may be lost when cancellation races a push: whenever the
/// cancelable poll comes back empty, the message must still be pollable.
#[tokio::test]
async fn cancel_race_never_loses_a_message() {
    let registry = Arc::new(Registry::memory());
    registry.declare("a").unwrap();

    for round in 0..25u32 {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .long_poll_cancelable("a", Duration::from_secs(2), cancel_rx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pusher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .push("a", &Message::new(round.to_string().into_bytes()))
                    .unwrap();
            })
        };
        let _ = cancel_tx.send(true);
        pusher.await.unwrap();

        match waiter.await.unwrap().unwrap() {
            Some(delivery) => delivery.ack().await.unwrap(),
            None => {
                // Canceled: the raced message must still be in the mailbox.
                let delivery = registry.poll("a").unwrap().expect("message leaked");
                assert_eq!(delivery.message.body, round.to_string().into_bytes());
                delivery.ack().await.unwrap();
            }
        }

        let stats = registry.mailbox("a").unwrap().stats().unwrap();
        assert_eq!((stats.size, stats.in_flight), (0, 0), "round {round}");
    }
}

#[tokio::test]
async fn message_pushed_after_timeout_is_retained() {
    let registry = Registry::memory();
    registry.declare("a").unwrap();

    let empty = registry
        .long_poll("a", Duration::from_millis(20))
        .await
        .unwrap();
    assert!(empty.is_none());

    registry.push("a", &Message::new(b"later".to_vec())).unwrap();
    let delivery = registry.poll("a").unwrap().unwrap();
    assert_eq!(delivery.message.body, b"later");
}
