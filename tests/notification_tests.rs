//! Chain notifier tests

use chainstate_core::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn block(nonce: u32) -> Arc<Block> {
    Arc::new(Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: [0; 32],
            timestamp: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce,
        },
        transactions: vec![],
    })
}

#[test]
fn test_every_subscriber_sees_same_order() {
    let notifier = ChainNotifier::new();
    let logs: Vec<Arc<Mutex<Vec<u32>>>> = (0..5)
        .map(|_| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let sink = log.clone();
            notifier.subscribe(move |n| {
                if let Some(block) = n.block() {
                    sink.lock().push(block.header.nonce);
                }
            });
            log
        })
        .collect();

    for nonce in 0..100 {
        notifier.send_notification(Notification::BlockConnected(block(nonce)));
    }

    let expected: Vec<u32> = (0..100).collect();
    for log in logs {
        assert_eq!(*log.lock(), expected);
    }
}

#[test]
fn test_subscribe_while_sending() {
    let notifier = ChainNotifier::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    let sender = {
        let notifier = notifier.clone();
        thread::spawn(move || {
            for nonce in 0..200 {
                notifier.send_notification(Notification::BlockAccepted(block(nonce)));
            }
        })
    };
    let subscriptions: Vec<Subscription> = (0..20)
        .map(|_| {
            let delivered = delivered.clone();
            notifier.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    sender.join().unwrap();

    assert_eq!(notifier.subscriber_count(), 20);
    for subscription in subscriptions {
        assert!(subscription.unsubscribe());
    }
    assert_eq!(notifier.subscriber_count(), 0);
    assert!(delivered.load(Ordering::Relaxed) <= 20 * 200);
}

#[test]
fn test_unsubscribe_after_notifier_dropped() {
    let notifier = ChainNotifier::new();
    let subscription = notifier.subscribe(|_| {});
    drop(notifier);
    assert!(!subscription.unsubscribe());
}

#[test]
fn test_channel_subscriber_receives_in_order() {
    let notifier = ChainNotifier::new();
    let (subscription, receiver) = notifier.subscribe_channel(16);

    for nonce in 0..3 {
        notifier.send_notification(Notification::BlockConnected(block(nonce)));
    }
    subscription.unsubscribe();
    notifier.send_notification(Notification::BlockConnected(block(3)));

    let nonces: Vec<u32> = std::iter::from_fn(|| receiver.try_recv().ok())
        .filter_map(|n| n.block().map(|b| b.header.nonce))
        .collect();
    assert_eq!(nonces, vec![0, 1, 2]);
}

#[test]
fn test_fault_does_not_remove_subscriber() {
    let notifier = ChainNotifier::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    notifier.subscribe(move |n| {
        counter.fetch_add(1, Ordering::SeqCst);
        if n.kind() == NotificationType::BlockDisconnected {
            panic!("cannot handle disconnects");
        }
    });

    assert_eq!(notifier.send_notification(Notification::BlockDisconnected(block(1))), 1);
    assert_eq!(notifier.send_notification(Notification::BlockConnected(block(1))), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_dropped_receivers_do_not_accumulate() {
    let notifier = ChainNotifier::new();
    for _ in 0..10 {
        let (_subscription, receiver) = notifier.subscribe_channel(1);
        drop(receiver);
    }
    assert_eq!(notifier.subscriber_count(), 10);

    notifier.send_notification(Notification::BlockAccepted(block(0)));
    assert_eq!(notifier.subscriber_count(), 0);
}
