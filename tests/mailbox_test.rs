use reactor_net::lifecycle::{setup_tracing, Runtime, RuntimeConfig};
use reactor_net::NetError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const SENDERS: usize = 8;
const MESSAGES: usize = 500;

/// Per-sender order holds and the handler is never entered twice at once.
#[test]
fn test_concurrent_senders_keep_per_sender_order() {
    setup_tracing();
    let runtime = Runtime::new(RuntimeConfig::with_workers(4)).expect("Failed to start runtime");
    let ctx = runtime.create_and_associate_context();

    let (done_tx, done_rx) = mpsc::channel();
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut log: Vec<(usize, usize)> = Vec::with_capacity(SENDERS * MESSAGES);
    let mut overlapped = false;
    let actor = runtime
        .mailbox()
        .register_actor_on(ctx, move |(sender, seq): (usize, usize)| {
            if in_flight.swap(true, Ordering::SeqCst) {
                overlapped = true;
            }
            log.push((sender, seq));
            in_flight.store(false, Ordering::SeqCst);
            if log.len() == SENDERS * MESSAGES {
                done_tx.send((std::mem::take(&mut log), overlapped)).unwrap();
            }
        })
        .expect("Failed to register actor");

    let handles: Vec<_> = (0..SENDERS)
        .map(|sender| {
            let mailbox = runtime.mailbox().clone();
            thread::spawn(move || {
                for seq in 0..MESSAGES {
                    mailbox.send(actor, (sender, seq)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (log, overlapped) = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("Not every message was delivered");
    assert!(!overlapped);

    let mut next: HashMap<usize, usize> = HashMap::new();
    for (sender, seq) in log {
        let expected = next.entry(sender).or_insert(0);
        assert_eq!(seq, *expected, "sender {sender} out of order");
        *expected += 1;
    }
    assert!(next.values().all(|n| *n == MESSAGES));
    runtime.shutdown();
}

/// Typed handles registered from inside a context.
#[test]
fn test_spawn_from_inside_a_context() {
    setup_tracing();
    let runtime = Runtime::new(RuntimeConfig::with_workers(2)).expect("Failed to start runtime");
    let ctx = runtime.create_and_associate_context();

    let (handle_tx, handle_rx) = mpsc::channel();
    let (echo_tx, echo_rx) = mpsc::channel();
    let mailbox = runtime.mailbox().clone();
    runtime
        .execute_on_context(ctx, move || {
            let handle = mailbox.spawn(move |text: String| {
                echo_tx
                    .send((text, reactor_net::context::current()))
                    .unwrap();
            });
            handle_tx.send(handle).unwrap();
        })
        .unwrap();

    let handle = handle_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("Failed to spawn actor");
    assert_eq!(runtime.mailbox().context_of(handle.id()), Some(ctx));
    handle.send("ping".to_string()).unwrap();
    let (text, seen_ctx) = echo_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(text, "ping");
    assert_eq!(seen_ctx, Some(ctx));

    assert!(runtime.mailbox().unregister_actor(handle.id()));
    assert!(matches!(
        handle.send("pong".to_string()),
        Err(NetError::UnknownActor(_))
    ));
    runtime.shutdown();
}

#[test]
fn test_register_on_unbound_context_fails() {
    let runtime = Runtime::new(RuntimeConfig::with_workers(1)).expect("Failed to start runtime");
    let ctx = runtime.create_context();
    assert!(matches!(
        runtime.mailbox().register_actor_on(ctx, |_: u8| {}),
        Err(NetError::UnknownContext(_))
    ));
    runtime.shutdown();
}
