use super::*;
use std::sync::Mutex;

#[test]
fn delivers_in_subscription_order() {
    let hub = EventHub::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let seen = Arc::clone(&seen);
        hub.subscribe(move |value| seen.lock().expect("seen").push(("first", *value)))
    };
    let second = {
        let seen = Arc::clone(&seen);
        hub.subscribe(move |value| seen.lock().expect("seen").push(("second", *value)))
    };

    hub.emit(&7);

    assert_eq!(
        *seen.lock().expect("seen"),
        vec![("first", 7), ("second", 7)]
    );
    assert!(first.id() < second.id());
}

#[test]
fn dispose_stops_delivery() {
    let hub = EventHub::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let seen = Arc::clone(&seen);
        hub.subscribe(move |value| seen.lock().expect("seen").push(*value))
    };

    hub.emit(&1);
    subscription.dispose();
    hub.emit(&2);

    assert_eq!(*seen.lock().expect("seen"), vec![1]);
    assert_eq!(hub.subscriber_count(), 0);
}

#[test]
fn dropping_the_handle_disposes() {
    let hub = EventHub::<u32>::new();
    {
        let _subscription = hub.subscribe(|_| {});
        assert_eq!(hub.subscriber_count(), 1);
    }
    assert_eq!(hub.subscriber_count(), 0);
}

#[test]
fn handler_may_subscribe_while_emitting() {
    let hub = Arc::new(EventHub::<u32>::new());
    let nested = Arc::new(Mutex::new(Vec::new()));

    let _outer = {
        let hub_for_handler = Arc::clone(&hub);
        let nested = Arc::clone(&nested);
        hub.subscribe(move |_| {
            let subscription = hub_for_handler.subscribe(|_| {});
            nested.lock().expect("nested").push(subscription);
        })
    };

    hub.emit(&1);
    assert_eq!(hub.subscriber_count(), 2);
}

#[test]
fn disposing_after_hub_dropped_is_harmless() {
    let hub = EventHub::<u32>::new();
    let subscription = hub.subscribe(|_| {});
    drop(hub);
    subscription.dispose();
}

#[test]
fn emit_while_stops_once_undeliverable() {
    let hub = EventHub::<u32>::new();
    let open = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _closer = {
        let open = Arc::clone(&open);
        let seen = Arc::clone(&seen);
        hub.subscribe(move |value| {
            seen.lock().expect("seen").push(("closer", *value));
            open.store(false, std::sync::atomic::Ordering::SeqCst);
        })
    };
    let _after = {
        let seen = Arc::clone(&seen);
        hub.subscribe(move |value| seen.lock().expect("seen").push(("after", *value)))
    };

    let completed = hub.emit_while(&1, || open.load(std::sync::atomic::Ordering::SeqCst));

    assert!(!completed);
    assert_eq!(*seen.lock().expect("seen"), vec![("closer", 1)]);
}
