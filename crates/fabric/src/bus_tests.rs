// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::event::EventType;
use std::sync::atomic::AtomicUsize;
use tokio::sync::Mutex as AsyncMutex;

fn make_event(source: &str, id: &str) -> Event {
    let now = chrono::Utc::now();
    Event {
        id: id.to_owned(),
        source_connector_id: source.to_owned(),
        event_type: EventType::Motion,
        device_id: None,
        occurred_at: now,
        received_at: now,
        payload: Default::default(),
        capabilities_observed: Default::default(),
    }
}

fn collector_sink() -> (Sink, Arc<AsyncMutex<Vec<Event>>>) {
    let collected = Arc::new(AsyncMutex::new(Vec::new()));
    let c = Arc::clone(&collected);
    let sink: Sink = Arc::new(move |event| {
        let c = Arc::clone(&c);
        Box::pin(async move {
            c.lock().await.push(event);
        })
    });
    (sink, collected)
}

#[tokio::test]
async fn subscriber_receives_matching_events_in_order() {
    let bus = EventBus::new();
    let (sink, collected) = collector_sink();
    let _handle = bus.subscribe(Filter::any(), sink, DropPolicy::DropOldest, None);

    for i in 0..5 {
        bus.publish(make_event("cam-1", &format!("e{i}")));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let got = collected.lock().await;
    let ids: Vec<&str> = got.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
}

#[tokio::test]
async fn filter_excludes_non_matching_events() {
    let bus = EventBus::new();
    let (sink, collected) = collector_sink();
    let _handle = bus.subscribe(Filter::by_source("cam-1"), sink, DropPolicy::DropOldest, None);

    bus.publish(make_event("cam-1", "e1"));
    bus.publish(make_event("cam-2", "e2"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let got = collected.lock().await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, "e1");
}

#[tokio::test]
async fn source_ring_overflow_drops_oldest() {
    let bus = EventBus::with_capacity(4, 256, Duration::from_millis(100));
    // No subscriber: nothing drains the dispatcher delivery side, but the
    // ring itself fills independent of subscriptions.
    for i in 0..5 {
        bus.publish(make_event("cam-1", &format!("e{i}")));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bus.source_overflow("cam-1"), 1);
}

#[tokio::test]
async fn slow_sink_with_drop_oldest_keeps_latest_events() {
    let bus = EventBus::new();
    let started = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let collected = Arc::new(AsyncMutex::new(Vec::new()));

    let s = Arc::clone(&started);
    let r = Arc::clone(&release);
    let c = Arc::clone(&collected);
    let first_call = Arc::new(AtomicUsize::new(0));
    let fc = Arc::clone(&first_call);
    let sink: Sink = Arc::new(move |event| {
        let s = Arc::clone(&s);
        let r = Arc::clone(&r);
        let c = Arc::clone(&c);
        let fc = Arc::clone(&fc);
        Box::pin(async move {
            if fc.fetch_add(1, Ordering::Relaxed) == 0 {
                s.notify_one();
                r.notified().await;
            }
            c.lock().await.push(event);
        })
    });

    let _handle = bus.subscribe(Filter::any(), sink, DropPolicy::DropOldest, Some(4));

    bus.publish(make_event("cam-1", "e0"));
    started.notified().await; // first event is being "processed" (blocked)

    for i in 1..=10 {
        bus.publish(make_event("cam-1", &format!("e{i}")));
    }
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let got = collected.lock().await;
    assert_eq!(got.first().unwrap().id, "e0");
    assert!(got.len() <= 5, "expected bounded delivery, got {}", got.len());
}

#[tokio::test]
async fn unsubscribe_stops_new_deliveries() {
    let bus = EventBus::new();
    let (sink, collected) = collector_sink();
    let handle = bus.subscribe(Filter::any(), sink, DropPolicy::DropOldest, None);

    bus.publish(make_event("cam-1", "e0"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.unsubscribe();
    bus.publish(make_event("cam-1", "e1"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let got = collected.lock().await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, "e0");
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let bus = EventBus::new();
    let (sink, _collected) = collector_sink();
    let handle = bus.subscribe(Filter::any(), sink, DropPolicy::DropOldest, None);
    handle.unsubscribe();
    handle.unsubscribe();
}
