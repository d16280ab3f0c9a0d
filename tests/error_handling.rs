//! Error handling and edge case tests.

use eventrelay::{
    CloseReason, Event, EventId, EventStore, Relay, RelayConfig, RelayError, Result, Start,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A store whose backend can be switched off.
struct FlakyStore {
    inner: eventrelay::MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: eventrelay::MemoryStore::default(),
            down: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(RelayError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "backend unreachable",
            )))
        } else {
            Ok(())
        }
    }
}

impl EventStore for FlakyStore {
    fn append(&self, channel: &str, event_type: &str, payload: Vec<u8>) -> Result<Event> {
        self.check()?;
        self.inner.append(channel, event_type, payload)
    }

    fn read_since(&self, channel: &str, last_id: EventId) -> Result<Vec<Event>> {
        self.check()?;
        self.inner.read_since(channel, last_id)
    }

    fn latest_id(&self, channel: &str) -> Result<Option<EventId>> {
        self.check()?;
        self.inner.latest_id(channel)
    }

    fn oldest_id(&self, channel: &str) -> Result<Option<EventId>> {
        self.check()?;
        self.inner.oldest_id(channel)
    }

    fn channels(&self) -> Vec<String> {
        self.inner.channels()
    }
}

fn flaky_relay() -> (Relay, Arc<FlakyStore>) {
    let store = FlakyStore::new();
    let relay = Relay::with_store(RelayConfig::default(), store.clone()).unwrap();
    (relay, store)
}

// --- Store failures ---

#[test]
fn test_publish_fails_when_store_down() {
    let (relay, store) = flaky_relay();
    let mut session = relay.subscribe(["global"], Start::Latest).unwrap();
    assert!(session
        .recv_timeout(Duration::from_millis(10))
        .unwrap()
        .is_none());

    store.down.store(true, Ordering::SeqCst);
    let result = relay.publish("global", "lost?");
    assert!(matches!(result, Err(RelayError::Io(_))));

    // Nothing reached live listeners either
    assert!(session
        .recv_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());

    store.down.store(false, Ordering::SeqCst);
    relay.publish("global", "ok").unwrap();
    let d = session.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(d.event.id, EventId(1));
}

#[test]
fn test_replay_failure_is_terminal() {
    let (relay, store) = flaky_relay();
    relay.publish("global", "one").unwrap();

    store.down.store(true, Ordering::SeqCst);
    let mut session = relay.subscribe(["global"], Start::After(EventId::ZERO)).unwrap();

    assert!(matches!(session.next(), Some(Err(RelayError::Io(_)))));
    assert!(session.next().is_none());
    assert!(matches!(session.close_reason(), Some(CloseReason::Failed(_))));
    assert_eq!(relay.live_count("global"), 0);
}

#[test]
fn test_replay_failure_reaches_sink() {
    use eventrelay::{Delivery, EventSink, SinkClosed};

    struct Sink(Option<CloseReason>);
    impl EventSink for Sink {
        fn deliver(&mut self, _: &Delivery) -> std::result::Result<(), SinkClosed> {
            Ok(())
        }
        fn close(&mut self, reason: &CloseReason) {
            self.0 = Some(reason.clone());
        }
    }

    let (relay, store) = flaky_relay();
    store.down.store(true, Ordering::SeqCst);
    let session = relay.subscribe(["global"], Start::Latest).unwrap();

    let mut sink = Sink(None);
    let reason = session.forward_to(&mut sink, None);
    assert!(matches!(reason, CloseReason::Failed(ref msg) if msg.contains("unreachable")));
    assert_eq!(sink.0, Some(reason));
}

// --- Edge cases ---

#[test]
fn test_last_id_ahead_of_history() {
    let relay = Relay::open(RelayConfig::default()).unwrap();
    relay.publish("global", "one").unwrap();

    // A client claiming to have seen more than exists gets nothing replayed
    let mut session = relay.subscribe(["global"], Start::After(EventId(99))).unwrap();
    assert!(session
        .recv_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());

    // ...but still receives what is published next
    relay.publish("global", "two").unwrap();
    let d = session.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(d.event.id, EventId(2));
    assert_eq!(d.event.payload_str(), Some("two"));
}

#[test]
fn test_last_id_from_before_restart() {
    // A memory store restarted: the client's id is from the previous run
    let relay = Relay::open(RelayConfig::default()).unwrap();
    let mut session = relay
        .subscribe(["global"], Start::from_last_event_id(Some("40")))
        .unwrap();
    relay.publish("global", "after restart").unwrap();

    let d = session.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(d.event.id, EventId(1));
}

#[test]
fn test_replay_gap_with_max_last_id() {
    let relay = Relay::open(RelayConfig::default()).unwrap();
    relay.publish("global", "one").unwrap();
    assert!(!relay.replay_gap("global", EventId(u64::MAX)).unwrap());
}

#[test]
fn test_closed_session_reports_reason() {
    let relay = Relay::open(RelayConfig::default()).unwrap();
    let mut session = relay.subscribe(["global"], Start::Latest).unwrap();
    session.cancel_handle().cancel();

    assert!(matches!(
        session.recv_timeout(Duration::from_millis(10)),
        Err(RelayError::SessionClosed(CloseReason::Cancelled))
    ));
    assert!(session.next().is_none());
}

#[test]
fn test_invalid_config_rejected() {
    let result = Relay::open(RelayConfig {
        live_buffer: 0,
        ..Default::default()
    });
    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
}
