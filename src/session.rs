//! Subscription sessions: replay missed history, then switch to live delivery.
//!
//! A session registers with the router *before* reading history, so every
//! event appended after the read is already sitting in its live buffer. Both
//! happen in [`Session::open`], which fixes each channel's cursor. Once the
//! replayed history has been handed out, buffered live events at or below the
//! cursor are duplicates and are dropped; everything above it is delivered in
//! order.
//!
//! The live buffer holds `live_buffer` events per session. Events published
//! while the caller is not polling, including before the first poll, count
//! against it; overflowing it closes the session with
//! [`CloseReason::Lagged`].
//!
//! Per channel the session moves through: replay → live → closed. Channels
//! are replayed one after another and then merged by arrival; there is no
//! cross-channel ordering.

use crate::error::{CloseReason, RelayError, Result};
use crate::router::{BroadcastRouter, LiveSink, RegistrationHandle};
use crate::store::EventStore;
use crate::types::{Delivery, EventId};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a session starts reading.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Start {
    /// Only events published from now on.
    #[default]
    Latest,
    /// Everything after this id, on every channel (a client's Last-Event-Id).
    /// An id past the channel's latest is treated as the latest.
    After(EventId),
    /// Explicit per-channel cursors; channels not listed start at latest.
    Cursors(HashMap<String, EventId>),
}

impl Start {
    /// Interpret a client-presented Last-Event-Id. Missing or unparseable
    /// values start fresh.
    pub fn from_last_event_id(value: Option<&str>) -> Self {
        match value.and_then(|v| v.parse::<EventId>().ok()) {
            Some(id) => Start::After(id),
            None => Start::Latest,
        }
    }

    fn resume_point(&self, channel: &str) -> Option<EventId> {
        match self {
            Start::Latest => None,
            Start::After(id) => Some(*id),
            Start::Cursors(map) => map.get(channel).copied(),
        }
    }
}

/// Error returned by a sink that can no longer accept events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkClosed;

impl fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink closed")
    }
}

impl std::error::Error for SinkClosed {}

/// Downstream consumer of a session, typically a streaming HTTP response.
/// The session hands over structured events; wire formatting is the sink's job.
pub trait EventSink {
    /// Accept one event.
    fn deliver(&mut self, delivery: &Delivery) -> std::result::Result<(), SinkClosed>;

    /// Called when no event arrived within the heartbeat interval.
    fn heartbeat(&mut self) -> std::result::Result<(), SinkClosed> {
        Ok(())
    }

    /// Called once when the session ends.
    fn close(&mut self, _reason: &CloseReason) {}
}

/// Cancels a session from another thread. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct ChannelCursor {
    name: Arc<str>,
    cursor: EventId,
    registration: RegistrationHandle,
}

enum Phase {
    Replay {
        pending: VecDeque<Delivery>,
        failure: Option<RelayError>,
    },
    Live,
    Closed,
}

enum Step {
    Item(Delivery),
    Timeout,
    Failed(RelayError),
    Closed,
}

/// A client's view of one or more channels.
///
/// Iterating blocks until the next event; use [`Session::recv_timeout`] to
/// interleave heartbeats. Dropping the session releases its registrations.
pub struct Session {
    id: u64,
    store: Arc<dyn EventStore>,
    router: Arc<BroadcastRouter>,
    channels: Vec<ChannelCursor>,
    sink: LiveSink,
    live: Receiver<Delivery>,
    cancel: CancelHandle,
    cancelled: Receiver<()>,
    phase: Phase,
    close_reason: Option<CloseReason>,
}

impl Session {
    /// Register on every channel, then read the history `start` asks for.
    ///
    /// A store error here does not fail the open: it is reported by the
    /// first receive as the session's terminal error.
    pub fn open(
        store: Arc<dyn EventStore>,
        router: Arc<BroadcastRouter>,
        channels: Vec<String>,
        start: Start,
        live_buffer: usize,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (sink, live) = LiveSink::bounded(live_buffer);
        let (wake, cancelled) = bounded(1);

        let channels: Vec<ChannelCursor> = channels
            .into_iter()
            .map(|name| {
                let registration = router.subscribe(&name, sink.clone());
                ChannelCursor {
                    name: Arc::clone(&registration.channel),
                    cursor: EventId::ZERO,
                    registration,
                }
            })
            .collect();

        debug!(session = id, channels = channels.len(), start = ?start, "Session::open");

        let mut session = Self {
            id,
            store,
            router,
            channels,
            sink,
            live,
            cancel: CancelHandle {
                flag: Arc::new(AtomicBool::new(false)),
                wake,
            },
            cancelled,
            phase: Phase::Replay {
                pending: VecDeque::new(),
                failure: None,
            },
            close_reason: None,
        };

        let replay = session.read_history(&start);
        session.phase = match replay {
            Ok(pending) => Phase::Replay {
                pending,
                failure: None,
            },
            Err(e) => {
                warn!(session = id, error = %e, "Session: replay failed");
                Phase::Replay {
                    pending: VecDeque::new(),
                    failure: Some(e),
                }
            }
        };
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Last id delivered (or skipped as already seen) on `channel`.
    pub fn cursor(&self, channel: &str) -> Option<EventId> {
        self.channels
            .iter()
            .find(|c| &*c.name == channel)
            .map(|c| c.cursor)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| &*c.name)
    }

    /// Whether replay has finished and events now come from the live buffer.
    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live)
    }

    /// Why the session ended, once it has.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Next event, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time. A closed session returns
    /// [`RelayError::SessionClosed`]; a replay failure is returned once as
    /// its own error.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        match self.step(Some(Instant::now() + timeout)) {
            Step::Item(delivery) => Ok(Some(delivery)),
            Step::Timeout => Ok(None),
            Step::Failed(e) => Err(e),
            Step::Closed => Err(RelayError::SessionClosed(
                self.close_reason.clone().unwrap_or(CloseReason::Cancelled),
            )),
        }
    }

    /// Drive the session into `sink` until it ends, sending heartbeats when
    /// idle for `heartbeat`. The sink's `close` is called exactly once.
    pub fn forward_to<S: EventSink + ?Sized>(
        mut self,
        sink: &mut S,
        heartbeat: Option<Duration>,
    ) -> CloseReason {
        loop {
            let step = self.step(heartbeat.map(|h| Instant::now() + h));
            match step {
                Step::Item(delivery) => {
                    if sink.deliver(&delivery).is_err() {
                        self.terminate(CloseReason::SinkClosed);
                    }
                }
                Step::Timeout => {
                    if sink.heartbeat().is_err() {
                        self.terminate(CloseReason::SinkClosed);
                    }
                }
                Step::Failed(_) | Step::Closed => {
                    let reason = self.close_reason.clone().unwrap_or(CloseReason::Cancelled);
                    sink.close(&reason);
                    return reason;
                }
            }
        }
    }

    fn step(&mut self, deadline: Option<Instant>) -> Step {
        loop {
            if matches!(self.phase, Phase::Closed) {
                return Step::Closed;
            }
            if self.cancel.is_cancelled() {
                self.terminate(CloseReason::Cancelled);
                return Step::Closed;
            }

            match &mut self.phase {
                Phase::Replay { pending, failure } => {
                    if let Some(e) = failure.take() {
                        self.terminate(CloseReason::Failed(e.to_string()));
                        return Step::Failed(e);
                    }
                    if let Some(delivery) = pending.pop_front() {
                        self.advance(&delivery);
                        return Step::Item(delivery);
                    }
                    debug!(session = self.id, "Session: replay complete, now live");
                    self.phase = Phase::Live;
                }
                Phase::Live => match self.live.try_recv() {
                    Ok(delivery) => {
                        if let Some(delivery) = self.accept_live(delivery) {
                            return Step::Item(delivery);
                        }
                    }
                    Err(TryRecvError::Empty) => {
                        if self.sink.lagged() {
                            self.terminate(CloseReason::Lagged);
                            return Step::Closed;
                        }
                        let timer = match deadline {
                            Some(at) => crossbeam_channel::at(at),
                            None => crossbeam_channel::never(),
                        };
                        let (live, cancelled) = (self.live.clone(), self.cancelled.clone());
                        // None: timed out. Some(None): woken by cancel.
                        let woke: Option<Option<Delivery>> = select! {
                            recv(live) -> msg => Some(msg.ok()),
                            recv(cancelled) -> _ => Some(None),
                            recv(timer) -> _ => None,
                        };
                        match woke {
                            None => return Step::Timeout,
                            Some(Some(delivery)) => {
                                if let Some(delivery) = self.accept_live(delivery) {
                                    return Step::Item(delivery);
                                }
                            }
                            Some(None) => {}
                        }
                    }
                    // The session holds a sender, so this cannot happen.
                    Err(TryRecvError::Disconnected) => {
                        self.terminate(CloseReason::Cancelled);
                        return Step::Closed;
                    }
                },
                Phase::Closed => return Step::Closed,
            }
        }
    }

    /// Set every channel's cursor and read what each missed.
    ///
    /// Runs after registration, so anything appended past the cursor reaches
    /// the live buffer. A resume point past the latest id is clamped to it;
    /// otherwise live events up to the client's claimed id would be dropped.
    fn read_history(&mut self, start: &Start) -> Result<VecDeque<Delivery>> {
        let mut pending = VecDeque::new();
        for channel in &mut self.channels {
            let latest = self.store.latest_id(&channel.name)?.unwrap_or(EventId::ZERO);
            let from = match start.resume_point(&channel.name) {
                Some(id) => id.min(latest),
                None => {
                    channel.cursor = latest;
                    continue;
                }
            };

            channel.cursor = from;
            let events = self.store.read_since(&channel.name, from)?;
            debug!(
                session = self.id,
                channel = %channel.name,
                from = from.0,
                replayed = events.len(),
                "Session: replaying history"
            );
            pending.extend(events.into_iter().map(|event| Delivery {
                channel: Arc::clone(&channel.name),
                event,
            }));
        }
        Ok(pending)
    }

    /// Drop live events already covered by replay; advance the cursor otherwise.
    fn accept_live(&mut self, delivery: Delivery) -> Option<Delivery> {
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.name == delivery.channel)?;
        if delivery.event.id <= channel.cursor {
            return None;
        }
        channel.cursor = delivery.event.id;
        Some(delivery)
    }

    fn advance(&mut self, delivery: &Delivery) {
        if let Some(channel) = self
            .channels
            .iter_mut()
            .find(|c| c.name == delivery.channel)
        {
            channel.cursor = channel.cursor.max(delivery.event.id);
        }
    }

    fn terminate(&mut self, reason: CloseReason) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        self.phase = Phase::Closed;
        self.release();
        info!(session = self.id, reason = %reason, "Session closed");
        self.close_reason = Some(reason);
    }

    fn release(&self) {
        for channel in &self.channels {
            self.router.unsubscribe(&channel.registration);
        }
    }
}

impl Iterator for Session {
    type Item = Result<Delivery>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step(None) {
            Step::Item(delivery) => Some(Ok(delivery)),
            Step::Failed(e) => Some(Err(e)),
            Step::Timeout | Step::Closed => None,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}
