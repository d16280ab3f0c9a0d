//! In-memory fan-out of freshly appended events to live listeners.
//!
//! The router holds no history: a registration only sees events published
//! after `subscribe` returns. Delivery never blocks. Each listener owns a
//! bounded buffer, and a listener whose buffer is full is dropped and flagged
//! as lagged instead of slowing the publisher or its siblings.

use crate::channels::ChannelMap;
use crate::types::{Delivery, Event};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Unique identifier for a live registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// Returned by [`BroadcastRouter::subscribe`]; pass to `unsubscribe`.
#[derive(Clone, Debug)]
pub struct RegistrationHandle {
    pub id: RegistrationId,
    pub channel: Arc<str>,
}

/// Receiving side of a live listener. One sink may be registered on many
/// channels; deliveries carry their channel name.
#[derive(Clone, Debug)]
pub struct LiveSink {
    sender: Sender<Delivery>,
    lagged: Arc<AtomicBool>,
}

impl LiveSink {
    /// Create a sink with a buffer of `capacity` events and its receiver.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Delivery>) {
        let (sender, receiver) = bounded(capacity);
        (
            Self {
                sender,
                lagged: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    /// Whether the router dropped this sink for overflowing its buffer.
    pub fn lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    fn try_send(&self, delivery: Delivery) -> Result<(), TrySendError<Delivery>> {
        self.sender.try_send(delivery)
    }
}

struct Registration {
    channel: Arc<str>,
    sink: LiveSink,
}

type ChannelTable = RwLock<HashMap<RegistrationId, Registration>>;

/// Routes published events to the live sinks registered on their channel.
pub struct BroadcastRouter {
    channels: ChannelMap<ChannelTable>,
    next_id: AtomicU64,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self {
            channels: ChannelMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `sink` for events published on `channel` from now on.
    pub fn subscribe(&self, channel: &str, sink: LiveSink) -> RegistrationHandle {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let channel: Arc<str> = Arc::from(channel);

        let table = self
            .channels
            .get_or_insert_with(&channel, || RwLock::new(HashMap::new()));
        table.write().insert(
            id,
            Registration {
                channel: Arc::clone(&channel),
                sink,
            },
        );
        debug!(channel = %channel, registration = id.0, "BroadcastRouter::subscribe");

        RegistrationHandle { id, channel }
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &RegistrationHandle) -> bool {
        let removed = match self.channels.get(&handle.channel) {
            Some(table) => table.write().remove(&handle.id).is_some(),
            None => false,
        };
        if removed {
            debug!(
                channel = %handle.channel,
                registration = handle.id.0,
                "BroadcastRouter::unsubscribe"
            );
        }
        removed
    }

    /// Hand `event` to every sink registered on `channel`. Returns how many
    /// sinks accepted it.
    pub fn publish_live(&self, channel: &str, event: &Event) -> usize {
        let table = match self.channels.get(channel) {
            Some(table) => table,
            None => return 0,
        };

        let mut delivered = 0;
        let mut lagged = Vec::new();
        let mut gone = Vec::new();

        {
            let regs = table.read();
            for (id, reg) in regs.iter() {
                let delivery = Delivery {
                    channel: Arc::clone(&reg.channel),
                    event: event.clone(),
                };
                match reg.sink.try_send(delivery) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => lagged.push(*id),
                    Err(TrySendError::Disconnected(_)) => gone.push(*id),
                }
            }
        }

        if !lagged.is_empty() || !gone.is_empty() {
            let mut regs = table.write();
            for id in lagged {
                if let Some(reg) = regs.remove(&id) {
                    reg.sink.lagged.store(true, Ordering::Release);
                    warn!(
                        channel,
                        registration = id.0,
                        event_id = event.id.0,
                        "BroadcastRouter: dropping lagging listener"
                    );
                }
            }
            for id in gone {
                if regs.remove(&id).is_some() {
                    debug!(channel, registration = id.0, "BroadcastRouter: listener went away");
                }
            }
        }

        delivered
    }

    /// Number of live registrations on `channel`.
    pub fn live_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |table| table.read().len())
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}
