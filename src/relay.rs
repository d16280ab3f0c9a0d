//! The relay service: the single write path plus session construction.

use crate::auth::{dedup_channels, ChannelAuthorizer};
use crate::channels::ChannelMap;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::router::BroadcastRouter;
use crate::session::{Session, Start};
use crate::store::{self, EventStore};
use crate::testing::{PublishedEvent, Recorder, TypeFilter};
use crate::types::{Event, EventId, Message};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Anything that accepts publishes.
pub trait Publisher: Send + Sync {
    /// Publish `message` on `channel`. Fails only if the event could not be
    /// recorded.
    fn publish(&self, channel: &str, message: Message) -> Result<()>;
}

/// Event history, live fan-out and sessions behind one handle.
///
/// Create one per process and share it (it is `Send + Sync`).
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn EventStore>,
    router: Arc<BroadcastRouter>,
    /// Held across append + live publish so live delivery follows id order.
    write_locks: ChannelMap<Mutex<()>>,
    test_mode: RwLock<Option<Arc<Recorder>>>,
}

impl Relay {
    /// Validate `config` and open the store it names.
    pub fn open(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let store = store::open_store(&config)?;
        Self::with_store(config, store)
    }

    /// Use an already-open store.
    pub fn with_store(config: RelayConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        config.validate()?;
        info!(
            backend = ?config.backend,
            live_buffer = config.live_buffer,
            "Relay: ready"
        );
        Ok(Self {
            config,
            store,
            router: Arc::new(BroadcastRouter::new()),
            write_locks: ChannelMap::new(),
            test_mode: RwLock::new(None),
        })
    }

    // --- Publishing ---

    /// Publish on `channel`.
    ///
    /// The event is recorded before live listeners see it, and live delivery
    /// on a channel happens in id order.
    pub fn publish(&self, channel: &str, message: impl Into<Message>) -> Result<()> {
        self.publish_event(channel, message.into()).map(|_| ())
    }

    /// Publish and return the stored event (`None` in test mode).
    pub fn publish_event(&self, channel: &str, message: Message) -> Result<Option<Event>> {
        if let Some(recorder) = self.test_mode.read().clone() {
            recorder.record(channel, message);
            return Ok(None);
        }

        let (event_type, payload) = message.resolve(&self.config.default_event_type);

        let lock = self
            .write_locks
            .get_or_insert_with(channel, || Mutex::new(()));
        let _guard = lock.lock();

        let event = self
            .store
            .append(channel, &event_type, payload)
            .map_err(|e| {
                warn!(channel, event_type = %event_type, error = %e, "Relay::publish: append failed");
                e
            })?;
        let live = self.router.publish_live(channel, &event);

        debug!(
            channel,
            event_id = event.id.0,
            event_type = %event.event_type,
            live,
            "Relay::publish"
        );
        Ok(Some(event))
    }

    // --- Subscribing ---

    /// Open a session over `channels` starting at `start`.
    pub fn subscribe<I, S>(&self, channels: I, start: Start) -> Result<Session>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = dedup_channels(channels.into_iter().map(Into::into).collect());
        if channels.is_empty() {
            return Err(RelayError::NoChannels);
        }
        Ok(Session::open(
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            channels,
            start,
            self.config.live_buffer,
        ))
    }

    /// Open a session over the channels `authorizer` grants for `ctx`.
    pub fn subscribe_authorized<Ctx, A>(
        &self,
        authorizer: &A,
        ctx: &Ctx,
        start: Start,
    ) -> Result<Session>
    where
        Ctx: ?Sized,
        A: ChannelAuthorizer<Ctx> + ?Sized,
    {
        self.subscribe(authorizer.channels(ctx), start)
    }

    // --- History ---

    pub fn read_since(&self, channel: &str, last_id: EventId) -> Result<Vec<Event>> {
        self.store.read_since(channel, last_id)
    }

    pub fn latest_id(&self, channel: &str) -> Result<Option<EventId>> {
        self.store.latest_id(channel)
    }

    /// Whether resuming `channel` after `last_id` would miss evicted events.
    pub fn replay_gap(&self, channel: &str, last_id: EventId) -> Result<bool> {
        store::replay_gap(self.store.as_ref(), channel, last_id)
    }

    pub fn live_count(&self, channel: &str) -> usize {
        self.router.live_count(channel)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // --- Test mode ---

    /// Record publishes instead of storing and broadcasting them.
    ///
    /// Replaces any recorder from an earlier call.
    pub fn enable_test_mode(&self, filter: Option<TypeFilter>) {
        let recorder = Recorder::with_default_type(filter, self.config.default_event_type.clone());
        *self.test_mode.write() = Some(Arc::new(recorder));
        debug!("Relay: test mode enabled");
    }

    pub fn disable_test_mode(&self) {
        *self.test_mode.write() = None;
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode.read().is_some()
    }

    /// Publishes captured in test mode.
    pub fn published(&self) -> Result<Vec<PublishedEvent>> {
        self.test_mode
            .read()
            .as_ref()
            .map(|r| r.published())
            .ok_or(RelayError::TestModeDisabled)
    }

    /// Clear captured publishes; call between test cases.
    pub fn reset_published(&self) -> Result<()> {
        self.test_mode
            .read()
            .as_ref()
            .map(|r| r.reset())
            .ok_or(RelayError::TestModeDisabled)
    }
}

impl Publisher for Relay {
    fn publish(&self, channel: &str, message: Message) -> Result<()> {
        Relay::publish(self, channel, message)
    }
}
