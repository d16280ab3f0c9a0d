//! Channel selection for a connecting client.

/// Decides which channels a request may subscribe to.
///
/// The hosting application implements this; the relay only asks for the
/// list. `Ctx` is whatever per-request context the transport has (headers,
/// session, user).
pub trait ChannelAuthorizer<Ctx: ?Sized>: Send + Sync {
    /// Channel names for this request, in preference order.
    fn channels(&self, ctx: &Ctx) -> Vec<String>;
}

impl<Ctx, F> ChannelAuthorizer<Ctx> for F
where
    Ctx: ?Sized,
    F: Fn(&Ctx) -> Vec<String> + Send + Sync,
{
    fn channels(&self, ctx: &Ctx) -> Vec<String> {
        self(ctx)
    }
}

/// Grants the same fixed channel list to every request.
#[derive(Clone, Debug)]
pub struct StaticChannels(pub Vec<String>);

impl<Ctx: ?Sized> ChannelAuthorizer<Ctx> for StaticChannels {
    fn channels(&self, _ctx: &Ctx) -> Vec<String> {
        self.0.clone()
    }
}

/// Remove repeats, keeping first occurrences in order.
pub(crate) fn dedup_channels(channels: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    channels
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}
