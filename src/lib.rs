//! # Event Relay
//!
//! Broadcast typed events to streaming clients over named channels, with
//! per-channel history so a reconnecting client resumes exactly where it
//! left off.
//!
//! ## Core Concepts
//!
//! - **Channels**: Named topics, created on first publish or subscribe
//! - **Store**: Bounded, ordered history per channel with monotonic ids
//! - **Router**: Live fan-out to attached sessions, never blocking the publisher
//! - **Sessions**: Replay missed events, then switch to live with no gap and
//!   no duplicate
//!
//! Delivery is at-least-once across reconnects; clients deduplicate by id.
//!
//! ## Example
//!
//! ```ignore
//! use eventrelay::{Message, Relay, RelayConfig, Start};
//!
//! let relay = Relay::open(RelayConfig::default())?;
//!
//! relay.publish("global", Message::typed("notice", "hi"))?;
//!
//! // A client reconnecting with Last-Event-Id: 1
//! let session = relay.subscribe(["global"], Start::from_last_event_id(Some("1")))?;
//! for delivery in session {
//!     let delivery = delivery?;
//!     println!("{} {}", delivery.event.id, delivery.event.event_type);
//! }
//! ```

pub mod auth;
mod channels;
pub mod config;
pub mod error;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;
pub mod testing;
pub mod types;

// Re-exports
pub use auth::{ChannelAuthorizer, StaticChannels};
pub use config::{RelayConfig, RetentionPolicy, StoreBackend};
pub use error::{CloseReason, RelayError, Result};
pub use relay::{Publisher, Relay};
pub use router::{BroadcastRouter, LiveSink, RegistrationHandle, RegistrationId};
pub use session::{CancelHandle, EventSink, Session, SinkClosed, Start};
pub use store::{EventStore, LogStore, MemoryStore};
pub use testing::{PublishedEvent, Recorder, TypeFilter};
pub use types::*;
