//! # scopes-events
//!
//! Cross-scope activity log. [`EventLogger`] appends events to
//! `_scopes/_events/event-log.yaml` (rotating past a cap), keeps each scope's
//! subscriptions in `subscriptions.yaml`, and answers "what changed in the
//! scopes I watch" via [`EventLogger::get_pending_notifications`].

pub mod error;
pub mod event;
pub mod logger;
pub mod subscription;

pub use error::EventError;
pub use event::{generate_event_id, Event, EventFilter, EventLog, EventType};
pub use logger::{
    EventLogger, EventStats, SyncCounts, SyncDirection, DEFAULT_MAX_EVENTS,
    DEFAULT_NOTIFICATION_WINDOW_HOURS,
};
pub use subscription::{
    Notification, SubscribeOptions, Subscription, SubscriptionSet, Watch, MATCH_ALL,
};
