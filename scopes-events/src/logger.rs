//! [`EventLogger`]: append-only event log plus subscription registry.
//!
//! Both files live under `<root>/_scopes/_events/` and are only ever mutated
//! while holding their `.lock` sidecar. Reads are unlocked and best-effort;
//! writes are atomic, so a reader sees either the old or the new log.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use scopes_core::{Layout, LockOptions, StateLock, Versioned};

use crate::error::{io_err, EventError};
use crate::event::{Event, EventFilter, EventLog, EventType};
use crate::subscription::{
    Notification, SubscribeOptions, Subscription, SubscriptionSet, MATCH_ALL,
};

/// Events kept before the oldest are dropped.
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// How far back [`EventLogger::get_pending_notifications`] looks by default.
pub const DEFAULT_NOTIFICATION_WINDOW_HOURS: i64 = 24;

/// Direction of a sync operation, for [`EventLogger::log_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Up,
    Down,
}

/// Per-operation counters recorded by [`EventLogger::log_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub files: usize,
    pub conflicts: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_scope: BTreeMap<String, usize>,
    pub last_24h: usize,
    pub last_event: Option<Event>,
}

#[derive(Debug, Clone)]
pub struct EventLogger {
    layout: Layout,
    lock: StateLock,
    max_events: usize,
}

impl EventLogger {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            lock: StateLock::default(),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// Rotation cap; values below 1 are treated as 1.
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock = StateLock::new(options);
        self
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Create the events directory and empty log/subscription documents.
    /// Existing files are left untouched.
    pub fn initialize(&self) -> Result<(), EventError> {
        let dir = self.layout.events_dir();
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        self.create_if_missing::<EventLog>(&self.layout.event_log_path())?;
        self.create_if_missing::<SubscriptionSet>(&self.layout.subscriptions_path())?;
        Ok(())
    }

    fn create_if_missing<T>(&self, path: &std::path::Path) -> Result<(), EventError>
    where
        T: Serialize + Default,
    {
        self.lock.with_lock(path, || -> Result<(), EventError> {
            if !path.exists() {
                self.lock.write_yaml(path, &mut Versioned::new(T::default()))?;
                tracing::info!(path = %path.display(), "created events file");
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append an event and rotate the log past the cap. Returns the event as
    /// stored.
    pub fn log_event(
        &self,
        event_type: impl Into<EventType>,
        scope: &str,
        data: Value,
    ) -> Result<Event, EventError> {
        let event = Event::new(event_type.into(), scope, data);
        let max = self.max_events;
        let appended = event.clone();
        self.lock
            .update_yaml_with_version(&self.layout.event_log_path(), |log: &mut EventLog| {
                log.events.push(appended);
                let dropped = log.rotate(max);
                if dropped > 0 {
                    tracing::debug!(dropped, max, "rotated event log");
                }
            })?;
        tracing::debug!(id = %event.id, kind = %event.event_type, scope, "logged event");
        Ok(event)
    }

    /// Events, oldest first, optionally restricted to one scope.
    pub fn get_events(
        &self,
        scope: Option<&str>,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, EventError> {
        let log: Versioned<EventLog> = self.lock.read_yaml(&self.layout.event_log_path())?;
        Ok(filter.apply(scope, &log.data.events))
    }

    pub fn get_stats(&self, scope: Option<&str>) -> Result<EventStats, EventError> {
        let events = self.get_events(scope, &EventFilter::default())?;
        let day_ago = Utc::now() - Duration::hours(24);

        let mut stats = EventStats {
            total: events.len(),
            ..EventStats::default()
        };
        for event in &events {
            *stats.by_type.entry(event.event_type.to_string()).or_default() += 1;
            *stats.by_scope.entry(event.scope.clone()).or_default() += 1;
            if event.timestamp >= day_ago {
                stats.last_24h += 1;
            }
        }
        stats.last_event = events.into_iter().last();
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Watch `watched` on behalf of `subscriber`. Re-subscribing replaces the
    /// patterns wholesale. No patterns means every event.
    pub fn subscribe<I, S>(
        &self,
        subscriber: &str,
        watched: &str,
        patterns: I,
        options: SubscribeOptions,
    ) -> Result<(), EventError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            patterns.push(MATCH_ALL.to_string());
        }
        self.lock.update_yaml_with_version(
            &self.layout.subscriptions_path(),
            |set: &mut SubscriptionSet| {
                let sub = set.subscriptions.entry(subscriber.to_string()).or_default();
                sub.watch(watched, patterns);
                if let Some(notify) = options.notify {
                    sub.notify = notify;
                }
            },
        )?;
        tracing::info!(subscriber, watched, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber: &str, watched: &str) -> Result<(), EventError> {
        self.lock.update_yaml_with_version(
            &self.layout.subscriptions_path(),
            |set: &mut SubscriptionSet| {
                if let Some(sub) = set.subscriptions.get_mut(subscriber) {
                    if sub.unwatch(watched) {
                        tracing::info!(subscriber, watched, "unsubscribed");
                    }
                }
            },
        )?;
        Ok(())
    }

    /// The subscriber's watch list; an unknown subscriber watches nothing and
    /// has notifications on.
    pub fn get_subscriptions(&self, subscriber: &str) -> Result<Subscription, EventError> {
        let set: Versioned<SubscriptionSet> =
            self.lock.read_yaml(&self.layout.subscriptions_path())?;
        Ok(set
            .data
            .subscriptions
            .get(subscriber)
            .cloned()
            .unwrap_or_default())
    }

    /// Events from every watched scope since `since` (default: the last 24
    /// hours) that match the watch's patterns, oldest first.
    pub fn get_pending_notifications(
        &self,
        subscriber: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Notification>, EventError> {
        let sub = self.get_subscriptions(subscriber)?;
        if !sub.notify || sub.watch.is_empty() {
            return Ok(Vec::new());
        }

        let since =
            since.unwrap_or_else(|| Utc::now() - Duration::hours(DEFAULT_NOTIFICATION_WINDOW_HOURS));
        let log: Versioned<EventLog> = self.lock.read_yaml(&self.layout.event_log_path())?;
        let window = EventFilter::default().since(since);

        let mut notifications = Vec::new();
        for watch in &sub.watch {
            for event in window.apply(Some(watch.scope.as_str()),&log.data.events) {
                if watch.matches(&event) {
                    notifications.push(Notification {
                        event,
                        watched_by: subscriber.to_string(),
                        patterns: watch.patterns.clone(),
                    });
                }
            }
        }
        notifications.sort_by_key(|n| n.event.timestamp);
        Ok(notifications)
    }

    // -----------------------------------------------------------------------
    // Typed helpers
    // -----------------------------------------------------------------------

    pub fn log_artifact_created(
        &self,
        scope: &str,
        artifact: &str,
        metadata: Map<String, Value>,
    ) -> Result<Event, EventError> {
        self.log_event(EventType::ArtifactCreated, scope, artifact_data(artifact, metadata))
    }

    pub fn log_artifact_updated(
        &self,
        scope: &str,
        artifact: &str,
        metadata: Map<String, Value>,
    ) -> Result<Event, EventError> {
        self.log_event(EventType::ArtifactUpdated, scope, artifact_data(artifact, metadata))
    }

    pub fn log_artifact_promoted(
        &self,
        scope: &str,
        artifact: &str,
        shared_path: &str,
    ) -> Result<Event, EventError> {
        self.log_event(
            EventType::ArtifactPromoted,
            scope,
            json!({ "artifact": artifact, "shared_path": shared_path }),
        )
    }

    pub fn log_sync(
        &self,
        direction: SyncDirection,
        scope: &str,
        counts: SyncCounts,
    ) -> Result<Event, EventError> {
        let event_type = match direction {
            SyncDirection::Up => EventType::SyncUp,
            SyncDirection::Down => EventType::SyncDown,
        };
        self.log_event(
            event_type,
            scope,
            json!({
                "files_count": counts.files,
                "conflicts_count": counts.conflicts,
                "errors_count": counts.errors,
            }),
        )
    }
}

/// `{artifact, ...metadata}`; an `artifact` key in `metadata` wins.
fn artifact_data(artifact: &str, metadata: Map<String, Value>) -> Value {
    let mut data = Map::new();
    data.insert("artifact".into(), Value::String(artifact.to_string()));
    data.extend(metadata);
    Value::Object(data)
}
