//! Event records, the on-disk log document, and read-side filters.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const EVENT_LOG_SCHEMA: u32 = 1;

fn schema_version() -> u32 {
    EVENT_LOG_SCHEMA
}

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Kind of activity an event records.
///
/// Unknown names round-trip through [`EventType::Other`] so logs written by
/// newer tools stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ArtifactCreated,
    ArtifactUpdated,
    ArtifactDeleted,
    ArtifactPromoted,
    ScopeCreated,
    ScopeArchived,
    ScopeActivated,
    SyncUp,
    SyncDown,
    WorkflowStarted,
    WorkflowCompleted,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ArtifactCreated => "artifact_created",
            EventType::ArtifactUpdated => "artifact_updated",
            EventType::ArtifactDeleted => "artifact_deleted",
            EventType::ArtifactPromoted => "artifact_promoted",
            EventType::ScopeCreated => "scope_created",
            EventType::ScopeArchived => "scope_archived",
            EventType::ScopeActivated => "scope_activated",
            EventType::SyncUp => "sync_up",
            EventType::SyncDown => "sync_down",
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::Other(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "artifact_created" => EventType::ArtifactCreated,
            "artifact_updated" => EventType::ArtifactUpdated,
            "artifact_deleted" => EventType::ArtifactDeleted,
            "artifact_promoted" => EventType::ArtifactPromoted,
            "scope_created" => EventType::ScopeCreated,
            "scope_archived" => EventType::ScopeArchived,
            "scope_activated" => EventType::ScopeActivated,
            "sync_up" => EventType::SyncUp,
            "sync_down" => EventType::SyncDown,
            "workflow_started" => EventType::WorkflowStarted,
            "workflow_completed" => EventType::WorkflowCompleted,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        EventType::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event / EventLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub scope: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, scope: impl Into<String>, data: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            scope: scope.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// `data.artifact`, when present and a string.
    pub fn artifact(&self) -> Option<&str> {
        self.data.get("artifact").and_then(Value::as_str)
    }
}

/// Body of `event-log.yaml`. Oldest event first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            version: EVENT_LOG_SCHEMA,
            events: Vec::new(),
        }
    }
}

impl EventLog {
    /// Drop the oldest events until at most `max` remain. Returns how many
    /// were dropped.
    pub fn rotate(&mut self, max: usize) -> usize {
        let excess = self.events.len().saturating_sub(max);
        self.events.drain(..excess);
        excess
    }
}

/// `evt_<millis, base36, 9 wide>_<48 random bits, hex>`.
///
/// The fixed-width time prefix makes ids sort in creation order as plain
/// strings (to millisecond resolution).
pub fn generate_event_id() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let random: u64 = rand::thread_rng().gen_range(0..(1u64 << 48));
    format!("evt_{:0>9}_{:012x}", to_base36(millis), random)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Read-side filter for [`crate::EventLogger::get_events`]. All bounds are
/// inclusive; `limit` keeps the most recent matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn of_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Parse an RFC 3339 lower bound. Unparsable input leaves the filter
    /// unbounded.
    pub fn since_str(mut self, since: &str) -> Self {
        self.since = parse_bound(since).or(self.since);
        self
    }

    /// See [`since_str`](Self::since_str).
    pub fn until_str(mut self, until: &str) -> Self {
        self.until = parse_bound(until).or(self.until);
        self
    }

    /// `0` means no limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn apply<'a, I>(&self, scope: Option<&str>, events: I) -> Vec<Event>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut out: Vec<Event> = events
            .into_iter()
            .filter(|e| scope.map_or(true, |s| e.scope == s))
            .filter(|e| self.event_type.as_ref().map_or(true, |t| &e.event_type == t))
            .filter(|e| self.since.map_or(true, |since| e.timestamp >= since))
            .filter(|e| self.until.map_or(true, |until| e.timestamp <= until))
            .cloned()
            .collect();
        if let Some(limit) = self.limit {
            let excess = out.len().saturating_sub(limit);
            out.drain(..excess);
        }
        out
    }
}

fn parse_bound(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(value = raw, error = %e, "ignoring invalid date filter");
            None
        }
    }
}
