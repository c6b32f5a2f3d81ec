//! Who watches whom: the subscriptions document and notification records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use scopes_core::glob_find;

use crate::event::Event;

const SUBSCRIPTIONS_SCHEMA: u32 = 1;

fn schema_version() -> u32 {
    SUBSCRIPTIONS_SCHEMA
}

fn enabled() -> bool {
    true
}

/// Pattern that matches every event, including events without an artifact.
pub const MATCH_ALL: &str = "*";

/// One watched scope and the artifact patterns of interest in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    pub scope: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Watch {
    /// `true` if `event` concerns an artifact this watch cares about.
    pub fn matches(&self, event: &Event) -> bool {
        if self.patterns.iter().any(|p| p == MATCH_ALL) {
            return true;
        }
        match event.artifact() {
            Some(artifact) => self.patterns.iter().any(|p| glob_find(artifact, p)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub watch: Vec<Watch>,
    #[serde(default = "enabled")]
    pub notify: bool,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            watch: Vec::new(),
            notify: true,
        }
    }
}

impl Subscription {
    /// Add a watch on `scope`, or replace its patterns if already watched.
    pub fn watch(&mut self, scope: &str, patterns: Vec<String>) {
        match self.watch.iter_mut().find(|w| w.scope == scope) {
            Some(existing) => existing.patterns = patterns,
            None => self.watch.push(Watch {
                scope: scope.to_string(),
                patterns,
            }),
        }
    }

    /// Returns `true` if a watch was removed.
    pub fn unwatch(&mut self, scope: &str) -> bool {
        let before = self.watch.len();
        self.watch.retain(|w| w.scope != scope);
        self.watch.len() != before
    }
}

/// Body of `subscriptions.yaml`, keyed by subscriber scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSet {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self {
            version: SUBSCRIPTIONS_SCHEMA,
            subscriptions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Overwrite the subscriber's `notify` flag; `None` leaves it as is.
    pub notify: Option<bool>,
}

/// A watched event, tagged with who is being told about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(flatten)]
    pub event: Event,
    pub watched_by: String,
    pub patterns: Vec<String>,
}
