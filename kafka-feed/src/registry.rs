//! Which selectors are active and which callback answers for each topic.
//!
//! Callbacks are keyed by topic only: binding a topic twice keeps the last
//! callback, and every partition selector under that topic routes to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CallbackNotRegistered, SelectorNotFound};
use crate::message::TopicSelector;

/// Handler invoked with each message's key and value.
pub trait Callback: Send + Sync {
    fn call(&self, key: Option<&[u8]>, value: Option<&[u8]>) -> anyhow::Result<()>;
}

impl<F> Callback for F
where
    F: Fn(Option<&[u8]>, Option<&[u8]>) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, key: Option<&[u8]>, value: Option<&[u8]>) -> anyhow::Result<()> {
        self(key, value)
    }
}

pub type SharedCallback = Arc<dyn Callback>;

/// Wraps a closure as a [`SharedCallback`].
pub fn callback<F>(f: F) -> SharedCallback
where
    F: Fn(Option<&[u8]>, Option<&[u8]>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    selectors: Vec<TopicSelector>,
    callbacks: HashMap<String, SharedCallback>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `callback` to `topic`, replacing any earlier binding, and activates
    /// the selectors for `partitions`. Returns the full selector list to hand to
    /// the client.
    pub fn add(
        &mut self,
        topic: &str,
        callback: SharedCallback,
        partitions: Option<&[i32]>,
    ) -> Vec<TopicSelector> {
        let selectors = self.plan_add(topic, partitions);
        self.commit(selectors, Some((topic, callback)))
    }

    /// Deactivates the selectors for `partitions`. Either every requested
    /// selector is active and all are removed, or nothing changes.
    pub fn remove(
        &mut self,
        topic: &str,
        partitions: Option<&[i32]>,
    ) -> Result<Vec<TopicSelector>, SelectorNotFound> {
        let selectors = self.plan_remove(topic, partitions)?;
        Ok(self.commit(selectors, None))
    }

    /// The list `add` would produce, without changing anything.
    pub fn plan_add(&self, topic: &str, partitions: Option<&[i32]>) -> Vec<TopicSelector> {
        let mut selectors = self.selectors.clone();
        for selector in TopicSelector::expand(topic, partitions) {
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        selectors
    }

    /// The list `remove` would produce, without changing anything.
    pub fn plan_remove(
        &self,
        topic: &str,
        partitions: Option<&[i32]>,
    ) -> Result<Vec<TopicSelector>, SelectorNotFound> {
        let doomed = TopicSelector::expand(topic, partitions);
        if let Some(missing) = doomed.iter().find(|s| !self.selectors.contains(s)) {
            return Err(SelectorNotFound {
                selector: missing.clone(),
            });
        }
        Ok(self
            .selectors
            .iter()
            .filter(|s| !doomed.contains(s))
            .cloned()
            .collect())
    }

    /// Makes a planned list the active one, binding `callback` to its topic if
    /// given. Call only once the client has accepted `selectors`.
    pub fn commit(
        &mut self,
        selectors: Vec<TopicSelector>,
        binding: Option<(&str, SharedCallback)>,
    ) -> Vec<TopicSelector> {
        if let Some((topic, callback)) = binding {
            self.callbacks.insert(topic.to_owned(), callback);
        }
        self.selectors = selectors;
        self.selectors.clone()
    }

    pub fn callback(&self, topic: &str) -> Result<SharedCallback, CallbackNotRegistered> {
        self.callbacks
            .get(topic)
            .cloned()
            .ok_or_else(|| CallbackNotRegistered {
                topic: topic.to_owned(),
            })
    }

    pub fn selectors(&self) -> &[TopicSelector] {
        &self.selectors
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut topics: Vec<&String> = self.callbacks.keys().collect();
        topics.sort();
        f.debug_struct("SubscriptionRegistry")
            .field("selectors", &self.selectors)
            .field("callbacks", &topics)
            .finish()
    }
}
