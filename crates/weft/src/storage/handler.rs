// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Handler registry: topic, then owning node, then handler UUID.
//!
//! The same shape backs four different registries (typed subscriptions, raw
//! subscriptions, service repliers, pending requests), so entries are
//! `Arc<H>` with `H` usually a trait object. A handler is reachable from the
//! registry exactly as long as it is registered; removal drops the reference.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

/// Registry of handlers, generic over the capability they expose.
#[derive(Debug)]
pub struct HandlerStorage<H: ?Sized> {
    data: HashMap<String, HashMap<Uuid, HashMap<Uuid, Arc<H>>>>,
}

impl<H: ?Sized> Default for HandlerStorage<H> {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
        }
    }
}

impl<H: ?Sized> HandlerStorage<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Re-adding the same handler UUID replaces it.
    pub fn add_handler(&mut self, topic: &str, n_uuid: Uuid, h_uuid: Uuid, handler: Arc<H>) {
        self.data
            .entry(topic.to_string())
            .or_default()
            .entry(n_uuid)
            .or_default()
            .insert(h_uuid, handler);
    }

    /// Snapshot of every handler registered for a topic.
    pub fn handlers(&self, topic: &str) -> Vec<Arc<H>> {
        self.data
            .get(topic)
            .map(|by_node| {
                by_node
                    .values()
                    .flat_map(|by_handler| by_handler.values())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handlers of a topic together with the node that registered them.
    pub fn entries(&self, topic: &str) -> Vec<(Uuid, Arc<H>)> {
        self.data
            .get(topic)
            .map(|by_node| {
                by_node
                    .iter()
                    .flat_map(|(n_uuid, by_handler)| {
                        by_handler.values().map(|h| (*n_uuid, Arc::clone(h)))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handlers one node registered on a topic.
    pub fn handlers_for_node(&self, topic: &str, n_uuid: Uuid) -> Vec<Arc<H>> {
        self.data
            .get(topic)
            .and_then(|by_node| by_node.get(&n_uuid))
            .map(|by_handler| by_handler.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes holding at least one handler on a topic.
    pub fn nodes(&self, topic: &str) -> Vec<Uuid> {
        self.data
            .get(topic)
            .map(|by_node| by_node.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_handlers_for_topic(&self, topic: &str) -> bool {
        self.data.contains_key(topic)
    }

    /// First handler on a topic matching a predicate.
    pub fn first_handler(&self, topic: &str, pred: impl Fn(&H) -> bool) -> Option<Arc<H>> {
        let by_node = self.data.get(topic)?;
        for by_handler in by_node.values() {
            for handler in by_handler.values() {
                if pred(handler) {
                    return Some(Arc::clone(handler));
                }
            }
        }
        None
    }

    /// Remove one handler and hand it back.
    pub fn take_handler(&mut self, topic: &str, n_uuid: Uuid, h_uuid: Uuid) -> Option<Arc<H>> {
        let by_node = self.data.get_mut(topic)?;
        let by_handler = by_node.get_mut(&n_uuid)?;
        let handler = by_handler.remove(&h_uuid);
        if by_handler.is_empty() {
            by_node.remove(&n_uuid);
        }
        if by_node.is_empty() {
            self.data.remove(topic);
        }
        handler
    }

    /// Remove one handler. Returns whether something was removed.
    pub fn remove_handler(&mut self, topic: &str, n_uuid: Uuid, h_uuid: Uuid) -> bool {
        self.take_handler(topic, n_uuid, h_uuid).is_some()
    }

    /// Remove every handler a node registered on a topic.
    pub fn remove_handlers_for_node(&mut self, topic: &str, n_uuid: Uuid) -> bool {
        let Some(by_node) = self.data.get_mut(topic) else {
            return false;
        };
        let removed = by_node.remove(&n_uuid).is_some();
        if by_node.is_empty() {
            self.data.remove(topic);
        }
        removed
    }

    /// Remove every handler a node registered anywhere. Returns the removed
    /// entries with the topic they were registered on.
    pub fn drain_node(&mut self, n_uuid: Uuid) -> Vec<(String, Arc<H>)> {
        let mut removed = Vec::new();
        self.data.retain(|topic, by_node| {
            if let Some(by_handler) = by_node.remove(&n_uuid) {
                removed.extend(
                    by_handler
                        .into_values()
                        .map(|h| (topic.clone(), h)),
                );
            }
            !by_node.is_empty()
        });
        removed
    }

    /// Remove handlers matching a predicate, returning them.
    pub fn drain_matching(&mut self, pred: impl Fn(&H) -> bool) -> Vec<Arc<H>> {
        let mut removed = Vec::new();
        self.data.retain(|_, by_node| {
            by_node.retain(|_, by_handler| {
                by_handler.retain(|_, h| {
                    if pred(h) {
                        removed.push(Arc::clone(h));
                        false
                    } else {
                        true
                    }
                });
                !by_handler.is_empty()
            });
            !by_node.is_empty()
        });
        removed
    }

    /// Remove everything, returning the handlers. Used at shutdown.
    pub fn drain_all(&mut self) -> Vec<Arc<H>> {
        let mut removed = Vec::new();
        for (_, by_node) in self.data.drain() {
            for (_, by_handler) in by_node {
                removed.extend(by_handler.into_values());
            }
        }
        removed
    }
}
