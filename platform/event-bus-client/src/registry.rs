//! Concurrent, insertion-ordered collection of active handlers
//!
//! The registry is copy-on-write: every mutation builds a new list and swaps
//! it in under a short write lock, while readers take a cheap snapshot of the
//! current list. A dispatch that races an add or remove therefore sees either
//! the list before the mutation or the list after it, never a half-applied one.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::envelope::{MessageTag, RoutingKey};
use crate::handler::Registration;

type Entries = Arc<Vec<Arc<Registration>>>;

#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<Entries>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current list of registrations
    pub fn snapshot(&self) -> Entries {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Arc<Registration>>) -> R) -> R {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.as_ref().clone();
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }

    pub fn add(&self, registration: Arc<Registration>) {
        self.mutate(|entries| entries.push(registration));
    }

    /// Remove every registration matching `predicate`, returning what was removed
    pub fn remove_where(&self, predicate: impl Fn(&Registration) -> bool) -> Vec<Arc<Registration>> {
        self.mutate(|entries| {
            let (removed, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|entry| predicate(entry));
            *entries = kept;
            removed
        })
    }

    /// Put back registrations taken out by a failed removal
    pub fn restore(&self, registrations: Vec<Arc<Registration>>) {
        if registrations.is_empty() {
            return;
        }
        self.mutate(|entries| entries.extend(registrations));
    }

    /// Remove one specific registration (pointer identity)
    pub fn remove_entry(&self, registration: &Arc<Registration>) -> bool {
        !self
            .remove_where(|entry| std::ptr::eq(entry, registration.as_ref()))
            .is_empty()
    }

    /// Registrations whose routing key equals `route`, in insertion order
    pub fn matching(&self, route: &RoutingKey) -> Vec<Arc<Registration>> {
        self.snapshot()
            .iter()
            .filter(|entry| entry.route() == route)
            .cloned()
            .collect()
    }

    pub fn contains_route(&self, route: &RoutingKey) -> bool {
        self.snapshot().iter().any(|entry| entry.route() == route)
    }

    pub fn contains_tag(&self, tag: MessageTag) -> bool {
        self.snapshot().iter().any(|entry| entry.route().tag() == tag)
    }

    pub fn contains(&self, route: &RoutingKey, creator_id: &str) -> bool {
        self.snapshot()
            .iter()
            .any(|entry| entry.route() == route && entry.creator_id() == creator_id)
    }

    /// Distinct routing keys, in order of first registration
    pub fn routes(&self) -> Vec<RoutingKey> {
        let mut seen = HashSet::new();
        self.snapshot()
            .iter()
            .filter(|entry| seen.insert(entry.route().clone()))
            .map(|entry| entry.route().clone())
            .collect()
    }

    /// Distinct tags, in order of first registration
    pub fn tags(&self) -> Vec<MessageTag> {
        let mut seen = HashSet::new();
        self.snapshot()
            .iter()
            .map(|entry| entry.route().tag())
            .filter(|tag| seen.insert(*tag))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn clear(&self) {
        self.mutate(|entries| entries.clear());
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}
