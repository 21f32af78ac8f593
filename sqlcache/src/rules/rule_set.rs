use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::debug;

use super::{Action, Rule};
use crate::registry::Query;

/// Old and new rule lists handed to subscribers on replacement.
#[derive(Clone, Debug)]
pub struct RuleChange {
    pub old: Arc<Vec<Rule>>,
    pub new: Arc<Vec<Rule>>,
}

/// Handle returned by [`RuleSet::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&RuleChange) + Send + Sync>;

/// The live, ordered rule list.
///
/// Readers never block and always see either the full old list or the full
/// new one.
pub struct RuleSet {
    rules: ArcSwap<Vec<Rule>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet::new(Vec::new())
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("rules", &self.rules.load())
            .finish_non_exhaustive()
    }
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleSet {
            rules: ArcSwap::from_pointee(rules),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Evaluates every rule in order; each match overwrites the TTL, so the
    /// last matching rule decides. No match means no caching.
    pub fn evaluate(&self, query: &Query) -> Action {
        let rules = self.rules.load();
        let mut action = Action::default();
        for rule in rules.iter() {
            if rule.matches(query) {
                action.ttl = rule.ttl();
            }
        }
        action
    }

    /// A snapshot of the current rules.
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.load_full()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replaces all rules and notifies subscribers. Returns the
    /// previous list.
    pub fn replace(&self, rules: Vec<Rule>) -> Arc<Vec<Rule>> {
        let new = Arc::new(rules);
        let old = self.rules.swap(new.clone());
        debug!(
            "Replaced {} caching rules with {} rules",
            old.len(),
            new.len()
        );

        let change = RuleChange { old: old.clone(), new };
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        for listener in self.listeners() {
            listener(&change);
        }
        old
    }

    /// Registers a callback invoked after every [`RuleSet::replace`].
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RuleChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    fn listeners(&self) -> Vec<Listener> {
        self.lock_listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
