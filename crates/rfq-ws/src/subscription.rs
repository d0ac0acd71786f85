//! Local record of subscribed pairs and reconciliation with the server.

use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Differences found when comparing local and server subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Local pairs the server does not know about.
    pub to_subscribe: Vec<String>,
    /// Server pairs no longer wanted locally.
    pub to_unsubscribe: Vec<String>,
}

impl Reconciliation {
    pub fn is_in_sync(&self) -> bool {
        self.to_subscribe.is_empty() && self.to_unsubscribe.is_empty()
    }
}

/// Pairs the client wants to be subscribed to.
///
/// The set is the source of truth across reconnects: it is re-asserted on
/// every open and survives socket loss, and is only cleared by an explicit
/// close.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    pairs: BTreeSet<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the pair was newly added.
    pub fn add(&mut self, pair: &str) -> bool {
        self.pairs.insert(pair.to_string())
    }

    /// Returns true if the pair was present.
    pub fn remove(&mut self, pair: &str) -> bool {
        self.pairs.remove(pair)
    }

    pub fn contains(&self, pair: &str) -> bool {
        self.pairs.contains(pair)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Subscribed pairs in sorted order.
    pub fn pairs(&self) -> Vec<String> {
        self.pairs.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Compare with the server's view after a successful sync.
    pub fn reconcile(&self, server_pairs: &[String]) -> Reconciliation {
        let server: BTreeSet<&str> = server_pairs.iter().map(String::as_str).collect();

        let to_subscribe: Vec<String> = self
            .pairs
            .iter()
            .filter(|pair| !server.contains(pair.as_str()))
            .cloned()
            .collect();
        let to_unsubscribe: Vec<String> = server
            .iter()
            .filter(|pair| !self.pairs.contains(**pair))
            .map(|pair| pair.to_string())
            .collect();

        for pair in &to_subscribe {
            warn!(pair = %pair, "Local subscription not reflected on server, resubscribing");
        }
        for pair in &to_unsubscribe {
            warn!(pair = %pair, "Server subscription not reflected locally, unsubscribing");
        }

        let result = Reconciliation {
            to_subscribe,
            to_unsubscribe,
        };
        if result.is_in_sync() {
            debug!(pairs = self.pairs.len(), "Client and server subscriptions in sync");
        }
        result
    }
}
