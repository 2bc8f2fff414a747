//! Directed presence bookkeeping.
//!
//! When a resource sends available presence straight to an entity, that
//! entity may keep seeing the resource even if it is otherwise
//! unavailable to it, and it must be told when the resource goes offline.

use std::collections::HashSet;

use dashmap::DashMap;
use jid::{FullJid, Jid};

/// Per sending resource, the entities it sent directed presence to.
#[derive(Debug, Default)]
pub struct DirectedPresences {
    sent: DashMap<FullJid, HashSet<Jid>>,
}

impl DirectedPresences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record available presence from `sender` to `recipient`.
    pub fn add(&self, sender: FullJid, recipient: Jid) {
        self.sent.entry(sender).or_default().insert(recipient);
    }

    /// Forget the presence `sender` sent to `recipient`.
    pub fn remove(&self, sender: &FullJid, recipient: &Jid) -> bool {
        let Some(mut recipients) = self.sent.get_mut(sender) else {
            return false;
        };
        let removed = recipients.remove(recipient);
        let empty = recipients.is_empty();
        drop(recipients);
        if empty {
            self.sent.remove_if(sender, |_, set| set.is_empty());
        }
        removed
    }

    pub fn recipients(&self, sender: &FullJid) -> Vec<Jid> {
        self.sent
            .get(sender)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget and return every recipient of `sender`.
    pub fn take_recipients(&self, sender: &FullJid) -> Vec<Jid> {
        self.sent
            .remove(sender)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Whether `requester` received directed presence from `sender`.
    ///
    /// A record for the requester's bare JID covers all its resources.
    pub fn has_directed_presence(&self, sender: &FullJid, requester: &Jid) -> bool {
        let Some(recipients) = self.sent.get(sender) else {
            return false;
        };
        let requester_bare = Jid::from(requester.to_bare());
        recipients.contains(requester) || recipients.contains(&requester_bare)
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
