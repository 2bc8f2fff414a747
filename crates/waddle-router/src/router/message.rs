//! Message routing.
//!
//! Full JIDs are delivered as addressed. A bare local JID is resolved to
//! resources by priority, then show, then recent activity. Undeliverable
//! messages follow the type's failure policy: chat messages get one retry at
//! the bare JID when a resource has a positive priority, chat and normal
//! messages then go to the offline store, groupchat is bounced, headline and
//! error are dropped.

use std::sync::Arc;

use jid::{BareJid, FullJid, Jid};
use tracing::{debug, instrument};
use xmpp_parsers::message::{Message, MessageType};

use super::RouterCore;
use crate::address::{classify, AddressKind};
use crate::carbons::{self, CarbonDirection};
use crate::config::OfflinePolicy;
use crate::error::StanzaErrorCondition;
use crate::metrics;
use crate::session::{show_rank, Session};
use crate::stanza::Stanza;
use crate::RouterError;

pub struct MessageRouter {
    core: Arc<RouterCore>,
}

/// A resource competing for a bare-JID message.
struct Candidate {
    jid: Jid,
    session: Option<Arc<Session>>,
    priority: i8,
    show_rank: u8,
}

impl MessageRouter {
    pub fn new(core: Arc<RouterCore>) -> Self {
        Self { core }
    }

    #[instrument(skip_all, fields(to = ?message.to, type_ = ?message.type_))]
    pub async fn route(&self, session: Option<&Arc<Session>>, mut message: Message) -> Result<(), RouterError> {
        let incoming = Stanza::Message(message.clone());
        if !self.core.run_pre_interceptors(&incoming, session).await {
            return Ok(());
        }

        let to = match message.to.clone() {
            Some(to) => to,
            None => {
                let own = session
                    .and_then(|s| s.bare_jid())
                    .ok_or_else(|| RouterError::malformed("message without recipient"))?;
                let own = Jid::from(own);
                message.to = Some(own.clone());
                own
            }
        };
        let stanza = Stanza::Message(message.clone());

        if self.core.is_server_address(Some(&to)) {
            self.route_to_server(session, message).await;
        } else if self.core.is_blocked(&to, &stanza) {
            debug!("Message blocked by recipient's privacy list");
            self.core
                .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                .await;
        } else if self.core.sender_refuses(session, &stanza) {
            self.core
                .deliver_error(&stanza, session, StanzaErrorCondition::NotAcceptable)
                .await;
        } else if self.core.is_local_user(&to) {
            match classify(&to) {
                AddressKind::Full(full) => self.route_to_full(session, message, full).await,
                AddressKind::Bare(bare) => self.route_to_bare(session, message, bare).await,
                AddressKind::Domain => {}
            }
        } else {
            let eligible = carbons::should_copy_message(&message);
            if self.core.routing.route_packet(&to, stanza.clone()).await.is_delivered() {
                if eligible {
                    self.send_sent_carbons(session, &message);
                }
            } else {
                self.routing_failed(session, message).await;
            }
        }

        self.core.run_post_interceptors(&stanza, session);
        Ok(())
    }

    async fn route_to_server(&self, session: Option<&Arc<Session>>, message: Message) {
        let stanza = Stanza::Message(message.clone());
        if self.core.delegate_multicast(&stanza).await {
            return;
        }
        if !self.core.config.forward_to_admins {
            debug!("Message to the server dropped");
            return;
        }

        for admin in &self.core.config.admins {
            let mut copy = message.clone();
            copy.to = Some(Jid::from(admin.clone()));
            let recipients = self.select_recipients(admin, &copy);
            if !self.deliver_to(session, &copy, &recipients).await {
                self.store_offline(session, copy).await;
            }
        }
    }

    async fn route_to_full(&self, session: Option<&Arc<Session>>, message: Message, to: FullJid) {
        let eligible = carbons::should_copy_message(&message);
        let mut delivered = message.clone();
        carbons::strip_private(&mut delivered);

        let result = self
            .core
            .routing
            .route_packet(&Jid::from(to.clone()), Stanza::Message(delivered))
            .await;
        if !result.is_delivered() {
            self.routing_failed(session, message).await;
            return;
        }

        if eligible {
            self.send_received_carbons(&message, &to);
            self.send_sent_carbons(session, &message);
        }
    }

    async fn route_to_bare(&self, session: Option<&Arc<Session>>, message: Message, to: BareJid) {
        if message.type_ == MessageType::Groupchat {
            self.core
                .deliver_error(
                    &Stanza::Message(message),
                    session,
                    StanzaErrorCondition::ServiceUnavailable,
                )
                .await;
            return;
        }

        let recipients = self.select_recipients(&to, &message);
        if !self.deliver_to(session, &message, &recipients).await {
            self.routing_failed(session, message).await;
        }
    }

    /// Route copies to `recipients`; returns whether any was delivered.
    async fn deliver_to(&self, session: Option<&Arc<Session>>, message: &Message, recipients: &[Jid]) -> bool {
        let eligible = carbons::should_copy_message(message);
        let mut copy = message.clone();
        carbons::strip_private(&mut copy);

        let mut delivered = false;
        for recipient in recipients {
            if self
                .core
                .routing
                .route_packet(recipient, Stanza::Message(copy.clone()))
                .await
                .is_delivered()
            {
                delivered = true;
            }
        }

        if delivered && eligible {
            self.send_sent_carbons(session, message);
        }
        delivered
    }

    /// Resources of `user` that should receive a bare-JID message.
    fn select_recipients(&self, user: &BareJid, message: &Message) -> Vec<Jid> {
        let candidates: Vec<Candidate> = self
            .core
            .routing
            .get_routes(&Jid::from(user.clone()), message.from.as_ref())
            .into_iter()
            .map(|jid| self.candidate(jid))
            .filter(|candidate| candidate.priority >= 0)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        if message.type_ == MessageType::Headline {
            return candidates.into_iter().map(|c| c.jid).collect();
        }

        let top_priority = candidates.iter().map(|c| c.priority).max().unwrap_or(0);
        let mut selected: Vec<Jid> = if self.core.config.route_all_resources {
            candidates
                .iter()
                .filter(|c| c.priority == top_priority)
                .map(|c| c.jid.clone())
                .collect()
        } else {
            candidates
                .iter()
                .filter(|c| c.priority == top_priority)
                .min_by(|a, b| {
                    a.show_rank.cmp(&b.show_rank).then_with(|| {
                        let a_active = a.session.as_ref().map(|s| s.last_active());
                        let b_active = b.session.as_ref().map(|s| s.last_active());
                        b_active.cmp(&a_active)
                    })
                })
                .map(|c| vec![c.jid.clone()])
                .unwrap_or_default()
        };

        for candidate in &candidates {
            let carbons_enabled = candidate
                .session
                .as_ref()
                .map(|s| s.is_carbons_enabled())
                .unwrap_or(false);
            if carbons_enabled && !selected.contains(&candidate.jid) {
                selected.push(candidate.jid.clone());
            }
        }
        selected
    }

    /// Whether some resource of `user` has a positive priority.
    fn has_preferred_resource(&self, user: &BareJid, message: &Message) -> bool {
        self.core
            .routing
            .get_routes(&Jid::from(user.clone()), message.from.as_ref())
            .into_iter()
            .any(|jid| self.candidate(jid).priority >= 1)
    }

    fn candidate(&self, jid: Jid) -> Candidate {
        let session = jid
            .clone()
            .try_into_full()
            .ok()
            .and_then(|full| self.core.routing.get_client_route(&full));
        match session {
            Some(session) => Candidate {
                priority: session.priority(),
                show_rank: session.show_rank(),
                session: Some(session),
                jid,
            },
            // Routes on other nodes count as plain available, priority 0.
            None => Candidate {
                jid,
                session: None,
                priority: 0,
                show_rank: show_rank(None),
            },
        }
    }

    /// Mirror a delivered message to the recipient's other resources.
    fn send_received_carbons(&self, message: &Message, recipient: &FullJid) {
        for other in self.core.routing.local_sessions_of(&recipient.to_bare()) {
            let Some(other_jid) = other.full_jid() else {
                continue;
            };
            if other_jid == *recipient || !other.is_carbons_enabled() {
                continue;
            }
            let carbon = carbons::build_carbon(message, CarbonDirection::Received, &other_jid);
            if other.deliver(Stanza::Message(carbon)).is_sent() {
                metrics::record_carbon(CarbonDirection::Received.as_str());
            }
        }
    }

    /// Mirror a sent message to the sender's other resources.
    fn send_sent_carbons(&self, session: Option<&Arc<Session>>, message: &Message) {
        let Some(sender) = session.and_then(|s| s.full_jid()) else {
            return;
        };
        for other in self.core.routing.local_sessions_of(&sender.to_bare()) {
            let Some(other_jid) = other.full_jid() else {
                continue;
            };
            if other_jid == sender || !other.is_carbons_enabled() {
                continue;
            }
            let carbon = carbons::build_carbon(message, CarbonDirection::Sent, &other_jid);
            if other.deliver(Stanza::Message(carbon)).is_sent() {
                metrics::record_carbon(CarbonDirection::Sent.as_str());
            }
        }
    }

    /// No destination for `message`.
    pub async fn routing_failed(&self, session: Option<&Arc<Session>>, message: Message) {
        let stanza = Stanza::Message(message.clone());
        match message.type_ {
            MessageType::Error | MessageType::Headline => {
                debug!(type_ = ?message.type_, "Dropping undeliverable message");
            }
            MessageType::Groupchat => {
                self.core
                    .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                    .await;
            }
            MessageType::Chat | MessageType::Normal => {
                let Some(to) = message.to.clone() else {
                    return;
                };
                if !self.core.is_local_user(&to) {
                    self.core
                        .deliver_error(&stanza, session, StanzaErrorCondition::RemoteServerNotFound)
                        .await;
                    return;
                }

                if message.type_ == MessageType::Chat
                    && to.resource().is_some()
                    && self.has_preferred_resource(&to.to_bare(), &message)
                {
                    let recipients = self.select_recipients(&to.to_bare(), &message);
                    if self.deliver_to(session, &message, &recipients).await {
                        debug!("Delivered to the bare JID after full JID failed");
                        return;
                    }
                }
                self.store_offline(session, message).await;
            }
        }
    }

    async fn store_offline(&self, session: Option<&Arc<Session>>, message: Message) {
        let stanza = Stanza::Message(message.clone());
        let Some(owner) = message.to.as_ref().map(Jid::to_bare) else {
            return;
        };
        if !self.core.users.is_registered(&owner) {
            self.core
                .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                .await;
            return;
        }

        let stored = self.core.offline.store_offline(&message);
        metrics::record_offline_store(stored);
        if stored {
            debug!(user = %owner, "Message stored offline");
            return;
        }

        match self.core.config.offline_policy {
            OfflinePolicy::Drop => debug!(user = %owner, "Offline store refused message, dropping"),
            OfflinePolicy::Bounce => {
                self.core
                    .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                    .await;
            }
        }
    }
}
