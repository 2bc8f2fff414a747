//! Presence routing.
//!
//! Presence without a recipient is the sender's broadcast and updates its
//! session. Presence to the server answers subscription handshakes and
//! probes. Presence to anyone else is directed presence: it is delivered
//! and, for local senders, remembered so the recipient hears about the
//! sender going offline.

use std::sync::Arc;

use jid::Jid;
use tracing::{debug, instrument};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use super::RouterCore;
use crate::address::{classify, domain_jid, AddressKind};
use crate::error::StanzaErrorCondition;
use crate::session::{Session, SessionKind};
use crate::stanza::Stanza;
use crate::RouterError;

pub struct PresenceRouter {
    core: Arc<RouterCore>,
}

impl PresenceRouter {
    pub fn new(core: Arc<RouterCore>) -> Self {
        Self { core }
    }

    #[instrument(skip_all, fields(to = ?presence.to, type_ = ?presence.type_))]
    pub async fn route(&self, session: Option<&Arc<Session>>, presence: Presence) -> Result<(), RouterError> {
        let stanza = Stanza::Presence(presence.clone());
        if !self.core.run_pre_interceptors(&stanza, session).await {
            return Ok(());
        }

        match presence.to.clone() {
            None => self.broadcast_update(session, presence).await?,
            Some(to) if self.core.is_server_address(Some(&to)) => {
                if !self.core.delegate_multicast(&stanza).await {
                    self.handle_server_presence(session, presence).await;
                }
            }
            Some(to) => self.route_directed(session, presence, to).await,
        }

        self.core.run_post_interceptors(&stanza, session);
        Ok(())
    }

    /// The sender's own presence changed.
    async fn broadcast_update(&self, session: Option<&Arc<Session>>, mut presence: Presence) -> Result<(), RouterError> {
        let Some(session) = session.filter(|s| s.kind() == SessionKind::Client) else {
            debug!("Presence broadcast without a client session ignored");
            return Ok(());
        };
        let Some(jid) = session.full_jid() else {
            return Ok(());
        };
        presence.from = Some(Jid::from(jid.clone()));

        let sessions = &self.core.sessions;
        match presence.type_ {
            PresenceType::None => {
                let was_available = session.is_available();
                let old_priority = session.priority();
                sessions.session_available(session, presence.clone())?;
                if was_available {
                    sessions.change_priority(session, old_priority);
                }
                sessions
                    .broadcast_presence_to_other_resources(&jid, presence)
                    .await;
            }
            PresenceType::Unavailable => {
                sessions.session_unavailable(session, presence.clone());
                sessions
                    .broadcast_presence_to_other_resources(&jid, presence.clone())
                    .await;
                for recipient in self.core.routing.directed_presences().take_recipients(&jid) {
                    let mut directed = presence.clone();
                    directed.to = Some(recipient.clone());
                    self.core
                        .routing
                        .route_packet(&recipient, Stanza::Presence(directed))
                        .await;
                }
            }
            _ => debug!(type_ = ?presence.type_, "Ignoring presence broadcast of this type"),
        }
        Ok(())
    }

    /// Subscription handshakes and probes addressed to the server.
    async fn handle_server_presence(&self, session: Option<&Arc<Session>>, presence: Presence) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        let answer = match presence.type_ {
            PresenceType::Subscribe => PresenceType::Subscribed,
            PresenceType::Unsubscribe => PresenceType::Unsubscribed,
            PresenceType::Probe => PresenceType::None,
            _ => {
                debug!(type_ = ?presence.type_, "Ignoring presence to the server");
                return;
            }
        };

        let mut reply = Presence::new(answer);
        reply.from = domain_jid(self.core.domain());
        reply.to = Some(from);
        self.core.deliver_reply(session, Stanza::Presence(reply)).await;
    }

    async fn route_directed(&self, session: Option<&Arc<Session>>, presence: Presence, to: Jid) {
        let stanza = Stanza::Presence(presence.clone());
        if self.core.is_blocked(&to, &stanza) {
            debug!("Presence blocked by recipient's privacy list");
            return;
        }
        if self.core.sender_refuses(session, &stanza) {
            self.core
                .deliver_error(&stanza, session, StanzaErrorCondition::NotAcceptable)
                .await;
            return;
        }

        self.track_directed(session, &presence, &to);

        let delivered = match classify(&to) {
            AddressKind::Bare(_) if self.core.is_local_user(&to) => {
                let routes = self
                    .core
                    .routing
                    .get_routes(&to, presence.from.as_ref());
                let mut delivered = false;
                for route in routes {
                    if self
                        .core
                        .routing
                        .route_packet(&route, stanza.clone())
                        .await
                        .is_delivered()
                    {
                        delivered = true;
                    }
                }
                delivered
            }
            _ => self
                .core
                .routing
                .route_packet(&to, stanza.clone())
                .await
                .is_delivered(),
        };

        if !delivered {
            self.routing_failed(session, presence).await;
        }
    }

    /// Remember available presence a local resource sent to an entity.
    fn track_directed(&self, session: Option<&Arc<Session>>, presence: &Presence, to: &Jid) {
        let Some(sender) = session
            .filter(|s| s.kind() == SessionKind::Client)
            .and_then(|s| s.full_jid())
        else {
            return;
        };
        if to.to_bare() == sender.to_bare() {
            return;
        }

        let directed = self.core.routing.directed_presences();
        match presence.type_ {
            PresenceType::None => directed.add(sender, to.clone()),
            PresenceType::Unavailable => {
                directed.remove(&sender, to);
            }
            _ => {}
        }
    }

    /// No destination for `presence`. Only subscription requests bounce.
    pub async fn routing_failed(&self, session: Option<&Arc<Session>>, presence: Presence) {
        if presence.type_ == PresenceType::Subscribe {
            self.core
                .deliver_error(
                    &Stanza::Presence(presence),
                    session,
                    StanzaErrorCondition::ServiceUnavailable,
                )
                .await;
        } else {
            debug!(type_ = ?presence.type_, "Dropping undeliverable presence");
        }
    }
}
