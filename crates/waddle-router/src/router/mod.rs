//! Per-stanza-type routing policy.
//!
//! Every stanza goes through the same stages, each of which may stop it:
//!
//! 1. Pre-processing interceptors (a veto is answered with `not-allowed`)
//! 2. The authentication gate for sessions that have not bound a resource
//! 3. Server-self addressing (multicast, local IQ handlers, admins)
//! 4. Privacy lists of the recipient
//! 5. The sender's own filter, asked with the stanza reversed
//!    (`not-acceptable`)
//! 6. Delivery through the routing table, or the type's failure policy
//! 7. Post-processing interceptors (observe only)
//!
//! Error replies are guarded: a stanza that already carries an error, or
//! whose sender is the server, is never bounced.

mod iq;
mod message;
mod presence;

pub use iq::{spawn_iq_listener_sweep, IqHandler, IqResultListener, IqRouter};
pub use message::MessageRouter;
pub use presence::PresenceRouter;

use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use tracing::{debug, instrument, warn};
use xmpp_parsers::message::{Body, Message, MessageType};

use crate::address::{domain_jid, is_domain_address};
use crate::channel::{ChannelHandler, Originated};
use crate::config::RouterConfig;
use crate::error::{stream_errors, StanzaErrorCondition};
use crate::interceptor::{InterceptorManager, Rejected};
use crate::metrics;
use crate::policy::{MulticastRouter, OfflineStore, PrivacyPolicy, UserDirectory};
use crate::routing::RoutingTable;
use crate::session::{Session, SessionKind, SessionManager, SessionStatus};
use crate::stanza::{has_multicast_addresses, iq_child, Stanza};
use crate::RouterError;

/// Namespaces an unauthenticated client may use with the server.
const BOOTSTRAP_NAMESPACES: &[&str] = &[
    "jabber:iq:auth",
    "jabber:iq:register",
    "urn:ietf:params:xml:ns:xmpp-bind",
    "urn:ietf:params:xml:ns:xmpp-session",
];

/// Whether a stanza from a session in `status` addressed to `to` breaks
/// the rule that nothing but the server may be addressed before binding.
pub fn is_pre_bind_violation(status: SessionStatus, to: Option<&Jid>, domain: &str) -> bool {
    if status == SessionStatus::Authenticated {
        return false;
    }
    match to {
        Some(to) => to.node().is_some() || to.domain().as_str() != domain,
        None => false,
    }
}

/// State and collaborators shared by the three routers.
pub struct RouterCore {
    pub(crate) config: RouterConfig,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) interceptors: Arc<InterceptorManager>,
    pub(crate) privacy: Arc<dyn PrivacyPolicy>,
    pub(crate) offline: Arc<dyn OfflineStore>,
    pub(crate) users: Arc<dyn UserDirectory>,
    pub(crate) multicast: Option<Arc<dyn MulticastRouter>>,
}

impl RouterCore {
    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub(crate) fn is_server_address(&self, jid: Option<&Jid>) -> bool {
        jid.map(|jid| is_domain_address(jid, self.domain()))
            .unwrap_or(false)
    }

    /// A local account address (node on the served domain).
    pub(crate) fn is_local_user(&self, jid: &Jid) -> bool {
        jid.node().is_some() && self.routing.is_local_domain(jid.domain().as_str())
    }

    /// Run the pre-processing chain. Returns `false` when the stanza was
    /// vetoed and already answered.
    pub(crate) async fn run_pre_interceptors(
        &self,
        stanza: &Stanza,
        session: Option<&Arc<Session>>,
    ) -> bool {
        match self
            .interceptors
            .invoke(stanza, session.map(|s| s.as_ref()), true, false)
        {
            Ok(()) => true,
            Err(rejected) => {
                self.answer_rejection(stanza, session, rejected).await;
                false
            }
        }
    }

    pub(crate) fn run_post_interceptors(&self, stanza: &Stanza, session: Option<&Arc<Session>>) {
        if let Err(rejected) = self
            .interceptors
            .invoke(stanza, session.map(|s| s.as_ref()), true, true)
        {
            debug!(stanza = stanza.name(), %rejected, "Post-processing veto ignored");
        }
    }

    async fn answer_rejection(
        &self,
        stanza: &Stanza,
        session: Option<&Arc<Session>>,
        rejected: Rejected,
    ) {
        self.deliver_error(stanza, session, StanzaErrorCondition::NotAllowed)
            .await;

        let Some(reason) = rejected.reason else {
            return;
        };
        let Some(sender) = stanza.from().cloned() else {
            return;
        };
        let mut notice = Message::new(Some(sender));
        notice.from = domain_jid(self.domain());
        notice.type_ = MessageType::Chat;
        notice.bodies.insert(String::new(), Body(reason));
        self.deliver_reply(session, Stanza::Message(notice)).await;
    }

    /// Bounce `stanza` to its sender with `condition`.
    ///
    /// Returns whether a reply went out.
    #[instrument(skip(self, stanza, session), fields(stanza = stanza.name(), condition = %condition))]
    pub(crate) async fn deliver_error(
        &self,
        stanza: &Stanza,
        session: Option<&Arc<Session>>,
        condition: StanzaErrorCondition,
    ) -> bool {
        if stanza.is_error() {
            debug!("Not bouncing an error stanza");
            return false;
        }
        match stanza.from() {
            Some(from) if self.is_server_address(Some(from)) => {
                debug!("Not bouncing a stanza sent by the server");
                return false;
            }
            None if session.is_none() => return false,
            _ => {}
        }

        metrics::record_bounce(stanza.name(), condition.as_str());
        let reply = stanza.error_reply(condition, None);
        self.deliver_reply(session, reply).await
    }

    /// Send a server-generated reply back towards the sender.
    ///
    /// Client and component streams get it directly; anything else is
    /// routed by address.
    pub(crate) async fn deliver_reply(&self, session: Option<&Arc<Session>>, reply: Stanza) -> bool {
        match session {
            Some(session)
                if matches!(
                    session.kind(),
                    SessionKind::Client | SessionKind::Component | SessionKind::ConnectionMultiplexer
                ) =>
            {
                session.deliver(reply).is_sent()
            }
            _ => match reply.to().cloned() {
                Some(to) => self.routing.route_packet(&to, reply).await.is_delivered(),
                None => false,
            },
        }
    }

    /// Whether the recipient's privacy list blocks `stanza`.
    pub(crate) fn is_blocked(&self, recipient: &Jid, stanza: &Stanza) -> bool {
        self.is_local_user(recipient) && self.privacy.should_block(&recipient.to_bare(), stanza)
    }

    /// Whether the sender would refuse a stanza coming back from the
    /// recipient, in which case it may not send to it either.
    pub(crate) fn sender_refuses(&self, session: Option<&Arc<Session>>, stanza: &Stanza) -> bool {
        session
            .map(|session| !session.can_process(&stanza.reversed()))
            .unwrap_or(false)
    }

    /// Hand a stanza carrying address lists to the multicast service.
    pub(crate) async fn delegate_multicast(&self, stanza: &Stanza) -> bool {
        if !has_multicast_addresses(stanza) {
            return false;
        }
        let Some(multicast) = &self.multicast else {
            return false;
        };
        if let Err(e) = multicast.route(stanza.clone()).await {
            warn!(error = %e, "Multicast delivery failed");
        }
        true
    }
}

/// Front door of the routers: stamps, gates and dispatches by type.
pub struct PacketRouter {
    core: Arc<RouterCore>,
    iq: Arc<IqRouter>,
    message: MessageRouter,
    presence: PresenceRouter,
}

impl PacketRouter {
    pub fn new(core: Arc<RouterCore>) -> Self {
        Self {
            iq: Arc::new(IqRouter::new(Arc::clone(&core))),
            message: MessageRouter::new(Arc::clone(&core)),
            presence: PresenceRouter::new(Arc::clone(&core)),
            core,
        }
    }

    pub fn core(&self) -> &Arc<RouterCore> {
        &self.core
    }

    pub fn iq_router(&self) -> &Arc<IqRouter> {
        &self.iq
    }

    pub fn message_router(&self) -> &MessageRouter {
        &self.message
    }

    pub fn presence_router(&self) -> &PresenceRouter {
        &self.presence
    }

    /// Route a stanza read from `session`.
    #[instrument(skip_all, fields(stream_id = %session.stream_id(), stanza = stanza.name()))]
    pub async fn route(&self, session: &Arc<Session>, mut stanza: Stanza) -> Result<(), RouterError> {
        let started = std::time::Instant::now();
        let stanza_type = stanza.name();
        session.touch();
        metrics::record_stanza(stanza_type);

        if session.kind() == SessionKind::Client {
            if session.is_authenticated() {
                stanza.set_from(session.address());
            } else if !self.admit_unauthenticated(session, &stanza) {
                return Ok(());
            }
        }

        let result = self.dispatch(Some(session), stanza).await;
        metrics::record_routing_latency(started.elapsed().as_secs_f64() * 1000.0, stanza_type);
        result
    }

    /// Route a stanza generated inside the server.
    pub async fn route_internal(&self, stanza: Stanza) -> Result<(), RouterError> {
        if stanza.to().is_none() {
            return Err(RouterError::malformed(format!(
                "server-generated {} without recipient",
                stanza.name()
            )));
        }
        metrics::record_stanza(stanza.name());
        self.dispatch(None, stanza).await
    }

    async fn dispatch(&self, session: Option<&Arc<Session>>, stanza: Stanza) -> Result<(), RouterError> {
        match stanza {
            Stanza::Iq(iq) => self.iq.route(session, iq).await,
            Stanza::Message(message) => self.message.route(session, message).await,
            Stanza::Presence(presence) => self.presence.route(session, presence).await,
        }
    }

    /// Apply the authentication gate. Returns whether the stanza may go on.
    fn admit_unauthenticated(&self, session: &Session, stanza: &Stanza) -> bool {
        if is_pre_bind_violation(session.status(), stanza.to(), self.core.domain()) {
            warn!(to = ?stanza.to(), "Stanza to a foreign address before binding");
            session.close(Some(stream_errors::NOT_AUTHORIZED));
            return false;
        }

        let bootstrap = match stanza {
            Stanza::Iq(iq) => iq_child(iq)
                .map(|child| BOOTSTRAP_NAMESPACES.contains(&child.ns().as_str()))
                .unwrap_or(false),
            _ => false,
        };
        if bootstrap {
            return true;
        }

        debug!("Non-bootstrap stanza before authentication");
        if !stanza.is_error() {
            session.deliver(stanza.error_reply(StanzaErrorCondition::NotAuthorized, None));
        }
        session.close(Some(stream_errors::NOT_AUTHORIZED));
        false
    }
}

/// A stanza waiting in the processing channel.
#[derive(Debug, Clone)]
pub struct StanzaJob {
    pub session: Arc<Session>,
    pub stanza: Stanza,
}

impl Originated for StanzaJob {
    fn origin(&self) -> Option<Arc<Session>> {
        Some(Arc::clone(&self.session))
    }
}

#[async_trait]
impl ChannelHandler<StanzaJob> for PacketRouter {
    async fn process(&self, job: StanzaJob) -> Result<(), RouterError> {
        if job.session.is_closed() {
            debug!(stream_id = %job.session.stream_id(), "Dropping stanza from closed session");
            return Ok(());
        }
        self.route(&job.session, job.stanza).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_pre_bind_violation_predicate() {
        let domain = "waddle.social";
        let connecting = SessionStatus::Connecting;

        assert!(is_pre_bind_violation(connecting, Some(&jid("bob@waddle.social/phone")), domain));
        assert!(is_pre_bind_violation(connecting, Some(&jid("bob@waddle.social")), domain));
        assert!(is_pre_bind_violation(connecting, Some(&jid("example.com")), domain));
        assert!(!is_pre_bind_violation(connecting, Some(&jid("waddle.social")), domain));
        assert!(!is_pre_bind_violation(connecting, None, domain));
        assert!(!is_pre_bind_violation(
            SessionStatus::Authenticated,
            Some(&jid("bob@waddle.social/phone")),
            domain
        ));
    }
}
