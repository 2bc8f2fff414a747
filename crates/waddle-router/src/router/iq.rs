//! IQ routing: namespace handlers for the server, result listeners for
//! server-originated requests, and delivery to other entities.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::Jid;
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};

use super::RouterCore;
use crate::address::domain_jid;
use crate::carbons::{self, CARBONS_NS};
use crate::error::StanzaErrorCondition;
use crate::session::Session;
use crate::stanza::{iq_child, is_iq_request, Stanza};
use crate::RouterError;

const PING_NS: &str = "urn:xmpp:ping";

/// Answers IQ requests for one namespace on behalf of the server.
#[async_trait]
pub trait IqHandler: Send + Sync {
    fn namespace(&self) -> &str;

    /// Handle a get or set.
    ///
    /// `Ok(Some(reply))` is sent back, `Ok(None)` means the handler
    /// answered on its own, and `Err(RouterError::Stanza { .. })` becomes
    /// an error reply. Any other error is a fault.
    async fn handle(&self, session: Option<&Arc<Session>>, iq: Iq) -> Result<Option<Iq>, RouterError>;
}

/// Waits for the answer to an IQ the server sent.
pub trait IqResultListener: Send + Sync {
    fn receive_packet(&self, iq: Iq);

    fn answer_timeout(&self, id: &str);
}

struct PendingAnswer {
    listener: Arc<dyn IqResultListener>,
    deadline: Instant,
}

/// Empty result for `iq`, addressed back to its sender.
pub(crate) fn result_reply(iq: &Iq) -> Iq {
    Iq {
        from: iq.to.clone(),
        to: iq.from.clone(),
        id: iq.id.clone(),
        payload: IqType::Result(None),
    }
}

pub struct IqRouter {
    core: Arc<RouterCore>,
    handlers: DashMap<String, Arc<dyn IqHandler>>,
    listeners: DashMap<String, PendingAnswer>,
}

impl IqRouter {
    pub fn new(core: Arc<RouterCore>) -> Self {
        let router = Self {
            core,
            handlers: DashMap::new(),
            listeners: DashMap::new(),
        };
        router
            .handlers
            .insert(CARBONS_NS.to_string(), Arc::new(CarbonsHandler));
        router
            .handlers
            .insert(PING_NS.to_string(), Arc::new(PingHandler));
        router
    }

    /// Register a handler. A namespace can only have one.
    pub fn add_handler(&self, handler: Arc<dyn IqHandler>) -> Result<(), RouterError> {
        let namespace = handler.namespace().to_string();
        match self.handlers.entry(namespace.clone()) {
            Entry::Occupied(_) => Err(RouterError::HandlerExists(namespace)),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                debug!(namespace = %namespace, "IQ handler registered");
                Ok(())
            }
        }
    }

    pub fn remove_handler(&self, namespace: &str) -> bool {
        self.handlers.remove(namespace).is_some()
    }

    pub fn supports(&self, namespace: &str) -> bool {
        self.find_handler(namespace).is_some()
    }

    fn find_handler(&self, namespace: &str) -> Option<Arc<dyn IqHandler>> {
        if let Some(handler) = self.handlers.get(namespace) {
            return Some(Arc::clone(handler.value()));
        }
        self.handlers
            .iter()
            .find(|entry| entry.key().eq_ignore_ascii_case(namespace))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Wait for the answer to the server's request `id`.
    pub fn add_iq_result_listener(
        &self,
        id: impl Into<String>,
        listener: Arc<dyn IqResultListener>,
        timeout: Duration,
    ) {
        self.listeners.insert(
            id.into(),
            PendingAnswer {
                listener,
                deadline: Instant::now() + timeout,
            },
        );
    }

    pub fn remove_iq_result_listener(&self, id: &str) -> bool {
        self.listeners.remove(id).is_some()
    }

    pub fn pending_listeners(&self) -> usize {
        self.listeners.len()
    }

    /// Time out listeners whose deadline passed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut timed_out = 0;
        for id in expired {
            if let Some((id, pending)) = self
                .listeners
                .remove_if(&id, |_, pending| pending.deadline <= now)
            {
                pending.listener.answer_timeout(&id);
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Send `iq` from the server and wait for its answer.
    pub async fn query(&self, mut iq: Iq, timeout: Duration) -> Result<Iq, RouterError> {
        let to = iq
            .to
            .clone()
            .ok_or_else(|| RouterError::malformed("query without recipient"))?;
        iq.from = domain_jid(self.core.domain());
        let id = iq.id.clone();

        let (tx, rx) = oneshot::channel();
        self.add_iq_result_listener(
            id.clone(),
            Arc::new(OneshotListener {
                sender: Mutex::new(Some(tx)),
            }),
            timeout,
        );

        let result = self.core.routing.route_packet(&to, Stanza::Iq(iq.clone())).await;
        if !result.is_delivered() {
            self.routing_failed(None, iq).await;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(answer))) => Ok(answer),
            _ => {
                self.remove_iq_result_listener(&id);
                Err(RouterError::Timeout(format!("no answer to iq {id}")))
            }
        }
    }

    #[instrument(skip_all, fields(id = %iq.id, to = ?iq.to))]
    pub async fn route(&self, session: Option<&Arc<Session>>, iq: Iq) -> Result<(), RouterError> {
        let stanza = Stanza::Iq(iq.clone());
        if !self.core.run_pre_interceptors(&stanza, session).await {
            return Ok(());
        }

        match iq.to.clone() {
            None => self.handle_local(session, iq).await?,
            Some(to) if self.core.is_server_address(Some(&to)) => {
                if !self.core.delegate_multicast(&stanza).await {
                    self.handle_local(session, iq).await?;
                }
            }
            Some(to) if self.core.is_local_user(&to) => {
                self.route_to_user(session, iq, to).await?;
            }
            Some(to) => {
                if self.core.sender_refuses(session, &stanza) {
                    self.core
                        .deliver_error(&stanza, session, StanzaErrorCondition::NotAcceptable)
                        .await;
                } else if !self.core.routing.route_packet(&to, stanza.clone()).await.is_delivered() {
                    self.routing_failed(session, iq).await;
                }
            }
        }

        self.core.run_post_interceptors(&stanza, session);
        Ok(())
    }

    async fn route_to_user(
        &self,
        session: Option<&Arc<Session>>,
        iq: Iq,
        to: Jid,
    ) -> Result<(), RouterError> {
        let stanza = Stanza::Iq(iq.clone());
        let request = is_iq_request(&iq);

        if !self.core.users.is_registered(&to.to_bare()) {
            if request {
                self.core
                    .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                    .await;
            }
            return Ok(());
        }
        if self.core.is_blocked(&to, &stanza) {
            debug!("IQ blocked by recipient's privacy list");
            if request {
                self.core
                    .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
                    .await;
            }
            return Ok(());
        }
        if self.core.sender_refuses(session, &stanza) {
            self.core
                .deliver_error(&stanza, session, StanzaErrorCondition::NotAcceptable)
                .await;
            return Ok(());
        }

        if to.resource().is_none() {
            // The account answers for a bare JID.
            return self.handle_local(session, iq).await;
        }
        if !self.core.routing.route_packet(&to, stanza).await.is_delivered() {
            self.routing_failed(session, iq).await;
        }
        Ok(())
    }

    async fn handle_local(&self, session: Option<&Arc<Session>>, iq: Iq) -> Result<(), RouterError> {
        if !is_iq_request(&iq) {
            self.handle_response(iq);
            return Ok(());
        }

        let namespace = iq_child(&iq).map(|child| child.ns()).unwrap_or_default();
        let handler = if namespace.is_empty() {
            None
        } else {
            self.find_handler(&namespace)
        };

        let Some(handler) = handler else {
            let condition = match &iq.to {
                Some(to) if !namespace.is_empty() && to.node().is_none() => {
                    StanzaErrorCondition::FeatureNotImplemented
                }
                _ => StanzaErrorCondition::ServiceUnavailable,
            };
            debug!(namespace = %namespace, condition = %condition, "No IQ handler");
            self.core
                .deliver_error(&Stanza::Iq(iq), session, condition)
                .await;
            return Ok(());
        };

        match handler.handle(session, iq.clone()).await {
            Ok(Some(reply)) => {
                self.core.deliver_reply(session, Stanza::Iq(reply)).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(RouterError::Stanza { condition, .. }) => {
                self.core
                    .deliver_error(&Stanza::Iq(iq), session, condition)
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Feed a result or error to the listener waiting for it.
    fn handle_response(&self, iq: Iq) {
        match self.listeners.remove(&iq.id) {
            Some((_, pending)) => pending.listener.receive_packet(iq),
            None => debug!(id = %iq.id, "No listener for IQ response"),
        }
    }

    /// No destination for `iq`. Requests are answered, responses dropped.
    pub async fn routing_failed(&self, session: Option<&Arc<Session>>, iq: Iq) {
        if !is_iq_request(&iq) {
            debug!(id = %iq.id, "Dropping unroutable IQ response");
            return;
        }

        let stanza = Stanza::Iq(iq);
        if self.core.is_server_address(stanza.from()) {
            if let Stanza::Iq(reply) =
                stanza.error_reply(StanzaErrorCondition::ServiceUnavailable, None)
            {
                self.handle_response(reply);
            }
            return;
        }
        self.core
            .deliver_error(&stanza, session, StanzaErrorCondition::ServiceUnavailable)
            .await;
    }
}

impl fmt::Debug for IqRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IqRouter")
            .field("handlers", &self.handlers.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Time out expired result listeners every `period`.
pub fn spawn_iq_listener_sweep(router: Arc<IqRouter>, period: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "IQ listener sweep started");

        loop {
            tokio::select! {
                _ = cancel_clone.cancelled() => {
                    info!("IQ listener sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let timed_out = router.sweep_expired(Instant::now());
                    if timed_out > 0 {
                        debug!(timed_out, "Expired IQ listeners");
                    }
                }
            }
        }
    });

    cancel
}

struct OneshotListener {
    sender: Mutex<Option<oneshot::Sender<Option<Iq>>>>,
}

impl OneshotListener {
    fn send(&self, answer: Option<Iq>) {
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = sender.send(answer);
        }
    }
}

impl IqResultListener for OneshotListener {
    fn receive_packet(&self, iq: Iq) {
        self.send(Some(iq));
    }

    fn answer_timeout(&self, _id: &str) {
        self.send(None);
    }
}

/// Message Carbons enable/disable (XEP-0280).
struct CarbonsHandler;

#[async_trait]
impl IqHandler for CarbonsHandler {
    fn namespace(&self) -> &str {
        CARBONS_NS
    }

    async fn handle(&self, session: Option<&Arc<Session>>, iq: Iq) -> Result<Option<Iq>, RouterError> {
        let Some(session) = session else {
            return Err(RouterError::service_unavailable(None));
        };
        let enable = if carbons::is_carbons_enable(&iq) {
            true
        } else if carbons::is_carbons_disable(&iq) {
            false
        } else {
            return Err(RouterError::bad_request(None));
        };

        session.set_carbons_enabled(enable);
        debug!(stream_id = %session.stream_id(), enable, "Carbons toggled");
        Ok(Some(result_reply(&iq)))
    }
}

/// XMPP Ping (XEP-0199).
struct PingHandler;

#[async_trait]
impl IqHandler for PingHandler {
    fn namespace(&self) -> &str {
        PING_NS
    }

    async fn handle(&self, _session: Option<&Arc<Session>>, iq: Iq) -> Result<Option<Iq>, RouterError> {
        match iq.payload {
            IqType::Get(_) => Ok(Some(result_reply(&iq))),
            _ => {
                warn!(id = %iq.id, "Ping that is not a get");
                Err(RouterError::bad_request(None))
            }
        }
    }
}
