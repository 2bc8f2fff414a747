//! Packet interceptors.
//!
//! Interceptors see every stanza twice: before the router acts on it
//! (`processed == false`), where a rejection stops processing, and after
//! (`processed == true`), where the stanza has already been handled and a
//! rejection is only logged.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::metrics;
use crate::session::Session;
use crate::stanza::Stanza;

/// Veto returned by an interceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rejected {
    /// Explanation sent to the sender in a follow-up message
    pub reason: Option<String>,
}

impl Rejected {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "rejected: {reason}"),
            None => f.write_str("rejected"),
        }
    }
}

/// Inspects stanzas flowing through the routers.
pub trait PacketInterceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "interceptor"
    }

    fn intercept(
        &self,
        stanza: &Stanza,
        session: Option<&Session>,
        incoming: bool,
        processed: bool,
    ) -> Result<(), Rejected>;
}

/// Ordered interceptor chain.
#[derive(Default)]
pub struct InterceptorManager {
    interceptors: RwLock<Vec<Arc<dyn PacketInterceptor>>>,
}

impl InterceptorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor to the chain.
    pub fn add_interceptor(&self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Remove an interceptor. Returns whether it was registered.
    pub fn remove_interceptor(&self, interceptor: &Arc<dyn PacketInterceptor>) -> bool {
        let mut interceptors = self
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = interceptors.len();
        interceptors.retain(|existing| !Arc::ptr_eq(existing, interceptor));
        interceptors.len() != before
    }

    pub fn len(&self) -> usize {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain in order; the first rejection stops it.
    pub fn invoke(
        &self,
        stanza: &Stanza,
        session: Option<&Session>,
        incoming: bool,
        processed: bool,
    ) -> Result<(), Rejected> {
        let chain: Vec<Arc<dyn PacketInterceptor>> = self
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for interceptor in chain {
            if let Err(rejected) = interceptor.intercept(stanza, session, incoming, processed) {
                debug!(
                    interceptor = interceptor.name(),
                    stanza = stanza.name(),
                    processed,
                    "Stanza rejected by interceptor"
                );
                metrics::record_interceptor_rejection(stanza.name(), processed);
                return Err(rejected);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for InterceptorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorManager")
            .field("interceptor_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xmpp_parsers::message::Message;

    struct Counting(AtomicUsize);

    impl PacketInterceptor for Counting {
        fn intercept(&self, _: &Stanza, _: Option<&Session>, _: bool, _: bool) -> Result<(), Rejected> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectAll;

    impl PacketInterceptor for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }

        fn intercept(&self, _: &Stanza, _: Option<&Session>, _: bool, _: bool) -> Result<(), Rejected> {
            Err(Rejected::with_reason("no"))
        }
    }

    fn stanza() -> Stanza {
        Stanza::Message(Message::new(Some("alice@waddle.social".parse().unwrap())))
    }

    #[test]
    fn test_rejection_stops_chain() {
        let manager = InterceptorManager::new();
        let before = Arc::new(Counting(AtomicUsize::new(0)));
        let after = Arc::new(Counting(AtomicUsize::new(0)));
        manager.add_interceptor(before.clone());
        manager.add_interceptor(Arc::new(RejectAll));
        manager.add_interceptor(after.clone());

        let result = manager.invoke(&stanza(), None, true, false);

        assert_eq!(result, Err(Rejected::with_reason("no")));
        assert_eq!(before.0.load(Ordering::SeqCst), 1);
        assert_eq!(after.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_interceptor() {
        let manager = InterceptorManager::new();
        let reject: Arc<dyn PacketInterceptor> = Arc::new(RejectAll);
        manager.add_interceptor(Arc::clone(&reject));
        assert_eq!(manager.len(), 1);

        assert!(manager.remove_interceptor(&reject));
        assert!(manager.is_empty());
        assert!(manager.invoke(&stanza(), None, true, false).is_ok());
    }
}
