//! The transport endpoint a session writes to.
//!
//! Wire-level concerns (XML framing, TLS, compression) live outside the
//! routing core. A session only sees a [`Connection`]: something that takes
//! parsed stanzas or raw text, can be closed, and tells interested parties
//! when it goes away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::StreamId;
use crate::stanza::Stanza;

/// Result of attempting to hand a stanza to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The stanza was queued for delivery
    Sent,
    /// There is no connection to write to
    NotConnected,
    /// The outbound channel is full (backpressure)
    ChannelFull,
    /// The outbound channel is closed
    ChannelClosed,
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// Notified once when a connection closes.
pub trait CloseListener: Send + Sync {
    /// Called with the handback registered alongside the listener.
    fn on_close(&self, handback: &StreamId);
}

/// A transport endpoint owned by one session.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Queue a parsed stanza for delivery.
    fn deliver(&self, stanza: Stanza) -> SendResult;

    /// Queue raw XML (stream errors, stream close tags).
    fn deliver_raw_text(&self, text: &str) -> SendResult;

    /// Close the connection and notify the close listeners.
    ///
    /// Closing twice is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Whether the transport is encrypted.
    fn is_secure(&self) -> bool;

    /// Register a listener invoked with `handback` when the connection closes.
    fn register_close_listener(&self, listener: Arc<dyn CloseListener>, handback: StreamId);
}

/// An item written to the outbound channel of a [`ChannelConnection`].
#[derive(Debug, Clone)]
pub enum OutboundStanza {
    /// A parsed stanza to serialize
    Stanza(Stanza),
    /// Raw text to write as-is
    RawText(String),
    /// The writer should flush and shut the socket
    Close,
}

/// Listeners registered on a connection, fired once on close.
#[derive(Default)]
pub struct CloseListeners {
    listeners: Mutex<Vec<(Arc<dyn CloseListener>, StreamId)>>,
}

impl CloseListeners {
    pub fn register(&self, listener: Arc<dyn CloseListener>, handback: StreamId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((listener, handback));
    }

    /// Take every listener and notify it.
    pub fn fire(&self) {
        let listeners = std::mem::take(
            &mut *self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (listener, handback) in listeners {
            listener.on_close(&handback);
        }
    }
}

/// A connection backed by a bounded mpsc channel.
///
/// The socket writer task owns the receiving half and turns
/// [`OutboundStanza`] items into bytes.
pub struct ChannelConnection {
    sender: mpsc::Sender<OutboundStanza>,
    secure: bool,
    closed: AtomicBool,
    listeners: CloseListeners,
}

impl ChannelConnection {
    /// Create a connection and the receiver its writer task drains.
    pub fn new(capacity: usize, secure: bool) -> (Arc<Self>, mpsc::Receiver<OutboundStanza>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let connection = Arc::new(Self {
            sender,
            secure,
            closed: AtomicBool::new(false),
            listeners: CloseListeners::default(),
        });
        (connection, receiver)
    }

    fn send(&self, item: OutboundStanza) -> SendResult {
        if self.closed.load(Ordering::Acquire) {
            return SendResult::ChannelClosed;
        }

        match self.sender.try_send(item) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, connection may have dropped");
                SendResult::ChannelClosed
            }
        }
    }
}

impl Connection for ChannelConnection {
    fn deliver(&self, stanza: Stanza) -> SendResult {
        self.send(OutboundStanza::Stanza(stanza))
    }

    fn deliver_raw_text(&self, text: &str) -> SendResult {
        self.send(OutboundStanza::RawText(text.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.try_send(OutboundStanza::Close);
        self.listeners.fire();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn register_close_listener(&self, listener: Arc<dyn CloseListener>, handback: StreamId) {
        self.listeners.register(listener, handback);
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("secure", &self.secure)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use xmpp_parsers::message::{Message, MessageType};

    fn make_test_message(to: &str) -> Stanza {
        let mut msg = Message::new(Some(to.parse().unwrap()));
        msg.type_ = MessageType::Chat;
        Stanza::Message(msg)
    }

    struct CountingListener(AtomicUsize);

    impl CloseListener for CountingListener {
        fn on_close(&self, _handback: &StreamId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_deliver_queues_stanza() {
        let (conn, mut rx) = ChannelConnection::new(16, true);

        let result = conn.deliver(make_test_message("alice@waddle.social"));
        assert_eq!(result, SendResult::Sent);
        assert!(matches!(rx.recv().await, Some(OutboundStanza::Stanza(_))));
        assert!(conn.is_secure());
    }

    #[test]
    fn test_deliver_to_full_channel() {
        let (conn, _rx) = ChannelConnection::new(1, false);

        let _ = conn.deliver(make_test_message("alice@waddle.social"));
        let result = conn.deliver(make_test_message("alice@waddle.social"));
        assert_eq!(result, SendResult::ChannelFull);
    }

    #[test]
    fn test_deliver_to_dropped_receiver() {
        let (conn, rx) = ChannelConnection::new(16, false);
        drop(rx);

        let result = conn.deliver(make_test_message("alice@waddle.social"));
        assert_eq!(result, SendResult::ChannelClosed);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_close_notifies_listeners_once() {
        let (conn, _rx) = ChannelConnection::new(16, false);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        conn.register_close_listener(listener.clone(), StreamId::generate());

        conn.close();
        conn.close();

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert_eq!(
            conn.deliver(make_test_message("alice@waddle.social")),
            SendResult::ChannelClosed
        );
    }
}
