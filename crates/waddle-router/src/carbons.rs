//! Message Carbons (XEP-0280).
//!
//! Clients enable carbons per session. A chat message sent from one
//! resource is mirrored to the sender's other carbons-enabled resources as a
//! `<sent/>` copy, and a chat message delivered to one resource is mirrored
//! to the recipient's other carbons-enabled resources as a `<received/>`
//! copy. Copies are never copied again.

use chrono::Utc;
use jid::{FullJid, Jid};
use minidom::Element;
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};

/// Namespace for XEP-0280 Message Carbons.
pub const CARBONS_NS: &str = "urn:xmpp:carbons:2";

/// Namespace for XEP-0297 Stanza Forwarding.
pub const FORWARDED_NS: &str = "urn:xmpp:forward:0";

/// Namespace for XEP-0203 Delayed Delivery.
pub const DELAY_NS: &str = "urn:xmpp:delay";

/// Namespace for XEP-0334 Message Processing Hints.
pub const HINTS_NS: &str = "urn:xmpp:hints";

/// Direction of a carbon copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    /// Copy of a message the user sent
    Sent,
    /// Copy of a message the user received
    Received,
}

impl CarbonDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            CarbonDirection::Sent => "sent",
            CarbonDirection::Received => "received",
        }
    }
}

/// Check if an IQ is a carbons enable request.
pub fn is_carbons_enable(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Set(elem) => elem.name() == "enable" && elem.ns() == CARBONS_NS,
        _ => false,
    }
}

/// Check if an IQ is a carbons disable request.
pub fn is_carbons_disable(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Set(elem) => elem.name() == "disable" && elem.ns() == CARBONS_NS,
        _ => false,
    }
}

/// Whether the message carries the `<private/>` hint.
pub fn is_private(msg: &Message) -> bool {
    msg.payloads
        .iter()
        .any(|p| p.name() == "private" && p.ns() == CARBONS_NS)
}

/// Whether the message already is a carbon copy.
pub fn is_carbon(msg: &Message) -> bool {
    msg.payloads
        .iter()
        .any(|p| (p.name() == "sent" || p.name() == "received") && p.ns() == CARBONS_NS)
}

/// Remove the `<private/>` hint before the message reaches a client.
pub fn strip_private(msg: &mut Message) {
    msg.payloads
        .retain(|p| !(p.name() == "private" && p.ns() == CARBONS_NS));
}

/// Check if a message should be mirrored to other resources.
///
/// Only `chat` messages qualify. Messages with `<private/>` or a
/// `<no-copy/>` hint are excluded, and so are carbons themselves.
pub fn should_copy_message(msg: &Message) -> bool {
    if msg.type_ != MessageType::Chat {
        return false;
    }

    if msg
        .payloads
        .iter()
        .any(|p| p.name() == "no-copy" && p.ns() == HINTS_NS)
    {
        debug!("Message has <no-copy/> hint, skipping carbon");
        return false;
    }

    if is_private(msg) {
        debug!("Message has <private/> element, skipping carbon");
        return false;
    }

    !is_carbon(msg)
}

/// Build a carbon copy of `original` addressed to one resource of the owner.
///
/// The wrapper is sent from the owner's bare JID:
/// ```xml
/// <message from='user@domain' to='user@domain/otherresource' type='chat'>
///   <sent xmlns='urn:xmpp:carbons:2'>
///     <forwarded xmlns='urn:xmpp:forward:0'>
///       <delay xmlns='urn:xmpp:delay' stamp='...'/>
///       <message ...>original message</message>
///     </forwarded>
///   </sent>
/// </message>
/// ```
pub fn build_carbon(original: &Message, direction: CarbonDirection, to: &FullJid) -> Message {
    let wrapper = Element::builder(direction.as_str(), CARBONS_NS)
        .append(build_forwarded_element(original))
        .build();

    let mut carbon = Message::new(Some(Jid::from(to.clone())));
    carbon.from = Some(Jid::from(to.to_bare()));
    carbon.type_ = original.type_.clone();
    carbon.payloads.push(wrapper);
    carbon
}

fn build_forwarded_element(original: &Message) -> Element {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let delay = Element::builder("delay", DELAY_NS)
        .attr("stamp", timestamp)
        .build();

    let msg_element: Element = original.clone().into();

    Element::builder("forwarded", FORWARDED_NS)
        .append(delay)
        .append(msg_element)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::message::Body;

    fn chat(to: &str) -> Message {
        let mut msg = Message::new(Some(to.parse().unwrap()));
        msg.type_ = MessageType::Chat;
        msg.bodies.insert(String::new(), Body("Hello".to_string()));
        msg
    }

    #[test]
    fn test_is_carbons_enable() {
        let iq = Iq {
            from: None,
            to: None,
            id: "enable-1".to_string(),
            payload: IqType::Set(Element::builder("enable", CARBONS_NS).build()),
        };
        assert!(is_carbons_enable(&iq));
        assert!(!is_carbons_disable(&iq));
    }

    #[test]
    fn test_enable_as_get_is_ignored() {
        let iq = Iq {
            from: None,
            to: None,
            id: "enable-1".to_string(),
            payload: IqType::Get(Element::builder("enable", CARBONS_NS).build()),
        };
        assert!(!is_carbons_enable(&iq));
    }

    #[test]
    fn test_should_copy_message() {
        assert!(should_copy_message(&chat("bob@waddle.social")));

        let mut groupchat = chat("room@muc.waddle.social");
        groupchat.type_ = MessageType::Groupchat;
        assert!(!should_copy_message(&groupchat));

        let mut private = chat("bob@waddle.social");
        private.payloads.push(Element::builder("private", CARBONS_NS).build());
        assert!(!should_copy_message(&private));

        let mut no_copy = chat("bob@waddle.social");
        no_copy.payloads.push(Element::builder("no-copy", HINTS_NS).build());
        assert!(!should_copy_message(&no_copy));
    }

    #[test]
    fn test_carbons_are_not_copied_again() {
        let original = chat("bob@waddle.social");
        let to: FullJid = "alice@waddle.social/desktop".parse().unwrap();
        let carbon = build_carbon(&original, CarbonDirection::Sent, &to);

        assert!(is_carbon(&carbon));
        assert!(!should_copy_message(&carbon));
    }

    #[test]
    fn test_build_received_carbon() {
        let mut original = chat("alice@waddle.social/phone");
        original.from = Some("bob@waddle.social/laptop".parse().unwrap());
        let to: FullJid = "alice@waddle.social/desktop".parse().unwrap();

        let carbon = build_carbon(&original, CarbonDirection::Received, &to);

        assert_eq!(carbon.to, Some(Jid::from(to.clone())));
        assert_eq!(carbon.from, Some(Jid::from(to.to_bare())));
        let received = carbon
            .payloads
            .iter()
            .find(|p| p.name() == "received" && p.ns() == CARBONS_NS)
            .unwrap();
        assert!(received
            .children()
            .any(|c| c.name() == "forwarded" && c.ns() == FORWARDED_NS));
    }

    #[test]
    fn test_strip_private() {
        let mut msg = chat("bob@waddle.social");
        msg.payloads.push(Element::builder("private", CARBONS_NS).build());
        strip_private(&mut msg);
        assert!(!is_private(&msg));
    }
}
