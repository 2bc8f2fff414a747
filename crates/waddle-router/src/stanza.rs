//! Parsed stanza wrapper and the addressing helpers routers need.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::StanzaErrorCondition;

/// Namespace for XEP-0033 Extended Stanza Addressing (multicast).
pub const ADDRESS_NS: &str = "http://jabber.org/protocol/address";

/// Stanza type for metrics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
        }
    }
}

/// Parsed stanza types.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Get the stanza type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Get the stanza type.
    pub fn kind(&self) -> StanzaType {
        match self {
            Stanza::Message(_) => StanzaType::Message,
            Stanza::Presence(_) => StanzaType::Presence,
            Stanza::Iq(_) => StanzaType::Iq,
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    pub fn set_from(&mut self, from: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.from = from,
            Stanza::Presence(p) => p.from = from,
            Stanza::Iq(iq) => iq.from = from,
        }
    }

    pub fn set_to(&mut self, to: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.to = to,
            Stanza::Presence(p) => p.to = to,
            Stanza::Iq(iq) => iq.to = to,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
            Stanza::Iq(iq) => Some(iq.id.as_str()),
        }
    }

    /// Whether the stanza already carries an error.
    ///
    /// Such stanzas are never bounced again.
    pub fn is_error(&self) -> bool {
        match self {
            Stanza::Message(m) => m.type_ == MessageType::Error,
            Stanza::Presence(p) => p.type_ == PresenceType::Error,
            Stanza::Iq(iq) => matches!(iq.payload, IqType::Error(_)),
        }
    }

    /// Build an error reply with swapped addressing.
    pub fn error_reply(&self, condition: StanzaErrorCondition, text: Option<&str>) -> Stanza {
        match self {
            Stanza::Message(m) => Stanza::Message(message_error(m, condition, text)),
            Stanza::Presence(p) => Stanza::Presence(presence_error(p, condition, text)),
            Stanza::Iq(iq) => Stanza::Iq(iq_error(iq, condition, text)),
        }
    }

    /// Copy of this stanza with `from` and `to` swapped.
    ///
    /// Used to ask a sender's own session whether it would accept a stanza
    /// coming back from the recipient.
    pub fn reversed(&self) -> Stanza {
        let mut copy = self.clone();
        let from = self.to().cloned();
        let to = self.from().cloned();
        copy.set_from(from);
        copy.set_to(to);
        copy
    }

    /// Serialize the stanza to XML.
    pub fn to_xml(&self) -> String {
        let element: Element = self.clone().into();
        String::from(&element)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        match stanza {
            Stanza::Message(m) => m.into(),
            Stanza::Presence(p) => p.into(),
            Stanza::Iq(iq) => iq.into(),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

/// The child element of a get/set/result IQ.
pub fn iq_child(iq: &Iq) -> Option<&Element> {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => Some(elem),
        IqType::Result(elem) => elem.as_ref(),
        IqType::Error(_) => None,
    }
}

/// Whether the IQ expects an answer (type get or set).
pub fn is_iq_request(iq: &Iq) -> bool {
    matches!(iq.payload, IqType::Get(_) | IqType::Set(_))
}

/// Whether an IQ to the server carries XEP-0033 multicast instructions.
pub fn has_multicast_addresses(stanza: &Stanza) -> bool {
    let has = |payloads: &[Element]| {
        payloads
            .iter()
            .any(|p| p.name() == "addresses" && p.ns() == ADDRESS_NS)
    };
    match stanza {
        Stanza::Message(m) => has(&m.payloads),
        Stanza::Presence(p) => has(&p.payloads),
        Stanza::Iq(iq) => iq_child(iq)
            .map(|child| child.get_child("addresses", ADDRESS_NS).is_some())
            .unwrap_or(false),
    }
}

fn iq_error(iq: &Iq, condition: StanzaErrorCondition, text: Option<&str>) -> Iq {
    Iq {
        from: iq.to.clone(),
        to: iq.from.clone(),
        id: iq.id.clone(),
        payload: IqType::Error(condition.to_stanza_error(text)),
    }
}

fn message_error(message: &Message, condition: StanzaErrorCondition, text: Option<&str>) -> Message {
    let mut reply = message.clone();
    reply.from = message.to.clone();
    reply.to = message.from.clone();
    reply.type_ = MessageType::Error;
    reply.payloads.push(condition.to_stanza_error(text).into());
    reply
}

fn presence_error(
    presence: &Presence,
    condition: StanzaErrorCondition,
    text: Option<&str>,
) -> Presence {
    let mut reply = presence.clone();
    reply.from = presence.to.clone();
    reply.to = presence.from.clone();
    reply.type_ = PresenceType::Error;
    reply.payloads.push(condition.to_stanza_error(text).into());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_error_reply_swaps_addresses() {
        let mut message = Message::new(Some(jid("bob@waddle.social")));
        message.from = Some(jid("alice@waddle.social/phone"));
        message.type_ = MessageType::Chat;

        let reply = Stanza::Message(message).error_reply(StanzaErrorCondition::ServiceUnavailable, None);

        assert!(reply.is_error());
        assert_eq!(reply.to(), Some(&jid("alice@waddle.social/phone")));
        assert_eq!(reply.from(), Some(&jid("bob@waddle.social")));
    }

    #[test]
    fn test_iq_error_reply_keeps_id() {
        let iq = Iq {
            from: Some(jid("alice@waddle.social/phone")),
            to: Some(jid("waddle.social")),
            id: "q1".to_string(),
            payload: IqType::Get(Element::builder("query", "jabber:iq:version").build()),
        };

        let reply = Stanza::Iq(iq).error_reply(StanzaErrorCondition::FeatureNotImplemented, None);

        assert_eq!(reply.id(), Some("q1"));
        assert!(reply.is_error());
    }

    #[test]
    fn test_reversed() {
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some(jid("alice@waddle.social/phone"));
        presence.to = Some(jid("bob@example.com"));

        let reversed = Stanza::Presence(presence).reversed();
        assert_eq!(reversed.from(), Some(&jid("bob@example.com")));
        assert_eq!(reversed.to(), Some(&jid("alice@waddle.social/phone")));
    }

    #[test]
    fn test_multicast_detection() {
        let addresses = Element::builder("addresses", ADDRESS_NS).build();
        let query = Element::builder("query", "jabber:iq:private")
            .append(addresses)
            .build();
        let iq = Iq {
            from: None,
            to: Some(jid("waddle.social")),
            id: "m1".to_string(),
            payload: IqType::Set(query),
        };
        assert!(has_multicast_addresses(&Stanza::Iq(iq)));

        let plain = Message::new(Some(jid("waddle.social")));
        assert!(!has_multicast_addresses(&Stanza::Message(plain)));
    }
}
