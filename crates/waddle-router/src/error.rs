//! Error types for the routing core.

use thiserror::Error;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// Errors raised by the routing core.
///
/// Protocol-level failures (unknown recipient, blocked stanza, ...) are
/// answered with error stanzas and never show up here; this type covers
/// malformed input, refused topology changes and internal faults.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The stanza or address cannot be processed at all
    #[error("Malformed stanza: {0}")]
    Malformed(String),

    /// No session is registered under the given key
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session is closed and can no longer be routed to
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// A route is owned by another cluster node and cannot be changed here
    #[error("Route {route} is owned by node {node}")]
    RouteOwnedElsewhere {
        /// The route that was refused
        route: String,
        /// The owning node
        node: String,
    },

    /// Resource conflict on bind
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// A handler is already registered for a namespace
    #[error("Handler already registered for namespace {0}")]
    HandlerExists(String),

    /// Cluster transport failure
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// The processing channel no longer accepts work
    #[error("Channel {0} is stopped")]
    ChannelStopped(String),

    /// A wait for an answer expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (answered to the sender as an error stanza)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl RouterError {
    /// Create a malformed-input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a cluster error.
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for the given condition, using its default type.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The error type RFC 6120 associates with this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::NotAuthorized | Self::Forbidden | Self::RegistrationRequired
            | Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable
            | Self::PolicyViolation => StanzaErrorType::Modify,
            Self::InternalServerError | Self::RecipientUnavailable
            | Self::RemoteServerTimeout | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }

    /// Map to the `xmpp-parsers` condition.
    pub fn to_defined(&self) -> DefinedCondition {
        match self {
            Self::BadRequest => DefinedCondition::BadRequest,
            Self::Conflict => DefinedCondition::Conflict,
            Self::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
            Self::Forbidden => DefinedCondition::Forbidden,
            Self::InternalServerError => DefinedCondition::InternalServerError,
            Self::ItemNotFound => DefinedCondition::ItemNotFound,
            Self::JidMalformed => DefinedCondition::JidMalformed,
            Self::NotAcceptable => DefinedCondition::NotAcceptable,
            Self::NotAllowed => DefinedCondition::NotAllowed,
            Self::NotAuthorized => DefinedCondition::NotAuthorized,
            Self::PolicyViolation => DefinedCondition::PolicyViolation,
            Self::RecipientUnavailable => DefinedCondition::RecipientUnavailable,
            Self::RegistrationRequired => DefinedCondition::RegistrationRequired,
            Self::RemoteServerNotFound => DefinedCondition::RemoteServerNotFound,
            Self::RemoteServerTimeout => DefinedCondition::RemoteServerTimeout,
            Self::ResourceConstraint => DefinedCondition::ResourceConstraint,
            Self::ServiceUnavailable => DefinedCondition::ServiceUnavailable,
            Self::SubscriptionRequired => DefinedCondition::SubscriptionRequired,
            Self::UndefinedCondition => DefinedCondition::UndefinedCondition,
            Self::UnexpectedRequest => DefinedCondition::UnexpectedRequest,
        }
    }

    /// Build the `xmpp-parsers` error payload for this condition.
    pub fn to_stanza_error(&self, text: Option<&str>) -> StanzaError {
        StanzaError::new(
            self.default_type().to_error_type(),
            self.to_defined(),
            "en",
            text.unwrap_or_default(),
        )
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    fn to_error_type(self) -> ErrorType {
        match self {
            Self::Auth => ErrorType::Auth,
            Self::Cancel => ErrorType::Cancel,
            Self::Modify => ErrorType::Modify,
            Self::Wait => ErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>",
        condition
    );

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='urn:ietf:params:xml:ns:xmpp-streams' xml:lang='en'>{}</text>",
            t
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions used by the routing core.
pub mod stream_errors {
    /// Stream error: conflict (resource bound by a newer session)
    pub const CONFLICT: &str = "conflict";
    /// Stream error: connection timeout
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// Stream error: internal server error
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_generation() {
        let error = generate_stream_error(
            stream_errors::NOT_AUTHORIZED,
            Some("Stanza sent before resource binding"),
        );

        assert!(error.contains("<stream:error>"));
        assert!(error.contains("<not-authorized"));
        assert!(error.contains("Stanza sent before resource binding"));
        assert!(error.ends_with("</stream:stream>"));
    }

    #[test]
    fn test_default_error_types() {
        assert_eq!(
            StanzaErrorCondition::ServiceUnavailable.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(
            StanzaErrorCondition::NotAuthorized.default_type(),
            StanzaErrorType::Auth
        );
        assert_eq!(
            StanzaErrorCondition::NotAcceptable.default_type(),
            StanzaErrorType::Modify
        );
        assert_eq!(
            StanzaErrorCondition::InternalServerError.default_type(),
            StanzaErrorType::Wait
        );
    }

    #[test]
    fn test_stanza_error_takes_default_type() {
        let err = RouterError::service_unavailable(Some("offline".to_string()));
        assert!(matches!(
            err,
            RouterError::Stanza {
                condition: StanzaErrorCondition::ServiceUnavailable,
                error_type: StanzaErrorType::Cancel,
                text: Some(_),
            }
        ));
        assert_eq!(err.to_string(), "Stanza error: service-unavailable");
    }
}
