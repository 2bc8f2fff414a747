//! Configuration for the routing core.
//!
//! Every type deserializes with defaults for missing keys so the host can
//! layer a partial TOML file and environment overrides on top of them.

use std::time::Duration;

use jid::BareJid;
use serde::{Deserialize, Serialize};

use crate::RouterError;

/// Default detach timeout for resumable sessions (10 minutes)
pub const DEFAULT_DETACH_TIMEOUT_SECS: u64 = 600;

/// Default idle timeout for server-to-server sessions (10 minutes)
pub const DEFAULT_SERVER_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default time a connection may stay unauthenticated (5 minutes)
pub const DEFAULT_PRE_AUTH_TIMEOUT_SECS: u64 = 300;

/// Default IQ result listener timeout (1 minute)
pub const DEFAULT_IQ_RESULT_TIMEOUT_SECS: u64 = 60;

/// What to do with a message the offline store refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Silently discard it
    #[default]
    Drop,
    /// Answer the sender with service-unavailable
    Bounce,
}

/// Session lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a detached session waits for resumption
    pub detach_timeout_secs: u64,
    /// Idle time after which server sessions are closed
    pub server_idle_timeout_secs: u64,
    /// How often idle server sessions are looked for
    pub server_cleanup_interval_secs: u64,
    /// How long a connection may stay unauthenticated
    pub pre_auth_timeout_secs: u64,
    /// How often stale pre-authenticated sessions are looked for
    pub pre_auth_cleanup_interval_secs: u64,
    /// Stanzas buffered for a detached session before older ones are dropped
    pub max_detached_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detach_timeout_secs: DEFAULT_DETACH_TIMEOUT_SECS,
            server_idle_timeout_secs: DEFAULT_SERVER_IDLE_TIMEOUT_SECS,
            server_cleanup_interval_secs: 60,
            pre_auth_timeout_secs: DEFAULT_PRE_AUTH_TIMEOUT_SECS,
            pre_auth_cleanup_interval_secs: 60,
            max_detached_backlog: 500,
        }
    }
}

impl SessionConfig {
    pub fn detach_timeout(&self) -> Duration {
        Duration::from_secs(self.detach_timeout_secs)
    }

    pub fn server_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server_idle_timeout_secs)
    }

    pub fn pre_auth_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_auth_timeout_secs)
    }

    /// Period of the detached-session reaper.
    ///
    /// A tenth of the detach timeout when that timeout lies between one
    /// minute and one hour, three minutes otherwise.
    pub fn detached_cleanup_period(&self) -> Duration {
        let max = self.detach_timeout();
        if max >= Duration::from_secs(60) && max <= Duration::from_secs(3600) {
            max / 10
        } else {
            Duration::from_secs(180)
        }
    }
}

/// Worker pool bounds of a processing channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Workers kept alive even when idle
    pub min_workers: usize,
    /// Upper bound on concurrent workers
    pub max_workers: usize,
    /// Idle time after which a worker above the minimum exits
    pub keep_alive_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 32,
            keep_alive_secs: 60,
        }
    }
}

impl ChannelConfig {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Configuration for the routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// The XMPP domain served by this server
    pub domain: String,
    /// Whether stanzas for unknown remote domains may be handed to the dialer
    pub federation_enabled: bool,
    /// Forward messages addressed to the server domain to the admins
    pub forward_to_admins: bool,
    /// Server administrators
    pub admins: Vec<BareJid>,
    /// Deliver bare-JID messages to every highest-priority resource
    pub route_all_resources: bool,
    /// Fate of messages the offline store refused
    pub offline_policy: OfflinePolicy,
    /// Conflicting binds tolerated before the old session is kicked (-1: never kick)
    pub conflict_limit: i32,
    /// How long server-originated IQs wait for an answer
    pub iq_result_timeout_secs: u64,
    /// How often expired IQ result listeners are swept
    pub iq_sweep_interval_secs: u64,
    /// Session lifecycle timing
    pub sessions: SessionConfig,
    /// Stanza processing channel bounds
    pub channel: ChannelConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            federation_enabled: false,
            forward_to_admins: false,
            admins: Vec::new(),
            route_all_resources: false,
            offline_policy: OfflinePolicy::default(),
            conflict_limit: 0,
            iq_result_timeout_secs: DEFAULT_IQ_RESULT_TIMEOUT_SECS,
            iq_sweep_interval_secs: 5,
            sessions: SessionConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Create a new router configuration.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Enable S2S federation.
    pub fn with_federation(mut self, enabled: bool) -> Self {
        self.federation_enabled = enabled;
        self
    }

    /// Set the server administrators.
    pub fn with_admins(mut self, admins: Vec<BareJid>) -> Self {
        self.admins = admins;
        self
    }

    /// Forward messages sent to the server domain to the admins.
    pub fn with_forward_to_admins(mut self, enabled: bool) -> Self {
        self.forward_to_admins = enabled;
        self
    }

    pub fn with_route_all_resources(mut self, enabled: bool) -> Self {
        self.route_all_resources = enabled;
        self
    }

    pub fn with_offline_policy(mut self, policy: OfflinePolicy) -> Self {
        self.offline_policy = policy;
        self
    }

    pub fn with_conflict_limit(mut self, limit: i32) -> Self {
        self.conflict_limit = limit;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionConfig) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn iq_result_timeout(&self) -> Duration {
        Duration::from_secs(self.iq_result_timeout_secs)
    }

    pub fn iq_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.iq_sweep_interval_secs.max(1))
    }

    /// Check the configuration for values the core cannot run with.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.domain.parse::<BareJid>().is_err() || self.domain.contains('@') {
            return Err(RouterError::config(format!(
                "domain '{}' is not a valid XMPP domain",
                self.domain
            )));
        }
        if self.channel.max_workers == 0 {
            return Err(RouterError::config("channel.max_workers must be at least 1"));
        }
        if self.channel.min_workers > self.channel.max_workers {
            return Err(RouterError::config(
                "channel.min_workers must not exceed channel.max_workers",
            ));
        }
        if self.conflict_limit < -1 {
            return Err(RouterError::config("conflict_limit must be -1 or greater"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_config_builder() {
        let config = RouterConfig::new("waddle.social")
            .with_federation(true)
            .with_conflict_limit(-1)
            .with_offline_policy(OfflinePolicy::Bounce);

        assert_eq!(config.domain, "waddle.social");
        assert!(config.federation_enabled);
        assert_eq!(config.conflict_limit, -1);
        assert_eq!(config.offline_policy, OfflinePolicy::Bounce);
        assert_eq!(config.iq_result_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RouterConfig::new("alice@waddle.social").validate().is_err());
        assert!(RouterConfig::new("waddle.social")
            .with_channel(ChannelConfig::new(8, 2))
            .validate()
            .is_err());
        assert!(RouterConfig::new("waddle.social")
            .with_conflict_limit(-5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_detached_cleanup_period() {
        let mut sessions = SessionConfig::default();
        assert_eq!(sessions.detached_cleanup_period(), Duration::from_secs(60));

        sessions.detach_timeout_secs = 30;
        assert_eq!(sessions.detached_cleanup_period(), Duration::from_secs(180));

        sessions.detach_timeout_secs = 7200;
        assert_eq!(sessions.detached_cleanup_period(), Duration::from_secs(180));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RouterConfig = serde_json::from_str(
            r#"{"domain": "waddle.social", "offline_policy": "bounce", "sessions": {"detach_timeout_secs": 120}}"#,
        )
        .unwrap();

        assert_eq!(config.domain, "waddle.social");
        assert_eq!(config.offline_policy, OfflinePolicy::Bounce);
        assert_eq!(config.sessions.detach_timeout_secs, 120);
        assert_eq!(config.sessions.pre_auth_timeout_secs, DEFAULT_PRE_AUTH_TIMEOUT_SECS);
        assert_eq!(config.channel.max_workers, 32);
    }
}
