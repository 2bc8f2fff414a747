//! Periodic session sweeps.
//!
//! Each sweep runs as its own task and stops when the returned
//! [`CancellationToken`] is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SessionManager;

/// Close server sessions idle past the configured timeout.
pub fn spawn_server_idle_cleanup(manager: Arc<SessionManager>) -> CancellationToken {
    let period = Duration::from_secs(manager.config().server_cleanup_interval_secs.max(1));
    spawn_sweep("server idle cleanup", period, move || {
        let manager = Arc::clone(&manager);
        async move { manager.close_idle_server_sessions(Instant::now()).await }
    })
}

/// Close connections that never authenticated in time.
pub fn spawn_pre_auth_cleanup(manager: Arc<SessionManager>) -> CancellationToken {
    let period = Duration::from_secs(manager.config().pre_auth_cleanup_interval_secs.max(1));
    spawn_sweep("pre-auth cleanup", period, move || {
        let manager = Arc::clone(&manager);
        async move { manager.close_stale_pre_auth_sessions(Instant::now()).await }
    })
}

/// End detached sessions whose resumption window passed.
pub fn spawn_detached_reaper(manager: Arc<SessionManager>) -> CancellationToken {
    let period = manager.config().detached_cleanup_period();
    spawn_sweep("detached session reaper", period, move || {
        let manager = Arc::clone(&manager);
        async move { manager.reap_detached_sessions(Instant::now()).await }
    })
}

fn spawn_sweep<F, Fut>(name: &'static str, period: Duration, mut sweep: F) -> CancellationToken
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = usize> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(task = name, interval_secs = period.as_secs(), "Session sweep started");
        loop {
            tokio::select! {
                _ = cancel_clone.cancelled() => {
                    info!(task = name, "Session sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let closed = sweep().await;
                    if closed > 0 {
                        info!(task = name, closed, "Session sweep closed sessions");
                    } else {
                        debug!(task = name, "Session sweep found nothing to close");
                    }
                }
            }
        }
    });

    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StandaloneCluster;
    use crate::config::{RouterConfig, SessionConfig};
    use crate::connection::ChannelConnection;
    use crate::policy::DisabledOfflineStore;
    use crate::routing::{RoutingCaches, RoutingTable};
    use crate::session::{SessionArena, SessionCaches, SessionKind};

    #[tokio::test(start_paused = true)]
    async fn test_pre_auth_sweep_closes_stale_connections() {
        let sessions = SessionConfig {
            pre_auth_timeout_secs: 5,
            pre_auth_cleanup_interval_secs: 1,
            ..Default::default()
        };
        let config = RouterConfig::new("waddle.social").with_sessions(sessions);
        let arena = Arc::new(SessionArena::new());
        let routing = Arc::new(RoutingTable::new(
            "waddle.social",
            Arc::new(StandaloneCluster::default()),
            RoutingCaches::local(),
            Arc::clone(&arena),
        ));
        let manager = SessionManager::new(
            &config,
            arena,
            routing,
            SessionCaches::local(),
            Arc::new(DisabledOfflineStore),
        );

        let (conn, _rx) = ChannelConnection::new(8, true);
        let session = manager.create_session(SessionKind::Client, conn);

        let cancel = spawn_pre_auth_cleanup(Arc::clone(&manager));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(session.is_closed());
        assert_eq!(manager.pre_auth_count(), 0);

        cancel.cancel();
    }
}
