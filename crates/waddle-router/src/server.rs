//! A running routing core: the stanza channel and the periodic sweeps.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::{ChannelHandler, ProcessingChannel};
use crate::context::ServerContext;
use crate::error::stream_errors;
use crate::router::{spawn_iq_listener_sweep, StanzaJob};
use crate::session::{
    spawn_detached_reaper, spawn_pre_auth_cleanup, spawn_server_idle_cleanup, Session,
};
use crate::stanza::Stanza;
use crate::RouterError;

/// Name of the channel carrying stanzas read from sessions.
pub const STANZA_CHANNEL: &str = "stanzas";

pub struct RoutingServer {
    context: Arc<ServerContext>,
    channel: Arc<ProcessingChannel<StanzaJob>>,
    background: Vec<CancellationToken>,
}

impl RoutingServer {
    /// Start the channel workers and background sweeps.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(context: Arc<ServerContext>) -> Self {
        let handler: Arc<dyn ChannelHandler<StanzaJob>> = context.router().clone();
        let channel = ProcessingChannel::new(STANZA_CHANNEL, context.config().channel.clone(), handler);
        channel.start();

        let sessions = Arc::clone(context.sessions());
        let background = vec![
            spawn_server_idle_cleanup(Arc::clone(&sessions)),
            spawn_pre_auth_cleanup(Arc::clone(&sessions)),
            spawn_detached_reaper(sessions),
            spawn_iq_listener_sweep(
                Arc::clone(context.router().iq_router()),
                context.config().iq_sweep_interval(),
            ),
        ];

        info!(domain = %context.config().domain, "Routing server started");
        Self {
            context,
            channel,
            background,
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn channel(&self) -> &Arc<ProcessingChannel<StanzaJob>> {
        &self.channel
    }

    /// Queue a stanza read from `session` for routing.
    pub fn submit(&self, session: Arc<Session>, stanza: Stanza) -> Result<(), RouterError> {
        self.channel.submit(StanzaJob { session, stanza })
    }

    /// Stop the sweeps, drain the channel and close every session.
    pub async fn shutdown(self) {
        for token in &self.background {
            token.cancel();
        }
        self.channel.shutdown().await;

        let sessions = self.context.arena().all();
        let closed = sessions.len();
        for session in sessions {
            self.context
                .sessions()
                .remove_session(&session, Some(stream_errors::SYSTEM_SHUTDOWN))
                .await;
        }
        info!(closed, "Routing server stopped");
    }
}
