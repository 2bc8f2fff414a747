//! Routing table behavior through a full context.

mod common;

use common::*;
use waddle_router::connection::Connection;
use waddle_router::{DomainPair, RouterConfig, RouterError, RoutingResult, SessionKind};
use xmpp_parsers::message::MessageType;

#[tokio::test]
async fn test_bare_jid_routes_follow_binding_order() {
    let (ctx, _) = context();
    let _phone = online_client(&ctx, "alice@waddle.social/phone").await;
    let _desktop = online_client(&ctx, "alice@waddle.social/desktop").await;

    let routes = ctx.routing().get_routes(&jid("alice@waddle.social"), None);
    assert_eq!(
        routes,
        vec![
            jid("alice@waddle.social/phone"),
            jid("alice@waddle.social/desktop")
        ]
    );

    assert!(ctx
        .routing()
        .remove_client_route(&full("alice@waddle.social/phone")));
    let routes = ctx.routing().get_routes(&jid("alice@waddle.social"), None);
    assert_eq!(routes, vec![jid("alice@waddle.social/desktop")]);
}

#[tokio::test]
async fn test_last_route_for_a_jid_wins() {
    let (ctx, _) = context();
    let first = ctx
        .sessions()
        .create_session(SessionKind::Client, RecordingConnection::new());
    let second = ctx
        .sessions()
        .create_session(SessionKind::Client, RecordingConnection::new());
    let target = full("alice@waddle.social/phone");

    assert!(ctx.routing().add_client_route(&target, &first).unwrap());
    assert!(!ctx.routing().add_client_route(&target, &second).unwrap());

    let owner = ctx.routing().get_client_route(&target).unwrap();
    assert_eq!(owner.stream_id(), second.stream_id());
    assert_eq!(ctx.routing().user_routes(&bare("alice@waddle.social")).len(), 1);
}

#[tokio::test]
async fn test_add_then_remove_leaves_no_route() {
    let (ctx, _) = context();
    let session = ctx
        .sessions()
        .create_session(SessionKind::Client, RecordingConnection::new());
    let target = full("alice@waddle.social/phone");

    ctx.routing().add_client_route(&target, &session).unwrap();
    assert!(ctx.routing().has_client_route(&target));
    assert!(ctx.routing().is_local_route(&jid("alice@waddle.social/phone")));

    assert!(ctx.routing().remove_client_route(&target));
    assert!(!ctx.routing().has_client_route(&target));
    assert!(ctx.routing().get_client_route(&target).is_none());
    assert!(ctx
        .routing()
        .user_routes(&bare("alice@waddle.social"))
        .is_empty());
}

#[tokio::test]
async fn test_closed_session_cannot_be_routed() {
    let (ctx, _) = context();
    let conn = RecordingConnection::new();
    let session = ctx
        .sessions()
        .create_session(SessionKind::Client, conn.clone());
    session.close(None);

    let result = ctx
        .routing()
        .add_client_route(&full("alice@waddle.social/phone"), &session);
    assert!(matches!(result, Err(RouterError::SessionClosed(_))));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_unavailable_resource_is_visible_through_directed_presence() {
    let (ctx, _) = context();
    let alice = bound_client(&ctx, "alice@waddle.social/phone").await;
    let bob = jid("bob@waddle.social/laptop");

    assert!(ctx
        .routing()
        .get_routes(&jid("alice@waddle.social"), Some(&bob))
        .is_empty());

    ctx.routing()
        .directed_presences()
        .add(alice.jid.clone(), jid("bob@waddle.social"));

    assert_eq!(
        ctx.routing()
            .get_routes(&jid("alice@waddle.social"), Some(&bob)),
        vec![jid("alice@waddle.social/phone")]
    );
    assert!(ctx
        .routing()
        .get_routes(&jid("alice@waddle.social"), None)
        .is_empty());
}

#[tokio::test]
async fn test_anonymous_routes_are_kept_apart() {
    let (ctx, _) = context();
    let conn = RecordingConnection::new();
    let session = ctx
        .sessions()
        .create_session(SessionKind::Client, conn);
    let guest = full("guest-1@waddle.social/web");
    ctx.sessions().bind(&session, guest.clone(), true).await.unwrap();

    assert!(ctx.routing().is_anonymous_route(&guest));
    assert!(ctx.routing().has_client_route(&guest));
}

#[tokio::test]
async fn test_component_route_delivers_to_component_session() {
    let (ctx, _) = context();
    let conn = RecordingConnection::new();
    let component = ctx
        .sessions()
        .create_session(SessionKind::Component, conn.clone());
    ctx.sessions()
        .register_component_session("pubsub.waddle.social", &component)
        .unwrap();

    assert!(ctx.routing().has_component_route("pubsub.waddle.social"));
    let result = ctx
        .routing()
        .route_packet(
            &jid("node@pubsub.waddle.social"),
            chat("node@pubsub.waddle.social", "hi").into(),
        )
        .await;
    assert_eq!(result, RoutingResult::SentToComponent);
    assert_eq!(conn.messages().len(), 1);

    assert!(ctx.sessions().unregister_component_session("pubsub.waddle.social"));
    assert!(!ctx.routing().has_component_route("pubsub.waddle.social"));
}

#[tokio::test]
async fn test_remote_domain_without_federation() {
    let (ctx, _) = context();
    let result = ctx
        .routing()
        .route_packet(
            &jid("bob@example.com"),
            message("bob@example.com", MessageType::Chat, "hi").into(),
        )
        .await;
    assert_eq!(result, RoutingResult::FederationDisabled);
}

#[tokio::test]
async fn test_outgoing_server_route_carries_remote_traffic() {
    let (ctx, _) = context_with(RouterConfig::new(DOMAIN).with_federation(true));
    let conn = RecordingConnection::new();
    let outgoing = ctx
        .sessions()
        .create_session(SessionKind::OutgoingServer, conn.clone());
    let pair = DomainPair::new(DOMAIN, "example.com");
    ctx.sessions()
        .register_outgoing_server_session(&pair, &outgoing)
        .unwrap();

    assert!(ctx.routing().has_server_route(&pair));
    let result = ctx
        .routing()
        .route_packet(&jid("bob@example.com"), chat("bob@example.com", "hi").into())
        .await;
    assert_eq!(result, RoutingResult::SentToRemote);
    assert_eq!(conn.messages().len(), 1);

    assert!(ctx.sessions().unregister_outgoing_server_session(&pair));
    assert!(!ctx.routing().has_server_route(&pair));
}

#[tokio::test]
async fn test_broadcast_reaches_local_clients() {
    let (ctx, _) = context();
    let alice = online_client(&ctx, "alice@waddle.social/phone").await;
    let bob = online_client(&ctx, "bob@waddle.social/laptop").await;

    let mut notice = chat("waddle.social", "maintenance at noon");
    notice.from = Some(jid("waddle.social"));
    let reached = ctx.routing().broadcast_packet(notice.into(), true).await;

    assert_eq!(reached, 2);
    assert_eq!(alice.conn.messages().len(), 1);
    assert_eq!(bob.conn.messages().len(), 1);
    assert_eq!(ctx.routing().local_client_count(), 2);
}
