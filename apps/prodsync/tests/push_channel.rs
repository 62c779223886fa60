mod support;

use parking_lot::Mutex;
use prodsync_client_core::push::{ConnectionState, PushChannel, PushDelivery, TokenSource};
use prodsync_client_core::ReconnectPolicy;
use prodsync_proto::{production_topic, PushMessage};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{eventually, within, MockServer, CODE};
use url::Url;

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(200),
    }
}

fn open(addr: std::net::SocketAddr) -> PushChannel {
    let url = Url::parse(&format!("ws://{addr}/ws")).expect("ws url");
    let token: TokenSource = Arc::new(|| Some("fresh".to_string()));
    PushChannel::open(url, fast_policy(), token)
}

fn collector() -> (
    Arc<Mutex<Vec<PushDelivery>>>,
    impl Fn(PushDelivery) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |delivery| sink.lock().push(delivery))
}

#[tokio::test]
async fn delivers_decoded_messages_to_subscribers() {
    let server = MockServer::new();
    let addr = server.spawn().await;
    let channel = open(addr);
    let topic = production_topic(CODE);

    let (seen, handler) = collector();
    let _subscription = channel.subscribe(topic.clone(), handler);
    let mut state = channel.watch_state();
    within("connect", state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("state");
    eventually("subscribe frame", || server.subscription_count(&topic) == 1).await;
    assert_eq!(
        server.connect_auth.lock().first().cloned().flatten().as_deref(),
        Some("Bearer fresh")
    );

    server.publish(
        &topic,
        json!({ "type": "FIELD_UPDATED", "payload": { "fieldId": 101, "value": "9.9" } }),
    );
    eventually("delivery", || seen.lock().len() == 1).await;
    match &seen.lock()[0] {
        PushDelivery::Message {
            topic: delivered,
            message: PushMessage::FieldUpdated(update),
        } => {
            assert_eq!(delivered, &topic);
            assert_eq!(update.value.as_deref(), Some("9.9"));
        }
        other => panic!("unexpected delivery {other:?}"),
    }

    channel.close().await;
    assert_eq!(channel.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn unknown_message_type_requests_resync() {
    let server = MockServer::new();
    let addr = server.spawn().await;
    let channel = open(addr);
    let topic = production_topic(CODE);

    let (seen, handler) = collector();
    let _subscription = channel.subscribe(topic.clone(), handler);
    eventually("subscribe frame", || server.subscription_count(&topic) == 1).await;

    server.publish(&topic, json!({ "type": "FIELD_RENAMED", "payload": {} }));
    server.publish(
        &topic,
        json!({ "type": "STATE_CHANGED", "payload": { "status": "FINISHED" } }),
    );
    eventually("both deliveries", || seen.lock().len() == 2).await;

    let seen = seen.lock();
    assert!(matches!(&seen[0], PushDelivery::Resync { reason, .. } if reason.contains("FIELD_RENAMED")));
    assert!(matches!(
        &seen[1],
        PushDelivery::Message { message: PushMessage::StateChanged(_), .. }
    ));
    drop(seen);
    channel.close().await;
}

#[tokio::test]
async fn reconnect_restores_every_topic() {
    let server = MockServer::new();
    let addr = server.spawn().await;
    let channel = open(addr);
    let record = production_topic(CODE);
    let created = prodsync_proto::TOPIC_PRODUCTION_CREATED.to_string();

    let (seen, handler) = collector();
    let _record_sub = channel.subscribe(record.clone(), handler);
    let _created_sub = channel.subscribe(created.clone(), |_| {});
    eventually("initial subscriptions", || {
        server.subscription_count(&record) == 1 && server.subscription_count(&created) == 1
    })
    .await;

    let mut state = channel.watch_state();
    server.drop_connections();
    within(
        "reconnecting state",
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .expect("state");
    within("reconnected", state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("state");
    eventually("resubscribed", || {
        server.subscription_count(&record) == 2 && server.subscription_count(&created) == 2
    })
    .await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    server.publish(
        &record,
        json!({ "type": "PRODUCTION_METADATA_UPDATED", "payload": { "assignee": "kim" } }),
    );
    eventually("delivery after reconnect", || seen.lock().len() == 1).await;
    channel.close().await;
}

#[tokio::test]
async fn last_handler_leaving_unsubscribes() {
    let server = MockServer::new();
    let addr = server.spawn().await;
    let channel = open(addr);
    let topic = production_topic(CODE);

    let first = channel.subscribe(topic.clone(), |_| {});
    let second = channel.subscribe(topic.clone(), |_| {});
    eventually("subscribe frame", || server.subscription_count(&topic) == 1).await;
    assert_eq!(channel.handler_count(&topic), 2);

    first.unsubscribe();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.unsubscribes.lock().is_empty());

    drop(second);
    eventually("unsubscribe frame", || server.unsubscribes.lock().len() == 1).await;
    assert_eq!(channel.handler_count(&topic), 0);
    channel.close().await;
}

#[tokio::test]
async fn keeps_retrying_until_the_broker_appears() {
    // Reserve a port, then release it so the first attempts are refused.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("probe");
    let addr = probe.local_addr().expect("addr");
    drop(probe);

    let channel = open(addr);
    let mut state = channel.watch_state();
    within(
        "first retry",
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt } if *attempt >= 1)),
    )
    .await
    .expect("state");

    channel.close().await;
    assert_eq!(channel.state(), ConnectionState::Closed);
}
