//! End-to-end coordinator scenarios against the public API.

use hub_core::{AdmissionMode, CostReading, RejectReason};
use hub_types::{ByteRange, ChannelMessage, ContentId, PeerId, PseudonymousAddress};
use peerhub_server::channel::ws::{dispatch, Frame};
use peerhub_server::channel::QueueChannel;
use peerhub_server::cost::StaticCostProvider;
use peerhub_server::error::{ErrorKind, RelayError};
use peerhub_server::registry::{PeerDescriptor, CAP_RELAY};
use peerhub_server::relay::{AdmissionQuery, RelayOutcome, RelayRequest};
use peerhub_server::sink::TracingMetricsSink;
use peerhub_server::{Config, CoordinatorState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Hub {
    state: Arc<CoordinatorState>,
    provider: Arc<StaticCostProvider>,
}

fn hub() -> Hub {
    let config = Config::default();
    let provider = Arc::new(StaticCostProvider::zero());
    let state = Arc::new(
        CoordinatorState::new(config, provider.clone(), Arc::new(TracingMetricsSink)).unwrap(),
    );
    Hub { state, provider }
}

fn pid(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

fn cid(id: &str) -> ContentId {
    ContentId::new(id).unwrap()
}

fn join(hub: &Hub, id: &str, content: &[&str], relay_capacity: Option<u32>) {
    hub.state
        .register(PeerDescriptor {
            peer_id: pid(id),
            addresses: vec![PseudonymousAddress::derive(id.as_bytes()).to_string()],
            private_addresses: vec![],
            content_ids: content.iter().map(|c| cid(c)).collect(),
            capabilities: relay_capacity
                .map(|_| vec![CAP_RELAY.to_string()])
                .unwrap_or_default(),
            version: "1.0".into(),
            relay_capacity,
        })
        .unwrap();
}

fn connect(hub: &Hub, id: &str) -> mpsc::Receiver<ChannelMessage> {
    let (channel, rx) = QueueChannel::pair(pid(id), 16);
    hub.state.channels().attach(pid(id), Arc::new(channel));
    rx
}

/// Answer every `Deliver` the peer receives, passing each answer through
/// its JSON wire form first.
fn serve(hub: &Hub, id: &str, mut rx: mpsc::Receiver<ChannelMessage>, payload: &'static [u8]) {
    let relay = hub.state.relay().clone();
    let peer = pid(id);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let ChannelMessage::Deliver { request_id, .. } = message {
                let answer = ChannelMessage::Delivered {
                    request_id,
                    payload: payload.to_vec(),
                    total_size: Some(payload.len() as u64),
                };
                let wire = answer.to_json().unwrap();
                assert!(wire.contains("QUFBQQ"));
                let decoded = ChannelMessage::from_json(&wire).unwrap();
                relay.on_message(&peer, decoded).await;
            }
        }
    });
}

#[tokio::test]
async fn discovered_holder_serves_a_mediated_relay() {
    let hub = hub();
    join(&hub, "a", &["store1"], None);
    join(&hub, "b", &[], None);

    let holders = hub.state.registry().find_by_content(&cid("store1"));
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].peer_id, pid("a"));

    let rx = connect(&hub, "a");
    serve(&hub, "a", rx, b"AAAA");

    let outcome = hub
        .state
        .relay()
        .execute(RelayRequest::new(cid("store1"), pid("a"), pid("b")))
        .await
        .unwrap();
    let RelayOutcome::Mediated {
        payload,
        total_size,
        ..
    } = outcome
    else {
        panic!("expected a mediated relay");
    };
    assert_eq!(payload, b"AAAA");
    assert_eq!(total_size, Some(4));
    assert_eq!(hub.state.relay().pending_count(), 0);
    assert_eq!(hub.state.sessions().len(), 0);
    assert_eq!(hub.state.stats().bytes_relayed, 4);
}

#[tokio::test]
async fn emergency_keeps_only_premium_continuations() {
    let hub = hub();
    hub.state.start().await;

    let premium = hub
        .state
        .relay()
        .admit(&AdmissionQuery {
            peer_id: pid("p"),
            tier: "premium".into(),
            requested_bandwidth: 0,
            is_premium: true,
            p2p_attempted: true,
            content_id: Some(cid("store1")),
            range: None,
            continuation: None,
            health_check: false,
        })
        .unwrap();
    let session = premium.session_id.unwrap();

    hub.provider.set(CostReading {
        current_spend: 500.0,
        projected_spend: 0.96 * hub.state.config().admission.budget_limit,
    });
    hub.state
        .admission()
        .refresh(hub.state.sessions())
        .await;
    assert_eq!(hub.state.admission().mode(), AdmissionMode::Emergency);

    let err = hub
        .state
        .relay()
        .admit(&AdmissionQuery {
            peer_id: pid("f"),
            tier: "free".into(),
            requested_bandwidth: 0,
            is_premium: false,
            p2p_attempted: true,
            content_id: None,
            range: None,
            continuation: None,
            health_check: false,
        })
        .unwrap_err();
    let RelayError::Rejected(rejection) = err else {
        panic!("expected a rejection");
    };
    assert_eq!(rejection.mode, AdmissionMode::Emergency);
    assert_eq!(rejection.retry_after_secs, 300);
    assert_eq!(rejection.reason, RejectReason::TopTierOnly);

    let continued = hub
        .state
        .relay()
        .admit(&AdmissionQuery {
            peer_id: pid("p"),
            tier: "premium".into(),
            requested_bandwidth: 0,
            is_premium: true,
            p2p_attempted: true,
            content_id: Some(cid("store1")),
            range: None,
            continuation: Some(session),
            health_check: false,
        })
        .unwrap();
    assert_eq!(continued.session_id, Some(session));
    assert_eq!(continued.grant.bandwidth, 5);
    assert_eq!(continued.grant.mode, AdmissionMode::Emergency);
    hub.state.shutdown();
}

#[tokio::test(start_paused = true)]
async fn silent_source_times_out_and_leaves_nothing_behind() {
    let hub = hub();
    join(&hub, "a", &["store1"], None);
    join(&hub, "b", &[], None);
    let _rx = connect(&hub, "a");

    let started = tokio::time::Instant::now();
    let err = hub
        .state
        .relay()
        .execute(RelayRequest::new(cid("store1"), pid("a"), pid("b")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(hub.state.config().relay.object_timeout_secs));
    assert_eq!(hub.state.relay().pending_count(), 0);
    assert_eq!(hub.state.sessions().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn source_disconnect_fails_the_relay_immediately() {
    let hub = hub();
    join(&hub, "a", &["store1"], None);
    join(&hub, "b", &[], None);
    let mut rx = connect(&hub, "a");

    let relay = hub.state.relay().clone();
    let call = tokio::spawn(async move {
        relay
            .execute(
                RelayRequest::new(cid("store1"), pid("a"), pid("b"))
                    .with_range(ByteRange::new(0, 10).unwrap(), Some(100)),
            )
            .await
    });
    assert!(matches!(rx.recv().await, Some(ChannelMessage::Deliver { range: Some(_), .. })));

    let started = tokio::time::Instant::now();
    hub.state.deregister(&pid("a"));
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(hub.state.relay().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn undecodable_answer_on_the_wire_fails_the_relay_at_once() {
    let hub = hub();
    join(&hub, "a", &["store1"], None);
    join(&hub, "b", &[], None);
    let mut rx = connect(&hub, "a");

    let relay = hub.state.relay().clone();
    let call = tokio::spawn(async move {
        relay
            .execute(RelayRequest::new(cid("store1"), pid("a"), pid("b")))
            .await
    });
    let Some(ChannelMessage::Deliver { request_id, .. }) = rx.recv().await else {
        panic!("expected a deliver request");
    };

    let started = tokio::time::Instant::now();
    let text = format!(
        r#"{{"type":"delivered","request_id":"{request_id}","payload":"!!not-base64!!"}}"#
    );
    dispatch(hub.state.relay(), &pid("a"), Frame::Text(&text)).await;
    assert_eq!(hub.state.relay().pending_count(), 0);

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRelayPayload);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(hub.state.sessions().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn hosted_relay_goes_to_least_loaded_peer_and_is_released() {
    let hub = hub();
    join(&hub, "a", &["store1"], None);
    join(&hub, "b", &[], None);
    join(&hub, "r1", &[], Some(4));
    join(&hub, "r2", &[], Some(4));
    let mut r1 = connect(&hub, "r1");
    let _r2 = connect(&hub, "r2");

    let first = hub
        .state
        .relay()
        .execute(RelayRequest::new(cid("store1"), pid("a"), pid("b")))
        .await
        .unwrap();
    let RelayOutcome::Hosted {
        assignment_id,
        relay_peer,
        ..
    } = first
    else {
        panic!("expected a hosted relay");
    };
    assert_eq!(relay_peer, pid("r1"));
    assert!(matches!(r1.recv().await, Some(ChannelMessage::HostRelay { .. })));

    let second = hub
        .state
        .relay()
        .execute(RelayRequest::new(cid("store1"), pid("a"), pid("b")))
        .await
        .unwrap();
    assert!(matches!(second, RelayOutcome::Hosted { relay_peer, .. } if relay_peer == pid("r2")));
    assert_eq!(hub.state.stats().hosted_relays, 2);

    hub.state
        .relay()
        .on_message(&pid("r1"), ChannelMessage::HostRelayDone { assignment_id })
        .await;
    assert_eq!(hub.state.relay().hosted().load_of(&pid("r1")), 0.0);

    // Unacknowledged hand-offs release themselves after the grace period.
    tokio::time::sleep(Duration::from_secs(hub.state.config().relay.hosted_grace_secs + 1)).await;
    assert_eq!(hub.state.stats().hosted_relays, 0);
    assert_eq!(hub.state.sessions().len(), 0);
}
