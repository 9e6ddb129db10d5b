// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End to end exercises of the broker context, driven packet by packet
//! with a manual clock and in-memory sinks.

use codec::v5::{Properties, Property, ReasonCode};
use codec::{
    ByteArray, DecodePacket, EncodePacket, FixedHeader, PacketId, PacketType, QoS, U32Data,
};
use std::sync::{Arc, Mutex};

use super::Broker;
use crate::auth::AllowAll;
use crate::clock::{Clock, ManualClock};
use crate::config::General;
use crate::session::{SessionConfig, SessionState};
use crate::sink::BufferSink;
use crate::types::SessionId;

type SharedSink = Arc<Mutex<BufferSink>>;

fn test_broker(clock: &Arc<ManualClock>) -> Broker {
    let clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
    Broker::new(
        General::default(),
        clock,
        Box::new(AllowAll),
        Box::new(AllowAll),
    )
}

fn session_config() -> SessionConfig {
    SessionConfig {
        max_qos: QoS::ExactOnce,
        max_inflight_messages: 20,
        max_inflight_bytes: 0,
        max_queued_messages: 100,
        max_queued_bytes: 0,
        queue_qos0_messages: false,
        max_topic_alias: 10,
        mount_point: String::new(),
    }
}

fn encode<P: EncodePacket>(packet: &P) -> Vec<u8> {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    buf
}

fn attach(broker: &mut Broker, config: &SessionConfig) -> (SessionId, SharedSink) {
    let sink: SharedSink = Arc::new(Mutex::new(BufferSink::new()));
    let id = broker.attach_connection(Box::new(Arc::clone(&sink)), config);
    (id, sink)
}

fn frames(sink: &SharedSink) -> Vec<Vec<u8>> {
    sink.lock().unwrap().frames().to_vec()
}

fn clear(sink: &SharedSink) {
    sink.lock().unwrap().clear();
}

fn packet_type(frame: &[u8]) -> PacketType {
    FixedHeader::decode(&mut ByteArray::new(frame))
        .unwrap()
        .packet_type()
}

/// Connect a v3.1.1 client, asserting the CONNACK, and leave the sink
/// empty.
fn connect_v3(
    broker: &mut Broker,
    client_id: &str,
    clean_session: bool,
) -> (SessionId, SharedSink) {
    let (id, sink) = attach(broker, &session_config());
    let mut packet = codec::v3::ConnectPacket::new(client_id).unwrap();
    packet.connect_flags_mut().set_clean_start(clean_session);
    broker.handle_frame(id, &encode(&packet)).unwrap();

    let written = frames(&sink);
    assert_eq!(packet_type(&written[0]), PacketType::ConnectAck);
    clear(&sink);
    (id, sink)
}

/// Connect a v5 client with a session expiry interval. The sink is left
/// as is: on a resume it may already hold deliveries after the CONNACK.
fn connect_v5(
    broker: &mut Broker,
    client_id: &str,
    clean_start: bool,
    session_expiry: u32,
) -> (SessionId, SharedSink, codec::v5::ConnectAckPacket) {
    let (id, sink) = attach(broker, &session_config());
    let mut packet = codec::v5::ConnectPacket::new(client_id).unwrap();
    packet.connect_flags_mut().set_clean_start(clean_start);
    if session_expiry > 0 {
        packet
            .properties_mut()
            .push(Property::SessionExpiryInterval(U32Data::new(session_expiry)));
    }
    broker.handle_frame(id, &encode(&packet)).unwrap();

    let written = frames(&sink);
    assert!(!written.is_empty());
    let ack = codec::v5::ConnectAckPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    (id, sink, ack)
}

fn subscribe_v3(broker: &mut Broker, id: SessionId, sink: &SharedSink, filter: &str, qos: QoS) {
    let packet = codec::v3::SubscribePacket::new(filter, qos, PacketId::new(1)).unwrap();
    broker.handle_frame(id, &encode(&packet)).unwrap();
    let written = frames(sink);
    assert_eq!(packet_type(&written[0]), PacketType::SubscribeAck);
    clear(sink);
}

fn subscribe_v5(broker: &mut Broker, id: SessionId, sink: &SharedSink, filter: &str, qos: QoS) {
    let packet = codec::v5::SubscribePacket::new(filter, qos, PacketId::new(1)).unwrap();
    broker.handle_frame(id, &encode(&packet)).unwrap();
    let written = frames(sink);
    assert_eq!(packet_type(&written[0]), PacketType::SubscribeAck);
    clear(sink);
}

#[test]
fn test_qos1_publish_reaches_subscriber_before_publisher_ack() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "a", true);
    subscribe_v3(&mut broker, a_id, &a_sink, "sensors/+/temp", QoS::AtLeastOnce);
    let (b_id, b_sink) = connect_v3(&mut broker, "b", true);

    let mut publish =
        codec::v3::PublishPacket::new("sensors/room1/temp", QoS::AtLeastOnce, b"22").unwrap();
    publish.set_packet_id(PacketId::new(5));
    broker.handle_frame(b_id, &encode(&publish)).unwrap();

    // A holds the forwarded PUBLISH.
    let a_frames = frames(&a_sink);
    assert_eq!(a_frames.len(), 1);
    let forwarded = codec::v3::PublishPacket::decode(&mut ByteArray::new(&a_frames[0])).unwrap();
    assert_eq!(forwarded.topic(), "sensors/room1/temp");
    assert_eq!(forwarded.message(), b"22");
    assert_eq!(forwarded.qos(), QoS::AtLeastOnce);
    assert!(!forwarded.retain());

    // B got its PUBACK with the publisher's own packet id.
    let b_frames = frames(&b_sink);
    assert_eq!(b_frames.len(), 1);
    let ack = codec::v3::PublishAckPacket::decode(&mut ByteArray::new(&b_frames[0])).unwrap();
    assert_eq!(ack.packet_id(), PacketId::new(5));

    // A acknowledges; the in-flight entry disappears.
    let puback = codec::v3::PublishAckPacket::new(forwarded.packet_id());
    broker.handle_frame(a_id, &encode(&puback)).unwrap();
    let session = broker.sessions.get(&a_id).unwrap();
    assert_eq!(session.msgs_out_ref().msg_count(), 0);
    assert_eq!(session.msgs_out_ref().inflight_quota(), 20);
}

#[test]
fn test_retained_message_redelivered_on_resume() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink, ack) = connect_v5(&mut broker, "a", false, 3_600);
    assert!(!ack.session_present());
    clear(&a_sink);
    subscribe_v5(&mut broker, a_id, &a_sink, "x/#", QoS::AtMostOnce);

    // Orderly disconnect; the session persists.
    let disconnect = codec::v5::DisconnectPacket::default();
    broker.handle_frame(a_id, &encode(&disconnect)).unwrap();
    assert_eq!(broker.session_state(a_id), Some(SessionState::Disconnected));

    // B publishes a retained message while A is away.
    let (b_id, _b_sink) = connect_v3(&mut broker, "b", true);
    let mut publish = codec::v3::PublishPacket::new("x/y", QoS::AtMostOnce, b"hi").unwrap();
    publish.set_retain(true);
    broker.handle_frame(b_id, &encode(&publish)).unwrap();

    // A returns with the same client id and receives the retained message
    // right behind the CONNACK.
    let (a2_id, a2_sink, ack) = connect_v5(&mut broker, "a", false, 3_600);
    assert!(ack.session_present());
    let written = frames(&a2_sink);
    assert_eq!(written.len(), 2);
    let forwarded = codec::v5::PublishPacket::decode(&mut ByteArray::new(&written[1])).unwrap();
    assert_eq!(forwarded.topic(), "x/y");
    assert_eq!(forwarded.message(), b"hi");
    assert!(forwarded.retain());
    assert_ne!(a2_id, a_id);
}

#[test]
fn test_empty_retained_payload_clears_slot() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, _a_sink) = connect_v3(&mut broker, "a", true);
    let mut publish = codec::v3::PublishPacket::new("a/b", QoS::AtMostOnce, b"keep").unwrap();
    publish.set_retain(true);
    broker.handle_frame(a_id, &encode(&publish)).unwrap();
    assert!(broker.trie.retained_at("a/b").is_some());

    let mut clear_publish = codec::v3::PublishPacket::new("a/b", QoS::AtMostOnce, b"").unwrap();
    clear_publish.set_retain(true);
    broker.handle_frame(a_id, &encode(&clear_publish)).unwrap();
    assert!(broker.trie.retained_at("a/b").is_none());

    // A fresh subscriber gets nothing.
    let (c_id, c_sink) = connect_v3(&mut broker, "c", true);
    subscribe_v3(&mut broker, c_id, &c_sink, "a/b", QoS::AtMostOnce);
    assert!(frames(&c_sink).is_empty());
}

#[test]
fn test_pubrel_resent_first_after_reconnect() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "a", false);
    subscribe_v3(&mut broker, a_id, &a_sink, "t", QoS::ExactOnce);
    let (b_id, _b_sink) = connect_v3(&mut broker, "b", true);

    let mut publish = codec::v3::PublishPacket::new("t", QoS::ExactOnce, b"p").unwrap();
    publish.set_packet_id(PacketId::new(7));
    broker.handle_frame(b_id, &encode(&publish)).unwrap();
    broker
        .handle_frame(
            b_id,
            &encode(&codec::v3::PublishReleasePacket::new(PacketId::new(7))),
        )
        .unwrap();

    // A received the forwarded QoS 2 publish and answers with PUBREC; the
    // broker replies PUBREL and now waits for PUBCOMP.
    let a_frames = frames(&a_sink);
    assert_eq!(a_frames.len(), 1);
    let forwarded = codec::v3::PublishPacket::decode(&mut ByteArray::new(&a_frames[0])).unwrap();
    let mid = forwarded.packet_id();
    clear(&a_sink);
    broker
        .handle_frame(a_id, &encode(&codec::v3::PublishReceivedPacket::new(mid)))
        .unwrap();
    let a_frames = frames(&a_sink);
    assert_eq!(packet_type(&a_frames[0]), PacketType::PublishRelease);
    clear(&a_sink);

    // A drops without sending PUBCOMP.
    broker.connection_closed(a_id);

    // On reconnect the PUBREL for that mid leads the outbound traffic.
    let (a2_id, a2_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v3::ConnectPacket::new("a").unwrap();
    connect.connect_flags_mut().set_clean_start(false);
    broker.handle_frame(a2_id, &encode(&connect)).unwrap();

    let written = frames(&a2_sink);
    assert!(written.len() >= 2);
    let ack = codec::v3::ConnectAckPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    assert!(ack.session_present());
    let release =
        codec::v3::PublishReleasePacket::decode(&mut ByteArray::new(&written[1])).unwrap();
    assert_eq!(release.packet_id(), mid);

    // PUBCOMP finishes the exchange.
    broker
        .handle_frame(a2_id, &encode(&codec::v3::PublishCompletePacket::new(mid)))
        .unwrap();
    let session = broker.sessions.get(&a2_id).unwrap();
    assert_eq!(session.msgs_out_ref().msg_count(), 0);
}

#[test]
fn test_takeover_migrates_queued_messages() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "dup", false);
    subscribe_v3(&mut broker, a_id, &a_sink, "jobs/#", QoS::AtLeastOnce);
    broker.connection_closed(a_id);

    // Queue some traffic for the sleeping session.
    let (p_id, _p_sink) = connect_v3(&mut broker, "producer", true);
    for i in 0..3_u16 {
        let mut publish =
            codec::v3::PublishPacket::new("jobs/new", QoS::AtLeastOnce, b"job").unwrap();
        publish.set_packet_id(PacketId::new(i + 1));
        broker.handle_frame(p_id, &encode(&publish)).unwrap();
    }
    assert_eq!(
        broker
            .sessions
            .get(&a_id)
            .unwrap()
            .msgs_out_ref()
            .queued_len(),
        3
    );

    // The second connection with the same id takes the session over.
    let (b_id, b_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v3::ConnectPacket::new("dup").unwrap();
    connect.connect_flags_mut().set_clean_start(false);
    broker.handle_frame(b_id, &encode(&connect)).unwrap();

    assert!(broker.sessions.get(&a_id).is_none());
    assert_eq!(broker.session_id_of("dup"), Some(b_id));

    let written = frames(&b_sink);
    let ack = codec::v3::ConnectAckPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    assert!(ack.session_present());
    // The three queued messages were drained to the new connection.
    assert_eq!(written.len(), 4);
    for frame in &written[1..] {
        let publish = codec::v3::PublishPacket::decode(&mut ByteArray::new(frame)).unwrap();
        assert_eq!(publish.topic(), "jobs/new");
    }
    let session = broker.sessions.get(&b_id).unwrap();
    assert_eq!(session.msgs_out_ref().inflight_len(), 3);
    assert_eq!(session.msgs_out_ref().queued_len(), 0);
}

#[test]
fn test_takeover_disconnects_live_victim() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink, _ack) = connect_v5(&mut broker, "dup", false, 600);
    clear(&a_sink);
    let (b_id, _b_sink, ack) = connect_v5(&mut broker, "dup", false, 600);
    assert!(ack.session_present());

    // The displaced connection was told why.
    let written = frames(&a_sink);
    assert_eq!(written.len(), 1);
    let disconnect =
        codec::v5::DisconnectPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    assert_eq!(disconnect.reason_code(), ReasonCode::SessionTakenOver);

    // Its socket shows up in the next tick's close list.
    let closes = broker.tick();
    assert!(closes.contains(&a_id));
    assert_eq!(broker.session_id_of("dup"), Some(b_id));
}

#[test]
fn test_offline_queue_cap_drops_excess() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let mut config = session_config();
    config.max_queued_messages = 10;
    config.max_inflight_messages = 4;

    let sink: SharedSink = Arc::new(Mutex::new(BufferSink::new()));
    let a_id = broker.attach_connection(Box::new(Arc::clone(&sink)), &config);
    let mut connect = codec::v3::ConnectPacket::new("slow").unwrap();
    connect.connect_flags_mut().set_clean_start(false);
    broker.handle_frame(a_id, &encode(&connect)).unwrap();
    clear(&sink);
    subscribe_v3(&mut broker, a_id, &sink, "firehose", QoS::AtLeastOnce);
    broker.connection_closed(a_id);

    let (p_id, _p_sink) = connect_v3(&mut broker, "producer", true);
    for i in 0..50_u16 {
        let mut publish =
            codec::v3::PublishPacket::new("firehose", QoS::AtLeastOnce, b"x").unwrap();
        publish.set_packet_id(PacketId::new(i + 1));
        broker.handle_frame(p_id, &encode(&publish)).unwrap();
    }

    let session = broker.sessions.get(&a_id).unwrap();
    // Exactly the cap is queued; the offline session gets no in-flight
    // allowance.
    assert_eq!(session.msgs_out_ref().queued_len(), 10);
    assert_eq!(session.msgs_out_ref().inflight_len(), 0);
}

#[test]
fn test_will_published_on_abnormal_close() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (watcher_id, watcher_sink) = connect_v3(&mut broker, "watcher", true);
    subscribe_v3(
        &mut broker,
        watcher_id,
        &watcher_sink,
        "alarms/#",
        QoS::AtMostOnce,
    );

    let (a_id, _a_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v3::ConnectPacket::new("device").unwrap();
    connect.set_will("alarms/device", b"gone").unwrap();
    broker.handle_frame(a_id, &encode(&connect)).unwrap();

    broker.connection_closed(a_id);

    let written = frames(&watcher_sink);
    assert_eq!(written.len(), 1);
    let will = codec::v3::PublishPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    assert_eq!(will.topic(), "alarms/device");
    assert_eq!(will.message(), b"gone");
}

#[test]
fn test_will_discarded_on_clean_disconnect() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (watcher_id, watcher_sink) = connect_v3(&mut broker, "watcher", true);
    subscribe_v3(
        &mut broker,
        watcher_id,
        &watcher_sink,
        "alarms/#",
        QoS::AtMostOnce,
    );

    let (a_id, _a_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v3::ConnectPacket::new("device").unwrap();
    connect.set_will("alarms/device", b"gone").unwrap();
    broker.handle_frame(a_id, &encode(&connect)).unwrap();

    broker
        .handle_frame(a_id, &encode(&codec::v3::DisconnectPacket::new()))
        .unwrap();
    assert!(frames(&watcher_sink).is_empty());
}

#[test]
fn test_delayed_will_fires_on_tick() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (watcher_id, watcher_sink) = connect_v3(&mut broker, "watcher", true);
    subscribe_v3(
        &mut broker,
        watcher_id,
        &watcher_sink,
        "alarms/#",
        QoS::AtMostOnce,
    );

    let (a_id, _a_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v5::ConnectPacket::new("device").unwrap();
    connect
        .properties_mut()
        .push(Property::SessionExpiryInterval(U32Data::new(3_600)));
    connect.set_will("alarms/device", b"gone").unwrap();
    let mut will_properties = Properties::new();
    will_properties.push(Property::WillDelayInterval(U32Data::new(5)));
    *connect.will_properties_mut() = will_properties;
    broker.handle_frame(a_id, &encode(&connect)).unwrap();

    broker.connection_closed(a_id);
    assert!(frames(&watcher_sink).is_empty());

    clock.advance(3);
    broker.tick();
    assert!(frames(&watcher_sink).is_empty());

    clock.advance(3);
    broker.tick();
    let written = frames(&watcher_sink);
    assert_eq!(written.len(), 1);
}

#[test]
fn test_session_expiry_removes_state() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, _a_sink, _ack) = connect_v5(&mut broker, "a", false, 60);
    broker.connection_closed(a_id);
    assert!(broker.sessions.contains_key(&a_id));

    clock.advance(61);
    broker.tick();
    assert!(!broker.sessions.contains_key(&a_id));
    assert_eq!(broker.session_id_of("a"), None);
}

#[test]
fn test_keepalive_timeout_reported_by_tick() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = attach(&mut broker, &session_config());
    let mut connect = codec::v3::ConnectPacket::new("a").unwrap();
    connect.set_keep_alive(10);
    broker.handle_frame(a_id, &encode(&connect)).unwrap();
    clear(&a_sink);

    clock.advance(14);
    assert!(broker.tick().is_empty());

    clock.advance(2);
    let closes = broker.tick();
    assert!(closes.contains(&a_id));
}

#[test]
fn test_retained_message_freed_when_replaced() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, _a_sink) = connect_v3(&mut broker, "a", true);
    let mut publish = codec::v3::PublishPacket::new("x", QoS::AtMostOnce, b"v").unwrap();
    publish.set_retain(true);
    broker.handle_frame(a_id, &encode(&publish)).unwrap();

    // Only the retained slot holds the message now.
    let retained = broker.trie.retained_at("x").unwrap();
    assert_eq!(crate::store::MessageStore::ref_count(&retained), 2);
    assert_eq!(broker.store.len(), 1);
    drop(retained);

    // Clearing the slot frees the message entirely.
    let mut clear_publish = codec::v3::PublishPacket::new("x", QoS::AtMostOnce, b"").unwrap();
    clear_publish.set_retain(true);
    broker.handle_frame(a_id, &encode(&clear_publish)).unwrap();
    broker.store.compact();
    assert_eq!(broker.store.len(), 0);
}

#[test]
fn test_second_connect_is_protocol_error() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, _a_sink) = connect_v3(&mut broker, "a", true);
    let packet = codec::v3::ConnectPacket::new("a").unwrap();
    assert!(broker.handle_frame(a_id, &encode(&packet)).is_err());
}

#[test]
fn test_first_packet_must_be_connect() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (id, _sink) = attach(&mut broker, &session_config());
    let packet = codec::v3::PingRequestPacket::new();
    assert!(broker.handle_frame(id, &encode(&packet)).is_err());
}

#[test]
fn test_publish_order_preserved_across_subscribers() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "a", true);
    subscribe_v3(&mut broker, a_id, &a_sink, "s/#", QoS::AtMostOnce);
    let (b_id, b_sink) = connect_v3(&mut broker, "b", true);
    subscribe_v3(&mut broker, b_id, &b_sink, "s/+", QoS::AtMostOnce);
    let (p_id, _p_sink) = connect_v3(&mut broker, "p", true);

    for payload in [b"1".as_slice(), b"2".as_slice(), b"3".as_slice()] {
        let publish = codec::v3::PublishPacket::new("s/x", QoS::AtMostOnce, payload).unwrap();
        broker.handle_frame(p_id, &encode(&publish)).unwrap();
    }

    for sink in [&a_sink, &b_sink] {
        let payloads: Vec<Vec<u8>> = frames(sink)
            .iter()
            .map(|frame| {
                codec::v3::PublishPacket::decode(&mut ByteArray::new(frame))
                    .unwrap()
                    .message()
                    .to_vec()
            })
            .collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }
}

#[test]
fn test_generated_client_id_returned_to_v5_client() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (id, sink) = attach(&mut broker, &session_config());
    let packet = codec::v5::ConnectPacket::new("").unwrap();
    broker.handle_frame(id, &encode(&packet)).unwrap();

    let written = frames(&sink);
    let ack = codec::v5::ConnectAckPacket::decode(&mut ByteArray::new(&written[0])).unwrap();
    assert_eq!(ack.reason_code(), ReasonCode::Success);
    let assigned = ack.properties().props().iter().find_map(|p| match p {
        Property::AssignedClientIdentifier(s) => Some(s.to_string()),
        _ => None,
    });
    let assigned = assigned.expect("assigned client id property");
    assert!(assigned.starts_with("auto-"));
    assert_eq!(broker.session_id_of(&assigned), Some(id));
}

#[test]
fn test_inbound_qos2_duplicate_not_routed_twice() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (s_id, s_sink) = connect_v3(&mut broker, "sub", true);
    subscribe_v3(&mut broker, s_id, &s_sink, "t", QoS::AtMostOnce);
    let (p_id, p_sink) = connect_v3(&mut broker, "pub", true);

    let mut publish = codec::v3::PublishPacket::new("t", QoS::ExactOnce, b"p").unwrap();
    publish.set_packet_id(PacketId::new(9));
    broker.handle_frame(p_id, &encode(&publish)).unwrap();
    // Nothing is routed before the release.
    assert!(frames(&s_sink).is_empty());
    assert_eq!(packet_type(&frames(&p_sink)[0]), PacketType::PublishReceived);
    clear(&p_sink);

    // A retransmission of the same packet id only repeats the PUBREC.
    publish.set_dup(true).unwrap();
    broker.handle_frame(p_id, &encode(&publish)).unwrap();
    assert!(frames(&s_sink).is_empty());
    assert_eq!(packet_type(&frames(&p_sink)[0]), PacketType::PublishReceived);
    clear(&p_sink);

    broker
        .handle_frame(
            p_id,
            &encode(&codec::v3::PublishReleasePacket::new(PacketId::new(9))),
        )
        .unwrap();
    assert_eq!(frames(&s_sink).len(), 1);
    assert_eq!(packet_type(&frames(&p_sink)[0]), PacketType::PublishComplete);
}

#[test]
fn test_shared_subscription_partitions_stream() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "w1", true);
    subscribe_v3(&mut broker, a_id, &a_sink, "$share/pool/jobs", QoS::AtMostOnce);
    let (b_id, b_sink) = connect_v3(&mut broker, "w2", true);
    subscribe_v3(&mut broker, b_id, &b_sink, "$share/pool/jobs", QoS::AtMostOnce);
    let (p_id, _p_sink) = connect_v3(&mut broker, "p", true);

    for _ in 0..4 {
        let publish = codec::v3::PublishPacket::new("jobs", QoS::AtMostOnce, b"j").unwrap();
        broker.handle_frame(p_id, &encode(&publish)).unwrap();
    }

    let a_count = frames(&a_sink).len();
    let b_count = frames(&b_sink).len();
    assert_eq!(a_count + b_count, 4);
    assert_eq!(a_count, 2);
    assert_eq!(b_count, 2);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut broker = test_broker(&clock);

    let (a_id, a_sink) = connect_v3(&mut broker, "a", true);
    subscribe_v3(&mut broker, a_id, &a_sink, "news/#", QoS::AtMostOnce);
    let (p_id, _p_sink) = connect_v3(&mut broker, "p", true);

    let unsubscribe =
        codec::v3::UnsubscribePacket::new("news/#", PacketId::new(4)).unwrap();
    broker.handle_frame(a_id, &encode(&unsubscribe)).unwrap();
    let written = frames(&a_sink);
    assert_eq!(packet_type(&written[0]), PacketType::UnsubscribeAck);
    clear(&a_sink);

    let publish = codec::v3::PublishPacket::new("news/today", QoS::AtMostOnce, b"x").unwrap();
    broker.handle_frame(p_id, &encode(&publish)).unwrap();
    assert!(frames(&a_sink).is_empty());
    assert_eq!(broker.trie.subscription_count(), 0);
}
