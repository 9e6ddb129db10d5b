// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Wire-level smoke test: a real server on a real socket, driven by raw
//! MQTT packets.

use codec::{ByteArray, DecodePacket, EncodePacket, PacketId, QoS};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::Duration;

use loon::config::Config;
use loon::server::ServerContext;

const CONFIG: &str = r#"
[[listeners]]
address = "127.0.0.1:18831"

[log]
log_level = "warn"
"#;

const ADDRESS: &str = "127.0.0.1:18831";

fn start_server() {
    let config: Config = toml::from_str(CONFIG).unwrap();
    std::thread::spawn(move || {
        let mut server = ServerContext::new(config);
        server.run_loop().unwrap();
    });
    sleep(Duration::from_millis(300));
}

fn send<P: EncodePacket>(stream: &mut TcpStream, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    stream.write_all(&buf).unwrap();
}

/// Read one complete control packet off the socket.
fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut first = [0_u8; 1];
    stream.read_exact(&mut first).unwrap();
    let mut frame = vec![first[0]];

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    loop {
        let mut byte = [0_u8; 1];
        stream.read_exact(&mut byte).unwrap();
        frame.push(byte[0]);
        remaining += usize::from(byte[0] & 0x7f) * multiplier;
        multiplier *= 128;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }

    let body_start = frame.len();
    frame.resize(body_start + remaining, 0);
    stream.read_exact(&mut frame[body_start..]).unwrap();
    frame
}

fn connect(client_id: &str) -> TcpStream {
    let mut stream = TcpStream::connect(ADDRESS).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    send(&mut stream, &codec::v3::ConnectPacket::new(client_id).unwrap());
    let frame = read_frame(&mut stream);
    let ack = codec::v3::ConnectAckPacket::decode(&mut ByteArray::new(&frame)).unwrap();
    assert_eq!(ack.return_code(), codec::v3::ConnectReturnCode::Accepted);
    assert!(!ack.session_present());
    stream
}

#[test]
fn test_connect_subscribe_publish() {
    start_server();

    let mut subscriber = connect("it-subscriber");
    send(
        &mut subscriber,
        &codec::v3::SubscribePacket::new("it/+/value", QoS::AtMostOnce, PacketId::new(1)).unwrap(),
    );
    let frame = read_frame(&mut subscriber);
    let ack = codec::v3::SubscribeAckPacket::decode(&mut ByteArray::new(&frame)).unwrap();
    assert_eq!(ack.packet_id(), PacketId::new(1));

    // Ping survives the session.
    send(&mut subscriber, &codec::v3::PingRequestPacket::new());
    let frame = read_frame(&mut subscriber);
    assert!(codec::v3::PingResponsePacket::decode(&mut ByteArray::new(&frame)).is_ok());

    let mut publisher = connect("it-publisher");
    let publish = codec::v3::PublishPacket::new("it/a/value", QoS::AtMostOnce, b"41").unwrap();
    send(&mut publisher, &publish);

    let frame = read_frame(&mut subscriber);
    let forwarded = codec::v3::PublishPacket::decode(&mut ByteArray::new(&frame)).unwrap();
    assert_eq!(forwarded.topic(), "it/a/value");
    assert_eq!(forwarded.message(), b"41");

    send(&mut subscriber, &codec::v3::DisconnectPacket::new());
    send(&mut publisher, &codec::v3::DisconnectPacket::new());
}
