// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests that drive a real control-plane client against a
//! mock coordinator over loopback TCP.

use std::{
    io::{Read as _, Write as _},
    net::TcpListener,
    time,
};

use ntest::timeout;
use outpost_protocol::{
    EngineHelloAck, Envelope, Ping, PortCheck, PortCheckTarget, SessionClose, SessionOpen,
    SessionResize, SessionType,
};

mod support;
use support::{start_control_plane, wait_until, Coordinator};

const LONG_KEEPALIVE: time::Duration = time::Duration::from_secs(60);

/// Run the hello/ack exchange and return the accepted control
/// connection.
fn handshake(coord: &Coordinator) -> support::Conn {
    let mut conn = coord.accept();
    match conn.read_msg() {
        Envelope::EngineHello(hello) => {
            assert_eq!(hello.version, outpost_protocol::VERSION);
            assert_eq!(hello.registration_token, None);
        }
        other => panic!("expected EngineHello, got {other:?}"),
    }
    conn.send_msg(&Envelope::EngineHelloAck(EngineHelloAck {
        accepted: true,
        server_version: String::from("1.2.3"),
    }));
    conn
}

#[test]
#[timeout(30000)]
fn hello_ack_sets_connected() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let _conn = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    cp.stop();
    assert!(!cp.is_running());
}

#[test]
#[timeout(30000)]
fn keepalive_pings_flow() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), time::Duration::from_millis(100));

    let mut conn = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    let first = match conn.read_msg() {
        Envelope::Ping(ping) => ping.timestamp,
        other => panic!("expected Ping, got {other:?}"),
    };
    let second = match conn.read_msg() {
        Envelope::Ping(ping) => ping.timestamp,
        other => panic!("expected Ping, got {other:?}"),
    };
    assert!(second >= first, "ping timestamps went backwards: {first} then {second}");

    cp.stop();
}

#[test]
#[timeout(30000)]
fn ping_answered_with_matching_pong() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut conn = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    conn.send_msg(&Envelope::Ping(Ping { timestamp: 42 }));
    match conn.read_msg() {
        Envelope::Pong(pong) => assert_eq!(pong.timestamp, 42),
        other => panic!("expected Pong, got {other:?}"),
    }

    cp.stop();
}

#[test]
#[timeout(30000)]
fn close_for_unknown_session_produces_no_frame() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut conn = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    conn.send_msg(&Envelope::SessionClose(SessionClose {
        session_id: String::from("nope"),
    }));
    // If the close had produced anything, it would land before the
    // answer to this ping.
    conn.send_msg(&Envelope::Ping(Ping { timestamp: 7 }));
    match conn.read_msg() {
        Envelope::Pong(pong) => assert_eq!(pong.timestamp, 7),
        other => panic!("expected Pong directly after bogus close, got {other:?}"),
    }

    cp.stop();
}

#[test]
#[timeout(30000)]
fn port_check_reports_dead_and_live_targets() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut conn = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    let live = TcpListener::bind("127.0.0.1:0").expect("binding live target");
    let live_port = live.local_addr().expect("live addr").port();

    conn.send_msg(&Envelope::PortCheck(PortCheck {
        request_id: String::from("q"),
        targets: vec![
            PortCheckTarget { id: String::from("a"), host: String::from("127.0.0.1"), port: 1 },
            PortCheckTarget {
                id: String::from("b"),
                host: String::from("127.0.0.1"),
                port: live_port,
            },
        ],
        timeout_ms: 500,
    }));

    match conn.read_msg_skipping_pings() {
        Envelope::PortCheckResult(result) => {
            assert_eq!(result.request_id, "q");
            assert_eq!(result.results.len(), 2);
            assert_eq!(result.results[0].id, "a");
            assert!(!result.results[0].online);
            assert_eq!(result.results[1].id, "b");
            assert!(result.results[1].online);
        }
        other => panic!("expected PortCheckResult, got {other:?}"),
    }

    cp.stop();
}

#[test]
#[timeout(30000)]
fn telnet_session_end_to_end() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut control = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    let telnet_srv = TcpListener::bind("127.0.0.1:0").expect("binding telnet server");
    let telnet_port = telnet_srv.local_addr().expect("telnet addr").port();

    control.send_msg(&Envelope::SessionOpen(SessionOpen {
        session_id: String::from("t1"),
        session_type: SessionType::Telnet,
        host: String::from("127.0.0.1"),
        port: telnet_port,
        params: vec![],
        jump_hosts: vec![],
    }));

    // The driver dials us back with a data connection whose first
    // frame names the session.
    let mut data = coord.accept();
    match data.read_msg() {
        Envelope::ConnectionReady(ready) => assert_eq!(ready.session_id, "t1"),
        other => panic!("expected ConnectionReady first on the data socket, got {other:?}"),
    }

    let (mut remote, _) = telnet_srv.accept().expect("accepting telnet connection");
    remote
        .set_read_timeout(Some(time::Duration::from_secs(5)))
        .expect("setting telnet read timeout");

    match control.read_msg() {
        Envelope::SessionOpenResult(result) => {
            assert_eq!(result.session_id, "t1");
            assert!(result.success, "open failed: {:?}", result.error_message);
            assert_eq!(result.connection_id, None);
        }
        other => panic!("expected SessionOpenResult, got {other:?}"),
    }

    // Remote -> data passes through unchanged.
    remote.write_all(b"hello").expect("telnet server write");
    let mut buf = [0u8; 5];
    data.stream.read_exact(&mut buf).expect("reading remote bytes off data channel");
    assert_eq!(&buf, b"hello");

    // Data -> remote passes through unchanged.
    data.stream.write_all(b"input").expect("data channel write");
    let mut buf = [0u8; 5];
    remote.read_exact(&mut buf).expect("reading client bytes at telnet server");
    assert_eq!(&buf, b"input");

    // Escaped IAC collapses to one 0xff payload byte.
    remote.write_all(&[0xff, 0xff, b'x']).expect("telnet server write");
    let mut buf = [0u8; 2];
    data.stream.read_exact(&mut buf).expect("reading unescaped bytes");
    assert_eq!(buf, [0xff, b'x']);

    // WILL ECHO gets answered with DO ECHO and never reaches the
    // data channel.
    remote.write_all(&[0xff, 251, 1]).expect("telnet server write");
    let mut buf = [0u8; 3];
    remote.read_exact(&mut buf).expect("reading negotiation reply");
    assert_eq!(buf, [0xff, 253, 1]);

    // A resize turns into a NAWS subnegotiation at the telnet peer.
    control.send_msg(&Envelope::SessionResize(SessionResize {
        session_id: String::from("t1"),
        cols: 80,
        rows: 24,
    }));
    let mut buf = [0u8; 9];
    remote.read_exact(&mut buf).expect("reading NAWS bytes");
    assert_eq!(buf, [0xff, 0xfa, 0x1f, 0x00, 0x50, 0x00, 0x18, 0xff, 0xf0]);

    // Server-side close tears the session down and reports it once.
    control.send_msg(&Envelope::SessionClose(SessionClose {
        session_id: String::from("t1"),
    }));
    match control.read_msg() {
        Envelope::SessionClosed(closed) => {
            assert_eq!(closed.session_id, "t1");
            assert_eq!(closed.reason.as_deref(), Some("closed by server"));
        }
        other => panic!("expected SessionClosed, got {other:?}"),
    }

    // The worker's own exit must not publish a second SessionClosed.
    control.send_msg(&Envelope::Ping(Ping { timestamp: 9 }));
    match control.read_msg() {
        Envelope::Pong(pong) => assert_eq!(pong.timestamp, 9),
        other => panic!("expected Pong after close, got {other:?}"),
    }

    cp.stop();
}

#[test]
#[timeout(30000)]
fn telnet_open_failure_reports_and_removes() {
    let coord = Coordinator::new();
    let (cp, registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut control = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    control.send_msg(&Envelope::SessionOpen(SessionOpen {
        session_id: String::from("dead"),
        session_type: SessionType::Telnet,
        host: String::from("127.0.0.1"),
        port: 1,
        params: vec![],
        jump_hosts: vec![],
    }));

    // The data connection comes up before the doomed remote connect.
    let mut data = coord.accept();
    match data.read_msg() {
        Envelope::ConnectionReady(ready) => assert_eq!(ready.session_id, "dead"),
        other => panic!("expected ConnectionReady, got {other:?}"),
    }

    match control.read_msg() {
        Envelope::SessionOpenResult(result) => {
            assert_eq!(result.session_id, "dead");
            assert!(!result.success);
            assert_eq!(
                result.error_message.as_deref(),
                Some("Failed to connect to telnet host")
            );
        }
        other => panic!("expected SessionOpenResult, got {other:?}"),
    }

    wait_until("failed session to leave the registry", || registry.is_empty());

    // A failed open owes no SessionClosed.
    control.send_msg(&Envelope::Ping(Ping { timestamp: 3 }));
    match control.read_msg() {
        Envelope::Pong(pong) => assert_eq!(pong.timestamp, 3),
        other => panic!("expected Pong after failed open, got {other:?}"),
    }

    cp.stop();
}

#[test]
#[timeout(30000)]
fn duplicate_session_id_rejected_on_the_wire() {
    let coord = Coordinator::new();
    let (cp, _registry) = start_control_plane(coord.port(), LONG_KEEPALIVE);

    let mut control = handshake(&coord);
    wait_until("engine to mark itself connected", || cp.is_connected());

    let telnet_srv = TcpListener::bind("127.0.0.1:0").expect("binding telnet server");
    let telnet_port = telnet_srv.local_addr().expect("telnet addr").port();

    let open = |id: &str| {
        Envelope::SessionOpen(SessionOpen {
            session_id: String::from(id),
            session_type: SessionType::Telnet,
            host: String::from("127.0.0.1"),
            port: telnet_port,
            params: vec![],
            jump_hosts: vec![],
        })
    };

    control.send_msg(&open("dup"));
    let mut data = coord.accept();
    match data.read_msg() {
        Envelope::ConnectionReady(ready) => assert_eq!(ready.session_id, "dup"),
        other => panic!("expected ConnectionReady, got {other:?}"),
    }
    let (_remote, _) = telnet_srv.accept().expect("accepting telnet connection");
    match control.read_msg() {
        Envelope::SessionOpenResult(result) => assert!(result.success),
        other => panic!("expected SessionOpenResult, got {other:?}"),
    }

    control.send_msg(&open("dup"));
    match control.read_msg() {
        Envelope::SessionOpenResult(result) => {
            assert_eq!(result.session_id, "dup");
            assert!(!result.success);
            assert_eq!(result.error_message.as_deref(), Some("Session already exists"));
        }
        other => panic!("expected duplicate-id SessionOpenResult, got {other:?}"),
    }

    control.send_msg(&Envelope::SessionClose(SessionClose {
        session_id: String::from("dup"),
    }));
    match control.read_msg() {
        Envelope::SessionClosed(closed) => assert_eq!(closed.session_id, "dup"),
        other => panic!("expected SessionClosed, got {other:?}"),
    }

    cp.stop();
}
