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

//! Graphical session tests against a mock proxy daemon speaking the
//! Guacamole instruction handshake.

use std::{
    io::{Read as _, Write as _},
    net::{TcpListener, TcpStream},
    time,
};

use liboutpost::engine::guac::{Instruction, InstructionReader};
use ntest::timeout;
use outpost_protocol::{Envelope, SessionClose, SessionJoin, SessionOpen, SessionType};

mod support;
use support::{start_control_plane_with_proxy, wait_until, Coordinator};

const LONG_KEEPALIVE: time::Duration = time::Duration::from_secs(60);
const CONNECTION_ID: &str = "$260d01da-779b-4ee9-afc1-c16bae885cc7";

struct MockProxy {
    listener: TcpListener,
}

struct ProxyConn {
    stream: TcpStream,
    _reader: InstructionReader<TcpStream>,
}

impl MockProxy {
    fn new() -> MockProxy {
        MockProxy { listener: TcpListener::bind("127.0.0.1:0").expect("binding mock proxy") }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().expect("proxy addr").port()
    }

    /// Accept one engine connection and run the proxy side of the
    /// handshake. Returns the select argument and the post-handshake
    /// connection along with the connect instruction's values.
    fn serve(&self) -> (String, Vec<String>, ProxyConn) {
        let (stream, _) = self.listener.accept().expect("accepting proxy connection");
        stream
            .set_read_timeout(Some(time::Duration::from_secs(5)))
            .expect("setting proxy read timeout");
        let mut reader =
            InstructionReader::new(stream.try_clone().expect("cloning proxy stream"));

        let select = reader.read().expect("reading select");
        assert_eq!(select.opcode, "select");
        let selected = select.args.first().cloned().expect("select carries a target");

        let mut stream_w = stream.try_clone().expect("cloning proxy stream");
        let args = Instruction::new(
            "args",
            vec![
                String::from("VERSION_1_5_0"),
                String::from("hostname"),
                String::from("port"),
                String::from("password"),
            ],
        );
        stream_w.write_all(args.encode().as_bytes()).expect("sending args");

        let connect_args = loop {
            let instruction = reader.read().expect("reading handshake instruction");
            if instruction.opcode == "connect" {
                break instruction.args;
            }
        };

        let ready = Instruction::new("ready", vec![String::from(CONNECTION_ID)]);
        stream_w.write_all(ready.encode().as_bytes()).expect("sending ready");

        (selected, connect_args, ProxyConn { stream: stream_w, _reader: reader })
    }
}

#[test]
#[timeout(30000)]
fn vnc_session_with_join_and_close() {
    let coord = Coordinator::new();
    let proxy = MockProxy::new();
    let (cp, _registry) =
        start_control_plane_with_proxy(coord.port(), LONG_KEEPALIVE, proxy.port());

    let mut control = {
        let mut conn = coord.accept();
        match conn.read_msg() {
            Envelope::EngineHello(_) => {}
            other => panic!("expected EngineHello, got {other:?}"),
        }
        conn.send_msg(&Envelope::EngineHelloAck(outpost_protocol::EngineHelloAck {
            accepted: true,
            server_version: String::from("1.2.3"),
        }));
        conn
    };
    wait_until("engine to mark itself connected", || cp.is_connected());

    control.send_msg(&Envelope::SessionOpen(SessionOpen {
        session_id: String::from("v1"),
        session_type: SessionType::Vnc,
        host: String::from("10.9.9.9"),
        port: 5900,
        params: vec![(String::from("password"), String::from("hunter2"))],
        jump_hosts: vec![],
    }));

    // Owner data connection first, then the proxy handshake.
    let mut owner_data = coord.accept();
    match owner_data.read_msg() {
        Envelope::ConnectionReady(ready) => assert_eq!(ready.session_id, "v1"),
        other => panic!("expected ConnectionReady, got {other:?}"),
    }

    let (selected, connect_args, mut owner_proxy) = proxy.serve();
    assert_eq!(selected, "vnc");
    // Version echo, then one value per advertised argument.
    assert_eq!(
        connect_args,
        vec![
            String::from("VERSION_1_5_0"),
            String::from("10.9.9.9"),
            String::from("5900"),
            String::from("hunter2"),
        ]
    );

    match control.read_msg() {
        Envelope::SessionOpenResult(result) => {
            assert_eq!(result.session_id, "v1");
            assert!(result.success, "open failed: {:?}", result.error_message);
            assert_eq!(result.connection_id.as_deref(), Some(CONNECTION_ID));
        }
        other => panic!("expected SessionOpenResult, got {other:?}"),
    }

    // The owner's data channel is a raw pipe to the proxy now.
    owner_proxy.stream.write_all(b"4.sync,8.12345678;").expect("proxy write");
    let mut buf = [0u8; 18];
    owner_data.stream.read_exact(&mut buf).expect("reading proxy bytes on data channel");
    assert_eq!(&buf, b"4.sync,8.12345678;");

    owner_data.stream.write_all(b"4.sync,8.12345678;").expect("data channel write");
    let mut buf = [0u8; 18];
    owner_proxy.stream.read_exact(&mut buf).expect("reading client bytes at proxy");
    assert_eq!(&buf, b"4.sync,8.12345678;");

    // A join produces a second data connection and a second proxy
    // connection selecting the existing connection id.
    control.send_msg(&Envelope::SessionJoin(SessionJoin { session_id: String::from("v1") }));

    let mut join_data = coord.accept();
    match join_data.read_msg() {
        Envelope::ConnectionReady(ready) => assert_eq!(ready.session_id, "v1"),
        other => panic!("expected ConnectionReady on join socket, got {other:?}"),
    }

    let (selected, _, mut join_proxy) = proxy.serve();
    assert_eq!(selected, CONNECTION_ID);

    join_proxy.stream.write_all(b"5.mouse,1.1;").expect("join proxy write");
    let mut buf = [0u8; 12];
    join_data.stream.read_exact(&mut buf).expect("reading joined bytes");
    assert_eq!(&buf, b"5.mouse,1.1;");

    // Close tears everything down with a single SessionClosed.
    control.send_msg(&Envelope::SessionClose(SessionClose {
        session_id: String::from("v1"),
    }));
    match control.read_msg() {
        Envelope::SessionClosed(closed) => {
            assert_eq!(closed.session_id, "v1");
            assert_eq!(closed.reason.as_deref(), Some("closed by server"));
        }
        other => panic!("expected SessionClosed, got {other:?}"),
    }

    cp.stop();
}
