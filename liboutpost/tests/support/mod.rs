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

//! A mock coordinator for driving the control-plane client in tests.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::{
    net::{TcpListener, TcpStream},
    sync::Arc,
    time,
};

use liboutpost::{
    consts,
    engine::{
        control_plane::{ControlPlane, Settings},
        registry::Registry,
    },
    protocol,
};
use outpost_protocol::Envelope;

const IO_TIMEOUT: time::Duration = time::Duration::from_secs(5);

pub struct Coordinator {
    listener: TcpListener,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding mock coordinator");
        Coordinator { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("coordinator addr").port()
    }

    /// Accept the next inbound connection (control or data plane).
    pub fn accept(&self) -> Conn {
        let (stream, _) = self.listener.accept().expect("accepting engine connection");
        stream.set_read_timeout(Some(IO_TIMEOUT)).expect("setting read timeout");
        Conn { stream }
    }
}

pub struct Conn {
    pub stream: TcpStream,
}

impl Conn {
    pub fn read_msg(&mut self) -> Envelope {
        protocol::read_msg(&mut self.stream, consts::MAX_FRAME_SIZE)
            .expect("reading frame from engine")
    }

    pub fn send_msg(&mut self, envelope: &Envelope) {
        protocol::write_msg(&mut self.stream, envelope).expect("writing frame to engine")
    }

    /// Read messages until one that is not a keepalive ping shows up.
    pub fn read_msg_skipping_pings(&mut self) -> Envelope {
        loop {
            match self.read_msg() {
                Envelope::Ping(_) => continue,
                other => return other,
            }
        }
    }
}

/// Spin up a control-plane client aimed at the mock coordinator.
pub fn start_control_plane(
    port: u16,
    keepalive_interval: time::Duration,
) -> (Arc<ControlPlane>, Arc<Registry>) {
    start_control_plane_with_proxy(port, keepalive_interval, 4822)
}

/// Like `start_control_plane`, but with the graphical proxy pointed
/// at a test-owned port.
pub fn start_control_plane_with_proxy(
    port: u16,
    keepalive_interval: time::Duration,
    proxy_port: u16,
) -> (Arc<ControlPlane>, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    let settings = Settings {
        host: String::from("127.0.0.1"),
        port,
        registration_token: String::new(),
        proxy_host: String::from("127.0.0.1"),
        proxy_port,
        keepalive_interval,
        reconnect_delay: time::Duration::from_millis(100),
    };
    let cp = ControlPlane::new(settings, Arc::clone(&registry));
    cp.start().expect("control plane start");
    (cp, registry)
}

/// Poll until `cond` holds or the deadline passes.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = time::Instant::now() + IO_TIMEOUT;
    while time::Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(time::Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
