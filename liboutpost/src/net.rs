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

use std::net::{TcpStream, ToSocketAddrs as _};

use anyhow::{anyhow, Context};
use socket2::SockRef;
use tracing::debug;

/// Open a TCP connection to `host:port`.
///
/// The name is resolved to a full address list (v4 and v6) and each
/// candidate is tried in order. The winning socket gets SO_KEEPALIVE
/// and TCP_NODELAY.
pub fn tcp_connect(host: &str, port: u16) -> anyhow::Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                SockRef::from(&stream)
                    .set_keepalive(true)
                    .context("setting SO_KEEPALIVE")?;
                stream.set_nodelay(true).context("setting TCP_NODELAY")?;
                debug!("connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(e).with_context(|| format!("connecting to {host}:{port}")),
        None => Err(anyhow!("{host}:{port} resolved to no addresses")),
    }
}
