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

//! Batched reachability probes.
//!
//! Every target in a batch gets a non-blocking connect up front, then
//! one poll loop races them all against a single shared deadline:
//! each socket that turns writable is settled by its SO_ERROR state,
//! and whatever is still pending when the deadline passes counts as
//! offline. Total latency is bounded by the caller's timeout, not by
//! the number of slow targets. The whole batch runs on one detached
//! worker so the dispatcher stays responsive, and results come back
//! in request order.

use std::{net::ToSocketAddrs as _, os::fd::AsFd as _, sync::Arc, thread, time};

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use outpost_protocol::{PortCheck, PortCheckOutcome, PortCheckTarget};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, span, Level};

use crate::{consts, engine::control_plane::ControlPlane};

pub fn spawn(cp: Arc<ControlPlane>, req: PortCheck) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("port-check-{}", req.request_id))
        .spawn(move || run(cp, req))
        .context("spawning port check thread")?;
    Ok(())
}

fn run(cp: Arc<ControlPlane>, req: PortCheck) {
    let _s = span!(Level::INFO, "port_check", req = req.request_id).entered();

    let timeout = time::Duration::from_millis(if req.timeout_ms == 0 {
        consts::DEFAULT_PORT_CHECK_TIMEOUT_MS
    } else {
        req.timeout_ms
    });

    let results = check_targets(&req.targets, timeout);
    info!("checked {} targets", results.len());
    cp.send_port_check_result(&req.request_id, results);
}

/// A connect attempt that has not settled yet.
enum Probe {
    Connected,
    Pending(Socket),
}

/// Race non-blocking connects to every target against one deadline.
fn check_targets(targets: &[PortCheckTarget], timeout: time::Duration) -> Vec<PortCheckOutcome> {
    let deadline = time::Instant::now() + timeout;

    let mut online = vec![false; targets.len()];
    // Sockets still waiting on their connect, tagged with the index
    // of the target they belong to.
    let mut pending: Vec<(usize, Socket)> = vec![];

    for (index, target) in targets.iter().enumerate() {
        match begin_connect(&target.host, target.port) {
            Ok(Probe::Connected) => online[index] = true,
            Ok(Probe::Pending(socket)) => pending.push((index, socket)),
            Err(e) => debug!("{}:{} unreachable: {e:#}", target.host, target.port),
        }
    }

    while !pending.is_empty() {
        let now = time::Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        let poll_ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;

        let mut fds: Vec<PollFd> = pending
            .iter()
            .map(|(_, socket)| PollFd::new(socket.as_fd(), PollFlags::POLLOUT))
            .collect();
        let nready = match poll(&mut fds, PollTimeout::from(poll_ms)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        };
        if nready == 0 {
            // Timed out; the deadline check up top ends the loop.
            continue;
        }

        let mut settled = vec![];
        for (slot, fd) in fds.iter().enumerate() {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents
                .intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP)
            {
                settled.push(slot);
            }
        }
        drop(fds);

        // Highest slot first so swap_remove never disturbs a slot we
        // still have to visit.
        for slot in settled.into_iter().rev() {
            let (index, socket) = pending.swap_remove(slot);
            let reachable = matches!(socket.take_error(), Ok(None));
            debug!("{}:{} online={}", targets[index].host, targets[index].port, reachable);
            online[index] = reachable;
        }
    }

    targets
        .iter()
        .zip(online)
        .map(|(target, online)| PortCheckOutcome { id: target.id.clone(), online })
        .collect()
}

/// Kick off one non-blocking connect. Resolution failures and
/// immediate refusals surface as errors; an in-progress connect comes
/// back as a pending probe for the poll loop to settle.
fn begin_connect(host: &str, port: u16) -> anyhow::Result<Probe> {
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("{host}:{port} resolved to no addresses"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .context("creating probe socket")?;
    socket.set_nonblocking(true).context("setting probe socket non-blocking")?;

    match socket.connect(&addr.into()) {
        Ok(()) => Ok(Probe::Connected),
        Err(e) if e.raw_os_error() == Some(Errno::EINPROGRESS as i32) => {
            Ok(Probe::Pending(socket))
        }
        Err(e) => Err(e).with_context(|| format!("connecting to {host}:{port}")),
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;

    fn target(id: &str, host: &str, port: u16) -> PortCheckTarget {
        PortCheckTarget { id: String::from(id), host: String::from(host), port }
    }

    #[test]
    fn batch_settles_dead_and_live_targets() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to succeed");
        let port = listener.local_addr().expect("addr").port();

        let targets = vec![
            target("a", "127.0.0.1", 1),
            target("b", "127.0.0.1", port),
            target("c", "host.invalid.", 80),
        ];
        let results = check_targets(&targets, time::Duration::from_millis(500));

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "a");
        assert!(!results[0].online);
        assert_eq!(results[1].id, "b");
        assert!(results[1].online);
        assert_eq!(results[2].id, "c");
        assert!(!results[2].online);
    }

    #[test]
    fn empty_batch_is_empty() {
        let results = check_targets(&[], time::Duration::from_millis(100));
        assert!(results.is_empty());
    }
}
