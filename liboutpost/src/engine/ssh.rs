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

//! The SSH transport: handshake, auth, and jump-host chaining.
//!
//! A jump chain is built one hop at a time. Hop 0 handshakes over a
//! real TCP socket. For every later hop (and for the final target) we
//! spawn a channel-proxy thread that opens a `direct-tcpip` channel on
//! the previous hop and pumps bytes between that channel and one end
//! of a socketpair; a fresh SSH handshake then runs over the other
//! end. Every inner hop is therefore SSH over SSH without the library
//! being any the wiser.
//!
//! `ssh2::Channel` cannot move between threads, so each proxy thread
//! opens its own channel; hop sessions are shared behind a mutex that
//! the pump takes per operation.

use std::{
    cmp,
    io::{Read as _, Write as _},
    os::fd::{AsFd as _, AsRawFd, IntoRawFd, OwnedFd},
    os::unix::net::UnixStream,
    sync::{Arc, Mutex},
    thread,
};

use anyhow::{anyhow, Context};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use outpost_protocol::JumpHost;
use tracing::{debug, info, warn};

use crate::{consts, engine::registry::Session as EngineSession, net};

/// Credentials for one SSH hop or target.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl Credentials {
    /// Pull credentials out of a session's parameter bag.
    pub fn from_session(session: &EngineSession) -> Credentials {
        Credentials {
            username: session.param("username").unwrap_or_default(),
            password: session.param("password"),
            private_key: session.param("privateKey"),
            passphrase: session.param("passphrase"),
        }
    }

    pub fn from_kv(params: &[(String, String)]) -> Credentials {
        let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        Credentials {
            username: get("username").unwrap_or_default(),
            password: get("password"),
            private_key: get("privateKey"),
            passphrase: get("passphrase"),
        }
    }

    fn from_jump(hop: &JumpHost) -> Credentials {
        Credentials {
            username: hop.username.clone(),
            password: hop.password.clone(),
            private_key: hop.private_key.clone(),
            passphrase: hop.passphrase.clone(),
        }
    }
}

/// An established SSH connection to the target, possibly layered over
/// a chain of jump hosts.
///
/// Field order matters for teardown: the target session disconnects
/// before the chain it rides on, and the chain unwinds tail first.
pub struct SshLink {
    pub session: ssh2::Session,
    /// The fd under the target session, for poll loops. A TCP socket
    /// for direct connections, the near socketpair end otherwise.
    pub poll_sock: OwnedFd,
    _chain: JumpChain,
}

#[derive(Default)]
struct JumpChain {
    hops: Vec<Arc<Mutex<ssh2::Session>>>,
}

impl Drop for JumpChain {
    fn drop(&mut self) {
        for hop in self.hops.drain(..).rev() {
            if let Ok(session) = hop.lock() {
                let _ = session.disconnect(None, "jump chain teardown", None);
            }
        }
    }
}

/// Connect to `host:port`, hopping through `jumps` in order. Auth for
/// the jump hosts happens here (each hop needs it before it will
/// forward); auth for the target is the caller's move.
pub fn connect(host: &str, port: u16, jumps: &[JumpHost]) -> anyhow::Result<SshLink> {
    if jumps.is_empty() {
        let stream = net::tcp_connect(host, port)?;
        let poll_sock: OwnedFd = stream.try_clone().context("cloning ssh socket")?.into();
        let session = handshake(stream)?;
        return Ok(SshLink { session, poll_sock, _chain: JumpChain::default() });
    }

    let jumps = &jumps[..cmp::min(jumps.len(), consts::MAX_JUMP_HOSTS)];
    let mut chain = JumpChain::default();

    let first = &jumps[0];
    info!("jump chain: connecting to hop 1 ({}:{})", first.host, first.port);
    let stream = net::tcp_connect(&first.host, first.port)
        .with_context(|| format!("connecting to jump host {}:{}", first.host, first.port))?;
    let session = handshake(stream)?;
    authenticate(&session, &Credentials::from_jump(first))
        .with_context(|| format!("authenticating to jump host {}:{}", first.host, first.port))?;
    chain.hops.push(Arc::new(Mutex::new(session)));

    for (i, hop) in jumps.iter().enumerate().skip(1) {
        info!("jump chain: forwarding to hop {} ({}:{})", i + 1, hop.host, hop.port);
        let parent = chain.hops.last().expect("chain is never empty here");
        let (session, _sock) = tunnel_through(parent, &hop.host, hop.port)?;
        authenticate(&session, &Credentials::from_jump(hop))
            .with_context(|| format!("authenticating to jump host {}:{}", hop.host, hop.port))?;
        chain.hops.push(Arc::new(Mutex::new(session)));
    }

    info!("jump chain: forwarding to target {}:{}", host, port);
    let last = chain.hops.last().expect("chain is never empty here");
    let (session, poll_sock) = tunnel_through(last, host, port)?;

    Ok(SshLink { session, poll_sock, _chain: chain })
}

fn handshake<S: IntoRawFd + AsRawFd + 'static>(stream: S) -> anyhow::Result<ssh2::Session> {
    let mut session = ssh2::Session::new().context("initializing ssh session")?;
    session.set_tcp_stream(stream);
    session.handshake().context("ssh handshake")?;
    Ok(session)
}

/// Open a forwarded path to `host:port` through `parent` and run a
/// fresh SSH handshake over it. Returns the new session along with a
/// pollable clone of the near socketpair end.
fn tunnel_through(
    parent: &Arc<Mutex<ssh2::Session>>,
    host: &str,
    port: u16,
) -> anyhow::Result<(ssh2::Session, OwnedFd)> {
    let (near, far) = UnixStream::pair().context("creating socketpair for jump tunnel")?;
    let poll_sock: OwnedFd = near.try_clone().context("cloning tunnel socket")?.into();

    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let parent = Arc::clone(parent);
    let target = (String::from(host), port);
    thread::Builder::new()
        .name(String::from("ssh-channel-proxy"))
        .spawn(move || channel_proxy(parent, target, far, ready_tx))
        .context("spawning channel proxy thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(e).with_context(|| format!("forwarding to {host}:{port}"));
        }
        Err(_) => return Err(anyhow!("channel proxy thread died before opening a channel")),
    }

    let session = handshake(near).context("ssh handshake over tunnel")?;
    Ok((session, poll_sock))
}

/// Pure byte pump between a freshly opened `direct-tcpip` channel and
/// one end of a socketpair. Owns nothing beyond its arguments; exits
/// on EOF from either side. The parent session runs non-blocking
/// while the pump lives and gets its prior mode back on the way out.
fn channel_proxy(
    parent: Arc<Mutex<ssh2::Session>>,
    target: (String, u16),
    sock: UnixStream,
    ready: crossbeam_channel::Sender<anyhow::Result<()>>,
) {
    let (host, port) = target;
    let (mut channel, was_blocking) = {
        let session = parent.lock().unwrap();
        let was_blocking = session.is_blocking();
        match session.channel_direct_tcpip(&host, port, None) {
            Ok(channel) => {
                session.set_blocking(false);
                (channel, was_blocking)
            }
            Err(e) => {
                let _ = ready.send(Err(anyhow!(e)));
                return;
            }
        }
    };
    let _ = ready.send(Ok(()));

    let mut buf = vec![0u8; consts::BUF_SIZE];
    'pump: loop {
        let mut had_activity = false;

        let read_res = {
            let _session = parent.lock().unwrap();
            channel.read(&mut buf)
        };
        match read_res {
            Ok(0) => {
                let at_eof = {
                    let _session = parent.lock().unwrap();
                    channel.eof()
                };
                if at_eof {
                    break;
                }
            }
            Ok(n) => {
                if (&sock).write_all(&buf[..n]).is_err() {
                    break;
                }
                had_activity = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        let mut fds = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::from(if had_activity { 0u16 } else { 10u16 });
        if let Ok(nready) = poll(&mut fds, timeout) {
            if nready > 0 {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    match (&sock).read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut off = 0;
                            while off < n {
                                let write_res = {
                                    let _session = parent.lock().unwrap();
                                    channel.write(&buf[off..n])
                                };
                                match write_res {
                                    Ok(w) => off += w,
                                    Err(e)
                                        if e.kind() == std::io::ErrorKind::WouldBlock =>
                                    {
                                        thread::sleep(consts::EAGAIN_BACKOFF);
                                    }
                                    Err(_) => break 'pump,
                                }
                            }
                            had_activity = true;
                        }
                    }
                }
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    break;
                }
            }
        }

        if !had_activity {
            thread::sleep(consts::EAGAIN_BACKOFF);
        }
    }

    // Free the channel with the session lock held, then restore the
    // blocking mode we found the session in.
    {
        let session = parent.lock().unwrap();
        drop(channel);
        session.set_blocking(was_blocking);
    }
    debug!("channel proxy pump for {}:{} finished", host, port);
}

/// Try public key auth (from an in-memory PEM string) first, then
/// password auth. Both absent or both failing is an error.
pub fn authenticate(session: &ssh2::Session, creds: &Credentials) -> anyhow::Result<()> {
    if let Some(key) = creds.private_key.as_deref().filter(|k| !k.is_empty()) {
        let passphrase = creds.passphrase.as_deref().filter(|p| !p.is_empty());
        match session.userauth_pubkey_memory(&creds.username, None, key, passphrase) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("public key auth failed: {}", e),
        }
    }

    if let Some(password) = creds.password.as_deref().filter(|p| !p.is_empty()) {
        match session.userauth_password(&creds.username, password) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("password auth failed: {}", e),
        }
    }

    Err(anyhow!("no ssh authentication method succeeded"))
}

/// Read one of an exec channel's streams to EOF, keeping at most
/// `cap` bytes. Anything past the cap is discarded without note.
pub fn read_stream_capped(channel: &mut ssh2::Channel, stderr: bool, cap: usize) -> String {
    let mut out: Vec<u8> = vec![];
    let mut tmp = [0u8; 4096];
    loop {
        let res = if stderr { channel.stderr().read(&mut tmp) } else { channel.read(&mut tmp) };
        match res {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = cmp::min(cap - out.len(), n);
                    out.extend_from_slice(&tmp[..take]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(consts::EAGAIN_BACKOFF);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Run a command on an already-authenticated session, returning
/// (stdout, stderr, exit code) with both streams capped.
pub fn exec_remote(
    session: &ssh2::Session,
    command: &str,
) -> anyhow::Result<(String, String, i32)> {
    let mut channel = session.channel_session().context("opening exec channel")?;
    channel.exec(command).context("starting remote command")?;

    let stdout = read_stream_capped(&mut channel, false, consts::EXEC_OUTPUT_CAP);
    let stderr = read_stream_capped(&mut channel, true, consts::EXEC_OUTPUT_CAP);

    let _ = channel.close();
    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok((stdout, stderr, exit_code))
}

/// Polite teardown for a session-level channel. Errors are expected
/// when the peer is already gone and get dropped on the floor.
pub fn teardown_channel(channel: &mut ssh2::Channel) {
    let _ = channel.send_eof();
    let _ = channel.close();
}

/// Pull a jump chain out of a session's synthetic parameters
/// (`jumpHostCount`, `jumpHost{i}_host`, ...). The dispatcher flattens
/// the wire-level jump host list into these so every driver consumes
/// them the same way.
pub fn jump_hosts_from_params(session: &EngineSession) -> Vec<JumpHost> {
    let count = session
        .param("jumpHostCount")
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    let count = cmp::min(count, consts::MAX_JUMP_HOSTS);

    let mut hops = Vec::with_capacity(count);
    for i in 0..count {
        let host = match session.param(&format!("jumpHost{i}_host")) {
            Some(h) if !h.is_empty() => h,
            _ => {
                warn!("jump host {} missing host param, truncating chain", i);
                break;
            }
        };
        hops.push(JumpHost {
            host,
            port: session
                .param(&format!("jumpHost{i}_port"))
                .and_then(|p| p.parse().ok())
                .unwrap_or(22),
            username: session.param(&format!("jumpHost{i}_username")).unwrap_or_default(),
            password: session.param(&format!("jumpHost{i}_password")),
            private_key: session.param(&format!("jumpHost{i}_privateKey")),
            passphrase: session.param(&format!("jumpHost{i}_passphrase")),
        });
    }
    hops
}

/// Flatten a wire-level jump host list into session params.
pub fn jump_hosts_to_params(session: &EngineSession, jumps: &[JumpHost]) {
    if jumps.is_empty() {
        return;
    }
    let jumps = &jumps[..cmp::min(jumps.len(), consts::MAX_JUMP_HOSTS)];
    session.add_param("jumpHostCount", &jumps.len().to_string());
    for (i, hop) in jumps.iter().enumerate() {
        session.add_param(&format!("jumpHost{i}_host"), &hop.host);
        session.add_param(&format!("jumpHost{i}_port"), &hop.port.to_string());
        session.add_param(&format!("jumpHost{i}_username"), &hop.username);
        if let Some(password) = &hop.password {
            session.add_param(&format!("jumpHost{i}_password"), password);
        }
        if let Some(key) = &hop.private_key {
            session.add_param(&format!("jumpHost{i}_privateKey"), key);
        }
        if let Some(passphrase) = &hop.passphrase {
            session.add_param(&format!("jumpHost{i}_passphrase"), passphrase);
        }
    }
}

#[cfg(test)]
mod test {
    use outpost_protocol::SessionType;

    use super::*;
    use crate::engine::registry::Registry;

    #[test]
    fn jump_hosts_round_trip_through_params() {
        let registry = Registry::new();
        let session =
            registry.create("s1", SessionType::Ssh, "target", 22).expect("create to succeed");

        let jumps = vec![
            JumpHost {
                host: String::from("hop1"),
                port: 2222,
                username: String::from("alice"),
                password: Some(String::from("pw")),
                private_key: None,
                passphrase: None,
            },
            JumpHost {
                host: String::from("hop2"),
                port: 22,
                username: String::from("bob"),
                password: None,
                private_key: Some(String::from("PEM")),
                passphrase: Some(String::from("pp")),
            },
        ];
        jump_hosts_to_params(&session, &jumps);

        let recovered = jump_hosts_from_params(&session);
        assert_eq!(recovered, jumps);
    }

    #[test]
    fn missing_count_means_no_jumps() {
        let registry = Registry::new();
        let session =
            registry.create("s1", SessionType::Ssh, "target", 22).expect("create to succeed");
        assert!(jump_hosts_from_params(&session).is_empty());
    }

    #[test]
    fn truncated_chain_stops_at_missing_host() {
        let registry = Registry::new();
        let session =
            registry.create("s1", SessionType::Ssh, "target", 22).expect("create to succeed");
        session.add_param("jumpHostCount", "3");
        session.add_param("jumpHost0_host", "hop1");
        session.add_param("jumpHost0_username", "u");
        // jumpHost1_host intentionally absent.
        session.add_param("jumpHost2_host", "hop3");

        let hops = jump_hosts_from_params(&session);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].host, "hop1");
    }
}
