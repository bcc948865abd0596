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

//! SSH-family session drivers: interactive shells, direct-tcpip
//! tunnels, and one-shot exec commands.

use std::{
    io::{Read as _, Write as _},
    net::TcpStream,
    os::fd::AsFd as _,
    sync::Arc,
    thread,
};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use outpost_protocol::ExecCommand;
use tracing::{debug, info, span, warn, Level};

use crate::{
    consts,
    engine::{
        control_plane::ControlPlane,
        registry::{Session, SessionCmd, SessionState},
        ssh,
    },
};

pub fn start_shell(cp: Arc<ControlPlane>, session: Arc<Session>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("ssh-{}", session.id))
        .spawn(move || run_shell(cp, session))
        .context("spawning ssh session thread")?;
    Ok(())
}

pub fn start_tunnel(cp: Arc<ControlPlane>, session: Arc<Session>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("tunnel-{}", session.id))
        .spawn(move || run_tunnel(cp, session))
        .context("spawning tunnel session thread")?;
    Ok(())
}

fn run_shell(cp: Arc<ControlPlane>, session: Arc<Session>) {
    let _s = span!(Level::INFO, "ssh", s = session.id).entered();
    session.advance(SessionState::Connecting);

    let creds = ssh::Credentials::from_session(&session);
    if creds.username.is_empty() {
        cp.session_failed(&session, "Missing username");
        return;
    }
    let jumps = ssh::jump_hosts_from_params(&session);

    info!(
        "connecting to {}:{} as {} (jump_hosts={})",
        session.host,
        session.port,
        creds.username,
        jumps.len()
    );

    let data = match cp.open_data_connection(&session.id) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("opening data connection: {:?}", e);
            cp.session_failed(&session, "Failed to open data connection");
            return;
        }
    };
    session.set_data_sock(Arc::clone(&data));

    let link = match ssh::connect(&session.host, session.port, &jumps) {
        Ok(link) => link,
        Err(e) => {
            warn!("ssh connect: {:?}", e);
            cp.session_failed(&session, "Failed to connect to SSH host");
            return;
        }
    };

    if let Err(e) = ssh::authenticate(&link.session, &creds) {
        debug!("auth: {:?}", e);
        cp.session_failed(&session, "SSH authentication failed");
        return;
    }
    debug!("authenticated");

    let mut channel = match link.session.channel_session() {
        Ok(channel) => channel,
        Err(e) => {
            warn!("opening session channel: {}", e);
            cp.session_failed(&session, "Failed to open SSH channel");
            return;
        }
    };
    if let Err(e) = channel.request_pty("xterm-256color", None, None) {
        warn!("requesting pty: {}", e);
        cp.session_failed(&session, "Failed to request PTY");
        return;
    }
    if let Err(e) = channel.shell() {
        warn!("starting shell: {}", e);
        cp.session_failed(&session, "Failed to start shell");
        return;
    }

    link.session.set_blocking(false);

    if session.advance(SessionState::Active) != SessionState::Active {
        // Closed out from under us while connecting.
        ssh::teardown_channel(&mut channel);
        cp.session_failed(&session, "Session closed");
        return;
    }
    cp.session_opened(&session, None);
    info!("active (target={}:{}, user={})", session.host, session.port, creds.username);

    bridge(&session, &data, &mut channel, &link);

    info!("ending");
    ssh::teardown_channel(&mut channel);
    cp.session_ended(&session, "session ended");
}

fn run_tunnel(cp: Arc<ControlPlane>, session: Arc<Session>) {
    let _s = span!(Level::INFO, "tunnel", s = session.id).entered();
    session.advance(SessionState::Connecting);

    let creds = ssh::Credentials::from_session(&session);
    if creds.username.is_empty() {
        cp.session_failed(&session, "Missing username");
        return;
    }
    let (remote_host, remote_port) = match (
        session.param("remoteHost"),
        session.param("remotePort"),
    ) {
        (Some(host), Some(port)) if !host.is_empty() => {
            match port.parse::<u16>() {
                Ok(port) if port > 0 => (host, port),
                _ => {
                    cp.session_failed(&session, "Invalid remotePort");
                    return;
                }
            }
        }
        _ => {
            cp.session_failed(&session, "Missing remoteHost/remotePort");
            return;
        }
    };
    let jumps = ssh::jump_hosts_from_params(&session);

    info!(
        "{}:{} -> forward to {}:{} (jump_hosts={})",
        session.host,
        session.port,
        remote_host,
        remote_port,
        jumps.len()
    );

    let data = match cp.open_data_connection(&session.id) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("opening data connection: {:?}", e);
            cp.session_failed(&session, "Failed to open data connection");
            return;
        }
    };
    session.set_data_sock(Arc::clone(&data));

    let link = match ssh::connect(&session.host, session.port, &jumps) {
        Ok(link) => link,
        Err(e) => {
            warn!("ssh connect: {:?}", e);
            cp.session_failed(&session, "Failed to connect to SSH host");
            return;
        }
    };

    if let Err(e) = ssh::authenticate(&link.session, &creds) {
        debug!("auth: {:?}", e);
        cp.session_failed(&session, "SSH authentication failed");
        return;
    }

    let mut channel = match link.session.channel_direct_tcpip(&remote_host, remote_port, None) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("direct-tcpip to {}:{} failed: {}", remote_host, remote_port, e);
            cp.session_failed(&session, "Port forward failed");
            return;
        }
    };

    link.session.set_blocking(false);

    if session.advance(SessionState::Active) != SessionState::Active {
        ssh::teardown_channel(&mut channel);
        cp.session_failed(&session, "Session closed");
        return;
    }
    cp.session_opened(&session, None);
    info!("active ({}:{} -> {}:{})", session.host, session.port, remote_host, remote_port);

    bridge(&session, &data, &mut channel, &link);

    info!("ending");
    ssh::teardown_channel(&mut channel);
    cp.session_ended(&session, "tunnel ended");
}

/// Shuffle bytes between the data connection and the SSH channel
/// until either side closes or the session stops being Active.
fn bridge(session: &Session, data: &TcpStream, channel: &mut ssh2::Channel, link: &ssh::SshLink) {
    let mut buf = vec![0u8; consts::BUF_SIZE];

    while session.state() == SessionState::Active {
        while let Some(cmd) = session.try_cmd() {
            match cmd {
                SessionCmd::Resize { cols, rows } => resize_pty(session, channel, cols, rows),
                SessionCmd::Close => return,
            }
        }

        let mut fds = [
            PollFd::new(data.as_fd(), PollFlags::POLLIN),
            PollFd::new(link.poll_sock.as_fd(), PollFlags::POLLIN),
        ];
        let nready = match poll(&mut fds, PollTimeout::from(consts::BRIDGE_POLL_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        };
        if nready == 0 {
            continue;
        }

        let data_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let ssh_revents = fds[1].revents().unwrap_or(PollFlags::empty());

        if data_revents.contains(PollFlags::POLLIN) {
            let nread = match (&*data).read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if write_channel_all(channel, &buf[..nread]).is_err() {
                return;
            }
        }

        if ssh_revents.contains(PollFlags::POLLIN) && read_channel_to_fd(channel, data).is_err() {
            return;
        }

        if data_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            return;
        }

        if channel.eof() {
            drain_channel(channel, data);
            return;
        }

        if ssh_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            drain_channel(channel, data);
            return;
        }
    }
}

fn resize_pty(session: &Session, channel: &mut ssh2::Channel, cols: u16, rows: u16) {
    match channel.request_pty_size(u32::from(cols), u32::from(rows), None, None) {
        Ok(()) => debug!("session {} resized to {}x{}", session.id, cols, rows),
        Err(e) => warn!("session {} pty resize failed: {}", session.id, e),
    }
}

/// Write a full buffer into the channel, backing off briefly whenever
/// the transport reports EAGAIN.
fn write_channel_all(channel: &mut ssh2::Channel, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match channel.write(buf) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(consts::EAGAIN_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Move whatever the channel currently has into the data fd without
/// blocking on the channel.
fn read_channel_to_fd(channel: &mut ssh2::Channel, data: &TcpStream) -> std::io::Result<()> {
    let mut buf = [0u8; consts::BUF_SIZE];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => (&*data).write_all(&buf[..n])?,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn drain_channel(channel: &mut ssh2::Channel, data: &TcpStream) {
    let mut buf = [0u8; consts::BUF_SIZE];
    loop {
        match channel.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if (&*data).write_all(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

/// Run a one-shot remote command on a detached worker so the
/// dispatcher never blocks on a slow host.
pub fn spawn_exec(cp: Arc<ControlPlane>, msg: ExecCommand) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("exec-{}", msg.request_id))
        .spawn(move || run_exec(cp, msg))
        .context("spawning exec command thread")?;
    Ok(())
}

fn run_exec(cp: Arc<ControlPlane>, msg: ExecCommand) {
    let _s = span!(Level::INFO, "exec", req = msg.request_id).entered();

    let creds = ssh::Credentials::from_kv(&msg.params);
    let jumps = &msg.jump_hosts;

    let link = match ssh::connect(&msg.host, msg.port, jumps) {
        Ok(link) => link,
        Err(e) => {
            warn!("ssh connect: {:?}", e);
            cp.send_exec_result(&msg.request_id, false, None, None, -1, Some("Failed to connect to SSH host"));
            return;
        }
    };

    if let Err(e) = ssh::authenticate(&link.session, &creds) {
        debug!("auth: {:?}", e);
        cp.send_exec_result(&msg.request_id, false, None, None, -1, Some("SSH authentication failed"));
        return;
    }

    let mut channel = match link.session.channel_session() {
        Ok(channel) => channel,
        Err(e) => {
            warn!("opening exec channel: {}", e);
            cp.send_exec_result(&msg.request_id, false, None, None, -1, Some("Failed to open SSH channel"));
            return;
        }
    };
    if let Err(e) = channel.exec(&msg.command) {
        warn!("exec: {}", e);
        cp.send_exec_result(&msg.request_id, false, None, None, -1, Some("Failed to execute command"));
        return;
    }

    let stdout = ssh::read_stream_capped(&mut channel, false, consts::EXEC_OUTPUT_CAP);
    let stderr = ssh::read_stream_capped(&mut channel, true, consts::EXEC_OUTPUT_CAP);

    let _ = channel.close();
    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);

    info!("command finished with exit code {}", exit_code);
    cp.send_exec_result(&msg.request_id, true, Some(stdout), Some(stderr), exit_code, None);
}
