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

//! The VNC/RDP session driver.
//!
//! The engine does not speak the remote-desktop protocols itself; it
//! brokers each user through the graphical proxy daemon. The session
//! thread owns a join rendezvous (a local datagram socketpair): the
//! dispatcher opens a fresh data connection for every `SessionJoin`
//! and passes the live fd over the rendezvous as SCM_RIGHTS ancillary
//! data, and the session thread turns each received fd into another
//! user of the same proxy connection.

use std::{
    io::{IoSlice, IoSliceMut, Read as _, Write as _},
    net::{Shutdown, TcpStream},
    os::fd::{AsFd as _, AsRawFd as _, FromRawFd as _, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{anyhow, Context};
use nix::{
    cmsg_space,
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{
        recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
        MsgFlags, SockFlag, SockType,
    },
};
use outpost_protocol::SessionType;
use socket2::SockRef;
use tracing::{debug, info, span, warn, Level};

use crate::{
    consts,
    engine::{
        control_plane::ControlPlane,
        guac,
        registry::{Session, SessionState},
    },
};

pub fn start(cp: Arc<ControlPlane>, session: Arc<Session>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("guac-{}", session.id))
        .spawn(move || run(cp, session))
        .context("spawning graphical session thread")?;
    Ok(())
}

fn run(cp: Arc<ControlPlane>, session: Arc<Session>) {
    let _s = span!(Level::INFO, "graphical", s = session.id).entered();
    session.advance(SessionState::Connecting);

    let protocol = match session.kind {
        SessionType::Vnc => "vnc",
        SessionType::Rdp => "rdp",
        other => {
            warn!("unsupported graphical session type {}", other);
            cp.session_failed(&session, "Unsupported session type");
            return;
        }
    };
    info!("starting with protocol {}", protocol);

    // The rendezvous the dispatcher will pass join fds through.
    let (join_rx, join_tx) = match socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("creating join rendezvous: {}", e);
            cp.session_failed(&session, "Failed to create join pipe");
            return;
        }
    };
    session.set_join_tx(join_tx);

    let data = match cp.open_data_connection(&session.id) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("opening data connection: {:?}", e);
            cp.session_failed(&session, "Failed to open data connection");
            return;
        }
    };
    session.set_data_sock(Arc::clone(&data));

    let (proxy_host, proxy_port) = cp.proxy_addr();
    let owner = match guac::connect_owner(
        &proxy_host,
        proxy_port,
        protocol,
        &session,
        consts::HANDSHAKE_TIMEOUT,
    ) {
        Ok(owner) => owner,
        Err(e) => {
            warn!("proxy handshake: {:?}", e);
            cp.session_failed(&session, "Failed to connect to graphical proxy");
            return;
        }
    };
    if let Err(e) = SockRef::from(&owner.stream).set_keepalive(true) {
        warn!("setting proxy keepalive: {}", e);
    }

    let connection_id = owner.connection_id.clone();
    session.set_connection_id(&connection_id);

    if session.advance(SessionState::Active) != SessionState::Active {
        cp.session_failed(&session, "Session closed");
        return;
    }
    cp.session_opened(&session, Some(&connection_id));
    info!("active (connection_id={})", connection_id);

    let users = Arc::new(AtomicUsize::new(0));
    spawn_user(Arc::clone(&session), Arc::clone(&data), owner, Arc::clone(&users), true);

    accept_joins(&cp, &session, &join_rx, &users);

    info!("ending");
    cp.session_ended(&session, "session ended");
}

/// Hand a user's data connection and handshaked proxy connection to a
/// dedicated pump thread. The user count is bumped before the thread
/// exists so the accept-joins loop can never observe a
/// spawned-but-uncounted user.
fn spawn_user(
    session: Arc<Session>,
    data: Arc<TcpStream>,
    proxy: guac::ProxyConnection,
    users: Arc<AtomicUsize>,
    owner: bool,
) {
    users.fetch_add(1, Ordering::AcqRel);
    let users_thread = users.clone();
    let spawned = thread::Builder::new()
        .name(format!("guac-user-{}", session.id))
        .spawn(move || {
            let _s = span!(Level::INFO, "guac_user", s = session.id, owner).entered();
            pump_user(&session, &data, &proxy.stream, &proxy.residual);
            let _ = data.shutdown(Shutdown::Both);
            let _ = proxy.stream.shutdown(Shutdown::Both);
            let remaining = users_thread.fetch_sub(1, Ordering::AcqRel) - 1;
            info!("user disconnected (remaining={})", remaining);
        });
    if let Err(e) = spawned {
        warn!("spawning user thread: {}", e);
        users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Raw byte pump between one user's data connection and its proxy
/// connection.
fn pump_user(session: &Session, data: &TcpStream, proxy: &TcpStream, residual: &[u8]) {
    if !residual.is_empty() && (&*data).write_all(residual).is_err() {
        return;
    }

    let mut buf = vec![0u8; consts::BUF_SIZE];

    while session.state() == SessionState::Active {
        let mut fds = [
            PollFd::new(data.as_fd(), PollFlags::POLLIN),
            PollFd::new(proxy.as_fd(), PollFlags::POLLIN),
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
        let proxy_revents = fds[1].revents().unwrap_or(PollFlags::empty());

        if data_revents.contains(PollFlags::POLLIN) {
            let nread = match (&*data).read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if (&*proxy).write_all(&buf[..nread]).is_err() {
                return;
            }
        }

        if proxy_revents.contains(PollFlags::POLLIN) {
            let nread = match (&*proxy).read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if (&*data).write_all(&buf[..nread]).is_err() {
                return;
            }
        }

        if data_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP)
            || proxy_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP)
        {
            return;
        }
    }
}

/// Wait for join fds from the dispatcher, spawning a user per fd.
/// Stops when every user is gone, the rendezvous dies, or the session
/// leaves Active.
fn accept_joins(
    cp: &Arc<ControlPlane>,
    session: &Arc<Session>,
    join_rx: &OwnedFd,
    users: &Arc<AtomicUsize>,
) {
    while session.state() == SessionState::Active {
        let mut fds = [PollFd::new(join_rx.as_fd(), PollFlags::POLLIN)];
        let nready = match poll(&mut fds, PollTimeout::from(consts::JOIN_POLL_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        };

        if nready == 0 {
            if users.load(Ordering::Acquire) == 0 {
                info!("all users disconnected");
                return;
            }
            continue;
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            return;
        }

        let join_fd = match recv_join_fd(join_rx) {
            Ok(fd) => fd,
            Err(e) => {
                debug!("join rendezvous closed: {:?}", e);
                return;
            }
        };
        info!("join connection received (fd={})", join_fd.as_raw_fd());

        let data = Arc::new(TcpStream::from(join_fd));
        let cp = Arc::clone(cp);
        let session = Arc::clone(session);
        let users = Arc::clone(users);
        spawn_joiner(cp, session, data, users);
    }
}

/// A joiner runs its proxy handshake on its own thread so a slow
/// proxy cannot stall the accept-joins loop.
fn spawn_joiner(
    cp: Arc<ControlPlane>,
    session: Arc<Session>,
    data: Arc<TcpStream>,
    users: Arc<AtomicUsize>,
) {
    let spawned = thread::Builder::new().name(format!("guac-join-{}", session.id)).spawn(
        move || {
            let (proxy_host, proxy_port) = cp.proxy_addr();
            let connection_id = match session.connection_id() {
                Some(id) => id,
                None => return,
            };
            match guac::connect_join(
                &proxy_host,
                proxy_port,
                &connection_id,
                &session,
                consts::HANDSHAKE_TIMEOUT,
            ) {
                Ok(joined) => {
                    spawn_user(session, data, joined, users, false);
                }
                Err(e) => {
                    warn!("joiner handshake failed: {:?}", e);
                    let _ = data.shutdown(Shutdown::Both);
                }
            }
        },
    );
    if let Err(e) = spawned {
        warn!("spawning joiner thread: {}", e);
    }
}

fn recv_join_fd(join_rx: &OwnedFd) -> anyhow::Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = cmsg_space!([std::os::fd::RawFd; 1]);

    let msg = recvmsg::<()>(
        join_rx.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .context("receiving join datagram")?;
    if msg.bytes == 0 {
        return Err(anyhow!("join rendezvous closed"));
    }

    for cmsg in msg.cmsgs().context("parsing control messages")? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // Safety: the kernel just installed this fd for us via
                // SCM_RIGHTS, so we hold its only reference.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(anyhow!("join datagram carried no fd"))
}

/// Dispatcher-side join: open a fresh data connection and pass it to
/// the session thread over the rendezvous.
pub fn join(cp: &Arc<ControlPlane>, session: &Arc<Session>) -> anyhow::Result<()> {
    if session.state() != SessionState::Active {
        return Err(anyhow!("session {} is not active", session.id));
    }

    let data = cp.open_data_connection(&session.id).context("opening join data connection")?;

    let sent = session.with_join_tx(|join_tx| {
        let fds = [data.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(b"J")];
        sendmsg::<()>(join_tx.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .context("passing join fd to session thread")
    });

    match sent {
        Some(Ok(_)) => {
            // The session thread owns its copy now; ours closes when
            // `data` drops here.
            info!("join fd sent to session {}", session.id);
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => Err(anyhow!("session {} has no join rendezvous", session.id)),
    }
}
