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

//! The telnet session driver.
//!
//! Bytes from the data connection pass through to the telnet peer
//! unchanged. Bytes from the peer get option negotiation stripped and
//! answered in place: we DO echo and suppress-go-ahead, we WILL
//! terminal-type and window-size, and we decline everything else.

use std::{
    io::{Read as _, Write},
    net::TcpStream,
    sync::Arc,
    thread,
};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use tracing::{debug, info, span, warn, Level};

use crate::{
    consts,
    engine::{
        control_plane::ControlPlane,
        registry::{Session, SessionCmd, SessionState},
    },
    net,
};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const TELOPT_ECHO: u8 = 1;
const TELOPT_SGA: u8 = 3;
const TELOPT_TTYPE: u8 = 24;
const TELOPT_NAWS: u8 = 31;

const TERM_NAME: &[u8] = b"xterm-256color";

pub fn start(cp: Arc<ControlPlane>, session: Arc<Session>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("telnet-{}", session.id))
        .spawn(move || run(cp, session))
        .context("spawning telnet session thread")?;
    Ok(())
}

fn run(cp: Arc<ControlPlane>, session: Arc<Session>) {
    let _s = span!(Level::INFO, "telnet", s = session.id).entered();
    session.advance(SessionState::Connecting);

    info!("connecting to {}:{}", session.host, session.port);

    let data = match cp.open_data_connection(&session.id) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("opening data connection: {:?}", e);
            cp.session_failed(&session, "Failed to open data connection");
            return;
        }
    };
    session.set_data_sock(Arc::clone(&data));

    let remote = match net::tcp_connect(&session.host, session.port) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("telnet connect: {:?}", e);
            cp.session_failed(&session, "Failed to connect to telnet host");
            return;
        }
    };
    session.set_remote_sock(Arc::clone(&remote));

    if session.advance(SessionState::Active) != SessionState::Active {
        cp.session_failed(&session, "Session closed");
        return;
    }
    cp.session_opened(&session, None);
    info!("active (target={}:{})", session.host, session.port);

    bridge(&session, &data, &remote);

    info!("ending");
    cp.session_ended(&session, "session ended");
}

fn bridge(session: &Session, data: &TcpStream, remote: &TcpStream) {
    use std::os::fd::AsFd as _;

    let mut buf = vec![0u8; consts::BUF_SIZE];

    while session.state() == SessionState::Active {
        while let Some(cmd) = session.try_cmd() {
            match cmd {
                SessionCmd::Resize { cols, rows } => {
                    match send_naws(&mut &*remote, cols, rows) {
                        Ok(()) => debug!("session {} resized to {}x{}", session.id, cols, rows),
                        Err(e) => warn!("session {} NAWS resize failed: {}", session.id, e),
                    }
                }
                SessionCmd::Close => return,
            }
        }

        let mut fds = [
            PollFd::new(data.as_fd(), PollFlags::POLLIN),
            PollFd::new(remote.as_fd(), PollFlags::POLLIN),
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
        let remote_revents = fds[1].revents().unwrap_or(PollFlags::empty());

        if data_revents.contains(PollFlags::POLLIN) {
            let nread = match (&*data).read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if (&*remote).write_all(&buf[..nread]).is_err() {
                return;
            }
        }

        if remote_revents.contains(PollFlags::POLLIN) {
            let nread = match (&*remote).read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if process_inbound(&buf[..nread], &mut &*remote, &mut &*data).is_err() {
                return;
            }
        }

        if data_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            return;
        }
        if remote_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            return;
        }
    }
}

/// Strip and answer telnet commands in a chunk from the peer, passing
/// the remaining payload bytes through to the data connection.
///
/// Negotiations that straddle a chunk boundary are dropped rather
/// than buffered; real servers send them whole.
fn process_inbound<TW, DW>(buf: &[u8], telnet_out: &mut TW, data_out: &mut DW) -> std::io::Result<()>
where
    TW: Write,
    DW: Write,
{
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;

    while i < buf.len() {
        if buf[i] != IAC || i + 1 >= buf.len() {
            out.push(buf[i]);
            i += 1;
            continue;
        }

        let cmd = buf[i + 1];
        if cmd == IAC {
            // Escaped 0xFF data byte.
            out.push(IAC);
            i += 2;
        } else if (WILL..=DONT).contains(&cmd) && i + 2 < buf.len() {
            negotiate(telnet_out, cmd, buf[i + 2])?;
            i += 3;
        } else if cmd == SB && i + 2 < buf.len() {
            i = subnegotiate(telnet_out, buf, i)?;
        } else {
            i += 2;
        }
    }

    if !out.is_empty() {
        data_out.write_all(&out)?;
    }
    Ok(())
}

fn negotiate<W: Write>(telnet_out: &mut W, cmd: u8, opt: u8) -> std::io::Result<()> {
    let reply = match cmd {
        DO => {
            if opt == TELOPT_NAWS || opt == TELOPT_TTYPE {
                WILL
            } else {
                WONT
            }
        }
        DONT => WONT,
        WILL => {
            if opt == TELOPT_ECHO || opt == TELOPT_SGA {
                DO
            } else {
                DONT
            }
        }
        WONT => DONT,
        _ => return Ok(()),
    };
    telnet_out.write_all(&[IAC, reply, opt])
}

/// Skip a subnegotiation block, answering TTYPE requests with our
/// terminal name. Returns the index just past the closing IAC SE, or
/// the end of the buffer when the block is unterminated.
fn subnegotiate<W: Write>(telnet_out: &mut W, buf: &[u8], i: usize) -> std::io::Result<usize> {
    let mut j = i + 3;
    while j + 1 < buf.len() && !(buf[j] == IAC && buf[j + 1] == SE) {
        j += 1;
    }
    if j + 1 >= buf.len() {
        return Ok(buf.len());
    }

    if buf[i + 2] == TELOPT_TTYPE {
        let mut reply = vec![IAC, SB, TELOPT_TTYPE, 0];
        reply.extend_from_slice(TERM_NAME);
        reply.extend_from_slice(&[IAC, SE]);
        telnet_out.write_all(&reply)?;
    }

    Ok(j + 2)
}

fn send_naws<W: Write>(telnet_out: &mut W, cols: u16, rows: u16) -> std::io::Result<()> {
    let buf = [
        IAC,
        SB,
        TELOPT_NAWS,
        (cols >> 8) as u8,
        (cols & 0xff) as u8,
        (rows >> 8) as u8,
        (rows & 0xff) as u8,
        IAC,
        SE,
    ];
    telnet_out.write_all(&buf)
}

#[cfg(test)]
mod test {
    use super::*;

    fn process(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut telnet_out = vec![];
        let mut data_out = vec![];
        process_inbound(input, &mut telnet_out, &mut data_out).expect("process to succeed");
        (telnet_out, data_out)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let (telnet_out, data_out) = process(b"hello");
        assert!(telnet_out.is_empty());
        assert_eq!(data_out, b"hello");
    }

    #[test]
    fn escaped_iac_unescapes() {
        let (telnet_out, data_out) = process(&[IAC, IAC, b'x']);
        assert!(telnet_out.is_empty());
        assert_eq!(data_out, vec![0xff, b'x']);
    }

    #[test]
    fn will_echo_answered_with_do() {
        let (telnet_out, data_out) = process(&[IAC, WILL, TELOPT_ECHO]);
        assert_eq!(telnet_out, vec![IAC, DO, TELOPT_ECHO]);
        assert!(data_out.is_empty());
    }

    #[test]
    fn will_unknown_answered_with_dont() {
        let (telnet_out, _) = process(&[IAC, WILL, 42]);
        assert_eq!(telnet_out, vec![IAC, DONT, 42]);
    }

    #[test]
    fn do_naws_answered_with_will() {
        let (telnet_out, _) = process(&[IAC, DO, TELOPT_NAWS]);
        assert_eq!(telnet_out, vec![IAC, WILL, TELOPT_NAWS]);
    }

    #[test]
    fn do_unknown_answered_with_wont() {
        let (telnet_out, _) = process(&[IAC, DO, TELOPT_ECHO]);
        assert_eq!(telnet_out, vec![IAC, WONT, TELOPT_ECHO]);
    }

    #[test]
    fn ttype_subnegotiation_gets_terminal_name() {
        // IAC SB TTYPE 1 ("send") IAC SE
        let (telnet_out, data_out) = process(&[IAC, SB, TELOPT_TTYPE, 1, IAC, SE]);
        let mut want = vec![IAC, SB, TELOPT_TTYPE, 0];
        want.extend_from_slice(b"xterm-256color");
        want.extend_from_slice(&[IAC, SE]);
        assert_eq!(telnet_out, want);
        assert!(data_out.is_empty());
    }

    #[test]
    fn unknown_subnegotiation_ignored() {
        let (telnet_out, data_out) = process(&[IAC, SB, TELOPT_NAWS, 0, 80, 0, 24, IAC, SE]);
        assert!(telnet_out.is_empty());
        assert!(data_out.is_empty());
    }

    #[test]
    fn negotiation_interleaved_with_data() {
        let (telnet_out, data_out) =
            process(&[b'a', IAC, WILL, TELOPT_SGA, b'b', IAC, IAC, b'c']);
        assert_eq!(telnet_out, vec![IAC, DO, TELOPT_SGA]);
        assert_eq!(data_out, vec![b'a', b'b', 0xff, b'c']);
    }

    #[test]
    fn naws_resize_bytes() {
        let mut out = vec![];
        send_naws(&mut out, 80, 24).expect("naws write to succeed");
        assert_eq!(out, vec![0xff, 0xfa, 0x1f, 0x00, 0x50, 0x00, 0x18, 0xff, 0xf0]);
    }
}
