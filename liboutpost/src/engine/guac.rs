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

//! Client for the graphical proxy daemon's text protocol.
//!
//! The proxy speaks the Guacamole instruction format: instructions are
//! comma-separated elements terminated by a semicolon, each element a
//! decimal character count, a period, and that many characters
//! (`6.select,3.vnc;`). The engine only ever parses instructions
//! during the connect handshake; once a connection is `ready` the
//! session's user threads pump raw bytes.

use std::{
    io::{Read, Write as _},
    net::TcpStream,
    time,
};

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::{
    engine::registry::Session,
    net,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: &str, args: Vec<String>) -> Instruction {
        Instruction { opcode: String::from(opcode), args }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode_element(&mut out, &self.opcode);
        for arg in &self.args {
            out.push(',');
            encode_element(&mut out, arg);
        }
        out.push(';');
        out
    }
}

fn encode_element(out: &mut String, value: &str) {
    out.push_str(&value.chars().count().to_string());
    out.push('.');
    out.push_str(value);
}

/// Try to parse one instruction off the front of `buf`. Returns the
/// instruction and the number of bytes consumed, or None when the
/// buffer does not yet hold a complete instruction.
pub fn parse_instruction(buf: &[u8]) -> anyhow::Result<Option<(Instruction, usize)>> {
    // A partial trailing UTF-8 sequence just means we need more
    // bytes; anything else non-UTF-8 is a protocol violation.
    let text = match std::str::from_utf8(buf) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&buf[..e.valid_up_to()]).expect("already validated")
        }
        Err(_) => return Err(anyhow!("invalid utf-8 in instruction stream")),
    };

    let mut elements = vec![];
    let mut pos = 0;
    loop {
        let rest = &text[pos..];
        let dot = match rest.find('.') {
            Some(dot) => dot,
            None => return Ok(None),
        };
        let length: usize = rest[..dot]
            .parse()
            .with_context(|| format!("bad element length {:?}", &rest[..dot.min(16)]))?;

        let value_start = dot + 1;
        let mut chars = rest[value_start..].char_indices();
        for _ in 0..length {
            if chars.next().is_none() {
                return Ok(None);
            }
        }
        let (term_off, terminator) = match chars.next() {
            Some((off, ch)) => (off, ch),
            None => return Ok(None),
        };

        let value = &rest[value_start..value_start + term_off];
        elements.push(String::from(value));
        pos += value_start + term_off + 1;

        match terminator {
            ',' => continue,
            ';' => {
                let opcode = elements.remove(0);
                return Ok(Some((Instruction { opcode, args: elements }, pos)));
            }
            other => return Err(anyhow!("bad element terminator {other:?}")),
        }
    }
}

/// A buffered instruction reader over a byte stream.
pub struct InstructionReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> InstructionReader<R> {
    pub fn new(inner: R) -> InstructionReader<R> {
        InstructionReader { inner, buf: vec![] }
    }

    pub fn read(&mut self) -> anyhow::Result<Instruction> {
        loop {
            if let Some((instruction, consumed)) = parse_instruction(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(instruction);
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).context("reading from proxy")?;
            if n == 0 {
                return Err(anyhow!("proxy closed the connection mid-instruction"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Surrender any bytes read past the last parsed instruction.
    pub fn into_residual(self) -> Vec<u8> {
        self.buf
    }
}

/// An established, handshaked proxy connection.
pub struct ProxyConnection {
    pub stream: TcpStream,
    pub connection_id: String,
    /// Proxy bytes that arrived on the heels of `ready`. They belong
    /// to the user's stream and must be delivered before anything
    /// read from the socket after this point.
    pub residual: Vec<u8>,
}

/// Connect to the proxy daemon and run the owner-side handshake:
/// select the protocol, answer the argument request from the session's
/// parameter bag, and wait for `ready` with the assigned connection
/// id.
pub fn connect_owner(
    proxy_host: &str,
    proxy_port: u16,
    protocol: &str,
    session: &Session,
    timeout: time::Duration,
) -> anyhow::Result<ProxyConnection> {
    handshake(proxy_host, proxy_port, protocol, session, timeout)
}

/// Connect to the proxy daemon and join an existing connection by id.
pub fn connect_join(
    proxy_host: &str,
    proxy_port: u16,
    connection_id: &str,
    session: &Session,
    timeout: time::Duration,
) -> anyhow::Result<ProxyConnection> {
    handshake(proxy_host, proxy_port, connection_id, session, timeout)
}

fn handshake(
    proxy_host: &str,
    proxy_port: u16,
    select_target: &str,
    session: &Session,
    timeout: time::Duration,
) -> anyhow::Result<ProxyConnection> {
    let mut stream = net::tcp_connect(proxy_host, proxy_port)
        .context("connecting to graphical proxy")?;
    stream.set_read_timeout(Some(timeout)).context("setting handshake timeout")?;

    send_instruction(
        &mut stream,
        &Instruction::new("select", vec![String::from(select_target)]),
    )?;

    let mut reader = InstructionReader::new(stream.try_clone().context("cloning proxy stream")?);
    let args = reader.read().context("reading args from proxy")?;
    if args.opcode != "args" {
        return Err(anyhow!("expected args from proxy, got {:?}", args.opcode));
    }

    // Newer proxies prefix the argument list with a protocol version
    // marker which must be echoed back as the first connect value.
    let (version, arg_names) = match args.args.split_first() {
        Some((first, rest)) if first.starts_with("VERSION_") => {
            (first.clone(), rest.to_vec())
        }
        _ => (String::new(), args.args.clone()),
    };

    send_instruction(
        &mut stream,
        &Instruction::new(
            "size",
            vec![
                lookup_or(session, "width", "1024"),
                lookup_or(session, "height", "768"),
                lookup_or(session, "dpi", "96"),
            ],
        ),
    )?;
    send_instruction(&mut stream, &Instruction::new("audio", vec![]))?;
    send_instruction(&mut stream, &Instruction::new("video", vec![]))?;
    send_instruction(&mut stream, &Instruction::new("image", vec![]))?;

    let mut connect_args = Vec::with_capacity(arg_names.len() + 1);
    if !version.is_empty() {
        connect_args.push(version);
    }
    for name in &arg_names {
        connect_args.push(resolve_arg(session, name).unwrap_or_default());
    }
    send_instruction(&mut stream, &Instruction::new("connect", connect_args))?;

    let ready = loop {
        let instruction = reader.read().context("waiting for ready from proxy")?;
        if instruction.opcode == "ready" {
            break instruction;
        }
        debug!("skipping pre-ready instruction {:?}", instruction.opcode);
    };
    let connection_id = ready
        .args
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("ready instruction carried no connection id"))?;

    stream.set_read_timeout(None).context("clearing handshake timeout")?;
    Ok(ProxyConnection { stream, connection_id, residual: reader.into_residual() })
}

fn lookup_or(session: &Session, key: &str, default: &str) -> String {
    session.param(key).filter(|v| !v.is_empty()).unwrap_or_else(|| String::from(default))
}

/// Map a proxy argument name to a value: the session's target host
/// and port answer `hostname`/`port`, everything else comes straight
/// from the parameter bag.
fn resolve_arg(session: &Session, name: &str) -> Option<String> {
    match name {
        "hostname" => Some(session.host.clone()),
        "port" => Some(session.port.to_string()),
        _ => session.param(name),
    }
}

fn send_instruction(stream: &mut TcpStream, instruction: &Instruction) -> anyhow::Result<()> {
    stream
        .write_all(instruction.encode().as_bytes())
        .with_context(|| format!("sending {} to proxy", instruction.opcode))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_select() {
        let instruction = Instruction::new("select", vec![String::from("vnc")]);
        assert_eq!(instruction.encode(), "6.select,3.vnc;");
    }

    #[test]
    fn encode_empty_args() {
        let instruction = Instruction::new("audio", vec![]);
        assert_eq!(instruction.encode(), "5.audio;");
    }

    #[test]
    fn encode_counts_chars_not_bytes() {
        let instruction = Instruction::new("size", vec![String::from("åäö")]);
        assert_eq!(instruction.encode(), "4.size,3.åäö;");
    }

    #[test]
    fn parse_round_trip() {
        let instruction = Instruction::new(
            "ready",
            vec![String::from("$260d01da-779b-4ee9-afc1-c16bae885cc7")],
        );
        let encoded = instruction.encode();
        let (parsed, consumed) =
            parse_instruction(encoded.as_bytes()).expect("parse to succeed").expect("complete");
        assert_eq!(parsed, instruction);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn parse_incomplete_wants_more() {
        assert!(parse_instruction(b"6.sele").expect("no hard error").is_none());
        assert!(parse_instruction(b"6.select,3.vn").expect("no hard error").is_none());
        assert!(parse_instruction(b"6.select,3.vnc").expect("no hard error").is_none());
    }

    #[test]
    fn parse_leaves_trailing_bytes() {
        let buf = b"4.args,8.hostname;5.ready";
        let (parsed, consumed) =
            parse_instruction(buf).expect("parse to succeed").expect("complete");
        assert_eq!(parsed.opcode, "args");
        assert_eq!(parsed.args, vec![String::from("hostname")]);
        assert_eq!(&buf[consumed..], b"5.ready");
    }

    #[test]
    fn parse_rejects_garbage_length() {
        assert!(parse_instruction(b"x.select;").is_err());
    }

    #[test]
    fn parse_rejects_bad_terminator() {
        assert!(parse_instruction(b"6.select:3.vnc;").is_err());
    }

    #[test]
    fn reader_reassembles_split_instructions() {
        let bytes = b"4.args,13.VERSION_1_5_0,8.hostname,4.port;".to_vec();
        let mut reader = InstructionReader::new(std::io::Cursor::new(bytes));
        let instruction = reader.read().expect("read to succeed");
        assert_eq!(instruction.opcode, "args");
        assert_eq!(instruction.args.len(), 3);
        assert_eq!(instruction.args[0], "VERSION_1_5_0");
    }
}
