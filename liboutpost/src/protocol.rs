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

//! Framing and serialization for the control-plane and SFTP wire
//! protocols.
//!
//! A frame is a 4 byte big endian length prefix followed by that many
//! payload bytes. Reads and writes are exact: a frame either arrives
//! whole or the read fails. Callers that share a stream between
//! threads must guard `write_frame` with their own mutex so two frames
//! never interleave; each function here performs a single logical
//! operation on the stream it is given.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};

use crate::consts;

/// The centralized encoding function that should be used for all
/// protocol serialization.
pub fn encode<T>(d: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    let mut buf = vec![];
    // msgpack is basically binary encoded json, so unknown fields in
    // a newer peer's messages get skipped rather than mangling the
    // fields that follow them.
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    d.serialize(&mut serializer).context("serializing message")?;
    Ok(buf)
}

/// The centralized decoding function that should be used for all
/// protocol deserialization.
pub fn decode<T>(buf: &[u8]) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
{
    let mut deserializer = rmp_serde::Deserializer::new(buf);
    let d: T = Deserialize::deserialize(&mut deserializer).context("deserializing message")?;
    Ok(d)
}

/// Write one frame. The caller is responsible for any cross-thread
/// serialization of the underlying stream.
pub fn write_frame<W>(w: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: Write,
{
    if payload.is_empty() {
        return Err(anyhow!("refusing to write an empty frame"));
    }
    if payload.len() > consts::MAX_FRAME_SIZE {
        return Err(anyhow!(
            "frame of {} bytes exceeds size limit of {} bytes",
            payload.len(),
            consts::MAX_FRAME_SIZE
        ));
    }

    w.write_u32::<BigEndian>(payload.len() as u32).context("writing frame length")?;
    w.write_all(payload).context("writing frame payload")?;
    w.flush().context("flushing frame")?;
    Ok(())
}

/// Read one frame, rejecting zero-length and oversized frames. A
/// short read or early EOF surfaces as a truncation error.
pub fn read_frame<R>(r: &mut R, max_size: usize) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let len = r.read_u32::<BigEndian>().context("reading frame length")? as usize;
    if len == 0 {
        return Err(anyhow!("zero length frame"));
    }
    if len > max_size {
        return Err(anyhow!("frame of {} bytes exceeds size limit of {} bytes", len, max_size));
    }

    let mut payload = vec![0; len];
    r.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            anyhow!("truncated frame: wanted {} bytes", len)
        } else {
            anyhow!(e).context("reading frame payload")
        }
    })?;
    Ok(payload)
}

/// Encode and frame a message in one go.
pub fn write_msg<W, T>(w: &mut W, msg: &T) -> anyhow::Result<()>
where
    W: Write,
    T: Serialize,
{
    let payload = encode(msg)?;
    write_frame(w, &payload)
}

/// Read and decode a single message.
pub fn read_msg<R, T>(r: &mut R, max_size: usize) -> anyhow::Result<T>
where
    R: Read,
    for<'de> T: Deserialize<'de>,
{
    let payload = read_frame(r, max_size)?;
    decode(&payload)
}
