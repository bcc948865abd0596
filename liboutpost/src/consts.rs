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

use std::time;

/// Upper bound on a single frame, control plane and SFTP alike.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const BUF_SIZE: usize = 1024 * 16;

/// How often the session bridges wake up to check for close/resize
/// intents when no bytes are flowing.
pub const BRIDGE_POLL_MS: u16 = 200;

/// Backoff between retries when an SSH channel write reports EAGAIN.
pub const EAGAIN_BACKOFF: time::Duration = time::Duration::from_millis(1);

/// Cap on captured stdout/stderr of a remote exec, per stream.
/// Anything past this is dropped without note.
pub const EXEC_OUTPUT_CAP: usize = 256 * 1024;

pub const SFTP_CHUNK_SIZE: usize = 32 * 1024;
pub const SFTP_SEARCH_DEPTH: u32 = 3;
pub const SFTP_SEARCH_MAX: u32 = 20;

/// How long a graphical user gets to complete the proxy handshake.
pub const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(15);

/// Poll period of the graphical accept-joins loop.
pub const JOIN_POLL_MS: u16 = 1000;

pub const DEFAULT_KEEPALIVE_INTERVAL: time::Duration = time::Duration::from_secs(10);
pub const DEFAULT_RECONNECT_DELAY: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_PORT_CHECK_TIMEOUT_MS: u64 = 2000;

pub const MAX_SESSIONS: usize = 256;
pub const MAX_SESSION_PARAMS: usize = 64;
pub const MAX_SESSION_ID_LEN: usize = 63;
pub const MAX_JUMP_HOSTS: usize = 8;
