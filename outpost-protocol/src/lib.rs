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

use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The tagged union carried in every control-plane frame.
///
/// Every frame on the control socket is a 4 byte big endian length
/// prefix followed by one serialized `Envelope`. The same envelope
/// type is used in both directions; each side just ignores variants
/// it never expects to receive.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum Envelope {
    /// First frame the engine sends after dialing the coordinator.
    EngineHello(EngineHello),
    /// The coordinator's verdict on an `EngineHello`.
    EngineHelloAck(EngineHelloAck),
    /// Keepalive probe. Either side may send one at any time.
    Ping(Ping),
    /// Immediate answer to a `Ping`, echoing its timestamp.
    Pong(Pong),
    /// Ask the engine to open a new session to a target host.
    SessionOpen(SessionOpen),
    /// The engine's verdict on a `SessionOpen`.
    SessionOpenResult(SessionOpenResult),
    /// Ask the engine to tear down a session.
    SessionClose(SessionClose),
    /// Notification that a session is gone, whatever the cause.
    SessionClosed(SessionClosed),
    /// Forward a terminal size change into a session.
    SessionResize(SessionResize),
    /// Ask the engine to add a viewer to an active graphical session.
    SessionJoin(SessionJoin),
    /// First frame on a fresh data connection, used by the coordinator
    /// to route the new socket into the right session.
    ConnectionReady(ConnectionReady),
    /// Run a one-shot command over SSH, outside of any session.
    ExecCommand(ExecCommand),
    /// The result of an `ExecCommand`.
    ExecCommandResult(ExecCommandResult),
    /// Probe a batch of host:port targets for reachability.
    PortCheck(PortCheck),
    /// The outcome of a `PortCheck` batch.
    PortCheckResult(PortCheckResult),
}

/// The metadata the engine announces when it first connects.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct EngineHello {
    #[serde(default)]
    pub version: String,
    /// Bearer-style token proving this engine may register with the
    /// coordinator. Omitted when the engine has no token configured.
    #[serde(default)]
    pub registration_token: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct EngineHelloAck {
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub server_version: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Ping {
    /// Milliseconds since the unix epoch at the sender.
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Pong {
    #[serde(default)]
    pub timestamp: u64,
}

/// The protocol family of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Vnc,
    Rdp,
    Ssh,
    Sftp,
    Telnet,
    Tunnel,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Vnc => write!(f, "vnc"),
            SessionType::Rdp => write!(f, "rdp"),
            SessionType::Ssh => write!(f, "ssh"),
            SessionType::Sftp => write!(f, "sftp"),
            SessionType::Telnet => write!(f, "telnet"),
            SessionType::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// One intermediate SSH server on the way to the target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JumpHost {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionOpen {
    pub session_id: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Protocol-specific connection parameters (credentials, display
    /// geometry, forward targets, ...). An ordered bag rather than a
    /// map so the coordinator controls iteration order.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub jump_hosts: Vec<JumpHost>,
}

impl SessionOpen {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Coarse classification of an open failure, for coordinators that
/// want to react differently without parsing the message text.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectionFailed,
    AuthFailed,
    MaxSessions,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionOpenResult {
    pub session_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// For graphical sessions, the proxy-assigned connection id that
    /// later `SessionJoin`s attach to.
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionClose {
    pub session_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionClosed {
    pub session_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionResize {
    pub session_id: String,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionJoin {
    pub session_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ConnectionReady {
    pub session_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ExecCommand {
    pub request_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Credentials travel in the same key/value form session params
    /// do: `username`, `password`, `privateKey`, `passphrase`.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub jump_hosts: Vec<JumpHost>,
}

impl ExecCommand {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ExecCommandResult {
    pub request_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub stdout_data: Option<String>,
    #[serde(default)]
    pub stderr_data: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortCheckTarget {
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PortCheck {
    pub request_id: String,
    #[serde(default)]
    pub targets: Vec<PortCheckTarget>,
    /// Per-target connect timeout. Zero means "use the default"
    /// (2000 ms).
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortCheckOutcome {
    pub id: String,
    #[serde(default)]
    pub online: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PortCheckResult {
    pub request_id: String,
    #[serde(default)]
    pub results: Vec<PortCheckOutcome>,
}

/// One message on an SFTP session's data channel.
///
/// SFTP data channels reuse the control-plane framing (4 byte big
/// endian length prefix, 16 MiB cap) and carry these instead of
/// `Envelope`s. Requests flow coordinator to engine, responses engine
/// to coordinator, matched up by `request_id`. Streaming responses
/// (`FileData`) repeat the id on every chunk.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SftpMessage {
    #[serde(default)]
    pub request_id: u32,
    pub payload: SftpPayload,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum SftpPayload {
    // Engine to coordinator.
    /// Sent once, before the request loop starts accepting requests.
    Ready,
    Ok,
    Error { message: String, code: i32 },
    DirList { entries: Vec<DirEntry> },
    StatResult(StatResult),
    RealpathResult { path: String, is_dir: bool },
    FileData { data: Vec<u8>, total_size: u64 },
    FileEnd,
    ExecResult { stdout_data: String, stderr_data: String, exit_code: i32 },
    SearchResult { directories: Vec<String> },

    // Coordinator to engine.
    ListDir { path: String },
    Stat { path: String },
    Mkdir { path: String },
    Rmdir { path: String, recursive: bool },
    Unlink { path: String },
    Rename { old_path: String, new_path: String },
    Chmod { path: String, mode: u32 },
    Realpath { path: String },
    ReadFile { path: String },
    WriteBegin { path: String },
    WriteData { data: Vec<u8> },
    WriteEnd,
    Exec { command: String },
    SearchDirs { search_path: String, max_results: u32 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_symlink: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: u64,
    #[serde(default)]
    pub mode: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatResult {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub atime: u64,
    #[serde(default)]
    pub mtime: u64,
    /// Resolved with a remote `stat -c '%U:%G'` since the SFTP
    /// attribute block only carries numeric ids. Blank when the
    /// remote side has no `stat` binary.
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub is_dir: bool,
}
