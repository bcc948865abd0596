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

//! The SFTP session driver: a typed request/response loop over the
//! session's data channel.
//!
//! Requests arrive as framed `SftpMessage`s; every request gets at
//! least one response carrying the same request id. File reads stream
//! out in 32 KiB `FileData` chunks, file writes stream in across
//! `WriteBegin`/`WriteData`/`WriteEnd`, and everything else is a
//! single round trip. Errors are request-scoped: the session keeps
//! serving after reporting one.

use std::{
    io::{Read as _, Write as _},
    net::TcpStream,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::Context;
use outpost_protocol::{DirEntry, SftpMessage, SftpPayload, StatResult};
use tracing::{debug, info, span, warn, Level};

use crate::{
    consts,
    engine::{
        control_plane::ControlPlane,
        registry::{Session, SessionState},
        ssh,
    },
    protocol,
};

// SFTP status codes from the wire protocol (LIBSSH2_FX_*).
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_FAILURE: i32 = 4;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_FILE_ALREADY_EXISTS: i32 = 11;
const FX_WRITE_PROTECT: i32 = 12;
const FX_NO_MEDIA: i32 = 13;
const FX_NO_SPACE_ON_FILESYSTEM: i32 = 14;
const FX_QUOTA_EXCEEDED: i32 = 15;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub fn start(cp: Arc<ControlPlane>, session: Arc<Session>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("sftp-{}", session.id))
        .spawn(move || run(cp, session))
        .context("spawning sftp session thread")?;
    Ok(())
}

fn run(cp: Arc<ControlPlane>, session: Arc<Session>) {
    let _s = span!(Level::INFO, "sftp", s = session.id).entered();
    session.advance(SessionState::Connecting);

    let creds = ssh::Credentials::from_session(&session);
    if creds.username.is_empty() {
        cp.session_failed(&session, "Missing username");
        return;
    }

    info!("connecting to {}:{} as {}", session.host, session.port, creds.username);

    let data = match cp.open_data_connection(&session.id) {
        Ok(stream) => Arc::new(stream),
        Err(e) => {
            warn!("opening data connection: {:?}", e);
            cp.session_failed(&session, "Failed to open data connection");
            return;
        }
    };
    session.set_data_sock(Arc::clone(&data));

    let link = match ssh::connect(&session.host, session.port, &[]) {
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

    let sftp = match link.session.sftp() {
        Ok(sftp) => sftp,
        Err(e) => {
            warn!("sftp init: {}", e);
            cp.session_failed(&session, "Failed to open SFTP subsystem");
            return;
        }
    };

    if session.advance(SessionState::Active) != SessionState::Active {
        cp.session_failed(&session, "Session closed");
        return;
    }
    cp.session_opened(&session, None);

    if let Err(e) = send(&data, 0, SftpPayload::Ready) {
        warn!("sending Ready: {:?}", e);
        cp.session_ended(&session, "session ended");
        return;
    }

    info!("active (target={}:{}, user={})", session.host, session.port, creds.username);

    request_loop(&session, &sftp, &link.session, &data);

    info!("ending");
    cp.session_ended(&session, "session ended");
}

/// An in-flight streaming upload. Only one write is open per channel;
/// a fresh WriteBegin quietly replaces any forgotten handle.
struct WriteState {
    file: ssh2::File,
    request_id: u32,
}

fn request_loop(session: &Session, sftp: &ssh2::Sftp, ssh: &ssh2::Session, data: &TcpStream) {
    let mut write_state: Option<WriteState> = None;

    while session.state() == SessionState::Active {
        let payload = match protocol::read_frame(&mut &*data, consts::MAX_FRAME_SIZE) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("data channel closed: {:?}", e);
                break;
            }
        };

        let msg: SftpMessage = match protocol::decode(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed sftp message: {:?}", e);
                continue;
            }
        };

        if dispatch(sftp, ssh, data, msg, &mut write_state).is_err() {
            // A send failure means the data channel is gone.
            break;
        }
    }
}

fn dispatch(
    sftp: &ssh2::Sftp,
    ssh: &ssh2::Session,
    data: &TcpStream,
    msg: SftpMessage,
    write_state: &mut Option<WriteState>,
) -> anyhow::Result<()> {
    let rid = msg.request_id;
    match msg.payload {
        SftpPayload::ListDir { path } => list_dir(sftp, data, rid, &path),
        SftpPayload::Stat { path } => stat(sftp, ssh, data, rid, &path),
        SftpPayload::Mkdir { path } => {
            simple_reply(data, rid, sftp.mkdir(Path::new(&path), 0o755))
        }
        SftpPayload::Rmdir { path, recursive } => {
            let res = if recursive {
                rmdir_recursive(sftp, Path::new(&path))
            } else {
                sftp.rmdir(Path::new(&path))
            };
            simple_reply(data, rid, res)
        }
        SftpPayload::Unlink { path } => simple_reply(data, rid, sftp.unlink(Path::new(&path))),
        SftpPayload::Rename { old_path, new_path } => {
            let flags = ssh2::RenameFlags::OVERWRITE
                | ssh2::RenameFlags::ATOMIC
                | ssh2::RenameFlags::NATIVE;
            simple_reply(
                data,
                rid,
                sftp.rename(Path::new(&old_path), Path::new(&new_path), Some(flags)),
            )
        }
        SftpPayload::Chmod { path, mode } => {
            let stat = ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            };
            simple_reply(data, rid, sftp.setstat(Path::new(&path), stat))
        }
        SftpPayload::Realpath { path } => realpath(sftp, data, rid, &path),
        SftpPayload::ReadFile { path } => read_file(sftp, data, rid, &path),
        SftpPayload::WriteBegin { path } => write_begin(sftp, data, rid, &path, write_state),
        SftpPayload::WriteData { data: bytes } => write_data(data, rid, &bytes, write_state),
        SftpPayload::WriteEnd => write_end(data, write_state),
        SftpPayload::Exec { command } => exec(ssh, data, rid, &command),
        SftpPayload::SearchDirs { search_path, max_results } => {
            search_dirs(sftp, data, rid, &search_path, max_results)
        }
        other => {
            warn!("unexpected sftp message: {:?}", other);
            send_error(data, rid, "Unknown operation", -1)
        }
    }
}

fn send(data: &TcpStream, request_id: u32, payload: SftpPayload) -> anyhow::Result<()> {
    protocol::write_msg(&mut &*data, &SftpMessage { request_id, payload })
}

fn send_error(data: &TcpStream, rid: u32, message: &str, code: i32) -> anyhow::Result<()> {
    send(data, rid, SftpPayload::Error { message: String::from(message), code })
}

/// Translate a library error into the short message the coordinator
/// shows end users, falling back to a generic one for anything that
/// is not an SFTP status code.
fn error_reply(data: &TcpStream, rid: u32, err: &ssh2::Error) -> anyhow::Result<()> {
    let (message, code) = match err.code() {
        ssh2::ErrorCode::SFTP(code) => (sftp_error_message(code), code),
        ssh2::ErrorCode::Session(code) => ("SFTP error", code),
    };
    send_error(data, rid, message, code)
}

fn sftp_error_message(code: i32) -> &'static str {
    match code {
        FX_NO_SUCH_FILE | FX_NO_SUCH_PATH => "Path does not exist",
        FX_PERMISSION_DENIED => "Permission denied",
        FX_FAILURE => "Operation failed",
        FX_FILE_ALREADY_EXISTS => "Already exists",
        FX_WRITE_PROTECT => "Write protected",
        FX_NO_MEDIA => "No media",
        FX_NO_SPACE_ON_FILESYSTEM => "No space left",
        FX_QUOTA_EXCEEDED => "Quota exceeded",
        _ => "SFTP error",
    }
}

fn simple_reply(
    data: &TcpStream,
    rid: u32,
    res: Result<(), ssh2::Error>,
) -> anyhow::Result<()> {
    match res {
        Ok(()) => send(data, rid, SftpPayload::Ok),
        Err(e) => error_reply(data, rid, &e),
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn is_symlink(stat: &ssh2::FileStat) -> bool {
    stat.perm.map(|p| p & S_IFMT == S_IFLNK).unwrap_or(false)
}

fn list_dir(sftp: &ssh2::Sftp, data: &TcpStream, rid: u32, path: &str) -> anyhow::Result<()> {
    let listing = match sftp.readdir(Path::new(path)) {
        Ok(listing) => listing,
        Err(e) => return error_reply(data, rid, &e),
    };

    let entries = listing
        .iter()
        .map(|(path, stat)| DirEntry {
            name: entry_name(path),
            is_dir: stat.is_dir(),
            is_symlink: is_symlink(stat),
            size: stat.size.unwrap_or(0),
            mtime: stat.mtime.unwrap_or(0),
            mode: stat.perm.unwrap_or(0),
        })
        .collect();

    send(data, rid, SftpPayload::DirList { entries })
}

/// Resolve symbolic owner/group names with a remote `stat` since the
/// SFTP attribute block only carries numeric ids.
fn owner_group(ssh: &ssh2::Session, path: &str) -> (String, String) {
    let quoted = shell_words::quote(path);
    let cmd = format!("stat -c '%U:%G' {quoted} 2>/dev/null || echo ':'");
    let out = match ssh::exec_remote(ssh, &cmd) {
        Ok((stdout, _, _)) => stdout,
        Err(e) => {
            debug!("owner/group lookup failed: {:?}", e);
            return (String::new(), String::new());
        }
    };
    match out.trim_end_matches('\n').split_once(':') {
        Some((owner, group)) => (String::from(owner), String::from(group)),
        None => (String::new(), String::new()),
    }
}

fn stat(
    sftp: &ssh2::Sftp,
    ssh: &ssh2::Session,
    data: &TcpStream,
    rid: u32,
    path: &str,
) -> anyhow::Result<()> {
    let attrs = match sftp.stat(Path::new(path)) {
        Ok(attrs) => attrs,
        Err(e) => return error_reply(data, rid, &e),
    };
    let (owner, group) = owner_group(ssh, path);

    send(
        data,
        rid,
        SftpPayload::StatResult(StatResult {
            size: attrs.size.unwrap_or(0),
            mode: attrs.perm.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            atime: attrs.atime.unwrap_or(0),
            mtime: attrs.mtime.unwrap_or(0),
            owner,
            group,
            is_dir: attrs.is_dir(),
        }),
    )
}

/// Depth-unbounded removal. Failures on individual children are left
/// for the final rmdir to surface.
fn rmdir_recursive(sftp: &ssh2::Sftp, path: &Path) -> Result<(), ssh2::Error> {
    let listing = sftp.readdir(path)?;
    for (child, stat) in listing {
        if stat.is_dir() {
            let _ = rmdir_recursive(sftp, &child);
        } else {
            let _ = sftp.unlink(&child);
        }
    }
    sftp.rmdir(path)
}

fn realpath(sftp: &ssh2::Sftp, data: &TcpStream, rid: u32, path: &str) -> anyhow::Result<()> {
    let resolved = match sftp.realpath(Path::new(path)) {
        Ok(resolved) => resolved,
        Err(e) => return error_reply(data, rid, &e),
    };
    let is_dir = sftp.stat(&resolved).map(|a| a.is_dir()).unwrap_or(false);

    send(
        data,
        rid,
        SftpPayload::RealpathResult {
            path: resolved.to_string_lossy().into_owned(),
            is_dir,
        },
    )
}

fn read_file(sftp: &ssh2::Sftp, data: &TcpStream, rid: u32, path: &str) -> anyhow::Result<()> {
    let total_size = match sftp.stat(Path::new(path)) {
        Ok(attrs) => attrs.size.unwrap_or(0),
        Err(e) => return error_reply(data, rid, &e),
    };

    let mut file = match sftp.open(Path::new(path)) {
        Ok(file) => file,
        Err(e) => return error_reply(data, rid, &e),
    };

    let mut chunk = vec![0u8; consts::SFTP_CHUNK_SIZE];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                send(
                    data,
                    rid,
                    SftpPayload::FileData { data: chunk[..n].to_vec(), total_size },
                )?;
            }
            Err(e) => {
                warn!("sftp read failed: {}", e);
                return send_error(data, rid, "SFTP error", FX_FAILURE);
            }
        }
    }

    send(data, rid, SftpPayload::FileEnd)
}

fn write_begin(
    sftp: &ssh2::Sftp,
    data: &TcpStream,
    rid: u32,
    path: &str,
    write_state: &mut Option<WriteState>,
) -> anyhow::Result<()> {
    // A dangling handle from an interrupted upload gets replaced, not
    // reported.
    write_state.take();

    let flags =
        ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE;
    match sftp.open_mode(Path::new(path), flags, 0o644, ssh2::OpenType::File) {
        Ok(file) => {
            *write_state = Some(WriteState { file, request_id: rid });
            send(data, rid, SftpPayload::Ok)
        }
        Err(e) => error_reply(data, rid, &e),
    }
}

fn write_data(
    data: &TcpStream,
    rid: u32,
    bytes: &[u8],
    write_state: &mut Option<WriteState>,
) -> anyhow::Result<()> {
    let state = match write_state.as_mut() {
        Some(state) => state,
        None => return send_error(data, rid, "No write in progress", -1),
    };
    if bytes.is_empty() {
        return Ok(());
    }

    if let Err(e) = state.file.write_all(bytes) {
        warn!("sftp write failed: {}", e);
        let rid = state.request_id;
        write_state.take();
        return send_error(data, rid, "SFTP error", FX_FAILURE);
    }
    Ok(())
}

fn write_end(data: &TcpStream, write_state: &mut Option<WriteState>) -> anyhow::Result<()> {
    if let Some(state) = write_state.take() {
        let rid = state.request_id;
        drop(state);
        return send(data, rid, SftpPayload::Ok);
    }
    Ok(())
}

fn exec(ssh: &ssh2::Session, data: &TcpStream, rid: u32, command: &str) -> anyhow::Result<()> {
    match ssh::exec_remote(ssh, command) {
        Ok((stdout_data, stderr_data, exit_code)) => send(
            data,
            rid,
            SftpPayload::ExecResult { stdout_data, stderr_data, exit_code },
        ),
        Err(e) => {
            warn!("exec failed: {:?}", e);
            send_error(data, rid, "Failed to execute command", -1)
        }
    }
}

/// How a search path splits into a base directory and a match rule.
#[derive(Debug, PartialEq)]
struct SearchSpec {
    base: String,
    /// Lowercased prefix matched against directory names. Empty
    /// matches everything.
    term: String,
    /// True when the path ended in '/': list the directories directly
    /// inside the base instead of prefix-matching.
    inside: bool,
}

fn parse_search_path(search_path: &str) -> SearchSpec {
    if let Some(stripped) = search_path.strip_suffix('/') {
        let base = if stripped.is_empty() { String::from("/") } else { String::from(stripped) };
        return SearchSpec { base, term: String::new(), inside: true };
    }

    match search_path.rfind('/') {
        None => SearchSpec {
            base: String::from("/"),
            term: search_path.to_lowercase(),
            inside: false,
        },
        Some(0) => SearchSpec {
            base: String::from("/"),
            term: search_path[1..].to_lowercase(),
            inside: false,
        },
        Some(idx) => SearchSpec {
            base: String::from(&search_path[..idx]),
            term: search_path[idx + 1..].to_lowercase(),
            inside: false,
        },
    }
}

fn name_matches(name: &str, term: &str) -> bool {
    if term.is_empty() {
        return true;
    }
    let name = name.as_bytes();
    let term = term.as_bytes();
    if name.len() < term.len() {
        return false;
    }
    name.iter().zip(term.iter()).all(|(n, t)| n.to_ascii_lowercase() == *t)
}

fn search_dirs(
    sftp: &ssh2::Sftp,
    data: &TcpStream,
    rid: u32,
    search_path: &str,
    max_results: u32,
) -> anyhow::Result<()> {
    let max_results = if max_results == 0 || max_results > consts::SFTP_SEARCH_MAX {
        consts::SFTP_SEARCH_MAX
    } else {
        max_results
    } as usize;

    let spec = parse_search_path(search_path);
    let base = PathBuf::from(&spec.base);
    let mut directories = vec![];
    search_recursive(sftp, &base, &spec, &base, &mut directories, 0, max_results);

    send(data, rid, SftpPayload::SearchResult { directories })
}

/// Walk directories under `current`, collecting matches until the
/// result cap or the depth cap (3 levels) is hit. Files and symlinked
/// entries never match.
fn search_recursive(
    sftp: &ssh2::Sftp,
    current: &Path,
    spec: &SearchSpec,
    base: &Path,
    results: &mut Vec<String>,
    depth: u32,
    max_results: usize,
) {
    if depth > consts::SFTP_SEARCH_DEPTH || results.len() >= max_results {
        return;
    }

    let listing = match sftp.readdir(current) {
        Ok(listing) => listing,
        Err(_) => return,
    };

    for (path, stat) in listing {
        if results.len() >= max_results {
            break;
        }
        if !stat.is_dir() || is_symlink(&stat) {
            continue;
        }

        let matched = if spec.inside {
            current == base
        } else {
            name_matches(&entry_name(&path), &spec.term)
        };
        if matched {
            results.push(path.to_string_lossy().into_owned());
        }

        if depth < consts::SFTP_SEARCH_DEPTH && results.len() < max_results {
            search_recursive(sftp, &path, spec, base, results, depth + 1, max_results);
        }
    }
}
