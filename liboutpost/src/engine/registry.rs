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

//! The in-memory table of active sessions and the state shared
//! between a session's worker thread and the control-plane
//! dispatcher.
//!
//! Ownership rules: the worker thread is the sole writer of a
//! session's protocol handles once it is past Connecting; the
//! dispatcher only reads state, enqueues intents on the command
//! channel, and shuts down sockets to wake a blocked worker.

use std::{
    collections::HashMap,
    fmt,
    net::{Shutdown, TcpStream},
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use outpost_protocol::SessionType;
use tracing::{info, warn};

use crate::consts;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum SessionState {
    Pending = 0,
    Connecting = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Pending,
            1 => SessionState::Connecting,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// An intent enqueued by the dispatcher for the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCmd {
    Resize { cols: u16, rows: u16 },
    Close,
}

/// Shared descriptor for one session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub kind: SessionType,
    pub host: String,
    pub port: u16,

    state: AtomicU8,
    /// Set once a successful SessionOpenResult is on the wire. A
    /// SessionClosed is only ever owed after this.
    opened: AtomicBool,
    /// Guards the one SessionClosed publication a session gets.
    closed_published: AtomicBool,
    params: Mutex<Vec<(String, String)>>,
    cmd_tx: crossbeam_channel::Sender<SessionCmd>,
    cmd_rx: crossbeam_channel::Receiver<SessionCmd>,

    /// Sockets the dispatcher may shut down to wake the worker out of
    /// a blocking read or poll. The worker holds its own clones.
    data_sock: Mutex<Option<Arc<TcpStream>>>,
    remote_sock: Mutex<Option<Arc<TcpStream>>>,
    /// Write end of the join rendezvous for graphical sessions.
    /// Dropping it wakes the accept-joins loop.
    join_tx: Mutex<Option<OwnedFd>>,
    /// The graphical proxy's id for this session, once assigned.
    connection_id: Mutex<Option<String>>,
}

impl Session {
    fn new(id: &str, kind: SessionType, host: &str, port: u16) -> Session {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        Session {
            id: String::from(id),
            kind,
            host: String::from(host),
            port,
            state: AtomicU8::new(SessionState::Pending as u8),
            opened: AtomicBool::new(false),
            closed_published: AtomicBool::new(false),
            params: Mutex::new(vec![]),
            cmd_tx,
            cmd_rx,
            data_sock: Mutex::new(None),
            remote_sock: Mutex::new(None),
            join_tx: Mutex::new(None),
            connection_id: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle, never moving backwards. Returns the
    /// state after the call, which is `to` unless something further
    /// along (e.g. a concurrent close) already won.
    pub fn advance(&self, to: SessionState) -> SessionState {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur >= to as u8 {
                return SessionState::from_u8(cur);
            }
            match self.state.compare_exchange_weak(
                cur,
                to as u8,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return to,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn add_param(&self, key: &str, value: &str) {
        let mut params = self.params.lock().unwrap();
        if params.len() >= consts::MAX_SESSION_PARAMS {
            warn!("max params reached for session {}", self.id);
            return;
        }
        params.push((String::from(key), String::from(value)));
    }

    pub fn param(&self, key: &str) -> Option<String> {
        let params = self.params.lock().unwrap();
        params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    /// Enqueue an intent for the worker. Best effort: a worker that
    /// has already exited just never drains it.
    pub fn send_cmd(&self, cmd: SessionCmd) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn try_cmd(&self) -> Option<SessionCmd> {
        self.cmd_rx.try_recv().ok()
    }

    pub fn set_data_sock(&self, sock: Arc<TcpStream>) {
        *self.data_sock.lock().unwrap() = Some(sock);
    }

    pub fn set_remote_sock(&self, sock: Arc<TcpStream>) {
        *self.remote_sock.lock().unwrap() = Some(sock);
    }

    pub fn set_join_tx(&self, fd: OwnedFd) {
        *self.join_tx.lock().unwrap() = Some(fd);
    }

    pub fn set_connection_id(&self, id: &str) {
        *self.connection_id.lock().unwrap() = Some(String::from(id));
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().unwrap().clone()
    }

    /// Run `f` against the join rendezvous write end, if the session
    /// still has one.
    pub fn with_join_tx<T>(&self, f: impl FnOnce(&OwnedFd) -> T) -> Option<T> {
        let join_tx = self.join_tx.lock().unwrap();
        join_tx.as_ref().map(f)
    }

    /// Dispatcher-side close: mark the session as going away, wake
    /// the worker, and shut down its sockets so blocked reads return.
    pub fn begin_close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        info!("closing connection for session {}", self.id);
        self.advance(SessionState::Closing);
        self.send_cmd(SessionCmd::Close);
        // Closing the write end wakes a pending accept-joins poll.
        self.join_tx.lock().unwrap().take();
        for sock in [&self.data_sock, &self.remote_sock] {
            if let Some(sock) = sock.lock().unwrap().as_ref() {
                let _ = sock.shutdown(Shutdown::Both);
            }
        }
    }

    /// Drop every fd the registry knows about for this session. The
    /// worker's own clones go away when it returns.
    pub fn release(&self) {
        self.data_sock.lock().unwrap().take();
        self.remote_sock.lock().unwrap().take();
        self.join_tx.lock().unwrap().take();
    }

    pub fn mark_opened(&self) {
        self.opened.store(true, Ordering::Release);
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Claim the right to publish this session's SessionClosed.
    /// Returns true exactly once.
    pub fn claim_closed_publication(&self) -> bool {
        self.closed_published
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateError {
    DuplicateId,
    Full,
    IdTooLong,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::DuplicateId => write!(f, "Session already exists"),
            CreateError::Full => write!(f, "Maximum sessions reached"),
            CreateError::IdTooLong => write!(f, "Session id too long"),
        }
    }
}

impl std::error::Error for CreateError {}

/// The table of live sessions, keyed by id.
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn create(
        &self,
        id: &str,
        kind: SessionType,
        host: &str,
        port: u16,
    ) -> Result<Arc<Session>, CreateError> {
        if id.len() > consts::MAX_SESSION_ID_LEN {
            return Err(CreateError::IdTooLong);
        }

        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= consts::MAX_SESSIONS {
            return Err(CreateError::Full);
        }
        if sessions.contains_key(id) {
            return Err(CreateError::DuplicateId);
        }

        let session = Arc::new(Session::new(id, kind, host, port));
        sessions.insert(String::from(id), Arc::clone(&session));
        info!("session created: {} (type={}, target={}:{})", id, kind, host, port);
        Ok(session)
    }

    pub fn find(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id).map(Arc::clone)
    }

    /// Remove a session from the table. Idempotent.
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(id)
        };
        if let Some(session) = removed {
            session.release();
            info!("session removed: {}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every session: wake the workers, close the fds, and
    /// empty the table. Called once on engine shutdown, after the
    /// control plane has stopped.
    pub fn destroy(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.begin_close();
            session.release();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_id_rejected() {
        let registry = Registry::new();
        registry.create("s1", SessionType::Ssh, "10.0.0.1", 22).expect("create to succeed");
        assert_eq!(
            registry.create("s1", SessionType::Telnet, "10.0.0.1", 23).unwrap_err(),
            CreateError::DuplicateId,
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn table_capacity_enforced() {
        let registry = Registry::new();
        for i in 0..consts::MAX_SESSIONS {
            registry
                .create(&format!("s{i}"), SessionType::Ssh, "10.0.0.1", 22)
                .expect("create to succeed");
        }

        let err = registry
            .create("one-too-many", SessionType::Ssh, "10.0.0.1", 22)
            .expect_err("257th session should be rejected");
        assert_eq!(err, CreateError::Full);
        assert_eq!(err.to_string(), "Maximum sessions reached");
        assert_eq!(registry.len(), consts::MAX_SESSIONS);
        assert!(registry.find("one-too-many").is_none());
    }

    #[test]
    fn overlong_id_rejected() {
        let registry = Registry::new();
        let id = "x".repeat(consts::MAX_SESSION_ID_LEN + 1);
        assert_eq!(
            registry.create(&id, SessionType::Ssh, "h", 22).unwrap_err(),
            CreateError::IdTooLong,
        );
    }

    #[test]
    fn state_never_moves_backwards() {
        let session = Session::new("s", SessionType::Ssh, "h", 22);
        assert_eq!(session.advance(SessionState::Connecting), SessionState::Connecting);
        assert_eq!(session.advance(SessionState::Closing), SessionState::Closing);
        // A late Active advance loses to the close.
        assert_eq!(session.advance(SessionState::Active), SessionState::Closing);
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn closed_published_exactly_once() {
        let session = Session::new("s", SessionType::Ssh, "h", 22);
        assert!(session.claim_closed_publication());
        assert!(!session.claim_closed_publication());
    }

    #[test]
    fn params_capped() {
        let session = Session::new("s", SessionType::Ssh, "h", 22);
        for i in 0..consts::MAX_SESSION_PARAMS + 5 {
            session.add_param(&format!("k{i}"), "v");
        }
        assert_eq!(session.param("k0").as_deref(), Some("v"));
        assert!(session.param(&format!("k{}", consts::MAX_SESSION_PARAMS)).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        registry.create("s1", SessionType::Ssh, "h", 22).expect("create to succeed");
        registry.remove("s1");
        registry.remove("s1");
        assert!(registry.is_empty());
    }
}
