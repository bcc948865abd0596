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

//! The persistent control-plane link to the coordinator.
//!
//! One socket, one read thread that demultiplexes typed frames into
//! per-session lifecycles, and one keepalive thread. All outbound
//! frames on the control socket funnel through a send mutex so
//! concurrent workers never interleave two frames. Data connections
//! are separate sockets, each private to the driver that opened it.

use std::{
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread, time,
};

use anyhow::{anyhow, Context};
use outpost_protocol::{
    ConnectionReady, EngineHello, Envelope, ErrorCode, ExecCommandResult, PortCheckOutcome,
    PortCheckResult, Pong, SessionClosed, SessionOpen, SessionOpenResult, SessionType,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config::Config,
    consts,
    engine::{
        graphical, port_check,
        registry::{Registry, Session, SessionCmd, SessionState},
        sftp, shell, ssh, telnet,
    },
    net, now_unix_ms, protocol,
};

/// Everything the control-plane client needs to know up front.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub registration_token: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub keepalive_interval: time::Duration,
    pub reconnect_delay: time::Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Settings {
        Settings {
            host: config.server_host.clone(),
            port: config.server_port,
            registration_token: config.registration_token.clone(),
            proxy_host: config.proxy_host.clone(),
            proxy_port: config.proxy_port,
            keepalive_interval: consts::DEFAULT_KEEPALIVE_INTERVAL,
            reconnect_delay: consts::DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub struct ControlPlane {
    settings: Settings,
    registry: Arc<Registry>,

    /// Should the read and keepalive threads stay alive.
    running: AtomicBool,
    /// Did the coordinator accept our hello.
    connected: AtomicBool,

    /// Writer half. The mutex is the frame-interleaving guard every
    /// outbound helper goes through.
    writer: Mutex<Option<TcpStream>>,
    /// A handle kept purely so `stop` can shut the socket down and
    /// unblock the read thread.
    conn: Mutex<Option<TcpStream>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(settings: Settings, registry: Arc<Registry>) -> Arc<ControlPlane> {
        Arc::new(ControlPlane {
            settings,
            registry,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            conn: Mutex::new(None),
            threads: Mutex::new(vec![]),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn reconnect_delay(&self) -> time::Duration {
        self.settings.reconnect_delay
    }

    pub fn proxy_addr(&self) -> (String, u16) {
        (self.settings.proxy_host.clone(), self.settings.proxy_port)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Dial the coordinator, announce ourselves, and spawn the read
    /// and keepalive threads.
    #[instrument(skip_all)]
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!(
            "connecting to control plane at {}:{}",
            self.settings.host, self.settings.port
        );
        let stream = net::tcp_connect(&self.settings.host, self.settings.port)
            .context("connecting to control plane")?;

        let read_stream = stream.try_clone().context("cloning control socket")?;
        *self.writer.lock().unwrap() = Some(stream.try_clone().context("cloning control socket")?);
        *self.conn.lock().unwrap() = Some(stream);
        self.connected.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let token = self.settings.registration_token.clone();
        let hello = Envelope::EngineHello(EngineHello {
            version: String::from(outpost_protocol::VERSION),
            registration_token: if token.is_empty() { None } else { Some(token) },
        });
        if let Err(e) = self.send(&hello) {
            self.teardown_socket();
            self.running.store(false, Ordering::Release);
            return Err(e).context("sending EngineHello");
        }

        let mut threads = self.threads.lock().unwrap();
        let reader = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name(String::from("control-read"))
                .spawn(move || reader.read_loop(read_stream))
                .context("spawning control plane read thread")?,
        );
        let keepalive = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name(String::from("control-keepalive"))
                .spawn(move || keepalive.keepalive_loop())
                .context("spawning keepalive thread")?,
        );

        info!("control plane client started");
        Ok(())
    }

    /// Stop the threads and close the socket. Idempotent; safe to
    /// call after the link has already dropped.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("stopping control plane client");
        }
        self.connected.store(false, Ordering::Release);
        self.teardown_socket();

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn teardown_socket(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        self.writer.lock().unwrap().take();
    }

    fn read_loop(self: Arc<Self>, mut stream: TcpStream) {
        while self.is_running() {
            let payload = match protocol::read_frame(&mut stream, consts::MAX_FRAME_SIZE) {
                Ok(payload) => payload,
                Err(e) => {
                    if self.is_running() {
                        warn!("control plane connection lost: {e:#}");
                        self.connected.store(false, Ordering::Release);
                    }
                    break;
                }
            };

            match protocol::decode::<Envelope>(&payload) {
                Ok(envelope) => self.dispatch(envelope),
                Err(e) => warn!("dropping malformed control frame: {e:#}"),
            }
        }
        self.running.store(false, Ordering::Release);
    }

    fn keepalive_loop(self: Arc<Self>) {
        const TICK: time::Duration = time::Duration::from_millis(50);

        let mut since_ping = time::Duration::ZERO;
        loop {
            thread::sleep(TICK);
            if !self.is_running() {
                return;
            }
            since_ping += TICK;
            if since_ping < self.settings.keepalive_interval {
                continue;
            }
            since_ping = time::Duration::ZERO;

            if !self.is_connected() {
                continue;
            }
            let ping =
                Envelope::Ping(outpost_protocol::Ping { timestamp: now_unix_ms() });
            if let Err(e) = self.send(&ping) {
                // The read thread will notice the dead link; nothing
                // more to do here.
                warn!("failed to send keepalive ping: {e:#}");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::EngineHelloAck(ack) => {
                if ack.accepted {
                    info!("server accepted engine (server version: {})", ack.server_version);
                    self.connected.store(true, Ordering::Release);
                } else {
                    error!("server rejected engine connection");
                    self.running.store(false, Ordering::Release);
                }
            }
            Envelope::Ping(ping) => {
                // Answer before anything else gets a chance to write.
                let pong = Envelope::Pong(Pong { timestamp: ping.timestamp });
                if let Err(e) = self.send(&pong) {
                    warn!("failed to answer ping: {e:#}");
                }
                trace!("ping/pong (ts={})", ping.timestamp);
            }
            Envelope::Pong(pong) => {
                trace!("pong received (ts={})", pong.timestamp);
            }
            Envelope::SessionOpen(open) => self.handle_session_open(open),
            Envelope::SessionClose(close) => self.handle_session_close(&close.session_id),
            Envelope::SessionResize(resize) => {
                if let Some(session) = self.registry.find(&resize.session_id) {
                    debug!(
                        "resize: id={} cols={} rows={}",
                        resize.session_id, resize.cols, resize.rows
                    );
                    let resizable = matches!(
                        session.kind,
                        SessionType::Ssh | SessionType::Telnet
                    );
                    if resizable && session.state() == SessionState::Active {
                        session.send_cmd(SessionCmd::Resize {
                            cols: resize.cols,
                            rows: resize.rows,
                        });
                    }
                }
            }
            Envelope::SessionJoin(join) => {
                info!("session join: id={}", join.session_id);
                match self.registry.find(&join.session_id) {
                    Some(session) => {
                        if let Err(e) = graphical::join(self, &session) {
                            warn!("failed to join session {}: {e:#}", join.session_id);
                        }
                    }
                    None => warn!("session join: session not found: {}", join.session_id),
                }
            }
            Envelope::ExecCommand(exec) => {
                info!(
                    "exec command: req={} host={}:{}",
                    exec.request_id, exec.host, exec.port
                );
                let request_id = exec.request_id.clone();
                if let Err(e) = shell::spawn_exec(Arc::clone(self), exec) {
                    warn!("failed to start exec worker: {e:#}");
                    self.send_exec_result(
                        &request_id,
                        false,
                        None,
                        None,
                        -1,
                        Some("Failed to start command"),
                    );
                }
            }
            Envelope::PortCheck(check) => {
                info!(
                    "port check: req={} targets={}",
                    check.request_id,
                    check.targets.len()
                );
                if let Err(e) = port_check::spawn(Arc::clone(self), check) {
                    warn!("failed to start port check worker: {e:#}");
                }
            }
            other => {
                warn!("ignoring unexpected control message: {other:?}");
            }
        }
    }

    fn handle_session_open(self: &Arc<Self>, open: SessionOpen) {
        info!(
            "session open: id={} type={} host={}:{}",
            open.session_id, open.session_type, open.host, open.port
        );

        let session = match self.registry.create(
            &open.session_id,
            open.session_type,
            &open.host,
            open.port,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!("creating session {}: {}", open.session_id, e);
                self.send_session_result(&open.session_id, false, Some(&e.to_string()), None);
                return;
            }
        };

        for (key, value) in &open.params {
            session.add_param(key, value);
        }
        // Flattened so every SSH-family driver reads the chain the
        // same way it reads credentials.
        ssh::jump_hosts_to_params(&session, &open.jump_hosts);

        let started = match open.session_type {
            SessionType::Vnc | SessionType::Rdp => {
                graphical::start(Arc::clone(self), Arc::clone(&session))
            }
            SessionType::Ssh => shell::start_shell(Arc::clone(self), Arc::clone(&session)),
            SessionType::Tunnel => shell::start_tunnel(Arc::clone(self), Arc::clone(&session)),
            SessionType::Telnet => telnet::start(Arc::clone(self), Arc::clone(&session)),
            SessionType::Sftp => sftp::start(Arc::clone(self), Arc::clone(&session)),
        };

        if let Err(e) = started {
            warn!("starting session {}: {e:#}", open.session_id);
            self.send_session_result(&open.session_id, false, Some("Failed to start connection"), None);
            self.registry.remove(&open.session_id);
        }
    }

    fn handle_session_close(&self, session_id: &str) {
        info!("session close: id={}", session_id);
        if let Some(session) = self.registry.find(session_id) {
            // Publish before waking the worker so the reason reflects
            // who initiated the close. A session whose open result is
            // not on the wire yet is owed no SessionClosed; its worker
            // reports the aborted open instead.
            if session.is_opened() {
                self.publish_session_closed(&session, "closed by server");
            }
            session.begin_close();
            self.registry.remove(session_id);
        }
    }

    /// Open a fresh TCP connection to the coordinator for a session's
    /// data plane. The `ConnectionReady` frame goes out without the
    /// send mutex: this socket belongs to the calling driver alone.
    pub fn open_data_connection(&self, session_id: &str) -> anyhow::Result<TcpStream> {
        debug!("opening data connection for session {}", session_id);
        let mut stream = net::tcp_connect(&self.settings.host, self.settings.port)
            .context("dialing coordinator for data connection")?;

        let ready = Envelope::ConnectionReady(ConnectionReady {
            session_id: String::from(session_id),
        });
        protocol::write_msg(&mut stream, &ready).context("sending ConnectionReady")?;

        debug!("data connection established for session {}", session_id);
        Ok(stream)
    }

    /// Serialize and send one frame on the control socket.
    pub fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let payload = protocol::encode(envelope)?;
        let mut writer = self.writer.lock().unwrap();
        match writer.as_mut() {
            Some(stream) => protocol::write_frame(stream, &payload),
            None => Err(anyhow!("control plane is not connected")),
        }
    }

    pub fn send_session_result(
        &self,
        session_id: &str,
        success: bool,
        error_message: Option<&str>,
        connection_id: Option<&str>,
    ) {
        let result = Envelope::SessionOpenResult(SessionOpenResult {
            session_id: String::from(session_id),
            success,
            error_code: if success { None } else { Some(ErrorCode::ConnectionFailed) },
            error_message: error_message.map(String::from),
            connection_id: connection_id.map(String::from),
        });
        if let Err(e) = self.send(&result) {
            warn!("failed to send session result for {}: {e:#}", session_id);
        }
    }

    /// Report a successful open and unlock SessionClosed publication
    /// for this session.
    pub fn session_opened(&self, session: &Session, connection_id: Option<&str>) {
        self.send_session_result(&session.id, true, None, connection_id);
        session.mark_opened();
    }

    /// Publish the session's one SessionClosed, if nobody else beat
    /// us to it.
    pub fn publish_session_closed(&self, session: &Session, reason: &str) {
        if !session.claim_closed_publication() {
            return;
        }
        let closed = Envelope::SessionClosed(SessionClosed {
            session_id: session.id.clone(),
            reason: Some(String::from(reason)),
        });
        if let Err(e) = self.send(&closed) {
            warn!("failed to send session closed for {}: {e:#}", session.id);
        }
    }

    /// Driver-side happy-path exit: publish SessionClosed (unless the
    /// dispatcher already did), release fds, drop the table entry.
    pub fn session_ended(&self, session: &Session, reason: &str) {
        session.advance(SessionState::Closing);
        if session.is_opened() {
            self.publish_session_closed(session, reason);
        }
        session.release();
        session.advance(SessionState::Closed);
        self.registry.remove(&session.id);
    }

    /// Driver-side open failure: report it and drop the session. No
    /// SessionClosed is due since the open never succeeded.
    pub fn session_failed(&self, session: &Session, message: &str) {
        warn!("session {} failed: {}", session.id, message);
        self.send_session_result(&session.id, false, Some(message), None);
        session.release();
        session.advance(SessionState::Closed);
        self.registry.remove(&session.id);
    }

    pub fn send_exec_result(
        &self,
        request_id: &str,
        success: bool,
        stdout_data: Option<String>,
        stderr_data: Option<String>,
        exit_code: i32,
        error_message: Option<&str>,
    ) {
        let result = Envelope::ExecCommandResult(ExecCommandResult {
            request_id: String::from(request_id),
            success,
            stdout_data,
            stderr_data,
            exit_code,
            error_message: error_message.map(String::from),
        });
        if let Err(e) = self.send(&result) {
            warn!("failed to send exec result for {}: {e:#}", request_id);
        }
    }

    pub fn send_port_check_result(&self, request_id: &str, results: Vec<PortCheckOutcome>) {
        let result = Envelope::PortCheckResult(PortCheckResult {
            request_id: String::from(request_id),
            results,
        });
        if let Err(e) = self.send(&result) {
            warn!("failed to send port check result for {}: {e:#}", request_id);
        }
    }
}
