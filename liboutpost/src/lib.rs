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

//! liboutpost implements the outpost remote-access engine: a single
//! stateful agent process that keeps a framed control-plane link to a
//! coordinator server and opens, proxies, and tears down remote
//! interactive sessions (SSH shells, SFTP, telnet, VNC/RDP via a
//! graphical proxy daemon, and TCP tunnels) on its behalf.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nix::sys::signal::{self, SigHandler, Signal};
use signal_hook::{consts::TERM_SIGNALS, flag};
use tracing::info;

pub mod config;
pub mod consts;
pub mod engine;
pub mod net;
pub mod protocol;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The command line arguments the engine expects.
///
/// These can be directly parsed with clap or manually constructed in
/// order to present some other user interface.
#[derive(Parser, Debug, Default)]
#[clap(author, about)]
pub struct Args {
    #[clap(long, help = "Control plane server host (overrides config.yaml)")]
    pub host: Option<String>,

    #[clap(long, help = "Control plane server port (overrides config.yaml)")]
    pub port: Option<u16>,

    #[clap(long, value_enum, default_value = "info", help = "Log verbosity")]
    pub log: LogLevel,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Run the engine until a term signal arrives.
pub fn run(args: Args) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(args.log))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;

    let mut config = config::load().context("loading config")?;
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }

    info!("outpost engine v{} starting", VERSION);

    // A write to a dead peer must surface as an error on the write,
    // not kill the process.
    // Safety: SigIgn installs no handler code, just the ignore disposition.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("ignoring SIGPIPE")?;

    // Shut down gracefully on the first term signal, immediately on
    // the second in case a driver is wedged.
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&shutdown))
            .context("registering shutdown escalation")?;
        flag::register(*sig, Arc::clone(&shutdown)).context("registering shutdown flag")?;
    }

    engine::run(config, shutdown)?;

    info!("engine stopped");
    Ok(())
}

/// Milliseconds since the unix epoch, for keepalive timestamps.
pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn shutdown_requested(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}
