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

//! The engine's outer loop: keep a control-plane client alive,
//! reconnecting with a delay whenever the link drops, until shutdown.

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread, time,
};

use tracing::{error, info};

use crate::{config::Config, shutdown_requested};

pub mod control_plane;
pub mod graphical;
pub mod guac;
pub mod port_check;
pub mod registry;
pub mod sftp;
pub mod shell;
pub mod ssh;
pub mod telnet;

use control_plane::{ControlPlane, Settings};
use registry::Registry;

const RUN_POLL: time::Duration = time::Duration::from_secs(1);
const SLEEP_TICK: time::Duration = time::Duration::from_millis(100);

pub fn run(config: Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let cp = ControlPlane::new(Settings::from_config(&config), Arc::clone(&registry));

    while !shutdown_requested(&shutdown) {
        match cp.start() {
            Ok(()) => {
                info!("connected to control plane");
                while cp.is_running() && !shutdown_requested(&shutdown) {
                    thread::sleep(RUN_POLL);
                }
                cp.stop();
            }
            Err(e) => {
                error!("control plane connection failed: {e:#}");
            }
        }

        if shutdown_requested(&shutdown) {
            break;
        }
        info!("reconnecting in {:?}", cp.reconnect_delay());
        sleep_interruptibly(cp.reconnect_delay(), &shutdown);
    }

    info!("shutting down engine");
    // Stop the dispatcher before tearing sessions out from under it.
    cp.stop();
    registry.destroy();
    Ok(())
}

fn sleep_interruptibly(total: time::Duration, shutdown: &AtomicBool) {
    let deadline = time::Instant::now() + total;
    while time::Instant::now() < deadline && !shutdown_requested(shutdown) {
        thread::sleep(SLEEP_TICK);
    }
}
