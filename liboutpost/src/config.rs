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

use std::{env, fs, io, path::Path};

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Token presented in the EngineHello so the coordinator can tell
    /// registered engines from random dialers. Overridden by the
    /// REGISTRATION_TOKEN environment variable.
    pub registration_token: String,

    /// Where to find the coordinator's control plane.
    pub server_host: String,
    pub server_port: u16,

    /// Where to find the graphical proxy daemon that VNC/RDP sessions
    /// are brokered through.
    pub proxy_host: String,
    pub proxy_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            registration_token: String::new(),
            server_host: String::from("127.0.0.1"),
            server_port: 7800,
            proxy_host: String::from("127.0.0.1"),
            proxy_port: 4822,
        }
    }
}

/// Load `config.yaml` from the working directory, writing a default
/// one on first run, then apply environment overrides.
pub fn load() -> anyhow::Result<Config> {
    load_from(Path::new(CONFIG_FILE))
}

pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no config file found, creating default {}", path.display());
            let config = Config::default();
            if let Err(e) = write_config(path, &config) {
                warn!("could not write default config file: {:?}", e);
            }
            config
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    if let Ok(token) = env::var("REGISTRATION_TOKEN") {
        if !token.is_empty() {
            info!("using REGISTRATION_TOKEN from environment");
            config.registration_token = token;
        }
    }

    Ok(config)
}

fn write_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let raw = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_written_on_first_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");

        let config = load_from(&path).expect("load to succeed");
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.server_port, 7800);
        assert!(path.exists(), "default config should have been written");

        // And the file we wrote should parse back to the same thing.
        let reloaded = load_from(&path).expect("reload to succeed");
        assert_eq!(reloaded.server_port, config.server_port);
        assert_eq!(reloaded.proxy_port, 4822);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "server_host: coordinator.example\nregistration_token: \"tok\"\n")
            .expect("write");

        let config = load_from(&path).expect("load to succeed");
        assert_eq!(config.server_host, "coordinator.example");
        assert_eq!(config.registration_token, "tok");
        assert_eq!(config.server_port, 7800);
    }
}
