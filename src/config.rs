//! Typed settings (C10), loaded from a TOML file at startup, following the
//! teacher's `config` module convention: plain `#[derive(Deserialize)]`
//! structs with a sibling `defaults` module supplying `serde(default = ...)`
//! values for optional fields.
//! Grounded on `examples/StractOrg-stract/crates/core/src/config/mod.rs`
//! (flat deserialized config structs, `defaults::` fn-per-field pattern) and
//! `main.rs`'s `load_toml_config` (`fs::read_to_string` + `toml::from_str`).

pub mod defaults;

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// One remote worker in the roster: a name for logging plus its address.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServerSpec {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The full remote-worker roster; `num_remote_servers` is its length.
    pub servers: Vec<ServerSpec>,

    #[serde(default = "defaults::Dissemination::num_seeded_hosts")]
    pub num_seeded_hosts: usize,

    #[serde(default = "defaults::Timeouts::remote_read_timeout_ms")]
    pub remote_read_timeout_ms: u64,

    #[serde(default = "defaults::Timeouts::remote_worker_timeout_ms")]
    pub remote_worker_timeout_ms: u64,

    /// Added per SPEC_FULL.md §9's open question: the original's `connect()`
    /// has no bound and can hang forever.
    #[serde(default = "defaults::Timeouts::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "defaults::Concurrency::number_of_remote_workers")]
    pub number_of_remote_workers: usize,

    #[serde(default = "defaults::Dispatch::limit_network_io")]
    pub limit_network_io: bool,

    /// Address the worker binary binds its listener to.
    #[serde(default = "defaults::Worker::listen_addr")]
    pub listen_addr: String,

    #[serde(default = "defaults::Logging::log_filter")]
    pub log_filter: String,
}

impl Config {
    pub fn num_remote_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn hosts_to_seed(&self) -> usize {
        self.num_seeded_hosts.min(self.num_remote_servers())
    }

    pub fn remote_read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.remote_read_timeout_ms)
    }

    pub fn remote_worker_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.remote_worker_timeout_ms)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
