//! Default values for optional `Config` fields, grouped by concern the way
//! `examples/StractOrg-stract/crates/core/src/config/defaults.rs` groups
//! `Collector`/`Api`/etc. as zero-sized marker structs with fn-per-field.

pub struct Dissemination;

impl Dissemination {
    pub fn num_seeded_hosts() -> usize {
        3
    }
}

pub struct Timeouts;

impl Timeouts {
    pub fn remote_read_timeout_ms() -> u64 {
        30_000
    }

    pub fn remote_worker_timeout_ms() -> u64 {
        60_000
    }

    pub fn connect_timeout_ms() -> u64 {
        5_000
    }
}

pub struct Concurrency;

impl Concurrency {
    pub fn number_of_remote_workers() -> usize {
        4
    }
}

pub struct Dispatch;

impl Dispatch {
    pub fn limit_network_io() -> bool {
        true
    }
}

pub struct Worker;

impl Worker {
    pub fn listen_addr() -> String {
        "0.0.0.0:7800".to_string()
    }
}

pub struct Logging;

impl Logging {
    pub fn log_filter() -> String {
        "crucible=info".to_string()
    }
}
