use figment::{Figment, providers::Env};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// A node whose last heartbeat is older than this is marked not-ready.
    /// Generous on purpose: at the default 1s heartbeat cadence a worker gets
    /// ~30 missed beats before it is written off.
    #[serde(default = "default_node_stale")]
    pub node_stale_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> String {
    "stevedore.db".to_string()
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_node_stale() -> u64 {
    30
}

pub fn get_config() -> Config {
    let config: Config = Figment::new()
        .merge(Env::prefixed("STEVEDORE_CONTROLLER_"))
        .extract()
        .expect("Failed to read configuration from environment variables.");
    config
}
