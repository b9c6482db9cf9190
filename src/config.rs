//! Module implement the typed runtime configuration.
//!
//! Configuration is a plain value with defaults; every key can be
//! overridden from the process environment by its upper-case name.

use std::env;

use crate::Result;

lazy_static::lazy_static! {
    /// Recognized configuration keys, in reply order for the `config`
    /// command.
    pub static ref CONFIG_KEYS: Vec<&'static str> = vec![
        "SELVA_PORT",
        "SERVER_BACKLOG_SIZE",
        "SERVER_MAX_CLIENTS",
        "FIND_INDICES_MAX",
        "FIND_INDICES_MAX_HINTS_FIND",
        "FIND_INDEXING_THRESHOLD",
        "FIND_INDEXING_INTERVAL",
        "FIND_INDEXING_ICB_UPDATE_INTERVAL",
        "FIND_INDEXING_POPULARITY_AVE_PERIOD",
        "HIERARCHY_EXPECTED_RESP_LEN",
        "HIERARCHY_SORT_BY_DEPTH",
    ];
}

/// Runtime configuration for a hierarchy instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// TCP port the outer server binds to.
    pub selva_port: u16,
    /// Listen backlog of the outer server.
    pub server_backlog_size: usize,
    /// Maximum number of simultaneous clients of the outer server.
    pub server_max_clients: usize,
    /// Maximum number of active (materialized) find indices.
    pub find_indices_max: usize,
    /// Maximum number of tracked index hints.
    pub find_indices_max_hints_find: usize,
    /// A hint is considered for indexing once the average of visited
    /// nodes per find exceeds this.
    pub find_indexing_threshold: f32,
    /// Interval of the index selector sweep, in milliseconds.
    pub find_indexing_interval: u64,
    /// Interval of the per-ICB accounting roll, in milliseconds.
    pub find_indexing_icb_update_interval: u64,
    /// Averaging period for the popularity low-pass filter, in
    /// milliseconds.
    pub find_indexing_popularity_ave_period: u64,
    /// Initial capacity of traversal result vectors.
    pub hierarchy_expected_resp_len: usize,
    /// Order full-DFS by subtree depth instead of head order.
    pub hierarchy_sort_by_depth: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            selva_port: 3000,
            server_backlog_size: 10,
            server_max_clients: 100,
            find_indices_max: 0,
            find_indices_max_hints_find: 500,
            find_indexing_threshold: 100.0,
            find_indexing_interval: 60_000,
            find_indexing_icb_update_interval: 5_000,
            find_indexing_popularity_ave_period: 216_000,
            hierarchy_expected_resp_len: 5_000,
            hierarchy_sort_by_depth: false,
        }
    }
}

impl Config {
    /// Build a configuration from defaults with environment overrides.
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        for key in CONFIG_KEYS.iter() {
            if let Ok(value) = env::var(key) {
                config.set(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Set a single key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "SELVA_PORT" => self.selva_port = parse(key, value)?,
            "SERVER_BACKLOG_SIZE" => self.server_backlog_size = parse(key, value)?,
            "SERVER_MAX_CLIENTS" => self.server_max_clients = parse(key, value)?,
            "FIND_INDICES_MAX" => self.find_indices_max = parse(key, value)?,
            "FIND_INDICES_MAX_HINTS_FIND" => {
                self.find_indices_max_hints_find = parse(key, value)?
            }
            "FIND_INDEXING_THRESHOLD" => self.find_indexing_threshold = parse(key, value)?,
            "FIND_INDEXING_INTERVAL" => self.find_indexing_interval = parse(key, value)?,
            "FIND_INDEXING_ICB_UPDATE_INTERVAL" => {
                self.find_indexing_icb_update_interval = parse(key, value)?
            }
            "FIND_INDEXING_POPULARITY_AVE_PERIOD" => {
                self.find_indexing_popularity_ave_period = parse(key, value)?
            }
            "HIERARCHY_EXPECTED_RESP_LEN" => {
                self.hierarchy_expected_resp_len = parse(key, value)?
            }
            "HIERARCHY_SORT_BY_DEPTH" => {
                let v: usize = parse(key, value)?;
                self.hierarchy_sort_by_depth = v != 0;
            }
            _ => return err_at!(InvalidInput, msg: "unknown config key {:?}", key),
        }
        Ok(())
    }

    /// String form of a single key, for the `config` command reply.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "SELVA_PORT" => self.selva_port.to_string(),
            "SERVER_BACKLOG_SIZE" => self.server_backlog_size.to_string(),
            "SERVER_MAX_CLIENTS" => self.server_max_clients.to_string(),
            "FIND_INDICES_MAX" => self.find_indices_max.to_string(),
            "FIND_INDICES_MAX_HINTS_FIND" => self.find_indices_max_hints_find.to_string(),
            "FIND_INDEXING_THRESHOLD" => self.find_indexing_threshold.to_string(),
            "FIND_INDEXING_INTERVAL" => self.find_indexing_interval.to_string(),
            "FIND_INDEXING_ICB_UPDATE_INTERVAL" => {
                self.find_indexing_icb_update_interval.to_string()
            }
            "FIND_INDEXING_POPULARITY_AVE_PERIOD" => {
                self.find_indexing_popularity_ave_period.to_string()
            }
            "HIERARCHY_EXPECTED_RESP_LEN" => self.hierarchy_expected_resp_len.to_string(),
            "HIERARCHY_SORT_BY_DEPTH" => (self.hierarchy_sort_by_depth as usize).to_string(),
            _ => return err_at!(InvalidInput, msg: "unknown config key {:?}", key),
        };
        Ok(value)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    err_at!(RangeError, value.parse::<T>(), "config {}={:?}", key, value)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
