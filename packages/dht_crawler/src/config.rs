//! Configuration collaborator (spec §6): the core never reads files or
//! environment variables itself, it only asks a `dyn Config` for typed
//! values by key.

use std::collections::HashMap;

pub trait Config: Send + Sync {
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn get_bool(&self, key: &str, default: bool) -> bool;
}

/// A `Config` backed by a flat string map, the way the CLI binary
/// populates it from flags/env before handing a `dyn Config` to the
/// core.
#[derive(Debug, Default, Clone)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> MapConfig {
        MapConfig::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl Config for MapConfig {
    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            })
            .unwrap_or(default)
    }
}

/// Recognized configuration keys (spec §6), resolved once at startup
/// into a plain struct so the rest of the crate does not re-parse
/// strings on every access.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub port: u16,
    pub bootstrap_nodes: Vec<String>,
    pub parallel_crawls: usize,
    pub refresh_interval_secs: u64,
    pub max_nodes: usize,
    pub max_info_hashes: usize,
    pub auto_start: bool,
    pub user_agent: String,
    pub config_dir: String,
}

impl DhtConfig {
    pub fn from_config(config: &dyn Config) -> DhtConfig {
        let bootstrap_nodes = config
            .get_string("dht.bootstrap_nodes", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        DhtConfig {
            port: config.get_int("dht.port", 6881) as u16,
            bootstrap_nodes,
            parallel_crawls: config.get_int("crawler.parallel_crawls", 10) as usize,
            refresh_interval_secs: config.get_int("crawler.refresh_interval", 15) as u64,
            max_nodes: config.get_int("crawler.max_nodes", 0) as usize,
            max_info_hashes: config.get_int("crawler.max_info_hashes", 0) as usize,
            auto_start: config.get_bool("crawler.auto_start", true),
            user_agent: config.get_string("network.user_agent", "dht_crawler/0.1"),
            config_dir: config.get_string("persistence.config_dir", "."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_defaults() {
        let config = MapConfig::new();
        assert_eq!(config.get_int("dht.port", 6881), 6881);
        assert!(config.get_bool("crawler.auto_start", true));
    }

    #[test]
    fn parses_bootstrap_node_list() {
        let mut config = MapConfig::new();
        config.set("dht.bootstrap_nodes", "router.bittorrent.com:6881, dht.transmissionbt.com:6881");
        let resolved = DhtConfig::from_config(&config);
        assert_eq!(
            resolved.bootstrap_nodes,
            vec!["router.bittorrent.com:6881", "dht.transmissionbt.com:6881"]
        );
    }
}
