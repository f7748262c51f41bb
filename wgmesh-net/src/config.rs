//! Runtime settings resolved from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::split_list;

/// Default database directory.
pub const DATA_DIR: &str = "/var/lib/wgmesh";

/// Default root for rendered configuration files.
pub const CONFIG_ROOT: &str = "/etc/wireguard";

pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_STATS_MAX_PARALLEL: usize = 4;
pub const DEFAULT_LISTEN_PORT: u16 = 51820;
pub const DEFAULT_DNS: &str = "1.1.1.1, 8.8.8.8";
pub const DEFAULT_KEEPALIVE: u16 = 25;
pub const DEFAULT_MTU: u16 = 1420;
pub const FULL_TUNNEL: &str = "0.0.0.0/0, ::/0";

/// Values applied to new groups and clients when the request leaves them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub listen_port: u16,
    pub dns: Vec<String>,
    pub endpoint: String,
    pub persistent_keepalive: u16,
    pub mtu: u16,
    pub client_allowed_ips: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            dns: split_list(DEFAULT_DNS),
            endpoint: String::new(),
            persistent_keepalive: DEFAULT_KEEPALIVE,
            mtu: DEFAULT_MTU,
            client_allowed_ips: FULL_TUNNEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub config_root: PathBuf,
    /// `None` disables the stats sampler.
    pub stats_interval: Option<Duration>,
    pub command_timeout: Duration,
    pub stats_max_parallel: usize,
    pub defaults: Defaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DATA_DIR),
            config_root: PathBuf::from(CONFIG_ROOT),
            stats_interval: Some(Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS)),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            stats_max_parallel: DEFAULT_STATS_MAX_PARALLEL,
            defaults: Defaults::default(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Unset or empty variables keep their
    /// default; a value that does not parse is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(dir) = get("WGMESH_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(root) = get("WG_CONFIG_PATH") {
            settings.config_root = PathBuf::from(root);
        }
        if let Some(secs) = parse_var::<u64>(&get, "STATS_COLLECTION_INTERVAL")? {
            settings.stats_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&get, "WG_COMMAND_TIMEOUT")? {
            if secs == 0 {
                return Err(Error::Config(
                    "WG_COMMAND_TIMEOUT must be at least 1 second".to_string(),
                ));
            }
            settings.command_timeout = Duration::from_secs(secs);
        }
        if let Some(parallel) = parse_var::<usize>(&get, "STATS_MAX_PARALLEL")? {
            settings.stats_max_parallel = parallel.max(1);
        }
        if let Some(dns) = get("WG_DEFAULT_DNS") {
            settings.defaults.dns = split_list(&dns);
        }
        if let Some(endpoint) = get("WG_DEFAULT_ENDPOINT") {
            settings.defaults.endpoint = endpoint.trim().to_string();
        }
        if let Some(port) = parse_var::<u16>(&get, "WG_DEFAULT_PORT")? {
            settings.defaults.listen_port = port;
        }

        Ok(settings)
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value {:?}", key, raw))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.config_root, PathBuf::from("/etc/wireguard"));
        assert_eq!(settings.stats_interval, Some(Duration::from_secs(60)));
        assert_eq!(settings.defaults.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(settings.defaults.listen_port, 51820);
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("WG_CONFIG_PATH", "/tmp/wg"),
            ("STATS_COLLECTION_INTERVAL", "300"),
            ("WG_COMMAND_TIMEOUT", "5"),
            ("WG_DEFAULT_DNS", "9.9.9.9"),
            ("WG_DEFAULT_ENDPOINT", "vpn.example.com"),
            ("WG_DEFAULT_PORT", "51000"),
        ])
        .unwrap();

        assert_eq!(settings.config_root, PathBuf::from("/tmp/wg"));
        assert_eq!(settings.stats_interval, Some(Duration::from_secs(300)));
        assert_eq!(settings.command_timeout, Duration::from_secs(5));
        assert_eq!(settings.defaults.dns, vec!["9.9.9.9"]);
        assert_eq!(settings.defaults.endpoint, "vpn.example.com");
        assert_eq!(settings.defaults.listen_port, 51000);
    }

    #[test]
    fn test_zero_interval_disables_sampler() {
        let settings = settings_from(&[("STATS_COLLECTION_INTERVAL", "0")]).unwrap();
        assert_eq!(settings.stats_interval, None);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        for (key, value) in [
            ("STATS_COLLECTION_INTERVAL", "soon"),
            ("WG_DEFAULT_PORT", "70000"),
            ("WG_COMMAND_TIMEOUT", "0"),
            ("STATS_MAX_PARALLEL", "-1"),
        ] {
            assert!(
                matches!(settings_from(&[(key, value)]), Err(Error::Config(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let settings = settings_from(&[("WG_CONFIG_PATH", ""), ("WG_DEFAULT_PORT", " ")]).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
