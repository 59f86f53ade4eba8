//! C8 — startup configuration: CLI flags via `argh`, an optional on-disk
//! config layer via `confy`, and the validation spec.md §6 requires before
//! the server starts accepting connections.

use std::time::Duration;

use argh::FromArgs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::limits::Limits;

#[derive(FromArgs, Debug)]
/// a subject-routing publish/subscribe server
pub struct Cli {
    /// client listen address, host:port
    #[argh(option, default = "\"0.0.0.0:4222\".to_string()")]
    pub addr: String,

    /// route listen address, host:port (disabled if absent)
    #[argh(option)]
    pub cluster_addr: Option<String>,

    /// cluster name; empty adopts whatever a peer offers
    #[argh(option, default = "String::new()")]
    pub cluster_name: String,

    /// comma-separated route URLs to dial on startup
    #[argh(option, default = "String::new()")]
    pub routes: String,

    /// human-readable server name, used in logs and `INFO`
    #[argh(option, default = "String::new()")]
    pub server_name: String,

    /// maximum payload size in bytes
    #[argh(option, default = "1024 * 1024")]
    pub max_payload: usize,

    /// maximum subscriptions per connection, 0 = unlimited
    #[argh(option, default = "0")]
    pub max_subscriptions: usize,

    /// ping interval in seconds
    #[argh(option, default = "120")]
    pub ping_interval: u64,

    /// unanswered pings allowed before a connection is considered stale
    #[argh(option, default = "2")]
    pub ping_max: u32,

    /// write deadline in seconds
    #[argh(option, default = "10")]
    pub write_deadline: u64,

    /// path to an optional config file overlaying these flags
    #[argh(option)]
    pub config_file: Option<String>,

    /// enter lame-duck mode `lame_duck_grace` seconds after SIGINT/SIGTERM,
    /// then drain over `lame_duck_duration` seconds, instead of stopping
    /// immediately
    #[argh(switch)]
    pub lame_duck_on_shutdown: bool,

    /// grace period before lame-duck eviction begins, in seconds
    #[argh(option, default = "0")]
    pub lame_duck_grace: u64,

    /// duration over which lame-duck eviction is spread, in seconds
    #[argh(option, default = "30")]
    pub lame_duck_duration: u64,
}

/// The subset of `Cli` persisted by `confy`, merged under the CLI flags
/// (CLI always wins — a file only fills in values the operator didn't pass).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub cluster_addr: Option<String>,
    pub cluster_name: Option<String>,
    pub routes: Option<String>,
    pub server_name: Option<String>,
    pub max_payload: Option<usize>,
}

#[derive(Debug)]
pub struct Settings {
    pub addr: String,
    pub cluster_addr: Option<String>,
    pub cluster_name: String,
    pub route_urls: Vec<String>,
    pub server_name: String,
    pub limits: Limits,
    pub lame_duck_on_shutdown: bool,
    pub lame_duck_grace: Duration,
    pub lame_duck_duration: Duration,
}

impl Cli {
    /// Loads the on-disk config (if any), lets CLI flags take precedence,
    /// and validates the merged result.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let file: FileConfig = match &self.config_file {
            Some(path) => confy::load_path(path).unwrap_or_default(),
            None => confy::load("nervecored").unwrap_or_default(),
        };

        let addr = non_default(&self.addr, "0.0.0.0:4222").unwrap_or_else(|| file.addr.clone().unwrap_or_else(|| self.addr.clone()));
        let cluster_addr = self.cluster_addr.clone().or_else(|| file.cluster_addr.clone());
        let cluster_name = if !self.cluster_name.is_empty() { self.cluster_name.clone() } else { file.cluster_name.clone().unwrap_or_default() };
        let routes_raw = if !self.routes.is_empty() { self.routes.clone() } else { file.routes.clone().unwrap_or_default() };
        let server_name = if !self.server_name.is_empty() { self.server_name.clone() } else { file.server_name.clone().unwrap_or_default() };
        let max_payload = if self.max_payload != 1024 * 1024 { self.max_payload } else { file.max_payload.unwrap_or(self.max_payload) };

        if server_name.chars().any(|c| c.is_whitespace()) {
            return Err(ConfigError::ServerNameHasWhitespace(server_name));
        }
        addr.parse::<std::net::SocketAddr>().map_err(|_| ConfigError::InvalidAddress(addr.clone()))?;
        if let Some(ref ca) = cluster_addr {
            ca.parse::<std::net::SocketAddr>().map_err(|_| ConfigError::InvalidAddress(ca.clone()))?;
        }

        let grace = Duration::from_secs(self.lame_duck_grace);
        let duration = Duration::from_secs(self.lame_duck_duration);
        if self.lame_duck_on_shutdown && grace >= duration {
            return Err(ConfigError::LameDuckGraceNotLessThanDuration { grace, duration });
        }

        let route_urls = routes_raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();

        let limits = Limits {
            max_payload,
            max_subscriptions: self.max_subscriptions,
            ping_interval: Duration::from_secs(self.ping_interval),
            ping_max: self.ping_max,
            write_deadline: Duration::from_secs(self.write_deadline),
            ..Limits::default()
        };

        Ok(Settings {
            addr,
            cluster_addr,
            cluster_name,
            route_urls,
            server_name,
            limits,
            lame_duck_on_shutdown: self.lame_duck_on_shutdown,
            lame_duck_grace: grace,
            lame_duck_duration: duration,
        })
    }
}

/// Returns `Some(value)` when `value` differs from `argh`'s default, so the
/// caller knows the operator actually passed it (as opposed to it being the
/// default argh would have filled in anyway) and should prefer it over the
/// file config.
fn non_default(value: &str, default: &str) -> Option<String> {
    if value != default {
        Some(value.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            addr: "0.0.0.0:4222".into(),
            cluster_addr: None,
            cluster_name: String::new(),
            routes: String::new(),
            server_name: String::new(),
            max_payload: 1024 * 1024,
            max_subscriptions: 0,
            ping_interval: 120,
            ping_max: 2,
            write_deadline: 10,
            config_file: None,
            lame_duck_on_shutdown: false,
            lame_duck_grace: 0,
            lame_duck_duration: 30,
        }
    }

    #[test]
    fn rejects_server_name_with_whitespace() {
        let mut cli = base_cli();
        cli.server_name = "has space".into();
        assert!(matches!(cli.resolve(), Err(ConfigError::ServerNameHasWhitespace(_))));
    }

    #[test]
    fn rejects_lame_duck_grace_not_less_than_duration() {
        let mut cli = base_cli();
        cli.lame_duck_on_shutdown = true;
        cli.lame_duck_grace = 30;
        cli.lame_duck_duration = 30;
        assert!(matches!(cli.resolve(), Err(ConfigError::LameDuckGraceNotLessThanDuration { .. })));
    }

    #[test]
    fn splits_route_list_on_commas() {
        let mut cli = base_cli();
        cli.routes = "a:1, b:2 ,c:3".into();
        let settings = cli.resolve().unwrap();
        assert_eq!(settings.route_urls, vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]);
    }
}
