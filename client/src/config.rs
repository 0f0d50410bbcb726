use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use crate::sync::SyncConfig;

#[derive(Parser, Debug, Clone)]
#[clap(name = "peerview-client")]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    #[clap(long, default_value = "ws://localhost:8000", env = "PEERVIEW_WS_ENDPOINT")]
    pub ws_endpoint: Url,
    #[clap(long, default_value = "http://localhost:8000", env = "PEERVIEW_API_ENDPOINT")]
    pub api_endpoint: Url,
    #[clap(long, env = "PEERVIEW_USERNAME")]
    pub username: String,
    #[clap(long, env = "PEERVIEW_PASSWORD")]
    pub password: String,
    /// Image file published as the local camera frame. Nothing is published without it.
    #[clap(long)]
    pub frame: Option<PathBuf>,
    /// Start with publishing switched off.
    #[clap(long)]
    pub camera_off: bool,
    #[clap(long, default_value_t = 100)]
    pub publish_interval_ms: u64,
    #[clap(long, default_value_t = 500)]
    pub heartbeat_interval_ms: u64,
}

impl Config {
    pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        anyhow::ensure!(
            self.publish_interval_ms > 0 && self.heartbeat_interval_ms > 0,
            "intervals must be positive"
        );
        Ok(SyncConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            publish_interval: Duration::from_millis(self.publish_interval_ms),
            publish: !self.camera_off,
        })
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::Config;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["peerview-client", "--username", "u", "--password", "p"]);
        assert_eq!(config.ws_endpoint.as_str(), "ws://localhost:8000/");
        assert_eq!(config.api_endpoint.as_str(), "http://localhost:8000/");
        let sync = config.sync_config().unwrap();
        assert_eq!(sync.heartbeat_interval.as_millis(), 500);
        assert_eq!(sync.publish_interval.as_millis(), 100);
        assert!(sync.publish);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config::parse_from([
            "peerview-client",
            "--username",
            "u",
            "--password",
            "p",
            "--heartbeat-interval-ms",
            "0",
        ]);
        assert!(config.sync_config().is_err());
    }
}
