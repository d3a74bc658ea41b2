use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use handoff_transfer::{DEFAULT_FLOW_TIMEOUT, DEFAULT_MAX_IN_FLIGHT, ServerConfig};

/// Settings read from the environment (and `.env`).
pub struct Config {
    pub db_path: PathBuf,
    pub account_id: String,
    pub attachments_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub bind_host: IpAddr,
    pub advertise_host: Option<String>,
    pub max_in_flight: usize,
    pub flow_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path: PathBuf = std::env::var("HANDOFF_DB_PATH")
            .unwrap_or_else(|_| "handoff.db".into())
            .into();
        let account_id = std::env::var("HANDOFF_ACCOUNT_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .context("HANDOFF_ACCOUNT_ID must be set")?;
        let attachments_dir: PathBuf = std::env::var("HANDOFF_ATTACHMENTS_DIR")
            .unwrap_or_else(|_| "./attachments".into())
            .into();
        let cache_dir: PathBuf = std::env::var("HANDOFF_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("handoff-cache"));
        let bind_host = match std::env::var("HANDOFF_BIND_HOST") {
            Ok(host) => host
                .parse()
                .with_context(|| format!("HANDOFF_BIND_HOST is not an IP address: {host}"))?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let advertise_host = std::env::var("HANDOFF_ADVERTISE_HOST")
            .ok()
            .filter(|host| !host.is_empty());
        let max_in_flight = std::env::var("HANDOFF_MAX_IN_FLIGHT_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        let flow_timeout = std::env::var("HANDOFF_FLOW_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLOW_TIMEOUT);

        Ok(Self {
            db_path,
            account_id,
            attachments_dir,
            cache_dir,
            bind_host,
            advertise_host,
            max_in_flight,
            flow_timeout,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            account_id: self.account_id.clone(),
            bind_host: self.bind_host,
            advertise_host: self.advertise_host.clone(),
            max_in_flight: self.max_in_flight,
            flow_timeout: self.flow_timeout,
            attachments_dir: Some(self.attachments_dir.clone()),
            ..Default::default()
        }
    }
}
